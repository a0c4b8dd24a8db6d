//! Category executor seam
//!
//! Each data category (events, profiles, channels) is served by one
//! [`CategoryExecutor`]. The engine only sees fully resolved queries and
//! result tables; storage internals stay behind this trait.

pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::error::{AppError, Result};
use crate::models::{Category, Property, ResolvedQuery, ResultTable};
use crate::services::normalizer::relabel_headers;

pub use memory::{Aggregate, MemoryExecutor, MetricDefinition, Record};

/// Per-request execution knobs, passed explicitly down the call chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Profile queries may take the optimised filter path
    pub optimised_profile_filter: bool,
    /// Event queries may take the optimised user-filter path
    pub optimised_event_user_filter: bool,
    /// Member queries in flight at once
    pub max_concurrency: usize,
    /// Budget for the execution stage of one group
    pub deadline: Option<Duration>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            optimised_profile_filter: false,
            optimised_event_user_filter: false,
            max_concurrency: 2,
            deadline: None,
        }
    }
}

/// Executes one resolved query against a category's storage.
///
/// Implementations must emit headers as `[datetime?] + group-by properties +
/// metrics` and zero-fill metrics rather than drop rows. Row order is free.
#[async_trait]
pub trait CategoryExecutor: Send + Sync {
    fn category(&self) -> Category;

    async fn execute(
        &self,
        project_id: i64,
        query: &ResolvedQuery,
        options: &ExecutionOptions,
    ) -> Result<ResultTable>;

    /// Distinct observed values of a property.
    async fn filter_values(&self, project_id: i64, property: &Property) -> Result<Vec<String>>;
}

/// Category to executor lookup
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<Category, Arc<dyn CategoryExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own category, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn CategoryExecutor>) {
        self.executors.insert(executor.category(), executor);
    }

    pub fn with(mut self, executor: Arc<dyn CategoryExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn get(&self, category: Category) -> Result<Arc<dyn CategoryExecutor>> {
        self.executors.get(&category).cloned().ok_or_else(|| {
            AppError::ExecutionFailure(format!("No executor registered for {}", category))
        })
    }

    /// Run one resolved query on its category's executor and relabel the
    /// group-by headers. Any executor error becomes `ExecutionFailure`.
    pub async fn run(
        &self,
        project_id: i64,
        query: &ResolvedQuery,
        options: &ExecutionOptions,
    ) -> Result<ResultTable> {
        let category = query.query.category;
        let executor = self.get(category)?;

        let mut table = executor
            .execute(project_id, query, options)
            .await
            .map_err(|e| {
                error!(
                    project_id,
                    category = %category,
                    display_category = %query.query.display_category,
                    error = %e,
                    "Category executor failed"
                );
                match e {
                    AppError::ExecutionFailure(_) => e,
                    other => AppError::ExecutionFailure(format!(
                        "{} query on '{}' failed: {}",
                        category,
                        query.query.display_category,
                        other.message()
                    )),
                }
            })?;

        relabel_headers(query, &mut table)?;
        Ok(table)
    }
}
