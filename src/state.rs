//! Application state shared across handlers

use std::sync::Arc;

use crate::config::Config;
use crate::db::{Database, PgDerivedMetricRepository, PgMappingRepository};
use crate::executor::{ExecutionOptions, ExecutorRegistry};
use crate::routes::metrics::EngineMetrics;
use crate::services::derived_metrics::{DerivedMetricRepository, MemoryDerivedMetricRepository};
use crate::services::mappings::{MappingRepository, MemoryMappingRepository};
use crate::services::{
    DerivedMetricStore, FilterValuesService, PropertyMappingStore, QueryGroupEngine, QueryNormalizer,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool, when mappings persist in Postgres
    pub db: Option<Arc<Database>>,
    pub mappings: PropertyMappingStore,
    pub derived_metrics: DerivedMetricStore,
    pub filter_values: FilterValuesService,
    pub engine: QueryGroupEngine,
    /// Defaults for each request's execution options
    pub execution: ExecutionOptions,
    /// Application metrics for Prometheus
    pub metrics: Arc<EngineMetrics>,
}

impl AppState {
    /// Create new application state
    ///
    /// # Arguments
    /// * `config` - Process configuration
    /// * `db` - Database, or `None` for in-memory repositories
    /// * `executors` - One executor per data category
    pub fn new(config: &Config, db: Option<Database>, executors: ExecutorRegistry) -> Self {
        let (mapping_repo, derived_repo): (Arc<dyn MappingRepository>, Arc<dyn DerivedMetricRepository>) =
            match &db {
                Some(db) => (
                    Arc::new(PgMappingRepository::new(db.clone())),
                    Arc::new(PgDerivedMetricRepository::new(db.clone())),
                ),
                None => (
                    Arc::new(MemoryMappingRepository::new()),
                    Arc::new(MemoryDerivedMetricRepository::new()),
                ),
            };

        let metrics = Arc::new(EngineMetrics::new());
        let mappings =
            PropertyMappingStore::new(mapping_repo, Arc::clone(&derived_repo), Arc::clone(&metrics));
        let derived_metrics = DerivedMetricStore::new(derived_repo);
        let normalizer = QueryNormalizer::new(mappings.clone(), derived_metrics.clone());
        let filter_values = FilterValuesService::new(mappings.clone(), executors.clone());
        let engine = QueryGroupEngine::new(normalizer, executors, Arc::clone(&metrics));

        Self {
            db: db.map(Arc::new),
            mappings,
            derived_metrics,
            filter_values,
            engine,
            execution: ExecutionOptions {
                optimised_profile_filter: config.optimised_profile_filter,
                optimised_event_user_filter: config.optimised_event_user_filter,
                max_concurrency: config.query_concurrency,
                deadline: config.query_timeout,
            },
            metrics,
        }
    }
}
