//! Query group orchestration
//!
//! `Received -> Normalized -> Executing -> Merged -> Done`, or `Failed` from
//! any state. A failure anywhere fails the whole group: the caller gets one
//! empty table per member query and the failing status.

use axum::http::StatusCode;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::executor::{ExecutionOptions, ExecutorRegistry};
use crate::models::{QueryGroup, ResultTable};
use crate::routes::metrics::EngineMetrics;
use crate::services::derived::execute_derived;
use crate::services::merger;
use crate::services::normalizer::{PlannedQuery, QueryNormalizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Received,
    Normalized,
    Executing,
    Merged,
    Done,
    Failed,
}

impl GroupState {
    fn can_advance_to(self, next: GroupState) -> bool {
        use GroupState::*;
        matches!(
            (self, next),
            (Received, Normalized)
                | (Normalized, Executing)
                | (Executing, Merged)
                | (Merged, Done)
                | (Received | Normalized | Executing | Merged, Failed)
        )
    }
}

struct StateTracker {
    project_id: i64,
    state: GroupState,
}

impl StateTracker {
    fn new(project_id: i64) -> Self {
        Self {
            project_id,
            state: GroupState::Received,
        }
    }

    fn advance(&mut self, next: GroupState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal query group transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(project_id = self.project_id, from = ?self.state, to = ?next, "Query group state");
        self.state = next;
    }
}

/// Result of executing one query group
#[derive(Debug, Clone)]
pub struct QueryGroupOutcome {
    /// One table per member query, in request order
    pub results: Vec<ResultTable>,
    pub status: StatusCode,
    pub error: Option<String>,
    pub state: GroupState,
    /// Joined view, present when requested and the group succeeded
    pub combined: Option<Vec<ResultTable>>,
    /// Why the requested joined view was left out; `results` are unaffected
    pub combined_error: Option<String>,
}

impl QueryGroupOutcome {
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::OK
    }
}

/// Top-level entry point for query groups
#[derive(Clone)]
pub struct QueryGroupEngine {
    normalizer: QueryNormalizer,
    executors: ExecutorRegistry,
    metrics: Arc<EngineMetrics>,
}

impl QueryGroupEngine {
    pub fn new(
        normalizer: QueryNormalizer,
        executors: ExecutorRegistry,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            normalizer,
            executors,
            metrics,
        }
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub async fn execute(
        &self,
        project_id: i64,
        group: &QueryGroup,
        options: &ExecutionOptions,
    ) -> QueryGroupOutcome {
        self.execute_inner(project_id, group, options, false).await
    }

    /// Like [`execute`](Self::execute), also building the combined view.
    pub async fn execute_combined(
        &self,
        project_id: i64,
        group: &QueryGroup,
        options: &ExecutionOptions,
    ) -> QueryGroupOutcome {
        self.execute_inner(project_id, group, options, true).await
    }

    async fn execute_inner(
        &self,
        project_id: i64,
        group: &QueryGroup,
        options: &ExecutionOptions,
        combine: bool,
    ) -> QueryGroupOutcome {
        let started = Instant::now();
        let mut tracker = StateTracker::new(project_id);
        self.metrics.inc_groups_executed();

        match self
            .run(project_id, group, options, combine, &mut tracker)
            .await
        {
            Ok((results, combined)) => {
                tracker.advance(GroupState::Done);
                let (combined, combined_error) = match combined {
                    Some(Ok(tables)) => (Some(tables), None),
                    Some(Err(err)) => {
                        warn!(project_id, error = %err, "Combined view skipped");
                        (None, Some(err.message().to_string()))
                    }
                    None => (None, None),
                };
                info!(
                    project_id,
                    queries = group.queries.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Query group executed"
                );
                QueryGroupOutcome {
                    results,
                    status: StatusCode::OK,
                    error: None,
                    state: tracker.state,
                    combined,
                    combined_error,
                }
            }
            Err(err) => {
                tracker.advance(GroupState::Failed);
                self.metrics.inc_groups_failed();
                let status = err.query_status();
                warn!(
                    project_id,
                    status = status.as_u16(),
                    error = %err,
                    "Query group failed"
                );
                QueryGroupOutcome {
                    results: ResultTable::empty_set(group.queries.len()),
                    status,
                    error: Some(err.message().to_string()),
                    state: tracker.state,
                    combined: None,
                    combined_error: None,
                }
            }
        }
    }

    async fn run(
        &self,
        project_id: i64,
        group: &QueryGroup,
        options: &ExecutionOptions,
        combine: bool,
        tracker: &mut StateTracker,
    ) -> Result<(Vec<ResultTable>, Option<Result<Vec<ResultTable>>>)> {
        let planned = self.normalizer.normalize(project_id, group).await?;
        tracker.advance(GroupState::Normalized);

        tracker.advance(GroupState::Executing);
        let tables = self.execute_planned(project_id, &planned, options).await?;

        let global_labels: Vec<String> = group
            .global_group_bys
            .iter()
            .map(|g| g.property_name.clone())
            .collect();
        let results = merger::finalize(&planned, tables, &global_labels)?;
        // A combined view that cannot be built never fails the group.
        let combined = combine.then(|| merger::combine(&group.queries, &planned, &results));
        tracker.advance(GroupState::Merged);

        Ok((results, combined))
    }

    /// Run members through an order-preserving bounded stream. Dropping the
    /// stream on error or deadline cancels executor calls still in flight.
    async fn execute_planned(
        &self,
        project_id: i64,
        planned: &[PlannedQuery],
        options: &ExecutionOptions,
    ) -> Result<Vec<ResultTable>> {
        let concurrency = options.max_concurrency.max(1);
        let members: Vec<_> = planned
            .iter()
            .enumerate()
            .map(|(index, plan)| self.execute_member(project_id, index, plan, options))
            .collect();
        let stage = stream::iter(members)
        .buffered(concurrency)
        .try_collect::<Vec<_>>();

        match options.deadline {
            Some(deadline) => tokio::time::timeout(deadline, stage).await.map_err(|_| {
                AppError::ExecutionFailure(format!(
                    "Query group exceeded deadline of {}ms",
                    deadline.as_millis()
                ))
            })?,
            None => stage.await,
        }
    }

    async fn execute_member(
        &self,
        project_id: i64,
        index: usize,
        plan: &PlannedQuery,
        options: &ExecutionOptions,
    ) -> Result<ResultTable> {
        let table = match plan {
            PlannedQuery::Direct(resolved) => {
                self.executors.run(project_id, resolved, options).await?
            }
            PlannedQuery::Derived(derived) => {
                execute_derived(&self.executors, project_id, derived, options).await?
            }
        };
        self.metrics.inc_queries_executed();
        debug!(
            project_id,
            query_index = index,
            rows = table.rows.len(),
            "Member query executed"
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CategoryExecutor, MemoryExecutor, MetricDefinition, Record};
    use crate::models::{Category, Property, ResolvedQuery};
    use crate::services::derived_metrics::{DerivedMetricStore, MemoryDerivedMetricRepository};
    use crate::services::mappings::{MemoryMappingRepository, PropertyMappingStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct SlowExecutor;

    #[async_trait]
    impl CategoryExecutor for SlowExecutor {
        fn category(&self) -> Category {
            Category::Profiles
        }

        async fn execute(
            &self,
            _project_id: i64,
            _query: &ResolvedQuery,
            _options: &ExecutionOptions,
        ) -> Result<ResultTable> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ResultTable::default())
        }

        async fn filter_values(&self, _project_id: i64, _property: &Property) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn engine(registry: ExecutorRegistry) -> (QueryGroupEngine, Arc<EngineMetrics>) {
        let metrics = Arc::new(EngineMetrics::new());
        let derived_repo = Arc::new(MemoryDerivedMetricRepository::new());
        let mappings = PropertyMappingStore::new(
            Arc::new(MemoryMappingRepository::new()),
            derived_repo.clone(),
            metrics.clone(),
        );
        let normalizer = QueryNormalizer::new(mappings, DerivedMetricStore::new(derived_repo));
        (QueryGroupEngine::new(normalizer, registry, metrics.clone()), metrics)
    }

    fn events_registry() -> ExecutorRegistry {
        let events = MemoryExecutor::events();
        events.define_metric("website_session", "sessions", MetricDefinition::count());
        events.define_metric("website_session", "users", MetricDefinition::count_distinct("user_id"));
        events.insert_many((0..3).map(|i| Record {
            project_id: 1,
            display_category: "website_session".into(),
            object_type: String::new(),
            timestamp: 100 + i,
            properties: serde_json::from_value(json!({"user_id": format!("u{}", i % 2)})).unwrap(),
        }));
        ExecutorRegistry::new().with(Arc::new(events))
    }

    fn group(raw: serde_json::Value) -> QueryGroup {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_state_transitions() {
        assert!(GroupState::Received.can_advance_to(GroupState::Normalized));
        assert!(GroupState::Executing.can_advance_to(GroupState::Failed));
        assert!(!GroupState::Received.can_advance_to(GroupState::Executing));
        assert!(!GroupState::Done.can_advance_to(GroupState::Failed));
    }

    #[tokio::test]
    async fn test_results_preserve_member_order() {
        let (engine, metrics) = engine(events_registry());
        let group = group(json!({
            "queries": [
                {"category": "events", "display_category": "website_session", "metrics": ["users"], "from": 0, "to": 1000},
                {"category": "events", "display_category": "website_session", "metrics": ["sessions"], "from": 0, "to": 1000},
                {"category": "events", "display_category": "website_session", "metrics": ["sessions", "users"], "from": 0, "to": 101}
            ]
        }));

        let outcome = engine.execute(1, &group, &ExecutionOptions::default()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.state, GroupState::Done);
        assert_eq!(outcome.results[0].rows, vec![vec![json!(2.0)]]);
        assert_eq!(outcome.results[1].rows, vec![vec![json!(3.0)]]);
        assert_eq!(outcome.results[2].headers, vec!["sessions", "users"]);
        assert_eq!(outcome.results[2].rows, vec![vec![json!(2.0), json!(2.0)]]);
        assert_eq!(metrics.snapshot().queries_executed_total, 3);
    }

    #[tokio::test]
    async fn test_executor_failure_fails_whole_group() {
        let (engine, metrics) = engine(events_registry());
        let group = group(json!({
            "queries": [
                {"category": "events", "display_category": "website_session", "metrics": ["sessions"]},
                {"category": "events", "display_category": "website_session", "metrics": ["bounce_rate"]}
            ]
        }));

        let outcome = engine.execute(1, &group, &ExecutionOptions::default()).await;
        assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(outcome.state, GroupState::Failed);
        assert_eq!(outcome.results, ResultTable::empty_set(2));
        assert!(outcome.error.unwrap().contains("bounce_rate"));
        assert_eq!(metrics.snapshot().groups_failed_total, 1);
    }

    #[tokio::test]
    async fn test_missing_executor_is_execution_failure() {
        let (engine, _) = engine(events_registry());
        let group = group(json!({
            "queries": [{"category": "channels", "display_category": "google_ads_metrics", "metrics": ["impressions"]}]
        }));
        let outcome = engine.execute(1, &group, &ExecutionOptions::default()).await;
        assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(outcome.results.len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_aborts_group() {
        let (engine, _) = engine(ExecutorRegistry::new().with(Arc::new(SlowExecutor)));
        let group = group(json!({
            "queries": [{"category": "profiles", "display_category": "hubspot_contacts", "metrics": ["count"]}]
        }));
        let options = ExecutionOptions {
            deadline: Some(Duration::from_millis(50)),
            ..ExecutionOptions::default()
        };

        let outcome = engine.execute(1, &group, &options).await;
        assert_eq!(outcome.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(outcome.error.unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn test_combined_view() {
        let (engine, _) = engine(events_registry());
        let group = group(json!({
            "queries": [
                {"category": "events", "display_category": "website_session", "metrics": ["sessions"], "from": 0, "to": 1000},
                {"category": "events", "display_category": "website_session", "metrics": ["users"], "from": 0, "to": 1000}
            ]
        }));
        let outcome = engine
            .execute_combined(1, &group, &ExecutionOptions::default())
            .await;
        let combined = outcome.combined.unwrap();
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].headers, vec!["sessions", "users"]);
        assert_eq!(combined[0].rows, vec![vec![json!(3.0), json!(2.0)]]);
        assert!(outcome.combined_error.is_none());
    }

    #[tokio::test]
    async fn test_mismatched_combined_view_keeps_results() {
        let (engine, _) = engine(events_registry());
        let group = group(json!({
            "queries": [
                {"category": "events", "display_category": "website_session", "metrics": ["sessions"],
                 "group_bys": [{"property_name": "user_id"}], "from": 0, "to": 1000},
                {"category": "events", "display_category": "website_session", "metrics": ["users"],
                 "from": 0, "to": 1000}
            ]
        }));
        let outcome = engine
            .execute_combined(1, &group, &ExecutionOptions::default())
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.state, GroupState::Done);
        assert!(outcome.combined.is_none());
        assert!(outcome.combined_error.unwrap().contains("same group-bys"));
        assert_eq!(outcome.results[0].headers, vec!["user_id", "sessions"]);
        assert_eq!(outcome.results[1].rows, vec![vec![json!(2.0)]]);
    }
}
