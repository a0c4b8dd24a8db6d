//! Prometheus metrics endpoint

use axum::{extract::State, http::header, response::IntoResponse};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::AppState;

/// Engine counters for Prometheus
#[derive(Default)]
pub struct EngineMetrics {
    /// Query groups received
    pub groups_executed_total: AtomicU64,
    /// Query groups that ended in a non-200 status
    pub groups_failed_total: AtomicU64,
    /// Member queries (direct or derived) executed successfully
    pub queries_executed_total: AtomicU64,
    mapping_cache_hits_total: AtomicU64,
    mapping_cache_misses_total: AtomicU64,
    mappings_created_total: AtomicU64,
    /// HTTP requests handled by the KPI endpoints
    pub requests_total: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_groups_executed(&self) {
        self.groups_executed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_groups_failed(&self) {
        self.groups_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queries_executed(&self) {
        self.queries_executed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mapping_cache_hit(&self) {
        self.mapping_cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mapping_cache_miss(&self) {
        self.mapping_cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mappings_created(&self) {
        self.mappings_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            groups_executed_total: self.groups_executed_total.load(Ordering::Relaxed),
            groups_failed_total: self.groups_failed_total.load(Ordering::Relaxed),
            queries_executed_total: self.queries_executed_total.load(Ordering::Relaxed),
            mapping_cache_hits_total: self.mapping_cache_hits_total.load(Ordering::Relaxed),
            mapping_cache_misses_total: self.mapping_cache_misses_total.load(Ordering::Relaxed),
            mappings_created_total: self.mappings_created_total.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub groups_executed_total: u64,
    pub groups_failed_total: u64,
    pub queries_executed_total: u64,
    pub mapping_cache_hits_total: u64,
    pub mapping_cache_misses_total: u64,
    pub mappings_created_total: u64,
    pub requests_total: u64,
}

/// GET /metrics
///
/// Returns Prometheus-format metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();

    let output = format!(
        r#"# HELP kpi_query_groups_total Total number of query groups executed
# TYPE kpi_query_groups_total counter
kpi_query_groups_total {}

# HELP kpi_query_groups_failed_total Total number of query groups that failed
# TYPE kpi_query_groups_failed_total counter
kpi_query_groups_failed_total {}

# HELP kpi_queries_executed_total Total number of member queries executed
# TYPE kpi_queries_executed_total counter
kpi_queries_executed_total {}

# HELP kpi_mapping_cache_hits_total Property mapping lookups served from the per-group cache
# TYPE kpi_mapping_cache_hits_total counter
kpi_mapping_cache_hits_total {}

# HELP kpi_mapping_cache_misses_total Property mapping lookups that reached the repository
# TYPE kpi_mapping_cache_misses_total counter
kpi_mapping_cache_misses_total {}

# HELP kpi_property_mappings_created_total Total number of property mappings created
# TYPE kpi_property_mappings_created_total counter
kpi_property_mappings_created_total {}

# HELP kpi_requests_total Total number of KPI API requests processed
# TYPE kpi_requests_total counter
kpi_requests_total {}

# HELP kpi_federation_info Build information
# TYPE kpi_federation_info gauge
kpi_federation_info{{version="{}"}} 1
"#,
        snapshot.groups_executed_total,
        snapshot.groups_failed_total,
        snapshot.queries_executed_total,
        snapshot.mapping_cache_hits_total,
        snapshot.mapping_cache_misses_total,
        snapshot.mappings_created_total,
        snapshot.requests_total,
        env!("CARGO_PKG_VERSION"),
    );

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = EngineMetrics::new();
        metrics.inc_groups_executed();
        metrics.inc_groups_executed();
        metrics.inc_groups_failed();
        metrics.inc_mapping_cache_miss();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.groups_executed_total, 2);
        assert_eq!(snapshot.groups_failed_total, 1);
        assert_eq!(snapshot.mapping_cache_misses_total, 1);
        assert_eq!(snapshot.mapping_cache_hits_total, 0);
    }
}
