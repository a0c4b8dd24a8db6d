//! HTTP routes

pub mod derived_metrics;
pub mod extract;
pub mod health;
pub mod mappings;
pub mod metrics;
pub mod query;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health and metrics (Kubernetes probes + Prometheus)
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(metrics::prometheus_metrics))
        // Query groups
        .route(
            "/api/v1/projects/{project_id}/kpi/query",
            post(query::execute_query_group),
        )
        .route(
            "/api/v1/projects/{project_id}/kpi/filter_values",
            post(query::filter_values),
        )
        // Property mappings
        .route(
            "/api/v1/projects/{project_id}/kpi/property_mappings",
            post(mappings::create_mapping).get(mappings::list_mappings),
        )
        .route(
            "/api/v1/projects/{project_id}/kpi/property_mappings/common_properties",
            post(mappings::common_mappings),
        )
        // Spelling used by existing dashboard clients
        .route(
            "/api/v1/projects/{project_id}/kpi/property_mappings/commom_properties",
            post(mappings::common_mappings),
        )
        .route(
            "/api/v1/projects/{project_id}/kpi/property_mappings/{id}",
            delete(mappings::delete_mapping),
        )
        // Derived metrics
        .route(
            "/api/v1/projects/{project_id}/kpi/derived_metrics",
            post(derived_metrics::create_derived_metric).get(derived_metrics::list_derived_metrics),
        )
        .route(
            "/api/v1/projects/{project_id}/kpi/derived_metrics/{id}",
            delete(derived_metrics::delete_derived_metric),
        )
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
