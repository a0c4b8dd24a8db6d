//! Derived metric (custom KPI) endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::error::Result;
use crate::models::DerivedMetric;
use crate::routes::extract::ApiJson;
use crate::routes::mappings::DeletedResponse;
use crate::services::derived_metrics::NewDerivedMetric;
use crate::state::AppState;

/// POST /api/v1/projects/{project_id}/kpi/derived_metrics
pub async fn create_derived_metric(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    ApiJson(request): ApiJson<NewDerivedMetric>,
) -> Result<Json<DerivedMetric>> {
    state.metrics.inc_requests();
    Ok(Json(state.derived_metrics.create(project_id, request).await?))
}

/// GET /api/v1/projects/{project_id}/kpi/derived_metrics
pub async fn list_derived_metrics(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<Json<Vec<DerivedMetric>>> {
    state.metrics.inc_requests();
    Ok(Json(state.derived_metrics.list(project_id).await?))
}

/// DELETE /api/v1/projects/{project_id}/kpi/derived_metrics/{id}
pub async fn delete_derived_metric(
    State(state): State<AppState>,
    Path((project_id, id)): Path<(i64, Uuid)>,
) -> Result<Json<DeletedResponse>> {
    state.metrics.inc_requests();
    state.derived_metrics.delete(project_id, id).await?;
    Ok(Json(DeletedResponse { id, deleted: true }))
}
