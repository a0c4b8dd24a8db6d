//! Property mapping CRUD endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Property, PropertyMapping};
use crate::routes::extract::ApiJson;
use crate::services::mappings::CommonMappingRequest;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateMappingRequest {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub properties: Vec<Property>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub id: Uuid,
    pub deleted: bool,
}

/// POST /api/v1/projects/{project_id}/kpi/property_mappings
///
/// 400 on validation failure, 409 when the normalized name is taken.
pub async fn create_mapping(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    ApiJson(request): ApiJson<CreateMappingRequest>,
) -> Result<Json<PropertyMapping>> {
    state.metrics.inc_requests();
    let mapping = state
        .mappings
        .create(project_id, &request.display_name, request.properties)
        .await?;
    Ok(Json(mapping))
}

/// GET /api/v1/projects/{project_id}/kpi/property_mappings
pub async fn list_mappings(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<Json<Vec<PropertyMapping>>> {
    state.metrics.inc_requests();
    Ok(Json(state.mappings.list(project_id).await?))
}

/// DELETE /api/v1/projects/{project_id}/kpi/property_mappings/{id}
pub async fn delete_mapping(
    State(state): State<AppState>,
    Path((project_id, id)): Path<(i64, Uuid)>,
) -> Result<Json<DeletedResponse>> {
    state.metrics.inc_requests();
    state.mappings.delete(project_id, id).await?;
    Ok(Json(DeletedResponse { id, deleted: true }))
}

/// POST /api/v1/projects/{project_id}/kpi/property_mappings/common_properties
///
/// Body: `[{"name": display_category_or_derived_metric, "derived_kpi": bool}]`
pub async fn common_mappings(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    ApiJson(requests): ApiJson<Vec<CommonMappingRequest>>,
) -> Result<Json<Vec<PropertyMapping>>> {
    state.metrics.inc_requests();
    Ok(Json(state.mappings.find_common(project_id, &requests).await?))
}
