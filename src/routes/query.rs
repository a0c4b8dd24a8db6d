//! Query group execution and filter-values endpoints

use axum::{
    extract::{Path, Query as UrlQuery, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::parse_bool;
use crate::error::{AppError, Result};
use crate::executor::ExecutionOptions;
use crate::models::{QueryGroup, ResultTable};
use crate::routes::extract::ApiJson;
use crate::services::filter_values::FilterValuesRequest;
use crate::state::AppState;

pub const OPTIMISED_PROFILE_FILTER_HEADER: &str = "x-optimised-profile-filter";
pub const OPTIMISED_EVENT_USER_FILTER_HEADER: &str = "x-optimised-event-user-filter";

#[derive(Debug, Default, Deserialize)]
pub struct QueryGroupParams {
    /// Also return the joined view of all member tables
    #[serde(default)]
    pub combine: bool,
}

#[derive(Debug, Serialize)]
pub struct QueryGroupResponse {
    pub result: Vec<ResultTable>,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined: Option<Vec<ResultTable>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined_error: Option<String>,
}

impl QueryGroupResponse {
    /// Response for a body that never became a query group.
    fn rejected(err: &AppError) -> (StatusCode, Json<Self>) {
        let status = err.status_code();
        (
            status,
            Json(Self {
                result: Vec::new(),
                status: status.as_u16(),
                error: Some(err.message().to_string()),
                combined: None,
                combined_error: None,
            }),
        )
    }
}

fn header_enabled(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bool)
        .unwrap_or(false)
}

/// Per-request options: configured defaults, switched on by request headers.
fn request_options(defaults: &ExecutionOptions, headers: &HeaderMap) -> ExecutionOptions {
    ExecutionOptions {
        optimised_profile_filter: defaults.optimised_profile_filter
            || header_enabled(headers, OPTIMISED_PROFILE_FILTER_HEADER),
        optimised_event_user_filter: defaults.optimised_event_user_filter
            || header_enabled(headers, OPTIMISED_EVENT_USER_FILTER_HEADER),
        ..defaults.clone()
    }
}

/// POST /api/v1/projects/{project_id}/kpi/query
///
/// Executes a query group. The HTTP status equals the group status; on
/// failure `result` holds one empty table per member query.
pub async fn execute_query_group(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    UrlQuery(params): UrlQuery<QueryGroupParams>,
    headers: HeaderMap,
    payload: std::result::Result<ApiJson<QueryGroup>, AppError>,
) -> (StatusCode, Json<QueryGroupResponse>) {
    state.metrics.inc_requests();
    let group = match payload {
        Ok(ApiJson(group)) => group,
        Err(err) => {
            warn!(project_id, error = %err, "Rejected KPI query body");
            return QueryGroupResponse::rejected(&err);
        }
    };
    let options = request_options(&state.execution, &headers);

    let outcome = if params.combine {
        state.engine.execute_combined(project_id, &group, &options).await
    } else {
        state.engine.execute(project_id, &group, &options).await
    };

    info!(
        project_id,
        queries = group.queries.len(),
        status = outcome.status.as_u16(),
        "KPI query handled"
    );

    (
        outcome.status,
        Json(QueryGroupResponse {
            result: outcome.results,
            status: outcome.status.as_u16(),
            error: outcome.error,
            combined: outcome.combined,
            combined_error: outcome.combined_error,
        }),
    )
}

/// POST /api/v1/projects/{project_id}/kpi/filter_values
///
/// Distinct values of a property, or of every property behind a mapping.
pub async fn filter_values(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    ApiJson(request): ApiJson<FilterValuesRequest>,
) -> Result<Json<Vec<String>>> {
    state.metrics.inc_requests();
    let values = state.filter_values.lookup(project_id, &request).await?;
    Ok(Json(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_headers_switch_flags_on() {
        let defaults = ExecutionOptions::default();
        let mut headers = HeaderMap::new();
        headers.insert(OPTIMISED_EVENT_USER_FILTER_HEADER, HeaderValue::from_static("true"));
        headers.insert(OPTIMISED_PROFILE_FILTER_HEADER, HeaderValue::from_static("nonsense"));

        let options = request_options(&defaults, &headers);
        assert!(options.optimised_event_user_filter);
        assert!(!options.optimised_profile_filter);
        assert_eq!(options.max_concurrency, defaults.max_concurrency);
    }
}
