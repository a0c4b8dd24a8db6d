//! Derived metric (custom KPI) definitions

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{DerivedMetric, QueryGroup, OTHERS_DISPLAY_CATEGORY};
use crate::services::formula::Formula;

#[async_trait]
pub trait DerivedMetricRepository: Send + Sync {
    /// Insert a definition; a taken `(project_id, name)` is a `Conflict`.
    async fn insert(&self, metric: DerivedMetric) -> Result<DerivedMetric>;

    async fn delete(&self, project_id: i64, id: Uuid) -> Result<bool>;

    async fn list(&self, project_id: i64) -> Result<Vec<DerivedMetric>>;

    async fn get_by_name(&self, project_id: i64, name: &str) -> Result<Option<DerivedMetric>>;
}

#[derive(Default)]
pub struct MemoryDerivedMetricRepository {
    metrics: RwLock<Vec<DerivedMetric>>,
}

impl MemoryDerivedMetricRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DerivedMetricRepository for MemoryDerivedMetricRepository {
    async fn insert(&self, metric: DerivedMetric) -> Result<DerivedMetric> {
        let mut metrics = self.metrics.write();
        if metrics
            .iter()
            .any(|m| m.project_id == metric.project_id && m.name == metric.name)
        {
            return Err(AppError::Conflict("Entity with the same name exists".into()));
        }
        metrics.push(metric.clone());
        Ok(metric)
    }

    async fn delete(&self, project_id: i64, id: Uuid) -> Result<bool> {
        let mut metrics = self.metrics.write();
        let before = metrics.len();
        metrics.retain(|m| !(m.project_id == project_id && m.id == id));
        Ok(metrics.len() != before)
    }

    async fn list(&self, project_id: i64) -> Result<Vec<DerivedMetric>> {
        Ok(self
            .metrics
            .read()
            .iter()
            .filter(|m| m.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_by_name(&self, project_id: i64, name: &str) -> Result<Option<DerivedMetric>> {
        Ok(self
            .metrics
            .read()
            .iter()
            .find(|m| m.project_id == project_id && m.name == name)
            .cloned())
    }
}

/// Body of a derived metric create request
#[derive(Debug, Clone, Deserialize)]
pub struct NewDerivedMetric {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub display_category: String,
    #[serde(alias = "transformations")]
    pub definition: QueryGroup,
}

/// Check a derived definition and return its parsed formula.
///
/// Sub-queries must be plain (non-derived) single-metric queries without
/// group-bys or time buckets, and their names must be exactly the formula's
/// variables.
pub fn validate_definition(definition: &QueryGroup) -> Result<Formula> {
    if definition.queries.is_empty() {
        return Err(AppError::InvalidInput(
            "Derived metric needs at least one sub-query".into(),
        ));
    }

    let formula = Formula::parse(&definition.formula)?;

    let mut names = BTreeSet::new();
    for query in &definition.queries {
        if query.is_derived() {
            return Err(AppError::InvalidInput(
                "Derived metric sub-queries cannot be derived".into(),
            ));
        }
        if query.metrics.len() != 1 {
            return Err(AppError::InvalidInput(format!(
                "Sub-query '{}' must have exactly one metric",
                query.name
            )));
        }
        if !query.group_bys.is_empty() || query.group_by_timestamp.is_some() {
            return Err(AppError::InvalidInput(format!(
                "Sub-query '{}' cannot have group-bys",
                query.name
            )));
        }
        let name = query.name.trim().to_lowercase();
        if name.is_empty() || !names.insert(name) {
            return Err(AppError::InvalidInput(
                "Sub-query names must be unique and non-empty".into(),
            ));
        }
    }

    if formula.variables() != names {
        return Err(AppError::InvalidInput(format!(
            "Formula '{}' variables do not match sub-query names",
            definition.formula
        )));
    }

    Ok(formula)
}

#[derive(Clone)]
pub struct DerivedMetricStore {
    repo: Arc<dyn DerivedMetricRepository>,
}

impl DerivedMetricStore {
    pub fn new(repo: Arc<dyn DerivedMetricRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> Arc<dyn DerivedMetricRepository> {
        Arc::clone(&self.repo)
    }

    pub async fn create(&self, project_id: i64, request: NewDerivedMetric) -> Result<DerivedMetric> {
        let name = request.name.trim().to_string();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(AppError::InvalidInput("Invalid derived metric name".into()));
        }
        validate_definition(&request.definition)?;

        let display_category = if request.display_category.trim().is_empty() {
            OTHERS_DISPLAY_CATEGORY.to_string()
        } else {
            request.display_category
        };

        let metric = DerivedMetric {
            id: Uuid::new_v4(),
            project_id,
            name,
            description: request.description,
            display_category,
            definition: request.definition,
            created_at: Utc::now(),
        };

        let created = self.repo.insert(metric).await?;
        info!(project_id, metric = %created.name, "Derived metric created");
        Ok(created)
    }

    pub async fn delete(&self, project_id: i64, id: Uuid) -> Result<()> {
        if !self.repo.delete(project_id, id).await? {
            return Err(AppError::NotFound(format!("Derived metric {} not found", id)));
        }
        info!(project_id, %id, "Derived metric deleted");
        Ok(())
    }

    pub async fn list(&self, project_id: i64) -> Result<Vec<DerivedMetric>> {
        self.repo.list(project_id).await
    }

    pub async fn get_by_name(&self, project_id: i64, name: &str) -> Result<DerivedMetric> {
        self.repo
            .get_by_name(project_id, name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Derived metric '{}' not found", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(formula: &str, queries: serde_json::Value) -> NewDerivedMetric {
        serde_json::from_value(json!({
            "name": "cost_per_click",
            "definition": {"formula": formula, "queries": queries}
        }))
        .unwrap()
    }

    fn sub_query(name: &str, metric: &str) -> serde_json::Value {
        json!({
            "category": "channels",
            "display_category": "google_ads_metrics",
            "metrics": [metric],
            "name": name
        })
    }

    fn store() -> DerivedMetricStore {
        DerivedMetricStore::new(Arc::new(MemoryDerivedMetricRepository::new()))
    }

    #[tokio::test]
    async fn test_create_defaults_to_others() {
        let store = store();
        let created = store
            .create(1, request("a/b", json!([sub_query("a", "cost"), sub_query("b", "clicks")])))
            .await
            .unwrap();
        assert_eq!(created.display_category, "others");
        assert_eq!(store.get_by_name(1, "cost_per_click").await.unwrap().id, created.id);

        let duplicate = store
            .create(1, request("a/b", json!([sub_query("a", "cost"), sub_query("b", "clicks")])))
            .await;
        assert!(matches!(duplicate, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_variables_must_match_names() {
        let store = store();
        let result = store
            .create(1, request("a/c", json!([sub_query("a", "cost"), sub_query("b", "clicks")])))
            .await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));

        let result = store
            .create(1, request("a", json!([sub_query("a", "cost"), sub_query("b", "clicks")])))
            .await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_nested_derived_rejected() {
        let mut nested = sub_query("b", "ctr");
        nested["query_type"] = json!("derived");
        let result = store()
            .create(1, request("a/b", json!([sub_query("a", "cost"), nested])))
            .await;
        assert!(matches!(result, Err(AppError::InvalidInput(msg)) if msg.contains("cannot be derived")));
    }

    #[tokio::test]
    async fn test_sub_query_shape_rules() {
        let mut grouped = sub_query("b", "clicks");
        grouped["group_bys"] = json!([{"property_name": "campaign_name"}]);
        let result = store()
            .create(1, request("a/b", json!([sub_query("a", "cost"), grouped])))
            .await;
        assert!(result.is_err());

        let mut two_metrics = sub_query("b", "clicks");
        two_metrics["metrics"] = json!(["clicks", "impressions"]);
        let result = store()
            .create(1, request("a/b", json!([sub_query("a", "cost"), two_metrics])))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delete_unknown() {
        let result = store().delete(1, Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
