//! Property mapping store: CRUD, per-category resolution and common lookup

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Property, PropertyMapping};
use crate::routes::metrics::EngineMetrics;
use crate::services::derived_metrics::DerivedMetricRepository;

/// Storage for property mappings
#[async_trait]
pub trait MappingRepository: Send + Sync {
    /// Insert a mapping; a taken `(project_id, name)` is a `Conflict`.
    async fn insert(&self, mapping: PropertyMapping) -> Result<PropertyMapping>;

    /// Returns false when nothing was deleted.
    async fn delete(&self, project_id: i64, id: Uuid) -> Result<bool>;

    /// All mappings of a project in creation order.
    async fn list(&self, project_id: i64) -> Result<Vec<PropertyMapping>>;

    async fn get_by_name(&self, project_id: i64, name: &str) -> Result<Option<PropertyMapping>>;
}

#[derive(Default)]
pub struct MemoryMappingRepository {
    mappings: RwLock<Vec<PropertyMapping>>,
}

impl MemoryMappingRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingRepository for MemoryMappingRepository {
    async fn insert(&self, mapping: PropertyMapping) -> Result<PropertyMapping> {
        let mut mappings = self.mappings.write();
        if mappings
            .iter()
            .any(|m| m.project_id == mapping.project_id && m.name == mapping.name)
        {
            return Err(AppError::Conflict("Entity with the same name exists".into()));
        }
        mappings.push(mapping.clone());
        Ok(mapping)
    }

    async fn delete(&self, project_id: i64, id: Uuid) -> Result<bool> {
        let mut mappings = self.mappings.write();
        let before = mappings.len();
        mappings.retain(|m| !(m.project_id == project_id && m.id == id));
        Ok(mappings.len() != before)
    }

    async fn list(&self, project_id: i64) -> Result<Vec<PropertyMapping>> {
        Ok(self
            .mappings
            .read()
            .iter()
            .filter(|m| m.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_by_name(&self, project_id: i64, name: &str) -> Result<Option<PropertyMapping>> {
        Ok(self
            .mappings
            .read()
            .iter()
            .find(|m| m.project_id == project_id && m.name == name)
            .cloned())
    }
}

/// One entry of a common-mapping lookup request
#[derive(Debug, Clone, Deserialize)]
pub struct CommonMappingRequest {
    /// Display category, or derived metric name when `derived_kpi` is set
    pub name: String,
    #[serde(default)]
    pub derived_kpi: bool,
}

/// Normalized identifier of a mapping display name.
///
/// `"Test property mapping 1"` becomes `test_property_mapping_1`.
pub fn normalize_display_name(display_name: &str) -> String {
    display_name
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn validate_properties(properties: &[Property]) -> Result<()> {
    if properties.is_empty() {
        return Err(AppError::InvalidInput(
            "Error with values passed in properties".into(),
        ));
    }

    if properties
        .iter()
        .any(|p| p.display_category.trim().is_empty() || p.name.trim().is_empty())
    {
        return Err(AppError::InvalidInput(
            "Error with values passed in properties".into(),
        ));
    }

    let data_type = properties[0].data_type;
    if properties.iter().any(|p| p.data_type != data_type) {
        return Err(AppError::InvalidInput(
            "All properties should have same data type".into(),
        ));
    }

    let mut seen = HashSet::new();
    if !properties.iter().all(|p| seen.insert(p.display_category.as_str())) {
        return Err(AppError::InvalidInput(
            "Duplicate display category in properties".into(),
        ));
    }

    Ok(())
}

/// Mapping service used by the HTTP layer and the normalizer
#[derive(Clone)]
pub struct PropertyMappingStore {
    repo: Arc<dyn MappingRepository>,
    derived: Arc<dyn DerivedMetricRepository>,
    metrics: Arc<EngineMetrics>,
}

impl PropertyMappingStore {
    pub fn new(
        repo: Arc<dyn MappingRepository>,
        derived: Arc<dyn DerivedMetricRepository>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            repo,
            derived,
            metrics,
        }
    }

    pub async fn create(
        &self,
        project_id: i64,
        display_name: &str,
        properties: Vec<Property>,
    ) -> Result<PropertyMapping> {
        let name = normalize_display_name(display_name);
        if name.is_empty() {
            return Err(AppError::InvalidInput("Invalid display name".into()));
        }
        validate_properties(&properties)?;

        let mapping = PropertyMapping {
            id: Uuid::new_v4(),
            project_id,
            display_name: display_name.trim().to_string(),
            name,
            properties,
            created_at: Utc::now(),
        };

        let created = self.repo.insert(mapping).await?;
        self.metrics.inc_mappings_created();
        info!(
            project_id,
            mapping = %created.name,
            properties = created.properties.len(),
            "Property mapping created"
        );
        Ok(created)
    }

    pub async fn delete(&self, project_id: i64, id: Uuid) -> Result<()> {
        if !self.repo.delete(project_id, id).await? {
            return Err(AppError::NotFound(format!("Property mapping {} not found", id)));
        }
        info!(project_id, %id, "Property mapping deleted");
        Ok(())
    }

    pub async fn list(&self, project_id: i64) -> Result<Vec<PropertyMapping>> {
        self.repo.list(project_id).await
    }

    pub async fn get(&self, project_id: i64, name: &str) -> Result<PropertyMapping> {
        self.repo
            .get_by_name(project_id, name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Property mapping '{}' not found", name)))
    }

    /// The concrete property a mapping uses for `display_category`.
    ///
    /// `NotFound` when no mapping has that name, `InvalidInput` when the
    /// mapping exists but does not cover the display category.
    pub async fn resolve_for_display_category(
        &self,
        project_id: i64,
        name: &str,
        display_category: &str,
    ) -> Result<Property> {
        let mapping = self.get(project_id, name).await?;
        property_of(&mapping, display_category)
    }

    /// Mappings covering every requested display category, in creation order.
    /// Derived metric entries contribute the display categories of their
    /// sub-queries.
    pub async fn find_common(
        &self,
        project_id: i64,
        requests: &[CommonMappingRequest],
    ) -> Result<Vec<PropertyMapping>> {
        let mut display_categories: Vec<String> = Vec::new();
        for request in requests {
            if request.derived_kpi {
                let metric = self
                    .derived
                    .get_by_name(project_id, &request.name)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("Derived metric '{}' not found", request.name))
                    })?;
                display_categories.extend(metric.display_categories());
            } else {
                display_categories.push(request.name.clone());
            }
        }

        let mappings = self.repo.list(project_id).await?;
        Ok(mappings
            .into_iter()
            .filter(|m| display_categories.iter().all(|dc| m.covers(dc)))
            .collect())
    }

    /// A resolver caching mapping lookups for one query group.
    pub fn resolver(&self, project_id: i64) -> MappingResolver {
        MappingResolver {
            repo: Arc::clone(&self.repo),
            metrics: Arc::clone(&self.metrics),
            project_id,
            cache: HashMap::new(),
        }
    }
}

fn property_of(mapping: &PropertyMapping, display_category: &str) -> Result<Property> {
    mapping.property_for(display_category).cloned().ok_or_else(|| {
        AppError::InvalidInput(format!(
            "Property mapping '{}' has no property for display category '{}'",
            mapping.name, display_category
        ))
    })
}

/// Per-group mapping cache: each name hits the repository at most once.
pub struct MappingResolver {
    repo: Arc<dyn MappingRepository>,
    metrics: Arc<EngineMetrics>,
    project_id: i64,
    cache: HashMap<String, Option<Arc<PropertyMapping>>>,
}

impl MappingResolver {
    pub async fn mapping(&mut self, name: &str) -> Result<Arc<PropertyMapping>> {
        let cached = match self.cache.get(name) {
            Some(entry) => {
                self.metrics.inc_mapping_cache_hit();
                entry.clone()
            }
            None => {
                self.metrics.inc_mapping_cache_miss();
                debug!(project_id = self.project_id, mapping = name, "Loading property mapping");
                let loaded = self
                    .repo
                    .get_by_name(self.project_id, name)
                    .await?
                    .map(Arc::new);
                self.cache.insert(name.to_string(), loaded.clone());
                loaded
            }
        };

        cached.ok_or_else(|| AppError::NotFound(format!("Property mapping '{}' not found", name)))
    }

    pub async fn resolve(&mut self, name: &str, display_category: &str) -> Result<Property> {
        let mapping = self.mapping(name).await?;
        property_of(&mapping, display_category)
    }
}
