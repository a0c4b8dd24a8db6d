//! Distinct values for a filter property, plain or property-mapped

use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::executor::memory::MAX_FILTER_VALUES;
use crate::executor::ExecutorRegistry;
use crate::models::{Category, Property, PropertyDataType};
use crate::services::mappings::PropertyMappingStore;

#[derive(Debug, Clone, Deserialize)]
pub struct FilterValuesRequest {
    #[serde(default, alias = "ca")]
    pub category: Option<Category>,
    #[serde(default, alias = "dc")]
    pub display_category: String,
    #[serde(default, alias = "objTy")]
    pub object_type: String,
    #[serde(alias = "prNa")]
    pub property_name: String,
    #[serde(default, alias = "en")]
    pub entity: String,
    #[serde(default, alias = "isPrMa")]
    pub is_property_mapping: bool,
}

#[derive(Clone)]
pub struct FilterValuesService {
    mappings: PropertyMappingStore,
    executors: ExecutorRegistry,
}

impl FilterValuesService {
    pub fn new(mappings: PropertyMappingStore, executors: ExecutorRegistry) -> Self {
        Self {
            mappings,
            executors,
        }
    }

    pub async fn lookup(&self, project_id: i64, request: &FilterValuesRequest) -> Result<Vec<String>> {
        if request.property_name.trim().is_empty() {
            return Err(AppError::InvalidInput("property_name is required".into()));
        }

        let properties = if request.is_property_mapping {
            self.mappings
                .get(project_id, &request.property_name)
                .await?
                .properties
        } else {
            let category = request
                .category
                .ok_or_else(|| AppError::InvalidInput("category is required".into()))?;
            vec![Property {
                category,
                display_category: request.display_category.clone(),
                object_type: request.object_type.clone(),
                name: request.property_name.clone(),
                data_type: PropertyDataType::Categorical,
                entity: request.entity.clone(),
            }]
        };

        let mut values = BTreeSet::new();
        for property in &properties {
            let executor = self.executors.get(property.category)?;
            values.extend(executor.filter_values(project_id, property).await?);
        }

        debug!(
            project_id,
            property = %request.property_name,
            mapped = request.is_property_mapping,
            values = values.len(),
            "Filter values resolved"
        );
        Ok(values.into_iter().take(MAX_FILTER_VALUES).collect())
    }
}
