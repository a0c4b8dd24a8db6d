//! Database access layer with SQLx and PostgreSQL

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{DerivedMetric, Property, PropertyMapping, QueryGroup};
use crate::services::derived_metrics::DerivedMetricRepository;
use crate::services::mappings::MappingRepository;

const CREATE_PROPERTY_MAPPINGS: &str = r#"
    CREATE TABLE IF NOT EXISTS property_mappings (
        id UUID PRIMARY KEY,
        project_id BIGINT NOT NULL,
        display_name TEXT NOT NULL,
        name TEXT NOT NULL,
        properties JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (project_id, name)
    )
"#;

const CREATE_DERIVED_METRICS: &str = r#"
    CREATE TABLE IF NOT EXISTS derived_metrics (
        id UUID PRIMARY KEY,
        project_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        display_category TEXT NOT NULL,
        definition JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (project_id, name)
    )
"#;

/// Database connection pool and operations
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(connection_string)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {}", e)))?;

        info!("Database connection pool established");
        Ok(Self { pool })
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the mapping and derived metric tables if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_PROPERTY_MAPPINGS)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_DERIVED_METRICS)
            .execute(&self.pool)
            .await?;
        info!("Database schema ready");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

fn mapping_from_row(row: &PgRow) -> Result<PropertyMapping> {
    let properties: Json<Vec<Property>> = row.try_get("properties")?;
    Ok(PropertyMapping {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        display_name: row.try_get("display_name")?,
        name: row.try_get("name")?,
        properties: properties.0,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn derived_from_row(row: &PgRow) -> Result<DerivedMetric> {
    let definition: Json<QueryGroup> = row.try_get("definition")?;
    Ok(DerivedMetric {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        display_category: row.try_get("display_category")?,
        definition: definition.0,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

/// Postgres-backed property mappings
#[derive(Clone)]
pub struct PgMappingRepository {
    db: Database,
}

impl PgMappingRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MappingRepository for PgMappingRepository {
    async fn insert(&self, mapping: PropertyMapping) -> Result<PropertyMapping> {
        sqlx::query(
            r#"
            INSERT INTO property_mappings (id, project_id, display_name, name, properties, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(mapping.id)
        .bind(mapping.project_id)
        .bind(&mapping.display_name)
        .bind(&mapping.name)
        .bind(Json(&mapping.properties))
        .bind(mapping.created_at)
        .execute(self.db.pool())
        .await?;

        Ok(mapping)
    }

    async fn delete(&self, project_id: i64, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM property_mappings WHERE project_id = $1 AND id = $2")
            .bind(project_id)
            .bind(id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, project_id: i64) -> Result<Vec<PropertyMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, display_name, name, properties, created_at
            FROM property_mappings
            WHERE project_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(mapping_from_row).collect()
    }

    async fn get_by_name(&self, project_id: i64, name: &str) -> Result<Option<PropertyMapping>> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, display_name, name, properties, created_at
            FROM property_mappings
            WHERE project_id = $1 AND name = $2
            "#,
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(mapping_from_row).transpose()
    }
}

/// Postgres-backed derived metric definitions
#[derive(Clone)]
pub struct PgDerivedMetricRepository {
    db: Database,
}

impl PgDerivedMetricRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DerivedMetricRepository for PgDerivedMetricRepository {
    async fn insert(&self, metric: DerivedMetric) -> Result<DerivedMetric> {
        sqlx::query(
            r#"
            INSERT INTO derived_metrics (id, project_id, name, description, display_category, definition, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(metric.id)
        .bind(metric.project_id)
        .bind(&metric.name)
        .bind(&metric.description)
        .bind(&metric.display_category)
        .bind(Json(&metric.definition))
        .bind(metric.created_at)
        .execute(self.db.pool())
        .await?;

        Ok(metric)
    }

    async fn delete(&self, project_id: i64, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM derived_metrics WHERE project_id = $1 AND id = $2")
            .bind(project_id)
            .bind(id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, project_id: i64) -> Result<Vec<DerivedMetric>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, name, description, display_category, definition, created_at
            FROM derived_metrics
            WHERE project_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(derived_from_row).collect()
    }

    async fn get_by_name(&self, project_id: i64, name: &str) -> Result<Option<DerivedMetric>> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, name, description, display_category, definition, created_at
            FROM derived_metrics
            WHERE project_id = $1 AND name = $2
            "#,
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(derived_from_row).transpose()
    }
}
