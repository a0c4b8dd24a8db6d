//! Core domain models for KPI query federation

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Header of the leading time-bucket column
pub const DATETIME_HEADER: &str = "datetime";

/// Cell value used for a group-by property that is absent on a record
pub const NONE_VALUE: &str = "$none";

/// Display category of derived metrics that span several categories
pub const OTHERS_DISPLAY_CATEGORY: &str = "others";

/// `display_result_as` value that scales a derived metric to a percentage
pub const PERCENTAGE_RESULT: &str = "percentage_type";

/// Data domain a metric is sourced from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Behavioral events
    #[serde(alias = "event")]
    Events,
    /// Entity profiles (CRM objects, users)
    #[serde(alias = "profile")]
    Profiles,
    /// Ad/channel spend documents
    #[serde(alias = "channel")]
    Channels,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Events => "events",
            Category::Profiles => "profiles",
            Category::Channels => "channels",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyDataType {
    #[default]
    Categorical,
    Numerical,
    Datetime,
}

/// A concrete, category-native property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub category: Category,
    pub display_category: String,
    #[serde(default)]
    pub object_type: String,
    pub name: String,
    pub data_type: PropertyDataType,
    #[serde(default)]
    pub entity: String,
}

/// A project-scoped alias uniting equivalent properties across display categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMapping {
    pub id: Uuid,
    pub project_id: i64,
    pub display_name: String,
    /// Normalized name, the identifier used inside queries
    pub name: String,
    pub properties: Vec<Property>,
    pub created_at: DateTime<Utc>,
}

impl PropertyMapping {
    /// The property registered for a display category, if any.
    pub fn property_for(&self, display_category: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.display_category == display_category)
    }

    pub fn covers(&self, display_category: &str) -> bool {
        self.property_for(display_category).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals,
    NotEqual,
    Contains,
    NotContains,
    GreaterThan,
    LesserThan,
    GreaterThanOrEqual,
    LesserThanOrEqual,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, alias = "objTy")]
    pub object_type: String,
    #[serde(alias = "prNa")]
    pub property_name: String,
    #[serde(default, alias = "isPrMa")]
    pub is_property_mapping: bool,
    #[serde(default, alias = "prDaTy")]
    pub data_type: PropertyDataType,
    #[serde(default, alias = "en")]
    pub entity: String,
    #[serde(alias = "co")]
    pub operator: Operator,
    #[serde(default, alias = "va")]
    pub value: String,
    #[serde(default, alias = "lOp")]
    pub logical_op: LogicalOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBy {
    #[serde(default, alias = "objTy")]
    pub object_type: String,
    #[serde(alias = "prNa")]
    pub property_name: String,
    #[serde(default, alias = "isPrMa")]
    pub is_property_mapping: bool,
    #[serde(default, alias = "prDaTy")]
    pub data_type: PropertyDataType,
    #[serde(default, alias = "en")]
    pub entity: String,
}

/// Time-bucket size for `group_by_timestamp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Date,
    Week,
    Month,
    Quarter,
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Granularity::Hour),
            "date" => Ok(Granularity::Date),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "quarter" => Ok(Granularity::Quarter),
            other => Err(format!("unknown group_by_timestamp: {}", other)),
        }
    }
}

fn deserialize_granularity<'de, D>(deserializer: D) -> std::result::Result<Option<Granularity>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    #[default]
    #[serde(rename = "", alias = "static", alias = "custom")]
    Standard,
    #[serde(rename = "derived")]
    Derived,
}

/// One member of a query group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(alias = "ca")]
    pub category: Category,
    #[serde(alias = "dc")]
    pub display_category: String,
    #[serde(default, alias = "me")]
    pub metrics: Vec<String>,
    #[serde(default, alias = "fil")]
    pub filters: Vec<Filter>,
    #[serde(default, alias = "gBy")]
    pub group_bys: Vec<GroupBy>,
    #[serde(default, alias = "fr")]
    pub from: i64,
    #[serde(default)]
    pub to: i64,
    #[serde(
        default,
        alias = "gbt",
        deserialize_with = "deserialize_granularity",
        skip_serializing_if = "Option::is_none"
    )]
    pub group_by_timestamp: Option<Granularity>,
    #[serde(default, alias = "qt")]
    pub query_type: QueryType,
    /// Formula variable name when used inside a derived metric
    #[serde(default, alias = "na")]
    pub name: String,
    #[serde(default, alias = "an")]
    pub alias_name: String,
    #[serde(default, alias = "tz")]
    pub timezone: String,
    /// Inline derived definition; otherwise `metrics[0]` names a stored derived metric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<QueryGroup>,
}

impl Query {
    pub fn is_derived(&self) -> bool {
        self.query_type == QueryType::Derived
    }

    /// Parse the IANA timezone; an empty string means UTC.
    pub fn tz(&self) -> Result<Tz> {
        if self.timezone.is_empty() {
            return Ok(Tz::UTC);
        }
        self.timezone
            .parse::<Tz>()
            .map_err(|_| AppError::InvalidInput(format!("Invalid timezone '{}'", self.timezone)))
    }

    /// Column name of this query's (first) metric in result tables.
    pub fn metric_label(&self) -> &str {
        if !self.alias_name.is_empty() {
            return &self.alias_name;
        }
        self.metrics.first().map(String::as_str).unwrap_or(&self.name)
    }
}

/// A group of member queries sharing global filters/group-bys.
///
/// Also the shape of a derived metric definition, where `formula` combines
/// the member queries by their `name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryGroup {
    #[serde(default, alias = "cl")]
    pub class: String,
    #[serde(default, alias = "for")]
    pub formula: String,
    #[serde(default, alias = "qG")]
    pub queries: Vec<Query>,
    #[serde(default, alias = "gFil")]
    pub global_filters: Vec<Filter>,
    #[serde(default, alias = "gGBy")]
    pub global_group_bys: Vec<GroupBy>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_result_as: String,
}

impl QueryGroup {
    pub fn is_percentage(&self) -> bool {
        self.display_result_as == PERCENTAGE_RESULT
    }
}

/// A stored formula over named sub-queries (custom KPI)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetric {
    pub id: Uuid,
    pub project_id: i64,
    pub name: String,
    pub description: String,
    pub display_category: String,
    pub definition: QueryGroup,
    pub created_at: DateTime<Utc>,
}

impl DerivedMetric {
    /// Display categories reachable through the sub-queries, deduplicated in order.
    pub fn display_categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = Vec::new();
        for query in &self.definition.queries {
            if !categories.contains(&query.display_category) {
                categories.push(query.display_category.clone());
            }
        }
        categories
    }
}

/// One result table. Every row has exactly `headers.len()` cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl ResultTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self { headers, rows }
    }

    /// Placeholder tables returned alongside a failed group status.
    pub fn empty_set(count: usize) -> Vec<ResultTable> {
        vec![ResultTable::default(); count]
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.rows.is_empty()
    }

    pub fn column_index(&self, header: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == header)
    }

    pub fn has_datetime(&self) -> bool {
        self.headers.first().map(String::as_str) == Some(DATETIME_HEADER)
    }
}

/// A member query with every property-mapping placeholder replaced by the
/// concrete property of its display category. This is what executors run.
#[derive(Debug, Clone)]
pub struct ResolvedQuery {
    pub query: Query,
    /// Column label per group-by: the mapping name for mapped group-bys,
    /// otherwise the property name.
    pub group_by_labels: Vec<String>,
    pub timezone: Tz,
}

impl ResolvedQuery {
    /// Number of leading non-metric columns in this query's result table.
    pub fn key_width(&self) -> usize {
        let datetime = usize::from(self.query.group_by_timestamp.is_some());
        datetime + self.query.group_bys.len()
    }
}
