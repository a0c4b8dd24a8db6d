//! In-memory category executor
//!
//! Holds raw records per display category and aggregates them on demand.
//! Used by the default binary and by tests; production storage engines plug
//! in through the same [`CategoryExecutor`] trait.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

use super::{CategoryExecutor, ExecutionOptions};
use crate::error::{AppError, Result};
use crate::models::{
    Category, Filter, Granularity, LogicalOp, Operator, Property, ResolvedQuery, ResultTable,
    DATETIME_HEADER, NONE_VALUE,
};

/// Upper bound on values returned by a filter-values lookup
pub const MAX_FILTER_VALUES: usize = 2500;

/// One raw event, profile document or channel document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub project_id: i64,
    pub display_category: String,
    #[serde(default)]
    pub object_type: String,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl Record {
    fn value_of(&self, property: &str) -> String {
        match self.properties.get(property) {
            None | Some(Value::Null) => NONE_VALUE.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    fn number_of(&self, property: &str) -> f64 {
        match self.properties.get(property) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "property")]
pub enum Aggregate {
    Count,
    Sum(String),
    CountDistinct(String),
}

/// How a named metric is computed for one display category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub aggregate: Aggregate,
    /// Only records of this object type contribute, e.g. one event name
    #[serde(default)]
    pub object_type: Option<String>,
}

impl MetricDefinition {
    pub fn count() -> Self {
        Self {
            aggregate: Aggregate::Count,
            object_type: None,
        }
    }

    pub fn sum(property: &str) -> Self {
        Self {
            aggregate: Aggregate::Sum(property.to_string()),
            object_type: None,
        }
    }

    pub fn count_distinct(property: &str) -> Self {
        Self {
            aggregate: Aggregate::CountDistinct(property.to_string()),
            object_type: None,
        }
    }

    pub fn for_object_type(mut self, object_type: &str) -> Self {
        self.object_type = Some(object_type.to_string());
        self
    }

    fn accepts(&self, record: &Record) -> bool {
        self.object_type
            .as_deref()
            .map_or(true, |object_type| record.object_type == object_type)
    }
}

enum Accumulator {
    Total(f64),
    Distinct(HashSet<String>),
}

impl Accumulator {
    fn new(definition: &MetricDefinition) -> Self {
        match definition.aggregate {
            Aggregate::CountDistinct(_) => Accumulator::Distinct(HashSet::new()),
            _ => Accumulator::Total(0.0),
        }
    }

    fn add(&mut self, definition: &MetricDefinition, record: &Record) {
        match (self, &definition.aggregate) {
            (Accumulator::Total(total), Aggregate::Count) => *total += 1.0,
            (Accumulator::Total(total), Aggregate::Sum(property)) => {
                *total += record.number_of(property)
            }
            (Accumulator::Distinct(seen), Aggregate::CountDistinct(property)) => {
                if record.properties.contains_key(property) {
                    seen.insert(record.value_of(property));
                }
            }
            _ => {}
        }
    }

    fn value(&self) -> f64 {
        match self {
            Accumulator::Total(total) => *total,
            Accumulator::Distinct(seen) => seen.len() as f64,
        }
    }
}

/// Category executor backed by in-process record storage
pub struct MemoryExecutor {
    category: Category,
    records: RwLock<Vec<Record>>,
    /// (display_category, metric name) -> definition
    metrics: RwLock<HashMap<(String, String), MetricDefinition>>,
}

impl MemoryExecutor {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            records: RwLock::new(Vec::new()),
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn events() -> Self {
        Self::new(Category::Events)
    }

    pub fn profiles() -> Self {
        Self::new(Category::Profiles)
    }

    pub fn channels() -> Self {
        Self::new(Category::Channels)
    }

    pub fn insert(&self, record: Record) {
        self.records.write().push(record);
    }

    pub fn insert_many(&self, records: impl IntoIterator<Item = Record>) {
        self.records.write().extend(records);
    }

    pub fn define_metric(&self, display_category: &str, name: &str, definition: MetricDefinition) {
        self.metrics
            .write()
            .insert((display_category.to_string(), name.to_string()), definition);
    }

    fn metric(&self, display_category: &str, name: &str) -> Result<MetricDefinition> {
        self.metrics
            .read()
            .get(&(display_category.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                AppError::InvalidInput(format!(
                    "Unknown metric '{}' for display category '{}'",
                    name, display_category
                ))
            })
    }

    fn aggregate(&self, project_id: i64, resolved: &ResolvedQuery) -> Result<ResultTable> {
        let query = &resolved.query;
        let tz = resolved.timezone;

        let definitions = query
            .metrics
            .iter()
            .map(|name| self.metric(&query.display_category, name))
            .collect::<Result<Vec<_>>>()?;

        let group_properties: Vec<&str> = query
            .group_bys
            .iter()
            .map(|g| g.property_name.as_str())
            .collect();

        let buckets = match query.group_by_timestamp {
            Some(granularity) => bucket_labels(query.from, query.to, granularity, tz),
            None => vec![String::new()],
        };
        let bucket_index: HashMap<&str, usize> = buckets
            .iter()
            .enumerate()
            .map(|(i, label)| (label.as_str(), i))
            .collect();

        let records = self.records.read();
        let in_window: Vec<&Record> = records
            .iter()
            .filter(|r| {
                r.project_id == project_id
                    && r.display_category == query.display_category
                    && r.timestamp >= query.from
                    && r.timestamp <= query.to
            })
            .collect();

        let key_space: BTreeSet<Vec<String>> = in_window
            .iter()
            .map(|r| group_properties.iter().map(|p| r.value_of(p)).collect())
            .chain(group_properties.is_empty().then(Vec::new))
            .collect();

        let mut cells: BTreeMap<(usize, Vec<String>), Vec<Accumulator>> = BTreeMap::new();
        for record in in_window.iter().filter(|r| matches_filters(r, &query.filters)) {
            let bucket = match query.group_by_timestamp {
                Some(granularity) => {
                    let Some(label) = record_bucket(record.timestamp, granularity, tz) else {
                        continue;
                    };
                    match bucket_index.get(label.as_str()) {
                        Some(index) => *index,
                        None => continue,
                    }
                }
                None => 0,
            };
            let key: Vec<String> = group_properties.iter().map(|p| record.value_of(p)).collect();
            let accumulators = cells
                .entry((bucket, key))
                .or_insert_with(|| definitions.iter().map(Accumulator::new).collect());
            for (acc, definition) in accumulators.iter_mut().zip(&definitions) {
                if definition.accepts(record) {
                    acc.add(definition, record);
                }
            }
        }

        let mut headers = Vec::with_capacity(resolved.key_width() + definitions.len());
        if query.group_by_timestamp.is_some() {
            headers.push(DATETIME_HEADER.to_string());
        }
        headers.extend(group_properties.iter().map(|p| p.to_string()));
        headers.extend(query.metrics.iter().cloned());

        let mut rows = Vec::with_capacity(buckets.len() * key_space.len());
        for (bucket, label) in buckets.iter().enumerate() {
            for key in &key_space {
                let mut row: Vec<Value> = Vec::with_capacity(headers.len());
                if query.group_by_timestamp.is_some() {
                    row.push(Value::String(label.clone()));
                }
                row.extend(key.iter().cloned().map(Value::String));
                match cells.get(&(bucket, key.clone())) {
                    Some(accumulators) => {
                        row.extend(accumulators.iter().map(|a| Value::from(a.value())))
                    }
                    None => row.extend(definitions.iter().map(|_| Value::from(0.0))),
                }
                rows.push(row);
            }
        }

        Ok(ResultTable::new(headers, rows))
    }
}

#[async_trait]
impl CategoryExecutor for MemoryExecutor {
    fn category(&self) -> Category {
        self.category
    }

    async fn execute(
        &self,
        project_id: i64,
        query: &ResolvedQuery,
        options: &ExecutionOptions,
    ) -> Result<ResultTable> {
        let optimised = match self.category {
            Category::Profiles => options.optimised_profile_filter,
            Category::Events => options.optimised_event_user_filter,
            Category::Channels => false,
        };
        debug!(
            project_id,
            category = %self.category,
            display_category = %query.query.display_category,
            optimised,
            "Executing in-memory query"
        );
        self.aggregate(project_id, query)
    }

    async fn filter_values(&self, project_id: i64, property: &Property) -> Result<Vec<String>> {
        let records = self.records.read();
        let values: BTreeSet<String> = records
            .iter()
            .filter(|r| {
                r.project_id == project_id
                    && r.display_category == property.display_category
                    && (property.object_type.is_empty() || r.object_type == property.object_type)
                    && r.properties.contains_key(&property.name)
            })
            .map(|r| r.value_of(&property.name))
            .collect();

        Ok(values.into_iter().take(MAX_FILTER_VALUES).collect())
    }
}

/// Filters apply in order; an `OR` filter joins the preceding group and
/// groups are ANDed together.
fn matches_filters(record: &Record, filters: &[Filter]) -> bool {
    let mut groups: Vec<Vec<&Filter>> = Vec::new();
    for filter in filters {
        match (filter.logical_op, groups.last_mut()) {
            (LogicalOp::Or, Some(group)) => group.push(filter),
            _ => groups.push(vec![filter]),
        }
    }

    groups
        .iter()
        .all(|group| group.iter().any(|filter| matches_filter(record, filter)))
}

fn matches_filter(record: &Record, filter: &Filter) -> bool {
    let actual = record.value_of(&filter.property_name);
    let expected = filter.value.as_str();

    let compare = |f: fn(f64, f64) -> bool| match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => f(a, b),
        _ => false,
    };

    match filter.operator {
        Operator::Equals => actual == expected,
        Operator::NotEqual => actual != expected,
        Operator::Contains => actual.contains(expected),
        Operator::NotContains => !actual.contains(expected),
        Operator::GreaterThan => compare(|a, b| a > b),
        Operator::LesserThan => compare(|a, b| a < b),
        Operator::GreaterThanOrEqual => compare(|a, b| a >= b),
        Operator::LesserThanOrEqual => compare(|a, b| a <= b),
    }
}

fn localize(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    tz.from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

fn midnight(tz: Tz, date: NaiveDate) -> DateTime<Tz> {
    localize(tz, date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

fn bucket_start(at: DateTime<Tz>, granularity: Granularity) -> DateTime<Tz> {
    let tz = at.timezone();
    let date = at.date_naive();
    match granularity {
        Granularity::Hour => {
            let naive = date.and_hms_opt(at.hour(), 0, 0).unwrap_or_default();
            localize(tz, naive)
        }
        Granularity::Date => midnight(tz, date),
        Granularity::Week => {
            let offset = i64::from(date.weekday().num_days_from_sunday());
            midnight(tz, date - Duration::days(offset))
        }
        Granularity::Month => midnight(tz, date.with_day(1).unwrap_or(date)),
        Granularity::Quarter => {
            let month = (date.month0() / 3) * 3 + 1;
            let first = NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date);
            midnight(tz, first)
        }
    }
}

fn next_bucket(start: DateTime<Tz>, granularity: Granularity) -> Option<DateTime<Tz>> {
    let tz = start.timezone();
    let date = start.date_naive();
    let next = match granularity {
        Granularity::Hour => bucket_start(start + Duration::hours(1), granularity),
        Granularity::Date => midnight(tz, date.succ_opt()?),
        Granularity::Week => midnight(tz, date + Duration::days(7)),
        Granularity::Month => midnight(tz, date.checked_add_months(Months::new(1))?),
        Granularity::Quarter => midnight(tz, date.checked_add_months(Months::new(3))?),
    };
    (next > start).then_some(next)
}

fn label(at: DateTime<Tz>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

fn to_local(timestamp: i64, tz: Tz) -> Option<DateTime<Tz>> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|at| at.with_timezone(&tz))
}

fn record_bucket(timestamp: i64, granularity: Granularity, tz: Tz) -> Option<String> {
    to_local(timestamp, tz).map(|at| label(bucket_start(at, granularity)))
}

/// Labels of every bucket overlapping `[from, to]`, in time order.
pub fn bucket_labels(from: i64, to: i64, granularity: Granularity, tz: Tz) -> Vec<String> {
    let (Some(start), Some(end)) = (to_local(from, tz), to_local(to, tz)) else {
        return Vec::new();
    };

    let mut labels = Vec::new();
    let mut current = bucket_start(start, granularity);
    while current <= end {
        labels.push(label(current));
        match next_bucket(current, granularity) {
            Some(next) => current = next,
            None => break,
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroupBy, PropertyDataType, Query, QueryType};
    use serde_json::json;

    // 2023-01-18T00:00:00Z
    const DAY: i64 = 1_674_000_000 - (1_674_000_000 % 86_400);

    fn record(dc: &str, offset: i64, props: serde_json::Value) -> Record {
        Record {
            project_id: 1,
            display_category: dc.into(),
            object_type: String::new(),
            timestamp: DAY + offset,
            properties: serde_json::from_value(props).unwrap(),
        }
    }

    fn query(dc: &str, metrics: &[&str]) -> Query {
        Query {
            category: Category::Profiles,
            display_category: dc.into(),
            metrics: metrics.iter().map(|m| m.to_string()).collect(),
            filters: vec![],
            group_bys: vec![],
            from: DAY,
            to: DAY + 3 * 86_400 - 1,
            group_by_timestamp: None,
            query_type: QueryType::Standard,
            name: String::new(),
            alias_name: String::new(),
            timezone: String::new(),
            definition: None,
        }
    }

    fn resolve(query: Query) -> ResolvedQuery {
        let labels = query.group_bys.iter().map(|g| g.property_name.clone()).collect();
        ResolvedQuery {
            timezone: query.tz().unwrap(),
            query,
            group_by_labels: labels,
        }
    }

    fn filter(property: &str, operator: Operator, value: &str, op: LogicalOp) -> Filter {
        Filter {
            object_type: String::new(),
            property_name: property.into(),
            is_property_mapping: false,
            data_type: PropertyDataType::Categorical,
            entity: String::new(),
            operator,
            value: value.into(),
            logical_op: op,
        }
    }

    fn group_by(property: &str) -> GroupBy {
        GroupBy {
            object_type: String::new(),
            property_name: property.into(),
            is_property_mapping: false,
            data_type: PropertyDataType::Categorical,
            entity: String::new(),
        }
    }

    fn contacts() -> MemoryExecutor {
        let executor = MemoryExecutor::profiles();
        executor.define_metric("hubspot_contacts", "count", MetricDefinition::count());
        executor.define_metric("hubspot_contacts", "revenue", MetricDefinition::sum("amount"));
        executor.insert_many(vec![
            record("hubspot_contacts", 10, json!({"country": "India", "amount": 5})),
            record("hubspot_contacts", 20, json!({"country": "US", "amount": 7})),
            record("hubspot_contacts", 86_400 + 5, json!({"country": "India", "amount": 1})),
            record("hubspot_contacts", 86_400 + 6, json!({"amount": 2})),
        ]);
        executor
    }

    #[tokio::test]
    async fn test_aggregate_without_grouping() {
        let executor = contacts();
        let table = executor
            .execute(1, &resolve(query("hubspot_contacts", &["count", "revenue"])), &ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(table.headers, vec!["count", "revenue"]);
        assert_eq!(table.rows, vec![vec![json!(4.0), json!(15.0)]]);
    }

    #[tokio::test]
    async fn test_zero_fill_when_filter_matches_nothing() {
        let executor = contacts();
        let mut q = query("hubspot_contacts", &["count"]);
        q.group_bys = vec![group_by("country")];
        q.filters = vec![filter("country", Operator::Equals, "Japan", LogicalOp::And)];
        let table = executor
            .execute(1, &resolve(q), &ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(table.headers, vec!["country", "count"]);
        assert_eq!(
            table.rows,
            vec![
                vec![json!("$none"), json!(0.0)],
                vec![json!("India"), json!(0.0)],
                vec![json!("US"), json!(0.0)],
            ]
        );
    }

    #[tokio::test]
    async fn test_datetime_buckets_are_zero_filled() {
        let executor = contacts();
        let mut q = query("hubspot_contacts", &["count"]);
        q.group_by_timestamp = Some(Granularity::Date);
        let table = executor
            .execute(1, &resolve(q), &ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(table.headers, vec!["datetime", "count"]);
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[0][0], json!("2023-01-18T00:00:00+00:00"));
        assert_eq!(table.rows[0][1], json!(2.0));
        assert_eq!(table.rows[1][1], json!(2.0));
        assert_eq!(table.rows[2][1], json!(0.0));
    }

    #[tokio::test]
    async fn test_or_filters_join_previous_group() {
        let executor = contacts();
        let mut q = query("hubspot_contacts", &["count"]);
        q.filters = vec![
            filter("country", Operator::Equals, "US", LogicalOp::And),
            filter("country", Operator::Equals, "$none", LogicalOp::Or),
            filter("amount", Operator::GreaterThan, "3", LogicalOp::And),
        ];
        let table = executor
            .execute(1, &resolve(q), &ExecutionOptions::default())
            .await
            .unwrap();
        assert_eq!(table.rows, vec![vec![json!(1.0)]]);
    }

    #[tokio::test]
    async fn test_unknown_metric() {
        let executor = contacts();
        let result = executor
            .execute(1, &resolve(query("hubspot_contacts", &["clicks"])), &ExecutionOptions::default())
            .await;
        assert!(matches!(result, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_filter_values_sorted_and_distinct() {
        let executor = contacts();
        let property = Property {
            category: Category::Profiles,
            display_category: "hubspot_contacts".into(),
            object_type: String::new(),
            name: "country".into(),
            data_type: PropertyDataType::Categorical,
            entity: String::new(),
        };
        let values = executor.filter_values(1, &property).await.unwrap();
        assert_eq!(values, vec!["India", "US"]);
    }

    #[test]
    fn test_bucket_labels_follow_timezone() {
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let labels = bucket_labels(DAY, DAY + 86_400, Granularity::Date, tz);
        assert_eq!(
            labels,
            vec![
                "2023-01-18T00:00:00+05:30",
                "2023-01-19T00:00:00+05:30",
            ]
        );

        let months = bucket_labels(DAY, DAY + 60 * 86_400, Granularity::Month, Tz::UTC);
        assert_eq!(
            months,
            vec![
                "2023-01-01T00:00:00+00:00",
                "2023-02-01T00:00:00+00:00",
                "2023-03-01T00:00:00+00:00",
            ]
        );

        // 2023-01-18 is a Wednesday; weeks start on the preceding Sunday.
        let weeks = bucket_labels(DAY, DAY + 7 * 86_400, Granularity::Week, Tz::UTC);
        assert_eq!(
            weeks,
            vec![
                "2023-01-15T00:00:00+00:00",
                "2023-01-22T00:00:00+00:00",
            ]
        );

        let quarters = bucket_labels(DAY, DAY + 90 * 86_400, Granularity::Quarter, Tz::UTC);
        assert_eq!(
            quarters,
            vec![
                "2023-01-01T00:00:00+00:00",
                "2023-04-01T00:00:00+00:00",
            ]
        );

        let hours = bucket_labels(DAY + 1_800, DAY + 2 * 3_600, Granularity::Hour, Tz::UTC);
        assert_eq!(
            hours,
            vec![
                "2023-01-18T00:00:00+00:00",
                "2023-01-18T01:00:00+00:00",
                "2023-01-18T02:00:00+00:00",
            ]
        );

        let local_hours = bucket_labels(DAY, DAY + 600, Granularity::Hour, tz);
        assert_eq!(local_hours, vec!["2023-01-18T05:00:00+05:30"]);
    }
}
