//! Derived metric expansion: run sub-queries, align rows, evaluate the formula

use futures_util::future::try_join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::executor::{ExecutionOptions, ExecutorRegistry};
use crate::models::{ResultTable, DATETIME_HEADER};
use crate::services::normalizer::DerivedPlan;

/// Execute every sub-query of `plan` and combine them into one table.
pub async fn execute_derived(
    registry: &ExecutorRegistry,
    project_id: i64,
    plan: &DerivedPlan,
    options: &ExecutionOptions,
) -> Result<ResultTable> {
    let tables = try_join_all(
        plan.sub_queries
            .iter()
            .map(|(_, resolved)| registry.run(project_id, resolved, options)),
    )
    .await?;

    let named: Vec<(String, ResultTable)> = plan
        .sub_queries
        .iter()
        .map(|(name, _)| name.clone())
        .zip(tables)
        .collect();

    debug!(
        project_id,
        metric = %plan.label,
        sub_queries = named.len(),
        "Derived sub-queries executed"
    );

    align(plan, &named)
}

fn cell_key(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cell_number(cell: &Value) -> f64 {
    match cell {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Join sub-query tables on `(datetime?, group-by values...)` and evaluate
/// the formula per joined row. Keys missing from a table contribute 0.
pub fn align(plan: &DerivedPlan, tables: &[(String, ResultTable)]) -> Result<ResultTable> {
    let key_width = usize::from(plan.has_datetime) + plan.group_by_labels.len();

    let mut joined: BTreeMap<Vec<String>, HashMap<&str, f64>> = BTreeMap::new();
    for (name, table) in tables {
        if table.headers.len() <= key_width {
            return Err(AppError::ExecutionFailure(format!(
                "Sub-query '{}' returned no metric column",
                name
            )));
        }
        for row in &table.rows {
            if row.len() != table.headers.len() {
                return Err(AppError::ExecutionFailure(format!(
                    "Sub-query '{}' returned a malformed row",
                    name
                )));
            }
            let key: Vec<String> = row[..key_width].iter().map(cell_key).collect();
            let value = cell_number(&row[key_width]);
            *joined.entry(key).or_default().entry(name.as_str()).or_insert(0.0) += value;
        }
    }

    let variables: Vec<&str> = plan.sub_queries.iter().map(|(name, _)| name.as_str()).collect();
    let scale = if plan.percentage { 100.0 } else { 1.0 };

    let mut rows = Vec::with_capacity(joined.len());
    for (key, values) in joined {
        let result = plan.formula.evaluate(|variable| {
            variables
                .contains(&variable)
                .then(|| values.get(variable).copied().unwrap_or(0.0))
        })?;

        let mut row: Vec<Value> = key.into_iter().map(Value::String).collect();
        row.push(Value::from(result * scale));
        rows.push(row);
    }

    let mut headers = Vec::with_capacity(key_width + 1);
    if plan.has_datetime {
        headers.push(DATETIME_HEADER.to_string());
    }
    headers.extend(plan.group_by_labels.iter().cloned());
    headers.push(plan.label.clone());

    Ok(ResultTable::new(headers, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::formula::Formula;
    use serde_json::json;

    fn plan(formula: &str, labels: &[&str], has_datetime: bool, percentage: bool) -> DerivedPlan {
        DerivedPlan {
            label: "ratio".into(),
            formula: Formula::parse(formula).unwrap(),
            percentage,
            sub_queries: Vec::new(),
            group_by_labels: labels.iter().map(|l| l.to_string()).collect(),
            has_datetime,
        }
    }

    fn with_variables(mut plan: DerivedPlan, names: &[&str]) -> DerivedPlan {
        let query: crate::models::Query = serde_json::from_value(json!({
            "category": "events", "display_category": "x", "metrics": ["count"]
        }))
        .unwrap();
        plan.sub_queries = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    crate::models::ResolvedQuery {
                        query: query.clone(),
                        group_by_labels: vec![],
                        timezone: chrono_tz::UTC,
                    },
                )
            })
            .collect();
        plan
    }

    fn table(headers: &[&str], rows: serde_json::Value) -> ResultTable {
        ResultTable::new(
            headers.iter().map(|h| h.to_string()).collect(),
            serde_json::from_value(rows).unwrap(),
        )
    }

    #[test]
    fn test_ratio_per_bucket() {
        let plan = with_variables(plan("a/b", &[], true, false), &["a", "b"]);
        let a = table(
            &["datetime", "impressions"],
            json!([["2023-01-18T00:00:00+00:00", 1000.0], ["2023-01-19T00:00:00+00:00", 3000.0]]),
        );
        let b = table(
            &["datetime", "page_views"],
            json!([["2023-01-19T00:00:00+00:00", 3.0], ["2023-01-18T00:00:00+00:00", 1.0]]),
        );

        let result = align(&plan, &[("a".into(), a), ("b".into(), b)]).unwrap();
        assert_eq!(result.headers, vec!["datetime", "ratio"]);
        assert_eq!(
            result.rows,
            vec![
                vec![json!("2023-01-18T00:00:00+00:00"), json!(1000.0)],
                vec![json!("2023-01-19T00:00:00+00:00"), json!(1000.0)],
            ]
        );
    }

    #[test]
    fn test_missing_keys_count_as_zero() {
        let plan = with_variables(plan("a+b", &["campaign"], false, false), &["a", "b"]);
        let a = table(&["campaign", "cost"], json!([["india", 5.0], ["us", 2.0]]));
        let b = table(&["campaign", "clicks"], json!([["india", 1.0], ["uk", 4.0]]));

        let result = align(&plan, &[("a".into(), a), ("b".into(), b)]).unwrap();
        assert_eq!(result.headers, vec!["campaign", "ratio"]);
        assert_eq!(
            result.rows,
            vec![
                vec![json!("india"), json!(6.0)],
                vec![json!("uk"), json!(4.0)],
                vec![json!("us"), json!(2.0)],
            ]
        );
    }

    #[test]
    fn test_percentage_and_division_by_zero() {
        let plan = with_variables(plan("a/b", &[], false, true), &["a", "b"]);
        let a = table(&["sessions"], json!([[1.0]]));
        let b = table(&["users"], json!([[4.0]]));
        let result = align(&plan, &[("a".into(), a.clone()), ("b".into(), b)]).unwrap();
        assert_eq!(result.rows, vec![vec![json!(25.0)]]);

        let zero = table(&["users"], json!([[0.0]]));
        let result = align(&plan, &[("a".into(), a), ("b".into(), zero)]).unwrap();
        assert_eq!(result.rows, vec![vec![json!(0.0)]]);
    }

    #[test]
    fn test_unknown_variable_is_invalid_input() {
        let plan = with_variables(plan("a/c", &[], false, false), &["a", "b"]);
        let a = table(&["cost"], json!([[1.0]]));
        let b = table(&["clicks"], json!([[1.0]]));
        let err = align(&plan, &[("a".into(), a), ("b".into(), b)]).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn test_missing_metric_column() {
        let plan = with_variables(plan("a", &["campaign"], false, false), &["a"]);
        let a = table(&["campaign"], json!([["india"]]));
        assert!(matches!(
            align(&plan, &[("a".into(), a)]),
            Err(AppError::ExecutionFailure(_))
        ));
    }
}
