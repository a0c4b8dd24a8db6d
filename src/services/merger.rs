//! Result merging
//!
//! [`finalize`] checks and harmonizes the per-member tables. [`combine`]
//! builds the optional joined view, one table for time-bucketed members and
//! one for the rest.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{AppError, Result};
use crate::models::{Category, Query, ResultTable};
use crate::services::normalizer::PlannedQuery;

fn key_width(plan: &PlannedQuery) -> usize {
    usize::from(plan.has_datetime()) + plan.group_by_labels().len()
}

/// Validate every table and align group-by column order across tables that
/// share the same group-by set. Output order equals input order.
pub fn finalize(
    planned: &[PlannedQuery],
    tables: Vec<ResultTable>,
    global_labels: &[String],
) -> Result<Vec<ResultTable>> {
    if planned.len() != tables.len() {
        return Err(AppError::ExecutionFailure(format!(
            "Expected {} result tables, got {}",
            planned.len(),
            tables.len()
        )));
    }

    for (index, table) in tables.iter().enumerate() {
        if let Some(row) = table.rows.iter().find(|r| r.len() != table.headers.len()) {
            return Err(AppError::ExecutionFailure(format!(
                "Query {} returned a row of width {} for {} headers",
                index,
                row.len(),
                table.headers.len()
            )));
        }
        if let Some(missing) = global_labels.iter().find(|l| table.column_index(l).is_none()) {
            return Err(AppError::ExecutionFailure(format!(
                "Query {} result lacks global group-by column '{}'",
                index, missing
            )));
        }
    }

    let mut canonical: HashMap<BTreeSet<String>, Vec<String>> = HashMap::new();
    let mut out = Vec::with_capacity(tables.len());
    for (plan, table) in planned.iter().zip(tables) {
        let labels = plan.group_by_labels();
        if labels.len() < 2 {
            out.push(table);
            continue;
        }
        let order = canonical
            .entry(labels.iter().cloned().collect())
            .or_insert_with(|| labels.to_vec())
            .clone();
        out.push(reorder_group_bys(table, usize::from(plan.has_datetime()), labels, &order));
    }

    Ok(out)
}

fn reorder_group_bys(
    mut table: ResultTable,
    offset: usize,
    current: &[String],
    target: &[String],
) -> ResultTable {
    if current == target {
        return table;
    }
    // positions[i] = where target[i] currently sits
    let positions: Vec<usize> = target
        .iter()
        .filter_map(|label| current.iter().position(|c| c == label))
        .map(|p| p + offset)
        .collect();
    if positions.len() != target.len() {
        return table;
    }

    let permute = |cells: &mut Vec<Value>| {
        let picked: Vec<Value> = positions.iter().map(|&p| cells[p].clone()).collect();
        for (i, cell) in picked.into_iter().enumerate() {
            cells[offset + i] = cell;
        }
    };

    let picked: Vec<String> = positions.iter().map(|&p| table.headers[p].clone()).collect();
    for (i, header) in picked.into_iter().enumerate() {
        table.headers[offset + i] = header;
    }
    for row in &mut table.rows {
        permute(row);
    }
    table
}

/// Header of a member's metric column in the combined view.
fn combined_metric_header(query: &Query, plan: &PlannedQuery, metric_index: usize) -> String {
    let metric = match plan {
        PlannedQuery::Derived(derived) => derived.label.clone(),
        PlannedQuery::Direct(resolved) => {
            let metrics = &resolved.query.metrics;
            if metrics.len() == 1 && !query.alias_name.is_empty() {
                query.alias_name.clone()
            } else {
                metrics.get(metric_index).cloned().unwrap_or_default()
            }
        }
    };
    if query.category == Category::Channels {
        format!("{}_{}", query.display_category, metric)
    } else {
        metric
    }
}

fn key_cell(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn combine_partition(
    members: &[(&Query, &PlannedQuery, &ResultTable)],
) -> Result<ResultTable> {
    let (_, first_plan, first_table) = members[0];
    let width = key_width(first_plan);
    let key_headers: Vec<String> = first_table.headers[..width].to_vec();
    let key_set: BTreeSet<&String> = key_headers.iter().collect();

    let mut metric_headers = Vec::new();
    // (member index, first metric column, metric count, output offset)
    let mut layout = Vec::with_capacity(members.len());
    for (index, (query, plan, table)) in members.iter().enumerate() {
        let width = key_width(plan);
        let member_keys: BTreeSet<&String> = table.headers[..width].iter().collect();
        if member_keys != key_set {
            return Err(AppError::InvalidInput(
                "Combined results need queries with the same group-bys".into(),
            ));
        }
        let metrics = table.headers.len() - width;
        layout.push((index, width, metrics, metric_headers.len()));
        for m in 0..metrics {
            metric_headers.push(combined_metric_header(query, plan, m));
        }
    }

    let total_metrics = metric_headers.len();
    let mut joined: BTreeMap<Vec<String>, Vec<Value>> = BTreeMap::new();
    for &(index, width, metrics, offset) in &layout {
        let table = members[index].2;
        // Reorder each member's keys to the first member's header order.
        let key_positions: Vec<usize> = key_headers
            .iter()
            .filter_map(|h| table.headers[..width].iter().position(|c| c == h))
            .collect();
        for row in &table.rows {
            let key: Vec<String> = key_positions.iter().map(|&p| key_cell(&row[p])).collect();
            let values = joined
                .entry(key)
                .or_insert_with(|| vec![Value::from(0.0); total_metrics]);
            for m in 0..metrics {
                values[offset + m] = row[width + m].clone();
            }
        }
    }

    let mut headers = key_headers;
    headers.extend(metric_headers);
    let rows = joined
        .into_iter()
        .map(|(key, values)| {
            let mut row: Vec<Value> = key.into_iter().map(Value::String).collect();
            row.extend(values);
            row
        })
        .collect();

    Ok(ResultTable::new(headers, rows))
}

/// Join member tables on their key columns: time-bucketed members first,
/// then the rest. Missing values are 0 and rows are sorted by key.
pub fn combine(
    queries: &[Query],
    planned: &[PlannedQuery],
    tables: &[ResultTable],
) -> Result<Vec<ResultTable>> {
    let members: Vec<(&Query, &PlannedQuery, &ResultTable)> = queries
        .iter()
        .zip(planned)
        .zip(tables)
        .map(|((q, p), t)| (q, p, t))
        .collect();

    let (bucketed, flat): (Vec<_>, Vec<_>) = members
        .into_iter()
        .partition(|(_, plan, _)| plan.has_datetime());

    let mut combined = Vec::with_capacity(2);
    for partition in [bucketed, flat] {
        if !partition.is_empty() {
            combined.push(combine_partition(&partition)?);
        }
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResolvedQuery;
    use serde_json::json;

    fn planned(raw: serde_json::Value, labels: &[&str]) -> (Query, PlannedQuery) {
        let query: Query = serde_json::from_value(raw).unwrap();
        let plan = PlannedQuery::Direct(ResolvedQuery {
            query: query.clone(),
            group_by_labels: labels.iter().map(|l| l.to_string()).collect(),
            timezone: chrono_tz::UTC,
        });
        (query, plan)
    }

    fn table(headers: &[&str], rows: serde_json::Value) -> ResultTable {
        ResultTable::new(
            headers.iter().map(|h| h.to_string()).collect(),
            serde_json::from_value(rows).unwrap(),
        )
    }

    #[test]
    fn test_finalize_rejects_ragged_rows() {
        let (_, plan) = planned(json!({"category": "events", "display_category": "x", "metrics": ["m"]}), &[]);
        let bad = table(&["m"], json!([[1.0, 2.0]]));
        assert!(matches!(
            finalize(&[plan], vec![bad], &[]),
            Err(AppError::ExecutionFailure(_))
        ));
    }

    #[test]
    fn test_finalize_requires_global_columns() {
        let (_, plan) = planned(json!({"category": "events", "display_category": "x", "metrics": ["m"]}), &[]);
        let t = table(&["m"], json!([[1.0]]));
        assert!(finalize(&[plan], vec![t], &["campaign".to_string()]).is_err());
    }

    #[test]
    fn test_finalize_aligns_shared_group_by_order() {
        let (_, first) = planned(
            json!({"category": "events", "display_category": "x", "metrics": ["m"]}),
            &["country", "campaign"],
        );
        let (_, second) = planned(
            json!({"category": "profiles", "display_category": "y", "metrics": ["n"]}),
            &["campaign", "country"],
        );
        let a = table(&["country", "campaign", "m"], json!([["in", "c1", 1.0]]));
        let b = table(&["campaign", "country", "n"], json!([["c1", "in", 2.0]]));

        let out = finalize(&[first, second], vec![a.clone(), b], &[]).unwrap();
        assert_eq!(out[0], a);
        assert_eq!(out[1].headers, vec!["country", "campaign", "n"]);
        assert_eq!(out[1].rows, vec![vec![json!("in"), json!("c1"), json!(2.0)]]);
    }

    #[test]
    fn test_combine_joins_and_zero_fills() {
        let (q1, p1) = planned(
            json!({"category": "channels", "display_category": "google_ads_metrics", "metrics": ["impressions"], "gbt": "date"}),
            &[],
        );
        let (q2, p2) = planned(
            json!({"category": "events", "display_category": "website_session", "metrics": ["page_views"], "an": "views", "gbt": "date"}),
            &[],
        );
        let (q3, p3) = planned(
            json!({"category": "profiles", "display_category": "hubspot_contacts", "metrics": ["count"]}),
            &[],
        );
        let t1 = table(&["datetime", "impressions"], json!([["d2", 5.0], ["d1", 3.0]]));
        let t2 = table(&["datetime", "page_views"], json!([["d1", 1.0]]));
        let t3 = table(&["count"], json!([[9.0]]));

        let combined = combine(&[q1, q2, q3], &[p1, p2, p3], &[t1, t2, t3]).unwrap();
        assert_eq!(combined.len(), 2);
        assert_eq!(
            combined[0].headers,
            vec!["datetime", "google_ads_metrics_impressions", "views"]
        );
        assert_eq!(
            combined[0].rows,
            vec![
                vec![json!("d1"), json!(3.0), json!(1.0)],
                vec![json!("d2"), json!(5.0), json!(0.0)],
            ]
        );
        assert_eq!(combined[1].headers, vec!["count"]);
        assert_eq!(combined[1].rows, vec![vec![json!(9.0)]]);
    }

    #[test]
    fn test_combine_requires_matching_keys() {
        let (q1, p1) = planned(json!({"category": "events", "display_category": "x", "metrics": ["m"]}), &["a"]);
        let (q2, p2) = planned(json!({"category": "events", "display_category": "x", "metrics": ["n"]}), &["b"]);
        let t1 = table(&["a", "m"], json!([["1", 1.0]]));
        let t2 = table(&["b", "n"], json!([["1", 1.0]]));
        assert!(combine(&[q1, q2], &[p1, p2], &[t1, t2]).is_err());
    }
}
