//! Benchmarks for derived metric formula evaluation and row alignment

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::{json, Value};

use kpi_federation::models::{Query, ResolvedQuery, ResultTable};
use kpi_federation::services::derived::align;
use kpi_federation::services::formula::Formula;
use kpi_federation::services::normalizer::DerivedPlan;

const CAMPAIGNS: usize = 200;
const DAYS: usize = 30;

fn sub_query(display_category: &str, metric: &str) -> ResolvedQuery {
    let query: Query = serde_json::from_value(json!({
        "category": "events",
        "display_category": display_category,
        "metrics": [metric],
        "group_by_timestamp": "date"
    }))
    .unwrap();
    ResolvedQuery {
        query,
        group_by_labels: vec!["campaign".into()],
        timezone: chrono_tz::UTC,
    }
}

fn create_plan() -> DerivedPlan {
    DerivedPlan {
        label: "cost_per_session".into(),
        formula: Formula::parse("(a + b) / c").unwrap(),
        percentage: false,
        sub_queries: vec![
            ("a".into(), sub_query("google_ads_metrics", "cost")),
            ("b".into(), sub_query("facebook_metrics", "spend")),
            ("c".into(), sub_query("website_session", "sessions")),
        ],
        group_by_labels: vec!["campaign".into()],
        has_datetime: true,
    }
}

fn create_table(metric: &str, scale: f64) -> ResultTable {
    let mut rows: Vec<Vec<Value>> = Vec::with_capacity(CAMPAIGNS * DAYS);
    for day in 0..DAYS {
        for campaign in 0..CAMPAIGNS {
            rows.push(vec![
                json!(format!("2023-01-{:02}T00:00:00+00:00", day + 1)),
                json!(format!("campaign_{}", campaign)),
                json!((campaign + day) as f64 * scale),
            ]);
        }
    }
    ResultTable::new(
        vec!["datetime".into(), "campaign".into(), metric.into()],
        rows,
    )
}

fn bench_formula(c: &mut Criterion) {
    let mut group = c.benchmark_group("formula");
    group.throughput(Throughput::Elements(1000));

    let formula = Formula::parse("(a + b) / c * 100 - d").unwrap();
    group.bench_function("evaluate_1000", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let value = i as f64;
                let _ = black_box(formula.evaluate(|name| match name {
                    "a" => Some(value),
                    "b" => Some(value * 2.0),
                    "c" => Some(value + 1.0),
                    "d" => Some(1.0),
                    _ => None,
                }));
            }
        });
    });

    group.bench_function("parse", |b| {
        b.iter(|| black_box(Formula::parse(black_box("(a + b) / (c - d) * 100"))));
    });

    group.finish();
}

fn bench_align(c: &mut Criterion) {
    let mut group = c.benchmark_group("derived_align");
    group.throughput(Throughput::Elements((CAMPAIGNS * DAYS) as u64));

    let plan = create_plan();
    let tables = vec![
        ("a".to_string(), create_table("cost", 1.5)),
        ("b".to_string(), create_table("spend", 0.5)),
        ("c".to_string(), create_table("sessions", 3.0)),
    ];

    group.bench_function("align_three_sub_queries", |b| {
        b.iter(|| black_box(align(&plan, &tables)));
    });

    group.finish();
}

criterion_group!(benches, bench_formula, bench_align);
criterion_main!(benches);
