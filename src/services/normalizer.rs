//! Query normalization
//!
//! Broadcasts global filters and group-bys into every member query, swaps
//! property-mapping placeholders for the concrete property of each query's
//! display category and expands derived members into their sub-queries.
//! Everything that can fail on mappings fails here, before any executor runs.

use std::collections::HashSet;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::{Filter, GroupBy, Query, QueryGroup, ResolvedQuery, ResultTable};
use crate::services::derived_metrics::{validate_definition, DerivedMetricStore};
use crate::services::formula::Formula;
use crate::services::mappings::{MappingResolver, PropertyMappingStore};

/// A derived member expanded into resolved sub-queries
#[derive(Debug, Clone)]
pub struct DerivedPlan {
    /// Header of the derived metric column
    pub label: String,
    pub formula: Formula,
    /// Scale the formula result by 100
    pub percentage: bool,
    /// `(formula variable, sub-query)` in definition order
    pub sub_queries: Vec<(String, ResolvedQuery)>,
    pub group_by_labels: Vec<String>,
    pub has_datetime: bool,
}

/// What the engine runs for one member query
#[derive(Debug, Clone)]
pub enum PlannedQuery {
    Direct(ResolvedQuery),
    Derived(DerivedPlan),
}

impl PlannedQuery {
    pub fn group_by_labels(&self) -> &[String] {
        match self {
            PlannedQuery::Direct(resolved) => &resolved.group_by_labels,
            PlannedQuery::Derived(plan) => &plan.group_by_labels,
        }
    }

    pub fn has_datetime(&self) -> bool {
        match self {
            PlannedQuery::Direct(resolved) => resolved.query.group_by_timestamp.is_some(),
            PlannedQuery::Derived(plan) => plan.has_datetime,
        }
    }
}

fn has_space(value: &str) -> bool {
    value.contains(char::is_whitespace)
}

fn check_names(property_name: &str, object_type: &str, entity: &str) -> Result<()> {
    if has_space(property_name) || has_space(object_type) || has_space(entity) {
        return Err(AppError::InvalidInput(format!(
            "Invalid property name '{}'",
            property_name
        )));
    }
    Ok(())
}

/// Structural checks on a group, run before any mapping lookup.
pub fn validate_group(group: &QueryGroup) -> Result<()> {
    if group.queries.is_empty() {
        return Err(AppError::InvalidInput("Query group has no queries".into()));
    }

    for query in &group.queries {
        if !query.is_derived() && query.metrics.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "Query on '{}' has no metrics",
                query.display_category
            )));
        }
        if query.is_derived() && query.definition.is_none() && query.metrics.is_empty() {
            return Err(AppError::InvalidInput(
                "Derived query must name a derived metric".into(),
            ));
        }
        if query.is_derived() && query.metric_label().trim().is_empty() {
            return Err(AppError::InvalidInput(
                "Derived query needs a metric name or alias for its column".into(),
            ));
        }
        for filter in &query.filters {
            check_names(&filter.property_name, &filter.object_type, &filter.entity)?;
        }
        for group_by in &query.group_bys {
            check_names(&group_by.property_name, &group_by.object_type, &group_by.entity)?;
        }
    }

    let global_names = group
        .global_filters
        .iter()
        .map(|f| (f.is_property_mapping, &f.property_name, &f.object_type, &f.entity))
        .chain(
            group
                .global_group_bys
                .iter()
                .map(|g| (g.is_property_mapping, &g.property_name, &g.object_type, &g.entity)),
        );

    let display_categories: HashSet<&str> = group
        .queries
        .iter()
        .map(|q| q.display_category.as_str())
        .collect();
    let mappings_required =
        display_categories.len() > 1 || group.queries.iter().any(Query::is_derived);

    for (is_mapping, property_name, object_type, entity) in global_names {
        check_names(property_name, object_type, entity)?;
        if is_mapping && (!object_type.is_empty() || !entity.is_empty()) {
            return Err(AppError::InvalidInput(format!(
                "Global property mapping '{}' cannot set object type or entity",
                property_name
            )));
        }
        if mappings_required && !is_mapping {
            return Err(AppError::InvalidInput(
                "Global filters and group-bys must be property mappings when queries span display categories"
                    .into(),
            ));
        }
    }

    Ok(())
}

/// Replace executor-native group-by headers with the resolved column labels.
pub fn relabel_headers(resolved: &ResolvedQuery, table: &mut ResultTable) -> Result<()> {
    let offset = usize::from(resolved.query.group_by_timestamp.is_some());
    let end = offset + resolved.group_by_labels.len();
    if table.headers.len() < end {
        return Err(AppError::ExecutionFailure(format!(
            "Result for '{}' is missing group-by columns",
            resolved.query.display_category
        )));
    }
    for (header, label) in table.headers[offset..end]
        .iter_mut()
        .zip(&resolved.group_by_labels)
    {
        header.clone_from(label);
    }
    Ok(())
}

#[derive(Clone)]
pub struct QueryNormalizer {
    mappings: PropertyMappingStore,
    derived: DerivedMetricStore,
}

impl QueryNormalizer {
    pub fn new(mappings: PropertyMappingStore, derived: DerivedMetricStore) -> Self {
        Self { mappings, derived }
    }

    /// Plan every member of `group`, preserving order.
    pub async fn normalize(&self, project_id: i64, group: &QueryGroup) -> Result<Vec<PlannedQuery>> {
        validate_group(group)?;

        let mut resolver = self.mappings.resolver(project_id);
        let mut planned = Vec::with_capacity(group.queries.len());

        for (index, query) in group.queries.iter().enumerate() {
            let plan = if query.is_derived() {
                PlannedQuery::Derived(
                    self.plan_derived(project_id, query, group, &mut resolver)
                        .await?,
                )
            } else {
                let filters = concat(&query.filters, &[&group.global_filters]);
                let group_bys = concat(&query.group_bys, &[&group.global_group_bys]);
                PlannedQuery::Direct(
                    resolve_query(query.clone(), filters, group_bys, &mut resolver).await?,
                )
            };
            debug!(
                project_id,
                query_index = index,
                derived = query.is_derived(),
                "Query normalized"
            );
            planned.push(plan);
        }

        Ok(planned)
    }

    async fn plan_derived(
        &self,
        project_id: i64,
        outer: &Query,
        group: &QueryGroup,
        resolver: &mut MappingResolver,
    ) -> Result<DerivedPlan> {
        let definition = match &outer.definition {
            Some(definition) => definition.clone(),
            None => {
                let name = outer.metrics.first().map(String::as_str).unwrap_or_default();
                self.derived.get_by_name(project_id, name).await?.definition
            }
        };
        let formula = validate_definition(&definition)?;

        let mut sub_queries = Vec::with_capacity(definition.queries.len());
        for sub in &definition.queries {
            let filters = concat(&sub.filters, &[&outer.filters, &group.global_filters]);
            let group_bys = concat(&sub.group_bys, &[&outer.group_bys, &group.global_group_bys]);

            let mut inherited = sub.clone();
            inherited.from = outer.from;
            inherited.to = outer.to;
            inherited.timezone.clone_from(&outer.timezone);
            inherited.group_by_timestamp = outer.group_by_timestamp;

            let resolved = resolve_query(inherited, filters, group_bys, resolver).await?;
            sub_queries.push((sub.name.trim().to_lowercase(), resolved));
        }

        let group_by_labels = sub_queries
            .first()
            .map(|(_, resolved)| resolved.group_by_labels.clone())
            .unwrap_or_default();

        Ok(DerivedPlan {
            label: outer.metric_label().to_string(),
            formula,
            percentage: definition.is_percentage(),
            sub_queries,
            group_by_labels,
            has_datetime: outer.group_by_timestamp.is_some(),
        })
    }
}

/// Locals first, then each broadcast list in order.
fn concat<T: Clone>(locals: &[T], broadcast: &[&Vec<T>]) -> Vec<T> {
    let mut out = locals.to_vec();
    for list in broadcast {
        out.extend(list.iter().cloned());
    }
    out
}

async fn resolve_filter(
    filter: Filter,
    display_category: &str,
    resolver: &mut MappingResolver,
) -> Result<Filter> {
    if !filter.is_property_mapping {
        return Ok(filter);
    }
    let property = resolver.resolve(&filter.property_name, display_category).await?;
    Ok(Filter {
        object_type: property.object_type,
        property_name: property.name,
        is_property_mapping: false,
        data_type: property.data_type,
        entity: property.entity,
        ..filter
    })
}

async fn resolve_group_by(
    group_by: GroupBy,
    display_category: &str,
    resolver: &mut MappingResolver,
) -> Result<(GroupBy, String)> {
    if !group_by.is_property_mapping {
        let label = group_by.property_name.clone();
        return Ok((group_by, label));
    }
    let property = resolver.resolve(&group_by.property_name, display_category).await?;
    let label = group_by.property_name;
    Ok((
        GroupBy {
            object_type: property.object_type,
            property_name: property.name,
            is_property_mapping: false,
            data_type: property.data_type,
            entity: property.entity,
        },
        label,
    ))
}

async fn resolve_query(
    mut query: Query,
    filters: Vec<Filter>,
    group_bys: Vec<GroupBy>,
    resolver: &mut MappingResolver,
) -> Result<ResolvedQuery> {
    let timezone = query.tz()?;

    let mut resolved_filters = Vec::with_capacity(filters.len());
    for filter in filters {
        resolved_filters.push(resolve_filter(filter, &query.display_category, resolver).await?);
    }

    let mut resolved_group_bys = Vec::with_capacity(group_bys.len());
    let mut group_by_labels = Vec::with_capacity(group_bys.len());
    for group_by in group_bys {
        let (resolved, label) = resolve_group_by(group_by, &query.display_category, resolver).await?;
        resolved_group_bys.push(resolved);
        group_by_labels.push(label);
    }

    query.filters = resolved_filters;
    query.group_bys = resolved_group_bys;
    query.definition = None;

    Ok(ResolvedQuery {
        query,
        group_by_labels,
        timezone,
    })
}
