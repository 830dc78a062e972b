#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use cw_catalog::{CatalogError, ColumnCatalog};
use cw_policy::{DecisionLog, ScanDecision, ScanPolicy};
use cw_query::{QueryError, QueryPlanner};
use cw_record::Record;
use cw_store::RowStore;
use cw_types::{DType, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cw_store::Predicate;

/// Fixed dataset palette, assigned round-robin to grouped series and
/// repeating past eight groups.
pub const SERIES_PALETTE: [&str; 8] = [
    "#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f", "#edc948", "#b07aa1", "#9c755f",
];

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("invalid chart options: {errors:?}")]
    InvalidOptions { errors: Vec<String> },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Line,
    Bar,
}

impl FromStr for ChartType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "line" => Ok(Self::Line),
            "bar" => Ok(Self::Bar),
            other => Err(format!(
                "unknown chart_type '{other}' (expected one of: line, bar)"
            )),
        }
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line => write!(f, "line"),
            Self::Bar => write!(f, "bar"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "sum" => Ok(Self::Sum),
            "avg" => Ok(Self::Avg),
            "count" => Ok(Self::Count),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(format!(
                "unknown aggregation '{other}' (expected one of: sum, avg, count, min, max)"
            )),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
        };
        write!(f, "{token}")
    }
}

/// A chart request as it arrives from the outer service layer. The enum
/// fields come in as strings and are checked for membership during
/// validation, so a bad value is a structured validation error rather
/// than a deserialization failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartRequest {
    pub dataset_id: Option<String>,
    pub x_column: String,
    pub y_column: String,
    pub chart_type: String,
    pub aggregation: Option<String>,
    pub group_by: Option<String>,
    pub filters: Vec<Predicate>,
    pub limit: Option<usize>,
}

impl ChartRequest {
    #[must_use]
    pub fn new(
        x_column: impl Into<String>,
        y_column: impl Into<String>,
        chart_type: ChartType,
    ) -> Self {
        Self {
            dataset_id: None,
            x_column: x_column.into(),
            y_column: y_column.into(),
            chart_type: chart_type.to_string(),
            aggregation: None,
            group_by: None,
            filters: Vec::new(),
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub x: Scalar,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartDataset {
    pub label: String,
    pub color: String,
    pub points: Vec<ChartPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub datasets: Vec<ChartDataset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct SeriesPlan {
    chart_type: ChartType,
    aggregation: Option<Aggregation>,
}

fn resolve_plan(request: &ChartRequest) -> Result<SeriesPlan, Vec<String>> {
    let mut errors = Vec::new();

    if request.x_column.trim().is_empty() {
        errors.push("x_column is required".to_owned());
    }
    if request.y_column.trim().is_empty() {
        errors.push("y_column is required".to_owned());
    }

    let chart_type = match ChartType::from_str(request.chart_type.trim()) {
        Ok(chart_type) => Some(chart_type),
        Err(message) => {
            errors.push(message);
            None
        }
    };

    let aggregation = match &request.aggregation {
        None => None,
        Some(raw) => match Aggregation::from_str(raw.trim()) {
            Ok(aggregation) => Some(aggregation),
            Err(message) => {
                errors.push(message);
                None
            }
        },
    };

    match (errors.is_empty(), chart_type) {
        (true, Some(chart_type)) => Ok(SeriesPlan {
            chart_type,
            aggregation,
        }),
        _ => Err(errors),
    }
}

/// Projects filtered records into chart-ready series. Stateless between
/// calls; the store and catalog collaborators are injected, never global.
#[derive(Debug)]
pub struct ChartProjector<'a, S: RowStore, C: ColumnCatalog> {
    store: &'a S,
    catalog: &'a C,
    policy: ScanPolicy,
}

impl<'a, S: RowStore, C: ColumnCatalog> ChartProjector<'a, S, C> {
    #[must_use]
    pub fn new(store: &'a S, catalog: &'a C) -> Self {
        Self {
            store,
            catalog,
            policy: ScanPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(store: &'a S, catalog: &'a C, policy: ScanPolicy) -> Self {
        Self {
            store,
            catalog,
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &ScanPolicy {
        &self.policy
    }

    /// Staged validation: structural errors, then column resolution, then
    /// a matching-row count. Independent checks accumulate; a stage only
    /// short-circuits the stages that depend on its success. Identical
    /// inputs over unchanged data validate identically.
    pub fn validate_options(
        &self,
        owner_id: &str,
        request: &ChartRequest,
    ) -> Result<ChartValidation, ChartError> {
        let mut warnings = Vec::new();

        let mut errors = match resolve_plan(request) {
            Ok(_) => Vec::new(),
            Err(errors) => errors,
        };
        if !errors.is_empty() {
            return Ok(ChartValidation {
                is_valid: false,
                errors,
                warnings,
            });
        }

        let columns = self
            .catalog
            .list_columns(owner_id, request.dataset_id.as_deref())?;
        let descriptor = |name: &str| columns.iter().find(|column| column.name == name);

        if descriptor(&request.x_column).is_none() {
            errors.push(format!(
                "Column '{}' not found in dataset",
                request.x_column
            ));
        }
        match descriptor(&request.y_column) {
            None => errors.push(format!(
                "Column '{}' not found in dataset",
                request.y_column
            )),
            Some(descriptor) => {
                if matches!(descriptor.dtype, DType::Text | DType::Bool) {
                    warnings.push(format!(
                        "Column '{}' is not numeric; values will be coerced leniently",
                        request.y_column
                    ));
                }
            }
        }
        if let Some(group_by) = &request.group_by {
            if descriptor(group_by).is_none() {
                errors.push(format!("Column '{group_by}' not found in dataset"));
            }
        }
        if !errors.is_empty() {
            return Ok(ChartValidation {
                is_valid: false,
                errors,
                warnings,
            });
        }

        let planner = QueryPlanner::new(self.store);
        let count =
            planner.matching_rows(owner_id, request.dataset_id.as_deref(), &request.filters)?;
        if count == 0 {
            errors.push("no records match the requested filters".to_owned());
        } else if count > self.policy.warn_rows {
            warnings.push(format!(
                "{count} matching rows exceed the recommended maximum of {}; consider aggregation or filters",
                self.policy.warn_rows
            ));
        }

        Ok(ChartValidation {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        })
    }

    /// Generate a chart series for a validated request. Fails with
    /// [`ChartError::InvalidOptions`] when validation does not pass;
    /// callers must not reach the store with unvalidated options.
    pub fn chart_data(
        &self,
        owner_id: &str,
        request: &ChartRequest,
    ) -> Result<ChartSeries, ChartError> {
        let report = self.validate_options(owner_id, request)?;
        if !report.is_valid {
            return Err(ChartError::InvalidOptions {
                errors: report.errors,
            });
        }

        let plan = resolve_plan(request)
            .map_err(|errors| ChartError::InvalidOptions { errors })?;

        let planner = QueryPlanner::new(self.store);
        let records = planner.series_rows(
            owner_id,
            request.dataset_id.as_deref(),
            &request.filters,
            request.limit,
        )?;

        let points = extract_points(&records, request);
        let points = match plan.aggregation {
            Some(aggregation) => aggregate_points(points, aggregation),
            None => points,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            owner_id,
            x_column = request.x_column.as_str(),
            y_column = request.y_column.as_str(),
            records = records.len(),
            points = points.len(),
            "projected chart series"
        );

        Ok(project_series(points, request, plan.chart_type))
    }

    /// Size-aware variant: counts the matching rows first and, when the
    /// dataset is large, derives a cheaper request (default aggregation
    /// and/or a scan cap) before generating. The caller's request is
    /// never mutated; every decision lands in `log`. A failing count is
    /// not fatal: the original request is used unchanged.
    pub fn optimized_chart_data(
        &self,
        owner_id: &str,
        request: &ChartRequest,
        log: &mut DecisionLog,
    ) -> Result<ChartSeries, ChartError> {
        let derived = self.optimize_request(owner_id, request, log);
        self.chart_data(owner_id, &derived)
    }

    /// The derivation step of [`ChartProjector::optimized_chart_data`],
    /// exposed so callers can inspect what the policy would do.
    #[must_use]
    pub fn optimize_request(
        &self,
        owner_id: &str,
        request: &ChartRequest,
        log: &mut DecisionLog,
    ) -> ChartRequest {
        let planner = QueryPlanner::new(self.store);
        let count =
            match planner.matching_rows(owner_id, request.dataset_id.as_deref(), &request.filters)
            {
                Ok(count) => count,
                Err(err) => {
                    self.policy
                        .record_fallback(format!("matching-row count failed: {err}"), log);
                    return request.clone();
                }
            };

        match self
            .policy
            .decide_series_admission(count, request.aggregation.is_some(), log)
        {
            ScanDecision::Proceed => request.clone(),
            ScanDecision::AutoAggregate { limit } => {
                let mut derived = request.clone();
                derived.aggregation = Some(Aggregation::Avg.to_string());
                derived.limit = Some(derived.limit.map_or(limit, |requested| requested.min(limit)));
                derived
            }
            ScanDecision::CapLimit { limit } => {
                let mut derived = request.clone();
                derived.limit = Some(derived.limit.map_or(limit, |requested| requested.min(limit)));
                derived
            }
        }
    }

    /// Preview variant: bypasses the size-based optimization policy and
    /// caps the projected series to the policy's preview budget (50
    /// points by default), spent across datasets in order.
    pub fn chart_preview(
        &self,
        owner_id: &str,
        request: &ChartRequest,
    ) -> Result<ChartSeries, ChartError> {
        let mut series = self.chart_data(owner_id, request)?;

        let mut budget = self.policy.preview_points;
        for dataset in &mut series.datasets {
            let keep = budget.min(dataset.points.len());
            dataset.points.truncate(keep);
            budget -= keep;
        }

        series.labels = rebuild_labels(&series, request.group_by.is_some());
        Ok(series)
    }
}

#[derive(Debug, Clone)]
struct RawPoint {
    x: Scalar,
    x_key: String,
    y: f64,
    group: Option<String>,
}

/// Lenient extraction: a null/absent x drops the record entirely, while
/// y falls back to `0.0` for anything unparsable or missing. This is the
/// opposite coercion policy from formula evaluation, on purpose.
fn extract_points(records: &[Record], request: &ChartRequest) -> Vec<RawPoint> {
    let mut points = Vec::new();
    for record in records {
        let x = match record.field(&request.x_column) {
            Some(value) if !value.is_missing() => value.clone(),
            _ => continue,
        };
        let y = record
            .field(&request.y_column)
            .map_or(0.0, Scalar::lenient_number);
        let group = request
            .group_by
            .as_deref()
            .map(|column| record.field_or_null(column).label());

        points.push(RawPoint {
            x_key: x.label(),
            x,
            y,
            group,
        });
    }
    points
}

#[derive(Debug)]
struct Accumulator {
    x: Scalar,
    x_key: String,
    group: Option<String>,
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
}

/// Group key is `(x, group?)`; output order is the first-seen order of
/// keys, matching the ungrouped passthrough behavior.
fn aggregate_points(points: Vec<RawPoint>, aggregation: Aggregation) -> Vec<RawPoint> {
    let mut ordering = Vec::<(String, Option<String>)>::new();
    let mut slots = HashMap::<(String, Option<String>), Accumulator>::new();

    for point in points {
        let key = (point.x_key.clone(), point.group.clone());
        let slot = slots.entry(key.clone()).or_insert_with(|| {
            ordering.push(key);
            Accumulator {
                x: point.x.clone(),
                x_key: point.x_key.clone(),
                group: point.group.clone(),
                sum: 0.0,
                count: 0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            }
        });
        slot.sum += point.y;
        slot.count += 1;
        slot.min = slot.min.min(point.y);
        slot.max = slot.max.max(point.y);
    }

    ordering
        .into_iter()
        .map(|key| {
            let slot = slots
                .remove(&key)
                .expect("ordering references only inserted keys");
            let y = match aggregation {
                Aggregation::Sum => slot.sum,
                Aggregation::Avg => slot.sum / slot.count as f64,
                Aggregation::Count => slot.count as f64,
                Aggregation::Min => slot.min,
                Aggregation::Max => slot.max,
            };
            RawPoint {
                x: slot.x,
                x_key: slot.x_key,
                y,
                group: slot.group,
            }
        })
        .collect()
}

fn compare_x(left: &RawPoint, right: &RawPoint) -> Ordering {
    match (&left.x, &right.x) {
        (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        _ => left.x_key.cmp(&right.x_key),
    }
}

fn project_series(points: Vec<RawPoint>, request: &ChartRequest, chart_type: ChartType) -> ChartSeries {
    if request.group_by.is_some() {
        // Dataset order is the first-seen order of group values in
        // extraction order, independent of any line sorting below.
        let mut order = Vec::<String>::new();
        let mut buckets = HashMap::<String, Vec<RawPoint>>::new();
        for point in points {
            let group = point.group.clone().unwrap_or_else(|| "<null>".to_owned());
            if !buckets.contains_key(&group) {
                order.push(group.clone());
            }
            buckets.entry(group).or_default().push(point);
        }

        let mut labels = BTreeSet::new();
        let mut datasets = Vec::with_capacity(order.len());
        for (slot, group) in order.iter().enumerate() {
            let mut bucket = buckets.remove(group).unwrap_or_default();
            if matches!(chart_type, ChartType::Line) {
                bucket.sort_by(compare_x);
            }
            for point in &bucket {
                labels.insert(point.x_key.clone());
            }
            datasets.push(ChartDataset {
                label: group.clone(),
                color: SERIES_PALETTE[slot % SERIES_PALETTE.len()].to_owned(),
                points: bucket
                    .into_iter()
                    .map(|point| ChartPoint {
                        x: point.x,
                        y: point.y,
                    })
                    .collect(),
            });
        }

        ChartSeries {
            labels: labels.into_iter().collect(),
            datasets,
        }
    } else {
        let mut points = points;
        if matches!(chart_type, ChartType::Line) {
            points.sort_by(compare_x);
        }

        let labels = points.iter().map(|point| point.x_key.clone()).collect();
        let dataset = ChartDataset {
            label: format!("{} vs {}", request.y_column, request.x_column),
            color: SERIES_PALETTE[0].to_owned(),
            points: points
                .into_iter()
                .map(|point| ChartPoint {
                    x: point.x,
                    y: point.y,
                })
                .collect(),
        };

        ChartSeries {
            labels,
            datasets: vec![dataset],
        }
    }
}

fn rebuild_labels(series: &ChartSeries, grouped: bool) -> Vec<String> {
    if grouped {
        let labels: BTreeSet<String> = series
            .datasets
            .iter()
            .flat_map(|dataset| dataset.points.iter().map(|point| point.x.label()))
            .collect();
        labels.into_iter().collect()
    } else {
        series
            .datasets
            .iter()
            .flat_map(|dataset| dataset.points.iter().map(|point| point.x.label()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cw_catalog::SampledCatalog;
    use cw_policy::{DecisionLog, ScanAction};
    use cw_store::{FilterOp, MemoryRowStore, Predicate, RowStore, StorageError};
    use cw_types::Scalar;

    use super::{ChartError, ChartProjector, ChartRequest, ChartType};

    fn row(pairs: Vec<(&str, Scalar)>) -> BTreeMap<String, Scalar> {
        pairs
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect()
    }

    fn sales_store() -> MemoryRowStore {
        let store = MemoryRowStore::new();
        store
            .insert_records(
                "owner-1",
                "ds-1",
                vec![
                    row(vec![
                        ("region", "A".into()),
                        ("amount", 10.0.into()),
                        ("channel", "web".into()),
                    ]),
                    row(vec![
                        ("region", "A".into()),
                        ("amount", 20.0.into()),
                        ("channel", "store".into()),
                    ]),
                    row(vec![
                        ("region", "B".into()),
                        ("amount", 15.0.into()),
                        ("channel", "web".into()),
                    ]),
                    row(vec![
                        ("region", "B".into()),
                        ("amount", 25.0.into()),
                        ("channel", "store".into()),
                    ]),
                ],
            )
            .expect("seed");
        store
    }

    fn request(aggregation: Option<&str>) -> ChartRequest {
        ChartRequest {
            dataset_id: Some("ds-1".to_owned()),
            aggregation: aggregation.map(str::to_owned),
            ..ChartRequest::new("region", "amount", ChartType::Bar)
        }
    }

    #[test]
    fn grouped_sum_aggregates_per_x_value() {
        let store = sales_store();
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let series = projector
            .chart_data("owner-1", &request(Some("sum")))
            .expect("series");

        assert_eq!(series.datasets.len(), 1);
        let points = &series.datasets[0].points;
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].x, Scalar::from("A"));
        assert_eq!(points[0].y, 30.0);
        assert_eq!(points[1].x, Scalar::from("B"));
        assert_eq!(points[1].y, 40.0);
    }

    #[test]
    fn avg_aggregation_divides_by_group_count() {
        let store = MemoryRowStore::new();
        store
            .insert_records(
                "owner-1",
                "ds-1",
                vec![
                    row(vec![("day", "d1".into()), ("amount", 100.0.into())]),
                    row(vec![("day", "d1".into()), ("amount", 105.0.into())]),
                ],
            )
            .expect("seed");
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let series = projector
            .chart_data(
                "owner-1",
                &ChartRequest {
                    dataset_id: Some("ds-1".to_owned()),
                    aggregation: Some("avg".to_owned()),
                    ..ChartRequest::new("day", "amount", ChartType::Bar)
                },
            )
            .expect("series");

        assert_eq!(series.datasets[0].points[0].y, 102.5);
    }

    #[test]
    fn group_by_emits_one_dataset_per_group_in_first_seen_order() {
        let store = sales_store();
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let series = projector
            .chart_data(
                "owner-1",
                &ChartRequest {
                    group_by: Some("channel".to_owned()),
                    aggregation: Some("sum".to_owned()),
                    ..request(None)
                },
            )
            .expect("series");

        assert_eq!(series.datasets.len(), 2);
        assert_eq!(series.datasets[0].label, "web");
        assert_eq!(series.datasets[1].label, "store");
        assert_ne!(series.datasets[0].color, series.datasets[1].color);
        // Labels are the sorted distinct x values when grouped.
        assert_eq!(series.labels, vec!["A".to_owned(), "B".to_owned()]);
    }

    #[test]
    fn line_charts_sort_points_by_x() {
        let store = MemoryRowStore::new();
        store
            .insert_records(
                "owner-1",
                "ds-1",
                vec![
                    row(vec![("t", 3.0.into()), ("v", 30.0.into())]),
                    row(vec![("t", 1.0.into()), ("v", 10.0.into())]),
                    row(vec![("t", 2.0.into()), ("v", 20.0.into())]),
                ],
            )
            .expect("seed");
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let line = projector
            .chart_data(
                "owner-1",
                &ChartRequest {
                    dataset_id: Some("ds-1".to_owned()),
                    ..ChartRequest::new("t", "v", ChartType::Line)
                },
            )
            .expect("series");
        let xs: Vec<f64> = line.datasets[0]
            .points
            .iter()
            .map(|point| point.y)
            .collect();
        assert_eq!(xs, vec![10.0, 20.0, 30.0]);
        assert_eq!(line.labels, vec!["1", "2", "3"]);

        let bar = projector
            .chart_data(
                "owner-1",
                &ChartRequest {
                    dataset_id: Some("ds-1".to_owned()),
                    ..ChartRequest::new("t", "v", ChartType::Bar)
                },
            )
            .expect("series");
        let ys: Vec<f64> = bar.datasets[0]
            .points
            .iter()
            .map(|point| point.y)
            .collect();
        assert_eq!(ys, vec![30.0, 10.0, 20.0]);
    }

    #[test]
    fn records_without_x_are_dropped_and_y_is_lenient() {
        let store = MemoryRowStore::new();
        store
            .insert_records(
                "owner-1",
                "ds-1",
                vec![
                    row(vec![("region", "A".into()), ("amount", "$1,000".into())]),
                    row(vec![("region", Scalar::Null), ("amount", 50.0.into())]),
                    row(vec![("region", "B".into()), ("amount", "n/a".into())]),
                    row(vec![("region", "C".into())]),
                ],
            )
            .expect("seed");
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let series = projector
            .chart_data("owner-1", &request(None))
            .expect("series");

        let points = &series.datasets[0].points;
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].y, 1000.0);
        assert_eq!(points[1].y, 0.0);
        assert_eq!(points[2].y, 0.0);
    }

    #[test]
    fn validation_accumulates_independent_errors() {
        let store = sales_store();
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let report = projector
            .validate_options(
                "owner-1",
                &ChartRequest {
                    chart_type: "pie".to_owned(),
                    aggregation: Some("median".to_owned()),
                    ..request(None)
                },
            )
            .expect("report");
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 2);

        // Column errors accumulate across x, y, and group_by.
        let report = projector
            .validate_options(
                "owner-1",
                &ChartRequest {
                    group_by: Some("nope".to_owned()),
                    ..ChartRequest::new("missing_x", "missing_y", ChartType::Bar)
                },
            )
            .expect("report");
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn validation_flags_zero_rows_and_non_numeric_y() {
        let store = sales_store();
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let zero = projector
            .validate_options(
                "owner-1",
                &ChartRequest {
                    filters: vec![Predicate::new("region", FilterOp::Eq, "Z")],
                    ..request(None)
                },
            )
            .expect("report");
        assert!(!zero.is_valid);
        assert!(zero.errors[0].contains("no records match"));

        let textual = projector
            .validate_options(
                "owner-1",
                &ChartRequest {
                    dataset_id: Some("ds-1".to_owned()),
                    ..ChartRequest::new("region", "channel", ChartType::Bar)
                },
            )
            .expect("report");
        assert!(textual.is_valid);
        assert_eq!(textual.warnings.len(), 1);
        assert!(textual.warnings[0].contains("not numeric"));
    }

    #[test]
    fn validation_is_idempotent_over_unchanged_data() {
        let store = sales_store();
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let first = projector
            .validate_options("owner-1", &request(Some("sum")))
            .expect("report");
        let second = projector
            .validate_options("owner-1", &request(Some("sum")))
            .expect("report");
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_options_block_generation() {
        let store = sales_store();
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let err = projector
            .chart_data(
                "owner-1",
                &ChartRequest {
                    chart_type: "pie".to_owned(),
                    ..request(None)
                },
            )
            .expect_err("must not generate");
        assert!(matches!(err, ChartError::InvalidOptions { .. }));
    }

    #[test]
    fn optimizer_defaults_large_unaggregated_requests_to_avg() {
        let store = MemoryRowStore::new();
        let rows: Vec<BTreeMap<String, Scalar>> = (0..8_000)
            .map(|i| {
                row(vec![
                    ("bucket", Scalar::from(f64::from(i % 10))),
                    ("amount", Scalar::from(f64::from(i))),
                ])
            })
            .collect();
        store
            .insert_records("owner-1", "ds-1", rows)
            .expect("seed");
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let original = ChartRequest {
            dataset_id: Some("ds-1".to_owned()),
            ..ChartRequest::new("bucket", "amount", ChartType::Bar)
        };
        let before = original.clone();

        let mut log = DecisionLog::new();
        let derived = projector.optimize_request("owner-1", &original, &mut log);

        assert_eq!(derived.aggregation.as_deref(), Some("avg"));
        assert!(derived.limit.expect("limit") <= 1_000);
        // The caller's request object is untouched.
        assert_eq!(original, before);
        assert_eq!(log.records()[0].action, ScanAction::AutoAggregate);

        let series = projector
            .optimized_chart_data("owner-1", &original, &mut log)
            .expect("series");
        assert_eq!(series.datasets.len(), 1);
    }

    #[test]
    fn optimizer_only_caps_limit_for_medium_scans() {
        let store = MemoryRowStore::new();
        let rows: Vec<BTreeMap<String, Scalar>> = (0..1_500)
            .map(|i| row(vec![("bucket", Scalar::from(f64::from(i % 10))), ("amount", 1.0.into())]))
            .collect();
        store
            .insert_records("owner-1", "ds-1", rows)
            .expect("seed");
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let mut log = DecisionLog::new();
        let derived = projector.optimize_request(
            "owner-1",
            &ChartRequest {
                dataset_id: Some("ds-1".to_owned()),
                limit: Some(5_000),
                ..ChartRequest::new("bucket", "amount", ChartType::Bar)
            },
            &mut log,
        );

        assert_eq!(derived.limit, Some(2_000));
        assert!(derived.aggregation.is_none());
    }

    struct FailingStore;

    impl RowStore for FailingStore {
        fn insert_records(
            &self,
            _owner_id: &str,
            _dataset_id: &str,
            _rows: Vec<BTreeMap<String, Scalar>>,
        ) -> Result<usize, StorageError> {
            Err(StorageError::Backend("unavailable".to_owned()))
        }

        fn fetch(
            &self,
            _owner_id: &str,
            _dataset_id: Option<&str>,
            _predicates: &[Predicate],
            _sort: Option<&cw_store::SortSpec>,
            _page: &cw_store::PageRequest,
        ) -> Result<cw_store::RecordPage, StorageError> {
            Err(StorageError::Backend("unavailable".to_owned()))
        }

        fn count(
            &self,
            _owner_id: &str,
            _dataset_id: Option<&str>,
            _predicates: &[Predicate],
        ) -> Result<u64, StorageError> {
            Err(StorageError::Backend("unavailable".to_owned()))
        }

        fn run_in_transaction<T>(
            &self,
            f: impl FnOnce(&Self) -> Result<T, StorageError>,
        ) -> Result<T, StorageError> {
            f(self)
        }
    }

    #[test]
    fn failed_admission_count_falls_back_to_the_original_request() {
        let sales = sales_store();
        let catalog = SampledCatalog::new(&sales);
        let failing = FailingStore;
        let projector = ChartProjector::new(&failing, &catalog);

        let original = request(None);
        let mut log = DecisionLog::new();
        let derived = projector.optimize_request("owner-1", &original, &mut log);

        assert_eq!(derived, original);
        assert_eq!(log.records()[0].action, ScanAction::Fallback);
    }

    #[test]
    fn preview_caps_the_series_to_the_point_budget() {
        let store = MemoryRowStore::new();
        let rows: Vec<BTreeMap<String, Scalar>> = (0..120)
            .map(|i| {
                row(vec![
                    ("t", Scalar::from(f64::from(i))),
                    ("v", Scalar::from(f64::from(i * 2))),
                ])
            })
            .collect();
        store
            .insert_records("owner-1", "ds-1", rows)
            .expect("seed");
        let catalog = SampledCatalog::new(&store);
        let projector = ChartProjector::new(&store, &catalog);

        let series = projector
            .chart_preview(
                "owner-1",
                &ChartRequest {
                    dataset_id: Some("ds-1".to_owned()),
                    ..ChartRequest::new("t", "v", ChartType::Line)
                },
            )
            .expect("series");

        let total_points: usize = series
            .datasets
            .iter()
            .map(|dataset| dataset.points.len())
            .sum();
        assert_eq!(total_points, 50);
        assert_eq!(series.labels.len(), 50);
    }
}
