//! Merging partial results from partitioned executions.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::crosstab::{Crosstab, CrosstabDimension};
use super::{AnalyzerResult, AnnotatedRows};
use crate::error::{AssayError, Result};
use crate::schema::Value;

/// Merges results of identical shape produced by independent executions
/// of the same analyzer.
pub trait ResultReducer: Send + Sync {
    fn reduce(&self, partials: &[AnalyzerResult]) -> Result<AnalyzerResult>;
}

/// How values of the same cell are combined.
#[derive(Clone)]
pub enum CombineKind {
    Sum,
    Min,
    Max,
    Custom(Arc<dyn Fn(&[Value]) -> Value + Send + Sync>),
}

impl fmt::Debug for CombineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CombineKind::Sum => write!(f, "Sum"),
            CombineKind::Min => write!(f, "Min"),
            CombineKind::Max => write!(f, "Max"),
            CombineKind::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// A combine rule plus an optional neutral element.
///
/// Without a neutral element a cell missing from a partial result is left
/// out of the combination. With one, the missing cell contributes the
/// neutral value, and the reduced crosstab holds every combination of
/// categories.
#[derive(Debug, Clone)]
pub struct Combiner {
    kind: CombineKind,
    neutral: Option<Value>,
}

impl Combiner {
    pub fn sum() -> Self {
        Self::of(CombineKind::Sum)
    }

    pub fn min() -> Self {
        Self::of(CombineKind::Min)
    }

    pub fn max() -> Self {
        Self::of(CombineKind::Max)
    }

    pub fn custom(f: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Self {
        Self::of(CombineKind::Custom(Arc::new(f)))
    }

    fn of(kind: CombineKind) -> Self {
        Self {
            kind,
            neutral: None,
        }
    }

    pub fn with_neutral(mut self, neutral: impl Into<Value>) -> Self {
        self.neutral = Some(neutral.into());
        self
    }

    pub fn kind(&self) -> &CombineKind {
        &self.kind
    }

    pub fn neutral(&self) -> Option<&Value> {
        self.neutral.as_ref()
    }

    pub fn combine(&self, values: &[Value]) -> Value {
        match &self.kind {
            CombineKind::Sum => {
                if values.iter().any(|v| matches!(v, Value::Float(_))) {
                    sum_as_double(values)
                } else {
                    sum_as_integer(values)
                }
            }
            CombineKind::Min => minimum(values),
            CombineKind::Max => maximum(values),
            CombineKind::Custom(f) => f(values),
        }
    }

    /// Combine the values found in each partial, filling gaps with the
    /// neutral element when there is one.
    fn combine_present<'a>(&self, found: impl Iterator<Item = Option<&'a Value>>) -> Value {
        let values: Vec<Value> = found
            .filter_map(|v| v.or(self.neutral.as_ref()).cloned())
            .collect();
        self.combine(&values)
    }
}

/// Sum of the integer and float entries as an integer. Nulls and
/// non-numeric entries are skipped. Null if nothing was summed.
pub fn sum_as_integer(values: &[Value]) -> Value {
    let mut numbers = values.iter().filter_map(|v| match v {
        Value::Integer(i) => Some(*i),
        Value::Float(f) => Some(*f as i64),
        _ => None,
    });
    let Some(first) = numbers.next() else {
        return Value::Null;
    };
    match numbers.try_fold(first, i64::checked_add) {
        Some(total) => Value::Integer(total),
        // Too large for an integer.
        None => sum_as_double(values),
    }
}

/// Sum of the numeric entries as a float. Null if nothing was summed.
pub fn sum_as_double(values: &[Value]) -> Value {
    let mut numbers = values.iter().filter_map(Value::as_f64);
    match numbers.next() {
        Some(first) => Value::Float(numbers.fold(first, |acc, n| acc + n)),
        None => Value::Null,
    }
}

/// Largest numeric entry, keeping its original representation.
pub fn maximum(values: &[Value]) -> Value {
    extreme(values, |candidate, best| candidate > best)
}

/// Smallest numeric entry, keeping its original representation.
pub fn minimum(values: &[Value]) -> Value {
    extreme(values, |candidate, best| candidate < best)
}

fn extreme(values: &[Value], better: impl Fn(f64, f64) -> bool) -> Value {
    let mut best: Option<(f64, &Value)> = None;
    for value in values {
        let Some(number) = value.as_f64() else {
            continue;
        };
        match best {
            Some((current, _)) if !better(number, current) => {}
            _ => best = Some((number, value)),
        }
    }
    best.map(|(_, v)| v.clone()).unwrap_or(Value::Null)
}

/// Merge crosstabs cell by cell.
///
/// Every crosstab must have the same dimension names in the same order.
/// Categories are unioned in first-seen order.
pub fn merge_crosstabs(crosstabs: &[&Crosstab], combiner: &Combiner) -> Result<Crosstab> {
    let Some(first) = crosstabs.first() else {
        return Err(AssayError::ResultShape("no crosstabs to merge".to_string()));
    };
    let names = first.dimension_names();
    for other in &crosstabs[1..] {
        if other.dimension_names() != names {
            return Err(AssayError::ResultShape(format!(
                "crosstab dimensions {:?} do not match {:?}",
                other.dimension_names(),
                names
            )));
        }
    }

    let mut dimensions: Vec<CrosstabDimension> =
        names.iter().map(|n| CrosstabDimension::new(*n)).collect();
    let mut keys: IndexMap<Vec<String>, ()> = IndexMap::new();
    for crosstab in crosstabs {
        for (merged, dimension) in dimensions.iter_mut().zip(crosstab.dimensions()) {
            for category in dimension.categories() {
                merged.add_category(category);
            }
        }
        for (key, _) in crosstab.cells() {
            keys.insert(key.to_vec(), ());
        }
    }
    if combiner.neutral().is_some() {
        for key in cartesian(&dimensions) {
            keys.entry(key).or_insert(());
        }
    }

    let mut merged = Crosstab::new(dimensions);
    for key in keys.into_keys() {
        let value = combiner.combine_present(crosstabs.iter().map(|c| c.cell(&key)));
        merged.put_key(key, value);
    }
    Ok(merged)
}

fn cartesian(dimensions: &[CrosstabDimension]) -> Vec<Vec<String>> {
    let mut keys: Vec<Vec<String>> = vec![Vec::new()];
    for dimension in dimensions {
        keys = keys
            .into_iter()
            .flat_map(|prefix| {
                dimension.categories().map(move |category| {
                    let mut key = prefix.clone();
                    key.push(category.to_string());
                    key
                })
            })
            .collect();
    }
    keys
}

/// Merge metric maps, each metric with its own combiner.
fn merge_metrics(
    partials: &[AnalyzerResult],
    combiner_for: impl Fn(&str) -> Combiner,
) -> IndexMap<String, Value> {
    let mut names: Vec<&str> = Vec::new();
    for partial in partials {
        for name in partial.metrics.keys() {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
    }
    names
        .into_iter()
        .map(|name| {
            let combiner = combiner_for(name);
            let value = combiner.combine_present(partials.iter().map(|p| p.metrics.get(name)));
            (name.to_string(), value)
        })
        .collect()
}

/// Sum row counts and concatenate the partial samples.
pub(crate) fn merge_annotated_rows(partials: &[AnalyzerResult]) -> IndexMap<String, AnnotatedRows> {
    let mut merged: IndexMap<String, AnnotatedRows> = IndexMap::new();
    for partial in partials {
        for (name, rows) in &partial.annotated_rows {
            let entry = merged.entry(name.clone()).or_insert_with(|| AnnotatedRows {
                row_count: 0,
                rows: Vec::new(),
                sample_size: rows.sample_size,
            });
            entry.row_count += rows.row_count;
            entry.sample_size = entry.sample_size.max(rows.sample_size);
            let room = entry.sample_size.saturating_sub(entry.rows.len());
            entry.rows.extend(rows.rows.iter().take(room).cloned());
        }
    }
    merged
}

/// Reduces crosstab cells with one combiner and metrics with per-metric
/// combiners. Sums everything unless told otherwise.
#[derive(Debug, Clone)]
pub struct DefaultResultReducer {
    crosstab: Combiner,
    metrics: IndexMap<String, Combiner>,
    default_metric: Combiner,
}

impl Default for DefaultResultReducer {
    fn default() -> Self {
        Self {
            crosstab: Combiner::sum(),
            metrics: IndexMap::new(),
            default_metric: Combiner::sum(),
        }
    }
}

impl DefaultResultReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_crosstab_combiner(mut self, combiner: Combiner) -> Self {
        self.crosstab = combiner;
        self
    }

    pub fn with_metric_combiner(mut self, metric: impl Into<String>, combiner: Combiner) -> Self {
        self.metrics.insert(metric.into(), combiner);
        self
    }

    pub fn with_default_metric_combiner(mut self, combiner: Combiner) -> Self {
        self.default_metric = combiner;
        self
    }
}

impl ResultReducer for DefaultResultReducer {
    fn reduce(&self, partials: &[AnalyzerResult]) -> Result<AnalyzerResult> {
        let Some(first) = partials.first() else {
            return Err(AssayError::ResultShape("no partial results".to_string()));
        };

        let crosstabs: Vec<&Crosstab> = partials.iter().filter_map(|p| p.crosstab.as_ref()).collect();
        let crosstab = match crosstabs.len() {
            0 => None,
            n if n == partials.len() => Some(merge_crosstabs(&crosstabs, &self.crosstab)?),
            _ => {
                return Err(AssayError::ResultShape(format!(
                    "only {} of {} partial results of '{}' carry a crosstab",
                    crosstabs.len(),
                    partials.len(),
                    first.component
                )));
            }
        };

        let metrics = merge_metrics(partials, |name| {
            self.metrics
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.default_metric.clone())
        });

        Ok(AnalyzerResult {
            component: first.component.clone(),
            crosstab,
            metrics,
            annotated_rows: merge_annotated_rows(partials),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputRow, RowId};

    fn completeness(values: [(&str, &str, i64); 4]) -> AnalyzerResult {
        let mut crosstab = Crosstab::new(vec![
            CrosstabDimension::new("Column"),
            CrosstabDimension::new("Measure"),
        ]);
        for (column, measure, value) in values {
            crosstab
                .put(&[("Column", column), ("Measure", measure)], value)
                .unwrap();
        }
        AnalyzerResult::new("Completeness").with_crosstab(crosstab)
    }

    #[test]
    fn test_sum_reduces_completeness_crosstabs() {
        let a = completeness([
            ("col1", "Null count", 3),
            ("col2", "Null count", 2),
            ("col1", "Valid count", 10),
            ("col2", "Valid count", 11),
        ]);
        let b = completeness([
            ("col1", "Null count", 5),
            ("col2", "Null count", 2),
            ("col1", "Valid count", 20),
            ("col2", "Valid count", 21),
        ]);

        let reduced = DefaultResultReducer::new().reduce(&[a, b]).unwrap();
        let ct = reduced.crosstab.unwrap();
        let get = |c: &str, m: &str| ct.get(&[("Column", c), ("Measure", m)]).cloned();
        assert_eq!(get("col1", "Null count"), Some(Value::Integer(8)));
        assert_eq!(get("col2", "Null count"), Some(Value::Integer(4)));
        assert_eq!(get("col1", "Valid count"), Some(Value::Integer(30)));
        assert_eq!(get("col2", "Valid count"), Some(Value::Integer(32)));
    }

    #[test]
    fn test_missing_cells_stay_absent_without_neutral() {
        let mut a = Crosstab::new(vec![CrosstabDimension::new("Value")]);
        a.put(&[("Value", "x")], 1i64).unwrap();
        let mut b = Crosstab::new(vec![CrosstabDimension::new("Value")]);
        b.put(&[("Value", "y")], 2i64).unwrap();

        let merged = merge_crosstabs(&[&a, &b], &Combiner::max()).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get(&[("Value", "x")]), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_neutral_fills_category_grid() {
        let mut a = Crosstab::new(vec![
            CrosstabDimension::new("Column"),
            CrosstabDimension::new("Measure"),
        ]);
        a.put(&[("Column", "a"), ("Measure", "m1")], 1i64).unwrap();
        let mut b = a.clone();
        b.put(&[("Column", "b"), ("Measure", "m2")], 4i64).unwrap();

        let merged = merge_crosstabs(&[&a, &b], &Combiner::sum().with_neutral(0i64)).unwrap();
        assert_eq!(merged.len(), 4);
        assert_eq!(
            merged.get(&[("Column", "b"), ("Measure", "m1")]),
            Some(&Value::Integer(0))
        );
        assert_eq!(
            merged.get(&[("Column", "a"), ("Measure", "m1")]),
            Some(&Value::Integer(2))
        );
    }

    #[test]
    fn test_numeric_helpers_skip_nulls() {
        let values = vec![Value::Integer(4), Value::Null, Value::Integer(-1)];
        assert_eq!(sum_as_integer(&values), Value::Integer(3));
        assert_eq!(sum_as_double(&values), Value::Float(3.0));
        assert_eq!(maximum(&values), Value::Integer(4));
        assert_eq!(minimum(&values), Value::Integer(-1));
        assert_eq!(sum_as_integer(&[Value::Null, Value::Null]), Value::Null);
        assert_eq!(maximum(&[]), Value::Null);
    }

    #[test]
    fn test_integer_sum_overflow_falls_back_to_float() {
        let values = vec![Value::Integer(i64::MAX), Value::Integer(1)];
        assert_eq!(sum_as_integer(&values), Value::Float(i64::MAX as f64 + 1.0));
        assert_eq!(
            sum_as_integer(&[Value::Integer(i64::MIN), Value::Integer(-1)]),
            Value::Float(i64::MIN as f64 - 1.0)
        );
    }

    #[test]
    fn test_merged_samples_respect_sample_size() {
        let partial = |first: u64, rows: usize| {
            let rows: Vec<InputRow> = (0..rows as u64)
                .map(|i| InputRow::new(RowId::physical(first + i), Vec::new()))
                .collect();
            AnalyzerResult::new("Rows").with_annotated_rows(
                "Rows",
                AnnotatedRows {
                    row_count: 10,
                    rows,
                    sample_size: 3,
                },
            )
        };

        let merged = merge_annotated_rows(&[partial(1, 2), partial(11, 3), partial(21, 1)]);
        let rows = &merged["Rows"];
        assert_eq!(rows.row_count, 30);
        let ids: Vec<u64> = rows.rows.iter().map(|r| r.id().value()).collect();
        assert_eq!(ids, vec![1, 2, 11]);

        // Small partials are kept whole.
        let merged = merge_annotated_rows(&[partial(1, 1), partial(11, 1)]);
        assert_eq!(merged["Rows"].rows.len(), 2);
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let a = Crosstab::new(vec![CrosstabDimension::new("Column")]);
        let b = Crosstab::new(vec![CrosstabDimension::new("Value")]);
        assert!(matches!(
            merge_crosstabs(&[&a, &b], &Combiner::sum()),
            Err(AssayError::ResultShape(_))
        ));

        let with = AnalyzerResult::new("x").with_crosstab(a);
        let without = AnalyzerResult::new("x");
        assert!(DefaultResultReducer::new().reduce(&[with, without]).is_err());
    }

    #[test]
    fn test_metric_combiners() {
        let a = AnalyzerResult::new("x")
            .with_metric("Row count", 3i64)
            .with_metric("Longest", 7i64);
        let b = AnalyzerResult::new("x")
            .with_metric("Row count", 4i64)
            .with_metric("Longest", 5i64);
        let reducer = DefaultResultReducer::new().with_metric_combiner("Longest", Combiner::max());
        let reduced = reducer.reduce(&[a, b]).unwrap();
        assert_eq!(reduced.count("Row count"), Some(7));
        assert_eq!(reduced.count("Longest"), Some(7));
    }
}
