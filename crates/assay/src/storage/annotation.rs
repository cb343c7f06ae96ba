//! Row annotations: named buckets of rows used for drill-down in results.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::input::{InputRow, RowId};
use crate::schema::{InputColumn, Value};

static NEXT_ANNOTATION: AtomicU64 = AtomicU64::new(1);

struct AnnotationState {
    id: u64,
    row_count: AtomicU64,
}

/// A bucket of rows.
///
/// The row count includes the distinct count of every annotated row. A
/// given row is counted once per annotation however often it is annotated.
#[derive(Clone)]
pub struct RowAnnotation(Arc<AnnotationState>);

impl RowAnnotation {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AnnotationState {
            id: NEXT_ANNOTATION.fetch_add(1, Ordering::Relaxed),
            row_count: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn row_count(&self) -> u64 {
        self.0.row_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_rows(&self, count: u64) {
        self.0.row_count.fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn reset_count(&self) {
        self.0.row_count.store(0, Ordering::Release);
    }
}

impl PartialEq for RowAnnotation {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for RowAnnotation {}

impl fmt::Debug for RowAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowAnnotation[id={},rows={}]", self.id(), self.row_count())
    }
}

/// Creates annotations and records which rows belong to them.
pub trait RowAnnotationFactory: Send + Sync {
    fn create_annotation(&self) -> RowAnnotation {
        RowAnnotation::new()
    }

    /// Add a row standing for `distinct_count` source rows. Idempotent per
    /// (row, annotation).
    fn annotate(&self, row: &InputRow, distinct_count: u32, annotation: &RowAnnotation)
    -> Result<()>;

    fn annotate_rows(&self, rows: &[InputRow], annotation: &RowAnnotation) -> Result<()> {
        for row in rows {
            self.annotate(row, 1, annotation)?;
        }
        Ok(())
    }

    fn is_annotated(&self, row: &InputRow, annotation: &RowAnnotation) -> Result<bool>;

    /// Remove every row from the annotation.
    fn reset(&self, annotation: &RowAnnotation) -> Result<()>;

    /// Upper bound on the rows returned by [`rows`](Self::rows).
    fn sample_size(&self) -> usize;

    /// Materialized rows of the annotation, bounded by the sample size.
    fn rows(&self, annotation: &RowAnnotation) -> Result<Vec<InputRow>>;

    /// Value counts of one column over the annotated rows, weighted by
    /// distinct count, most frequent first.
    fn value_counts(
        &self,
        annotation: &RowAnnotation,
        column: &InputColumn,
    ) -> Result<IndexMap<Value, u64>>;

    /// Annotate `to` with every row annotated in `from`.
    fn transfer_annotations(&self, from: &RowAnnotation, to: &RowAnnotation) -> Result<()>;
}

/// Keeps every annotated row in memory, in annotation order. `rows`
/// returns the first `sample_size` of them and value counts cover them all.
pub struct InMemoryRowAnnotationFactory {
    sample_size: usize,
    annotations: Mutex<HashMap<u64, IndexMap<RowId, (InputRow, u32)>>>,
}

impl InMemoryRowAnnotationFactory {
    pub fn new(sample_size: usize) -> Self {
        Self {
            sample_size,
            annotations: Mutex::new(HashMap::new()),
        }
    }

    /// Memberships held across all annotations.
    pub fn member_count(&self) -> usize {
        self.annotations.lock().values().map(IndexMap::len).sum()
    }

    /// Take every membership out, by annotation id, in annotation order.
    pub(crate) fn drain(&self) -> Vec<(u64, Vec<(InputRow, u32)>)> {
        self.annotations
            .lock()
            .drain()
            .map(|(id, members)| (id, members.into_values().collect()))
            .collect()
    }
}

impl RowAnnotationFactory for InMemoryRowAnnotationFactory {
    fn annotate(
        &self,
        row: &InputRow,
        distinct_count: u32,
        annotation: &RowAnnotation,
    ) -> Result<()> {
        let mut annotations = self.annotations.lock();
        let members = annotations.entry(annotation.id()).or_default();
        if members.contains_key(&row.id()) {
            return Ok(());
        }
        members.insert(row.id(), (row.clone(), distinct_count));
        annotation.add_rows(distinct_count as u64);
        Ok(())
    }

    fn is_annotated(&self, row: &InputRow, annotation: &RowAnnotation) -> Result<bool> {
        Ok(self
            .annotations
            .lock()
            .get(&annotation.id())
            .is_some_and(|members| members.contains_key(&row.id())))
    }

    fn reset(&self, annotation: &RowAnnotation) -> Result<()> {
        self.annotations.lock().remove(&annotation.id());
        annotation.reset_count();
        Ok(())
    }

    fn sample_size(&self) -> usize {
        self.sample_size
    }

    fn rows(&self, annotation: &RowAnnotation) -> Result<Vec<InputRow>> {
        Ok(self
            .annotations
            .lock()
            .get(&annotation.id())
            .map(|members| {
                members
                    .values()
                    .take(self.sample_size)
                    .map(|(row, _)| row.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn value_counts(
        &self,
        annotation: &RowAnnotation,
        column: &InputColumn,
    ) -> Result<IndexMap<Value, u64>> {
        let annotations = self.annotations.lock();
        let mut counts: IndexMap<Value, u64> = IndexMap::new();
        if let Some(members) = annotations.get(&annotation.id()) {
            for (row, distinct_count) in members.values() {
                *counts.entry(row.value(column).clone()).or_insert(0) += *distinct_count as u64;
            }
        }
        counts.sort_by(|_, a, _, b| b.cmp(a));
        Ok(counts)
    }

    fn transfer_annotations(&self, from: &RowAnnotation, to: &RowAnnotation) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let mut annotations = self.annotations.lock();
        let Some(source) = annotations.get(&from.id()) else {
            return Ok(());
        };
        let moved: Vec<(RowId, (InputRow, u32))> = source
            .iter()
            .map(|(id, member)| (*id, member.clone()))
            .collect();

        let target = annotations.entry(to.id()).or_default();
        let mut added = 0u64;
        for (id, (row, distinct_count)) in moved {
            if !target.contains_key(&id) {
                target.insert(id, (row, distinct_count));
                added += distinct_count as u64;
            }
        }
        to.add_rows(added);
        Ok(())
    }
}
