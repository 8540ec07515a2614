//! Incremental import progress: what has been covered, what must be retried.
//!
//! Every indexed entity (e.g. `"ethereum:0xabc…:transfers"`) owns one
//! [`ImportProgress`]. The import runner mutates it after each batch and
//! persists it through a [`ProgressStore`] before moving on; the planner only
//! ever reads a snapshot.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ImportError;
use crate::range::{exclude_sorted, intersect, merge, total_size, Range, RangeValue};

/// Import progress of a single entity.
///
/// `covered_ranges` and `to_retry` are kept merged and clipped to
/// `full_range`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ImportProgress<T: RangeValue> {
    /// Everything this entity should eventually cover.
    pub full_range: Range<T>,
    /// Successfully imported sub-ranges.
    #[serde(default)]
    pub covered_ranges: Vec<Range<T>>,
    /// Sub-ranges whose last attempt failed.
    #[serde(default)]
    pub to_retry: Vec<Range<T>>,
}

impl<T: RangeValue> ImportProgress<T> {
    pub fn new(full_range: Range<T>) -> Self {
        Self {
            full_range,
            covered_ranges: Vec::new(),
            to_retry: Vec::new(),
        }
    }

    /// Merge both lists and clip them to `full_range`.
    ///
    /// Call this on progress coming from an external source (JSON, database).
    pub fn normalize(&mut self) {
        self.covered_ranges = merge(&intersect(&self.covered_ranges, &self.full_range));
        let retry = merge(&intersect(&self.to_retry, &self.full_range));
        self.to_retry = exclude_sorted(&retry, &self.covered_ranges);
    }

    /// Never-attempted sub-ranges: `full_range − (covered ∪ to_retry)`, ascending.
    pub fn pending_ranges(&self) -> Vec<Range<T>> {
        let mut done = self.covered_ranges.clone();
        done.extend_from_slice(&self.to_retry);
        exclude_sorted(&[self.full_range], &done)
    }

    /// Previously failed sub-ranges still inside `full_range`, ascending.
    pub fn retry_ranges(&self) -> Vec<Range<T>> {
        merge(&intersect(&self.to_retry, &self.full_range))
    }

    /// Mark `ranges` as imported. They leave `to_retry` if they were there.
    pub fn record_success(&mut self, ranges: &[Range<T>]) {
        if ranges.is_empty() {
            return;
        }
        let mut covered = std::mem::take(&mut self.covered_ranges);
        covered.extend(intersect(ranges, &self.full_range));
        self.covered_ranges = merge(&covered);
        self.to_retry = exclude_sorted(&self.to_retry, ranges);
    }

    /// Mark `ranges` as failed. Parts already covered stay covered.
    pub fn record_failure(&mut self, ranges: &[Range<T>]) {
        if ranges.is_empty() {
            return;
        }
        let failed = exclude_sorted(&intersect(ranges, &self.full_range), &self.covered_ranges);
        let mut retry = std::mem::take(&mut self.to_retry);
        retry.extend(failed);
        self.to_retry = merge(&retry);
    }

    /// Grow `full_range` as the chain head advances. It never shrinks.
    pub fn extend_to(&mut self, to: T) {
        self.full_range = self.full_range.extend_to(to);
    }

    pub fn is_complete(&self) -> bool {
        self.to_retry.is_empty() && self.pending_ranges().is_empty()
    }

    pub fn covered_size(&self) -> u64 {
        total_size(&self.covered_ranges)
    }

    pub fn pending_size(&self) -> u64 {
        total_size(&self.pending_ranges())
    }

    pub fn retry_size(&self) -> u64 {
        total_size(&self.to_retry)
    }
}

/// Progress snapshot of one entity, as handed to the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState<T: RangeValue> {
    /// Unique entity key, e.g. `"bsc:0x1234:share_rate"`.
    pub key: String,
    #[serde(flatten)]
    pub progress: ImportProgress<T>,
}

impl<T: RangeValue> EntityState<T> {
    pub fn new(key: impl Into<String>, progress: ImportProgress<T>) -> Self {
        Self {
            key: key.into(),
            progress,
        }
    }
}

// ─── Store contract ──────────────────────────────────────────────────────────

/// Persistence contract for per-entity import progress.
///
/// Implementations include [`MemoryProgressStore`] and the SQLite store in
/// `chainrange-storage`.
#[async_trait]
pub trait ProgressStore<T: RangeValue>: Send + Sync {
    /// Load the progress of an entity, `None` before its first import.
    async fn load(&self, key: &str) -> Result<Option<ImportProgress<T>>, ImportError>;

    /// Save (upsert) the progress of an entity.
    async fn save(&self, key: &str, progress: &ImportProgress<T>) -> Result<(), ImportError>;

    /// Forget an entity (e.g. to re-import it from scratch).
    async fn delete(&self, key: &str) -> Result<(), ImportError>;

    /// Read-modify-write: apply a batch outcome and return the new progress.
    ///
    /// The default implementation is not atomic; stores shared between
    /// processes should override it.
    async fn record(
        &self,
        key: &str,
        full_range: Range<T>,
        succeeded: &[Range<T>],
        failed: &[Range<T>],
    ) -> Result<ImportProgress<T>, ImportError> {
        let mut progress = self
            .load(key)
            .await?
            .unwrap_or_else(|| ImportProgress::new(full_range));
        progress.extend_to(full_range.to());
        progress.record_success(succeeded);
        progress.record_failure(failed);
        self.save(key, &progress).await?;
        Ok(progress)
    }
}

// ─── In-memory store (for testing) ───────────────────────────────────────────

/// In-memory progress store for tests and one-shot imports.
pub struct MemoryProgressStore<T: RangeValue> {
    data: Mutex<HashMap<String, ImportProgress<T>>>,
}

impl<T: RangeValue> Default for MemoryProgressStore<T> {
    fn default() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: RangeValue> MemoryProgressStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities with stored progress.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T: RangeValue> ProgressStore<T> for MemoryProgressStore<T> {
    async fn load(&self, key: &str) -> Result<Option<ImportProgress<T>>, ImportError> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn save(&self, key: &str, progress: &ImportProgress<T>) -> Result<(), ImportError> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), progress.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ImportError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn record(
        &self,
        key: &str,
        full_range: Range<T>,
        succeeded: &[Range<T>],
        failed: &[Range<T>],
    ) -> Result<ImportProgress<T>, ImportError> {
        let mut data = self.data.lock().unwrap();
        let progress = data
            .entry(key.to_string())
            .or_insert_with(|| ImportProgress::new(full_range));
        progress.extend_to(full_range.to());
        progress.record_success(succeeded);
        progress.record_failure(failed);
        Ok(progress.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(from: u64, to: u64) -> Range<u64> {
        Range::new(from, to).unwrap()
    }

    #[test]
    fn pending_excludes_covered_and_retry() {
        let mut p = ImportProgress::new(r(0, 999));
        p.covered_ranges = vec![r(100, 199)];
        p.to_retry = vec![r(500, 599)];
        assert_eq!(p.pending_ranges(), vec![r(0, 99), r(200, 499), r(600, 999)]);
        assert_eq!(p.retry_ranges(), vec![r(500, 599)]);
    }

    #[test]
    fn success_clears_retry() {
        let mut p = ImportProgress::new(r(0, 999));
        p.record_failure(&[r(100, 299)]);
        assert_eq!(p.to_retry, vec![r(100, 299)]);

        p.record_success(&[r(100, 199)]);
        assert_eq!(p.covered_ranges, vec![r(100, 199)]);
        assert_eq!(p.to_retry, vec![r(200, 299)]);
    }

    #[test]
    fn failure_never_uncovers() {
        let mut p = ImportProgress::new(r(0, 999));
        p.record_success(&[r(0, 499)]);
        p.record_failure(&[r(400, 599)]);
        assert_eq!(p.covered_ranges, vec![r(0, 499)]);
        assert_eq!(p.to_retry, vec![r(500, 599)]);
    }

    #[test]
    fn outcomes_are_clipped_to_full_range() {
        let mut p = ImportProgress::new(r(100, 199));
        p.record_success(&[r(0, 149)]);
        p.record_failure(&[r(190, 300)]);
        assert_eq!(p.covered_ranges, vec![r(100, 149)]);
        assert_eq!(p.to_retry, vec![r(190, 199)]);
    }

    #[test]
    fn extend_to_only_grows() {
        let mut p = ImportProgress::new(r(100, 199));
        p.record_success(&[r(100, 199)]);
        assert!(p.is_complete());

        p.extend_to(150);
        assert_eq!(p.full_range, r(100, 199));

        p.extend_to(299);
        assert_eq!(p.full_range, r(100, 299));
        assert_eq!(p.pending_ranges(), vec![r(200, 299)]);
        assert_eq!(p.pending_size(), 100);
    }

    #[test]
    fn normalize_cleans_external_data() {
        let mut p = ImportProgress::new(r(0, 99));
        p.covered_ranges = vec![r(50, 60), r(0, 10), r(55, 200)];
        p.to_retry = vec![r(5, 20)];
        p.normalize();
        assert_eq!(p.covered_ranges, vec![r(0, 10), r(50, 99)]);
        assert_eq!(p.to_retry, vec![r(11, 20)]);
    }

    #[test]
    fn entity_state_json_shape() {
        let json = r#"{"key":"eth:0x1:transfers","full_range":{"from":1,"to":10},"covered_ranges":[{"from":1,"to":5}]}"#;
        let state: EntityState<u64> = serde_json::from_str(json).unwrap();
        assert_eq!(state.key, "eth:0x1:transfers");
        assert_eq!(state.progress.covered_ranges, vec![r(1, 5)]);
        assert!(state.progress.to_retry.is_empty());
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryProgressStore::<u64>::new();
        assert!(store.load("a").await.unwrap().is_none());

        let mut p = ImportProgress::new(r(0, 10));
        p.record_success(&[r(0, 5)]);
        store.save("a", &p).await.unwrap();
        assert_eq!(store.load("a").await.unwrap(), Some(p));

        store.delete("a").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn record_creates_then_updates() {
        let store = MemoryProgressStore::<u64>::new();
        let p = store
            .record("a", r(0, 99), &[r(0, 49)], &[r(50, 59)])
            .await
            .unwrap();
        assert_eq!(p.covered_ranges, vec![r(0, 49)]);
        assert_eq!(p.to_retry, vec![r(50, 59)]);

        let p = store.record("a", r(0, 199), &[r(50, 59)], &[]).await.unwrap();
        assert_eq!(p.full_range, r(0, 199));
        assert_eq!(p.covered_ranges, vec![r(0, 59)]);
        assert!(p.to_retry.is_empty());
        assert_eq!(store.load("a").await.unwrap(), Some(p));
    }
}
