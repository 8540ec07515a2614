//! Import runner: executes a query plan against a [`RangeSource`] and
//! persists per-entity progress after every batch.
//!
//! A failed query never aborts the run: its range goes to the entity's
//! retry list and the next batch proceeds. Only storage and plan errors stop
//! an import.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ImportError;
use crate::planner::{plan_queries, AddressQuery, EntityQuery, PlannerOptions, QueryBatch};
use crate::progress::{EntityState, ImportProgress, ProgressStore};
use crate::range::{Range, RangeValue};

/// A record located on the range axis (block number, timestamp).
pub trait Positioned<T: RangeValue> {
    fn position(&self) -> T;
}

/// Connector contract: how records are fetched for planned queries.
#[async_trait]
pub trait RangeSource<T: RangeValue>: Send + Sync {
    type Record: Positioned<T> + Send + 'static;
    type Error: fmt::Display + Send + Sync + 'static;

    /// Run a JSON-RPC batch. Returns one independent outcome per query, in
    /// the same order.
    async fn query_entities(
        &self,
        queries: &[EntityQuery<T>],
    ) -> Vec<Result<Vec<Self::Record>, Self::Error>>;

    /// Run one wide query for several entities. Records are tagged with the
    /// entity key they belong to.
    async fn query_addresses(
        &self,
        query: &AddressQuery<T>,
    ) -> Result<Vec<(String, Self::Record)>, Self::Error>;
}

/// A record together with the entity it was imported for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedRecord<R> {
    pub entity_key: String,
    pub record: R,
}

/// Result of one executed batch.
#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub records: Vec<ImportedRecord<R>>,
    pub queries: usize,
    pub failed_queries: usize,
}

/// Totals of an import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub batches: usize,
    pub queries: usize,
    pub failed_queries: usize,
    pub records: usize,
}

struct EntityOutcome<T: RangeValue> {
    succeeded: Vec<Range<T>>,
    failed: Vec<Range<T>>,
}

impl<T: RangeValue> Default for EntityOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Drives planned imports for a fixed set of entities.
pub struct ImportRunner<T: RangeValue, S: RangeSource<T>> {
    source: Arc<S>,
    store: Arc<dyn ProgressStore<T>>,
    full_ranges: HashMap<String, Range<T>>,
}

impl<T: RangeValue, S: RangeSource<T>> ImportRunner<T, S> {
    pub fn new(source: Arc<S>, store: Arc<dyn ProgressStore<T>>) -> Self {
        Self {
            source,
            store,
            full_ranges: HashMap::new(),
        }
    }

    /// Register an entity and the range it should eventually cover.
    pub fn entity(mut self, key: impl Into<String>, full_range: Range<T>) -> Self {
        self.full_ranges.insert(key.into(), full_range);
        self
    }

    /// Current progress of every registered entity, sorted by key.
    pub async fn states(&self) -> Result<Vec<EntityState<T>>, ImportError> {
        let mut keys: Vec<&String> = self.full_ranges.keys().collect();
        keys.sort();

        let mut states = Vec::with_capacity(keys.len());
        for key in keys {
            let full_range = self.full_ranges[key];
            let mut progress = self
                .store
                .load(key)
                .await?
                .unwrap_or_else(|| ImportProgress::new(full_range));
            progress.extend_to(full_range.to());
            states.push(EntityState::new(key.clone(), progress));
        }
        Ok(states)
    }

    /// Plan the next import from stored progress.
    pub async fn plan(&self, options: &PlannerOptions) -> Result<Vec<QueryBatch<T>>, ImportError> {
        let states = self.states().await?;
        Ok(plan_queries(&states, options)?)
    }

    /// Execute one batch and persist the resulting progress.
    pub async fn run_batch(&self, batch: &QueryBatch<T>) -> Result<BatchOutcome<S::Record>, ImportError> {
        self.check_known(batch)?;

        let mut outcomes: BTreeMap<String, EntityOutcome<T>> = BTreeMap::new();
        let mut records = Vec::new();
        let mut failed_queries = 0;

        match batch {
            QueryBatch::JsonRpc { queries } => {
                let mut results = self.source.query_entities(queries).await.into_iter();
                for query in queries {
                    let entry = outcomes.entry(query.entity_key.clone()).or_default();
                    match results.next() {
                        Some(Ok(found)) => {
                            entry.succeeded.push(query.range);
                            records.extend(found.into_iter().map(|record| ImportedRecord {
                                entity_key: query.entity_key.clone(),
                                record,
                            }));
                        }
                        Some(Err(e)) => {
                            warn!(entity = %query.entity_key, range = %query.range, error = %e, "query failed, range queued for retry");
                            entry.failed.push(query.range);
                            failed_queries += 1;
                        }
                        None => {
                            warn!(entity = %query.entity_key, range = %query.range, "source returned no result for query");
                            entry.failed.push(query.range);
                            failed_queries += 1;
                        }
                    }
                }
            }
            QueryBatch::Address { queries } => {
                for query in queries {
                    match self.source.query_addresses(query).await {
                        Ok(found) => {
                            for key in &query.entity_keys {
                                let entry = outcomes.entry(key.clone()).or_default();
                                entry.succeeded.extend(query.wanted_ranges(key).unwrap_or_default());
                            }
                            records.extend(
                                found
                                    .into_iter()
                                    .filter(|(key, record)| query.keeps(key, record.position()))
                                    .map(|(entity_key, record)| ImportedRecord { entity_key, record }),
                            );
                        }
                        Err(e) => {
                            warn!(entities = ?query.entity_keys, range = %query.range, error = %e, "address query failed, ranges queued for retry");
                            for key in &query.entity_keys {
                                let entry = outcomes.entry(key.clone()).or_default();
                                entry.failed.extend(query.wanted_ranges(key).unwrap_or_default());
                            }
                            failed_queries += 1;
                        }
                    }
                }
            }
        }

        for (key, outcome) in &outcomes {
            let full_range = self.full_range(key)?;
            self.store
                .record(key, full_range, &outcome.succeeded, &outcome.failed)
                .await?;
        }

        info!(
            queries = batch.query_count(),
            failed_queries,
            records = records.len(),
            entities = outcomes.len(),
            "Import batch complete"
        );
        Ok(BatchOutcome {
            records,
            queries: batch.query_count(),
            failed_queries,
        })
    }

    fn full_range(&self, key: &str) -> Result<Range<T>, ImportError> {
        self.full_ranges
            .get(key)
            .copied()
            .ok_or_else(|| ImportError::UnknownEntity(key.to_string()))
    }

    fn check_known(&self, batch: &QueryBatch<T>) -> Result<(), ImportError> {
        match batch {
            QueryBatch::JsonRpc { queries } => queries
                .iter()
                .try_for_each(|q| self.full_range(&q.entity_key).map(drop)),
            QueryBatch::Address { queries } => queries
                .iter()
                .flat_map(|q| q.entity_keys.iter())
                .try_for_each(|key| self.full_range(key).map(drop)),
        }
    }

    /// Lazily import `plan`, yielding records batch by batch.
    ///
    /// A batch is only fetched once the consumer has drained the previous
    /// one; dropping the stream stops the import. The stream ends after the
    /// first error.
    pub fn stream(
        &self,
        plan: Vec<QueryBatch<T>>,
    ) -> impl Stream<Item = Result<ImportedRecord<S::Record>, ImportError>> + '_ {
        stream::unfold(Some(plan.into_iter()), move |remaining| async move {
            let mut remaining = remaining?;
            let batch = remaining.next()?;
            match self.run_batch(&batch).await {
                Ok(outcome) => {
                    let items: Vec<_> = outcome.records.into_iter().map(Ok).collect();
                    Some((stream::iter(items), Some(remaining)))
                }
                Err(e) => Some((stream::iter(vec![Err(e)]), None)),
            }
        })
        .flatten()
    }

    /// Execute the whole plan, discarding records.
    pub async fn run(&self, plan: &[QueryBatch<T>]) -> Result<ImportSummary, ImportError> {
        let mut summary = ImportSummary::default();
        for batch in plan {
            let outcome = self.run_batch(batch).await?;
            summary.batches += 1;
            summary.queries += outcome.queries;
            summary.failed_queries += outcome.failed_queries;
            summary.records += outcome.records.len();
        }
        info!(
            batches = summary.batches,
            queries = summary.queries,
            failed = summary.failed_queries,
            records = summary.records,
            "Import run complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PostFilter;
    use crate::progress::MemoryProgressStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Event {
        block: u64,
    }

    impl Positioned<u64> for Event {
        fn position(&self) -> u64 {
            self.block
        }
    }

    /// Emits one event per 10 blocks; fails every query for entity `bad`.
    #[derive(Default)]
    struct MockSource {
        calls: AtomicUsize,
    }

    fn events_in(range: &Range<u64>) -> Vec<Event> {
        (range.from()..=range.to())
            .filter(|b| b % 10 == 0)
            .map(|block| Event { block })
            .collect()
    }

    #[async_trait]
    impl RangeSource<u64> for MockSource {
        type Record = Event;
        type Error = String;

        async fn query_entities(&self, queries: &[EntityQuery<u64>]) -> Vec<Result<Vec<Event>, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            queries
                .iter()
                .map(|q| {
                    if q.entity_key == "bad" {
                        Err("connection reset".to_string())
                    } else {
                        Ok(events_in(&q.range))
                    }
                })
                .collect()
        }

        async fn query_addresses(&self, query: &AddressQuery<u64>) -> Result<Vec<(String, Event)>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.entity_keys.iter().any(|k| k == "bad") {
                return Err("timeout".into());
            }
            Ok(query
                .entity_keys
                .iter()
                .flat_map(|k| events_in(&query.range).into_iter().map(move |e| (k.clone(), e)))
                .collect())
        }
    }

    fn r(from: u64, to: u64) -> Range<u64> {
        Range::new(from, to).unwrap()
    }

    fn runner(
        store: Arc<MemoryProgressStore<u64>>,
    ) -> (Arc<MockSource>, ImportRunner<u64, MockSource>) {
        let source = Arc::new(MockSource::default());
        let runner = ImportRunner::new(source.clone(), store)
            .entity("good", r(0, 99))
            .entity("bad", r(0, 99));
        (source, runner)
    }

    #[tokio::test]
    async fn failures_are_isolated_per_entity() {
        let store = Arc::new(MemoryProgressStore::new());
        let (_, runner) = runner(store.clone());

        let plan = runner.plan(&PlannerOptions::default()).await.unwrap();
        let summary = runner.run(&plan).await.unwrap();
        assert_eq!(summary.failed_queries, 1);
        assert_eq!(summary.records, 10);

        let good = store.load("good").await.unwrap().unwrap();
        assert_eq!(good.covered_ranges, vec![r(0, 99)]);
        let bad = store.load("bad").await.unwrap().unwrap();
        assert!(bad.covered_ranges.is_empty());
        assert_eq!(bad.to_retry, vec![r(0, 99)]);

        // next plan only retries the failed entity
        let plan = runner.plan(&PlannerOptions::default()).await.unwrap();
        assert_eq!(
            plan,
            vec![QueryBatch::JsonRpc {
                queries: vec![EntityQuery {
                    entity_key: "bad".into(),
                    range: r(0, 99)
                }]
            }]
        );
    }

    #[tokio::test]
    async fn address_results_are_post_filtered() {
        let store = Arc::new(MemoryProgressStore::new());
        let source = Arc::new(MockSource::default());
        let runner = ImportRunner::new(source, store.clone())
            .entity("a", r(0, 99))
            .entity("b", r(0, 99));

        let batch = QueryBatch::Address {
            queries: vec![AddressQuery {
                entity_keys: vec!["a".into(), "b".into()],
                range: r(0, 99),
                post_filters: vec![PostFilter {
                    entity_key: "b".into(),
                    ranges: vec![r(50, 99)],
                }],
            }],
        };
        let outcome = runner.run_batch(&batch).await.unwrap();
        let for_b: Vec<u64> = outcome
            .records
            .iter()
            .filter(|r| r.entity_key == "b")
            .map(|r| r.record.block)
            .collect();
        assert_eq!(for_b, vec![50, 60, 70, 80, 90]);
        assert_eq!(outcome.records.len(), 15);

        let b = store.load("b").await.unwrap().unwrap();
        assert_eq!(b.covered_ranges, vec![r(50, 99)]);
        assert_eq!(b.pending_ranges(), vec![r(0, 49)]);
    }

    #[tokio::test]
    async fn stream_fetches_batches_on_demand() {
        let store = Arc::new(MemoryProgressStore::new());
        let source = Arc::new(MockSource::default());
        let runner = ImportRunner::new(source.clone(), store.clone()).entity("good", r(0, 299));

        let plan: Vec<_> = [r(200, 299), r(100, 199), r(0, 99)]
            .into_iter()
            .map(|range| QueryBatch::JsonRpc {
                queries: vec![EntityQuery {
                    entity_key: "good".into(),
                    range,
                }],
            })
            .collect();

        let first: Vec<_> = runner.stream(plan).take(3).collect().await;
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(Result::is_ok));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let progress = store.load("good").await.unwrap().unwrap();
        assert_eq!(progress.covered_ranges, vec![r(200, 299)]);
    }

    #[tokio::test]
    async fn stream_stops_on_unknown_entity() {
        let store = Arc::new(MemoryProgressStore::new());
        let (source, runner) = runner(store);
        let plan = vec![
            QueryBatch::JsonRpc {
                queries: vec![EntityQuery {
                    entity_key: "ghost".into(),
                    range: r(0, 9),
                }],
            },
            QueryBatch::JsonRpc {
                queries: vec![EntityQuery {
                    entity_key: "good".into(),
                    range: r(0, 9),
                }],
            },
        ];

        let items: Vec<_> = runner.stream(plan).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ImportError::UnknownEntity(ref k)) if k == "ghost"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
