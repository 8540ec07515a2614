//! Batch planner: decides which ranges to query, for which entities,
//! batched how, in what order.
//!
//! Two query shapes are available to a connector:
//! - a **JSON-RPC batch**: one request per `(entity, range)`, sent together
//! - an **address batch**: one wide request for several contracts over a
//!   covering range, with per-entity post-filters dropping what was not wanted
//!
//! Planning runs in two phases. Never-attempted ranges go first, previous
//! failures last. Each phase is cut into slices by the coverage index,
//! handled most recent first, and every slice independently picks the
//! cheaper shape.
//!
//! # Example
//!
//! ```rust
//! use chainrange_core::planner::{plan_queries, PlannerOptions};
//! use chainrange_core::progress::{EntityState, ImportProgress};
//! use chainrange_core::range::Range;
//!
//! let mut progress = ImportProgress::new(Range::new(100u64, 399).unwrap());
//! progress.record_success(&[Range::new(100, 299).unwrap()]);
//!
//! let options = PlannerOptions::default().max_range_size(1_000);
//! let plan = plan_queries(&[EntityState::new("eth:0xabc:transfers", progress)], &options).unwrap();
//! assert_eq!(plan.len(), 1);
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coverage::{build_coverage_index, CoverageIndexOptions};
use crate::error::{PlanError, RangeError};
use crate::progress::EntityState;
use crate::range::{
    covering, intersect, merge, split_many_and_take_some, total_size, Range, RangeValue, SortOrder,
};

// ─── Plan types ──────────────────────────────────────────────────────────────

/// One range to fetch for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityQuery<T: RangeValue> {
    pub entity_key: String,
    pub range: Range<T>,
}

/// Sub-ranges an entity actually wants out of a wider address query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostFilter<T: RangeValue> {
    pub entity_key: String,
    pub ranges: Vec<Range<T>>,
}

/// A single query covering several entities at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct AddressQuery<T: RangeValue> {
    /// Participating entities, sorted.
    pub entity_keys: Vec<String>,
    /// Covering range of everything the members want.
    pub range: Range<T>,
    /// Members that want less than `range`. Members without an entry want
    /// all of it.
    #[serde(default)]
    pub post_filters: Vec<PostFilter<T>>,
}

impl<T: RangeValue> AddressQuery<T> {
    /// The ranges `entity_key` wants from this query, `None` if it is not a member.
    pub fn wanted_ranges(&self, entity_key: &str) -> Option<Vec<Range<T>>> {
        if !self.entity_keys.iter().any(|k| k == entity_key) {
            return None;
        }
        let wanted = self
            .post_filters
            .iter()
            .find(|f| f.entity_key == entity_key)
            .map_or_else(|| vec![self.range], |f| f.ranges.clone());
        Some(wanted)
    }

    /// Returns `true` if a record of `entity_key` at `position` must be kept.
    pub fn keeps(&self, entity_key: &str, position: T) -> bool {
        self.wanted_ranges(entity_key)
            .map_or(false, |ranges| ranges.iter().any(|r| r.contains(position)))
    }
}

/// One step of a plan, executed as a single round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryBatch<T: RangeValue> {
    JsonRpc { queries: Vec<EntityQuery<T>> },
    Address { queries: Vec<AddressQuery<T>> },
}

impl<T: RangeValue> QueryBatch<T> {
    pub fn query_count(&self) -> usize {
        match self {
            Self::JsonRpc { queries } => queries.len(),
            Self::Address { queries } => queries.len(),
        }
    }

    pub fn is_json_rpc(&self) -> bool {
        matches!(self, Self::JsonRpc { .. })
    }
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// What to do when both shapes need the same number of queries, cover the
/// same amount of data, and the address shape groups several entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    PreferAddressBatch,
    PreferJsonRpc,
}

fn default_max_addresses_per_query() -> usize {
    1
}

fn default_max_range_size() -> u64 {
    3_000
}

fn default_max_queries_per_product() -> usize {
    10
}

/// Planner limits, usually derived from the endpoint's limitations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerOptions {
    /// Contracts allowed in one address query. `1` disables address batching.
    #[serde(default = "default_max_addresses_per_query")]
    pub max_addresses_per_query: usize,
    /// Widest range a single query may span.
    #[serde(default = "default_max_range_size")]
    pub max_range_size: u64,
    /// Cap on JSON-RPC queries per entity and slice.
    #[serde(default = "default_max_queries_per_product")]
    pub max_queries_per_product: usize,
    /// Plan the whole `full_range` regardless of past progress.
    #[serde(default)]
    pub ignore_import_state: bool,
    /// Cap on slices per phase. `None` uses `max_queries_per_product`.
    #[serde(default)]
    pub max_slices: Option<usize>,
    #[serde(default)]
    pub tie_break: TieBreak,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            max_addresses_per_query: default_max_addresses_per_query(),
            max_range_size: default_max_range_size(),
            max_queries_per_product: default_max_queries_per_product(),
            ignore_import_state: false,
            max_slices: None,
            tie_break: TieBreak::default(),
        }
    }
}

impl PlannerOptions {
    /// Set the number of contracts allowed per address query.
    pub fn max_addresses_per_query(mut self, n: usize) -> Self {
        self.max_addresses_per_query = n;
        self
    }

    /// Set the widest range one query may span.
    pub fn max_range_size(mut self, size: u64) -> Self {
        self.max_range_size = size;
        self
    }

    pub fn max_queries_per_product(mut self, n: usize) -> Self {
        self.max_queries_per_product = n;
        self
    }

    pub fn ignore_import_state(mut self, ignore: bool) -> Self {
        self.ignore_import_state = ignore;
        self
    }

    pub fn max_slices(mut self, n: usize) -> Self {
        self.max_slices = Some(n);
        self
    }

    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.max_addresses_per_query == 0 {
            return Err(PlanError::option("max_addresses_per_query", "must be at least 1"));
        }
        if self.max_range_size == 0 {
            return Err(PlanError::option("max_range_size", "must be at least 1"));
        }
        if self.max_queries_per_product == 0 {
            return Err(PlanError::option("max_queries_per_product", "must be at least 1"));
        }
        if self.max_slices == Some(0) {
            return Err(PlanError::option("max_slices", "must be at least 1"));
        }
        Ok(())
    }

    fn slice_limit(&self) -> usize {
        self.max_slices.unwrap_or(self.max_queries_per_product)
    }
}

// ─── Planning ────────────────────────────────────────────────────────────────

/// Ranges one entity wants inside the current slice.
struct Wanted<'a, T: RangeValue> {
    key: &'a str,
    ranges: Vec<Range<T>>,
}

struct Strategy<T: RangeValue> {
    batch: QueryBatch<T>,
    query_count: usize,
    coverage: u64,
    largest_group: usize,
}

/// Plan the query batches for `states`, most urgent first.
pub fn plan_queries<T: RangeValue>(
    states: &[EntityState<T>],
    options: &PlannerOptions,
) -> Result<Vec<QueryBatch<T>>, PlanError> {
    plan_queries_with_rng(states, options, &mut rand::thread_rng())
}

/// [`plan_queries`] with an explicit source of randomness for tie breaks
/// between equally covered entities.
pub fn plan_queries_with_rng<T: RangeValue, R: Rng + ?Sized>(
    states: &[EntityState<T>],
    options: &PlannerOptions,
    rng: &mut R,
) -> Result<Vec<QueryBatch<T>>, PlanError> {
    options.validate()?;
    check_entity_keys(states)?;

    let phases: Vec<Vec<Wanted<'_, T>>> = if options.ignore_import_state {
        vec![states
            .iter()
            .map(|s| Wanted {
                key: &s.key,
                ranges: vec![s.progress.full_range],
            })
            .collect()]
    } else {
        vec![
            states
                .iter()
                .map(|s| Wanted {
                    key: &s.key,
                    ranges: s.progress.pending_ranges(),
                })
                .collect(),
            states
                .iter()
                .map(|s| Wanted {
                    key: &s.key,
                    ranges: s.progress.retry_ranges(),
                })
                .collect(),
        ]
    };

    let index_options =
        CoverageIndexOptions::for_max_range_size(options.max_range_size).newest(options.slice_limit());
    let mut per_slice = Vec::new();
    for (phase, wanted) in phases.iter().enumerate() {
        let ranges: Vec<Vec<Range<T>>> = wanted.iter().map(|w| w.ranges.clone()).collect();
        let mut slices = build_coverage_index(&ranges, index_options)?;
        slices.reverse();
        debug!(phase, planned = slices.len(), "built coverage index");

        for slice in slices {
            let in_slice: Vec<Wanted<'_, T>> = wanted
                .iter()
                .map(|w| Wanted {
                    key: w.key,
                    ranges: intersect(&w.ranges, &slice),
                })
                .filter(|w| !w.ranges.is_empty())
                .collect();
            if in_slice.is_empty() {
                continue;
            }
            let strategy = best_strategy(&in_slice, options, rng)?;
            debug!(
                phase,
                slice = %slice,
                entities = in_slice.len(),
                queries = strategy.query_count,
                coverage = strategy.coverage,
                json_rpc = strategy.batch.is_json_rpc(),
                "picked query strategy"
            );
            per_slice.push(strategy.batch);
        }
    }

    let plan = merge_json_rpc_batches(per_slice);
    info!(entities = states.len(), summary = %plan_summary(&plan), "planned range queries");
    Ok(plan)
}

fn check_entity_keys<T: RangeValue>(states: &[EntityState<T>]) -> Result<(), PlanError> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for state in states {
        if state.key.is_empty() {
            return Err(PlanError::EmptyEntityKey);
        }
        *seen.entry(state.key.as_str()).or_default() += 1;
    }
    let keys: Vec<String> = seen
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(key, _)| key.to_string())
        .collect();
    if keys.is_empty() {
        Ok(())
    } else {
        Err(PlanError::DuplicateEntityKey { keys })
    }
}

fn best_strategy<T: RangeValue, R: Rng + ?Sized>(
    wanted: &[Wanted<'_, T>],
    options: &PlannerOptions,
    rng: &mut R,
) -> Result<Strategy<T>, RangeError> {
    let json_rpc = json_rpc_strategy(wanted, options)?;
    if options.max_addresses_per_query == 1 {
        return Ok(json_rpc);
    }
    let address = address_strategy(wanted, options, rng);
    Ok(choose(json_rpc, address, options.tie_break))
}

fn choose<T: RangeValue>(json_rpc: Strategy<T>, address: Strategy<T>, tie_break: TieBreak) -> Strategy<T> {
    match json_rpc.query_count.cmp(&address.query_count) {
        Ordering::Less => json_rpc,
        Ordering::Greater => address,
        Ordering::Equal => match json_rpc.coverage.cmp(&address.coverage) {
            Ordering::Greater => json_rpc,
            Ordering::Less => address,
            Ordering::Equal if address.largest_group <= 1 => json_rpc,
            Ordering::Equal => match tie_break {
                TieBreak::PreferAddressBatch => address,
                TieBreak::PreferJsonRpc => json_rpc,
            },
        },
    }
}

/// One query per entity range, newest first, capped per entity.
fn json_rpc_strategy<T: RangeValue>(
    wanted: &[Wanted<'_, T>],
    options: &PlannerOptions,
) -> Result<Strategy<T>, RangeError> {
    let mut queries = Vec::new();
    for w in wanted {
        let ranges = split_many_and_take_some(
            &w.ranges,
            options.max_range_size,
            options.max_queries_per_product,
            SortOrder::Desc,
        )?;
        queries.extend(ranges.into_iter().map(|range| EntityQuery {
            entity_key: w.key.to_string(),
            range,
        }));
    }
    let coverage = queries.iter().map(|q| q.range.size()).sum();
    Ok(Strategy {
        query_count: queries.len(),
        coverage,
        largest_group: 1,
        batch: QueryBatch::JsonRpc { queries },
    })
}

/// Group the entities wanting the most data together.
fn address_strategy<T: RangeValue, R: Rng + ?Sized>(
    wanted: &[Wanted<'_, T>],
    options: &PlannerOptions,
    rng: &mut R,
) -> Strategy<T> {
    let mut members: Vec<(&Wanted<'_, T>, u64)> =
        wanted.iter().map(|w| (w, total_size(&w.ranges))).collect();
    // shuffle first so the stable sort breaks coverage ties at random
    members.shuffle(rng);
    members.sort_by(|a, b| b.1.cmp(&a.1));

    let mut queries = Vec::new();
    let mut coverage = 0;
    let mut largest_group = 0;
    for group in members.chunks(options.max_addresses_per_query) {
        let all: Vec<Range<T>> = group.iter().flat_map(|(w, _)| w.ranges.iter().copied()).collect();
        let Some(range) = covering(&all) else { continue };

        let mut entity_keys: Vec<String> = group.iter().map(|(w, _)| w.key.to_string()).collect();
        entity_keys.sort();

        let mut post_filters: Vec<PostFilter<T>> = group
            .iter()
            .map(|(w, _)| PostFilter {
                entity_key: w.key.to_string(),
                ranges: merge(&w.ranges).into_iter().filter(|r| *r != range).collect(),
            })
            .filter(|f| !f.ranges.is_empty())
            .collect();
        post_filters.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));

        coverage += group.iter().map(|(_, size)| size).sum::<u64>();
        largest_group = largest_group.max(group.len());
        queries.push(AddressQuery {
            entity_keys,
            range,
            post_filters,
        });
    }

    Strategy {
        query_count: queries.len(),
        coverage,
        largest_group,
        batch: QueryBatch::Address { queries },
    }
}

/// Concatenate consecutive JSON-RPC batches. Address batches are never merged.
fn merge_json_rpc_batches<T: RangeValue>(batches: Vec<QueryBatch<T>>) -> Vec<QueryBatch<T>> {
    let mut merged: Vec<QueryBatch<T>> = Vec::with_capacity(batches.len());
    for batch in batches {
        match batch {
            QueryBatch::JsonRpc { queries } => match merged.last_mut() {
                Some(QueryBatch::JsonRpc { queries: acc }) => acc.extend(queries),
                _ => merged.push(QueryBatch::JsonRpc { queries }),
            },
            address => merged.push(address),
        }
    }
    merged
}

// ─── Summary ─────────────────────────────────────────────────────────────────

/// Query counts of a plan, per strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub json_rpc_batches: usize,
    pub json_rpc_queries: usize,
    pub address_batches: usize,
    pub address_queries: usize,
}

impl PlanSummary {
    pub fn total_queries(&self) -> usize {
        self.json_rpc_queries + self.address_queries
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} json-rpc batches ({} queries), {} address batches ({} queries)",
            self.json_rpc_batches, self.json_rpc_queries, self.address_batches, self.address_queries
        )
    }
}

pub fn plan_summary<T: RangeValue>(plan: &[QueryBatch<T>]) -> PlanSummary {
    plan.iter().fold(PlanSummary::default(), |mut acc, batch| {
        match batch {
            QueryBatch::JsonRpc { queries } => {
                acc.json_rpc_batches += 1;
                acc.json_rpc_queries += queries.len();
            }
            QueryBatch::Address { queries } => {
                acc.address_batches += 1;
                acc.address_queries += queries.len();
            }
        }
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ImportProgress;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn r(from: u64, to: u64) -> Range<u64> {
        Range::new(from, to).unwrap()
    }

    fn state(key: &str, full: Range<u64>) -> EntityState<u64> {
        EntityState::new(key, ImportProgress::new(full))
    }

    fn plan(states: &[EntityState<u64>], options: &PlannerOptions) -> Vec<QueryBatch<u64>> {
        plan_queries_with_rng(states, options, &mut StdRng::seed_from_u64(1)).unwrap()
    }

    /// Every range each entity receives from the plan, merged.
    fn received(plan: &[QueryBatch<u64>], key: &str) -> Vec<Range<u64>> {
        let mut out = Vec::new();
        for batch in plan {
            match batch {
                QueryBatch::JsonRpc { queries } => out.extend(
                    queries.iter().filter(|q| q.entity_key == key).map(|q| q.range),
                ),
                QueryBatch::Address { queries } => {
                    for q in queries {
                        out.extend(q.wanted_ranges(key).unwrap_or_default());
                    }
                }
            }
        }
        merge(&out)
    }

    #[test]
    fn only_uncovered_part_is_planned() {
        let mut s = state("a", r(100, 399));
        s.progress.record_success(&[r(100, 299)]);
        let options = PlannerOptions::default().max_range_size(1_000);

        let plan = plan(&[s], &options);
        assert_eq!(
            plan,
            vec![QueryBatch::JsonRpc {
                queries: vec![EntityQuery {
                    entity_key: "a".into(),
                    range: r(300, 399)
                }]
            }]
        );
    }

    #[test]
    fn three_entities_use_address_batching_where_cheaper() {
        let states = [
            state("0x1", r(100, 299)),
            state("0x2", r(200, 399)),
            state("0x3", r(250, 349)),
        ];
        let options = PlannerOptions::default()
            .max_addresses_per_query(2)
            .max_range_size(100)
            .max_queries_per_product(3);

        let plan = plan(&states, &options);
        assert_eq!(plan.len(), 3);

        // most recent slice: 0x2 and 0x3 in one query
        let QueryBatch::Address { queries } = &plan[0] else {
            panic!("expected an address batch, got {:?}", plan[0]);
        };
        assert_eq!(
            queries,
            &vec![AddressQuery {
                entity_keys: vec!["0x2".into(), "0x3".into()],
                range: r(300, 399),
                post_filters: vec![PostFilter {
                    entity_key: "0x3".into(),
                    ranges: vec![r(300, 349)]
                }],
            }]
        );

        let QueryBatch::Address { queries } = &plan[1] else {
            panic!("expected an address batch, got {:?}", plan[1]);
        };
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].entity_keys, vec!["0x1".to_string(), "0x2".to_string()]);
        assert_eq!(queries[0].range, r(200, 299));
        assert_eq!(queries[1].entity_keys, vec!["0x3".to_string()]);
        assert_eq!(queries[1].range, r(250, 299));

        // single entity left in the oldest slice
        assert_eq!(
            plan[2],
            QueryBatch::JsonRpc {
                queries: vec![EntityQuery {
                    entity_key: "0x1".into(),
                    range: r(100, 199)
                }]
            }
        );

        // never worse than one query per entity and slice
        assert!(plan_summary(&plan).total_queries() <= 6);
    }

    #[test]
    fn single_address_limit_never_batches_addresses() {
        let states = [
            state("0x1", r(100, 299)),
            state("0x2", r(200, 399)),
            state("0x3", r(250, 349)),
        ];
        let options = PlannerOptions::default()
            .max_addresses_per_query(1)
            .max_range_size(100)
            .max_queries_per_product(10);

        let plan = plan(&states, &options);
        assert!(plan.iter().all(QueryBatch::is_json_rpc));
        // consecutive json-rpc slices collapse into a single batch
        assert_eq!(plan.len(), 1);
        assert_eq!(plan_summary(&plan).json_rpc_queries, 6);
    }

    #[test]
    fn retries_come_after_new_ranges() {
        let mut s = state("a", r(0, 999));
        s.progress.record_success(&[r(0, 399)]);
        s.progress.record_failure(&[r(400, 499)]);
        let options = PlannerOptions::default().max_range_size(1_000);

        let plan = plan(&[s], &options);
        let QueryBatch::JsonRpc { queries } = &plan[0] else {
            panic!("expected a json-rpc batch");
        };
        let ranges: Vec<_> = queries.iter().map(|q| q.range).collect();
        assert_eq!(ranges, vec![r(500, 999), r(400, 499)]);
    }

    #[test]
    fn ignore_import_state_plans_full_range() {
        let mut s = state("a", r(0, 99));
        s.progress.record_success(&[r(0, 99)]);

        assert!(plan(&[s.clone()], &PlannerOptions::default()).is_empty());

        let options = PlannerOptions::default().ignore_import_state(true);
        let plan = plan(&[s], &options);
        assert_eq!(received(&plan, "a"), vec![r(0, 99)]);
    }

    #[test]
    fn slices_are_capped_newest_first() {
        let s = state("a", r(0, 999));
        let options = PlannerOptions::default()
            .max_range_size(100)
            .max_queries_per_product(10)
            .max_slices(2);

        let plan = plan(&[s], &options);
        assert_eq!(received(&plan, "a"), vec![r(800, 999)]);
    }

    #[test]
    fn duplicate_and_empty_keys_are_rejected() {
        let states = [state("a", r(0, 1)), state("b", r(0, 1)), state("a", r(5, 6))];
        let err = plan_queries(&states, &PlannerOptions::default()).unwrap_err();
        assert_eq!(err, PlanError::DuplicateEntityKey { keys: vec!["a".into()] });

        let err = plan_queries(&[state("", r(0, 1))], &PlannerOptions::default()).unwrap_err();
        assert_eq!(err, PlanError::EmptyEntityKey);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let options = PlannerOptions::default().max_range_size(0);
        let err = plan_queries(&[state("a", r(0, 1))], &options).unwrap_err();
        assert!(matches!(err, PlanError::InvalidOption { name: "max_range_size", .. }));
    }

    #[test]
    fn planned_ranges_stay_inside_pending_and_reproduce_it() {
        use rand::Rng;

        let mut rng = StdRng::seed_from_u64(99);
        for round in 0..50 {
            let states: Vec<EntityState<u64>> = (0..rng.gen_range(1..6))
                .map(|i| {
                    let from = rng.gen_range(0..2_000);
                    let mut s = state(&format!("e{i}"), r(from, from + rng.gen_range(0..1_500)));
                    let covered_from = rng.gen_range(0..3_000);
                    s.progress
                        .record_success(&[r(covered_from, covered_from + rng.gen_range(0..400))]);
                    s
                })
                .collect();
            let options = PlannerOptions::default()
                .max_addresses_per_query(rng.gen_range(1..4))
                .max_range_size(rng.gen_range(50..500))
                .max_queries_per_product(1_000);

            let plan = plan_queries_with_rng(&states, &options, &mut StdRng::seed_from_u64(round))
                .unwrap();
            for s in &states {
                let pending = s.progress.pending_ranges();
                assert_eq!(received(&plan, &s.key), pending, "round {round}, entity {}", s.key);
            }
            for batch in &plan {
                if let QueryBatch::Address { queries } = batch {
                    assert!(queries.iter().all(|q| q.entity_keys.len() <= options.max_addresses_per_query));
                    assert!(queries.iter().all(|q| q.range.size() <= options.max_range_size));
                }
            }
        }
    }

    #[test]
    fn post_filters_select_member_records() {
        let query = AddressQuery {
            entity_keys: vec!["a".into(), "b".into()],
            range: r(0, 99),
            post_filters: vec![PostFilter {
                entity_key: "b".into(),
                ranges: vec![r(10, 19)],
            }],
        };
        assert!(query.keeps("a", 50));
        assert!(query.keeps("b", 15));
        assert!(!query.keeps("b", 50));
        assert!(!query.keeps("c", 15));
    }

    #[test]
    fn tie_with_grouped_entities_follows_tie_break() {
        let strategy = |batch: QueryBatch<u64>, largest_group| Strategy {
            query_count: 2,
            coverage: 200,
            largest_group,
            batch,
        };
        let json = || QueryBatch::JsonRpc { queries: vec![] };
        let addr = || QueryBatch::Address { queries: vec![] };

        let picked = choose(strategy(json(), 1), strategy(addr(), 2), TieBreak::PreferAddressBatch);
        assert!(!picked.batch.is_json_rpc());

        let picked = choose(strategy(json(), 1), strategy(addr(), 2), TieBreak::PreferJsonRpc);
        assert!(picked.batch.is_json_rpc());

        let picked = choose(strategy(json(), 1), strategy(addr(), 1), TieBreak::PreferAddressBatch);
        assert!(picked.batch.is_json_rpc());
    }

    #[test]
    fn plan_serializes_with_type_tag() {
        let plan = vec![QueryBatch::JsonRpc {
            queries: vec![EntityQuery {
                entity_key: "a".into(),
                range: r(1, 2),
            }],
        }];
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json[0]["type"], "json_rpc");
        let back: Vec<QueryBatch<u64>> = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: PlannerOptions = serde_json::from_str(r#"{"max_addresses_per_query":5}"#).unwrap();
        assert_eq!(options.max_addresses_per_query, 5);
        assert_eq!(options.max_range_size, 3_000);
        assert_eq!(options.tie_break, TieBreak::PreferAddressBatch);
    }
}
