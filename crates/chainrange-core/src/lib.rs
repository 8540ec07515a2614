//! chainrange-core: range planning for incremental, rate-limited chain imports.
//!
//! # Architecture
//!
//! ```text
//! ProgressStore ──► EntityState[] ──► plan_queries ──► QueryBatch[] ──► ImportRunner
//!                                        ├── coverage index (slices, newest first)
//!                                        ├── JSON-RPC batch strategy
//!                                        └── address batch strategy (+ post-filters)
//! ```
//!
//! All planning is built on the closed-interval algebra in [`range`], generic
//! over block numbers (`u64`) and timestamps (`DateTime<Utc>`).

pub mod coverage;
pub mod error;
pub mod import;
pub mod planner;
pub mod progress;
pub mod range;

pub use coverage::{build_coverage_index, CoverageIndexOptions};
pub use error::{ImportError, PlanError, RangeError};
pub use import::{ImportRunner, ImportSummary, ImportedRecord, Positioned, RangeSource};
pub use planner::{
    plan_queries, plan_queries_with_rng, plan_summary, AddressQuery, EntityQuery, PlanSummary,
    PlannerOptions, PostFilter, QueryBatch, TieBreak,
};
pub use progress::{EntityState, ImportProgress, MemoryProgressStore, ProgressStore};
pub use range::{Range, RangeValue, SortOrder};
