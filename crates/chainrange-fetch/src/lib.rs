//! chainrange-fetch: cache-aside fetching of external resources.
//!
//! - [`FetchGuard`]: fresh-cache short cut, per-resource lock, retries with
//!   backoff, stale fallback
//! - [`CacheStore`]: memory, file and layered caches
//! - [`LockService`]: lease-based locks, with an in-process implementation
//! - [`Backoff`]: exponential backoff with full jitter

pub mod backoff;
pub mod cache;
pub mod error;
pub mod guard;
pub mod lock;

pub use backoff::{Backoff, BackoffConfig};
pub use cache::{CacheEntry, CacheStore, FileCache, LayeredCache, MemoryCache};
pub use error::{CacheError, GuardError, LockError, Retryable};
pub use guard::{FetchGuard, FetchGuardConfig};
pub use lock::{LockService, LockToken, MemoryLockService};
