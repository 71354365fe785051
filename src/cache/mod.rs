//! Persistent layer cache
//!
//! Content-addressed store of layers keyed by fingerprint.
//!
//! # Lifecycle
//!
//! | Phase | Operation |
//! |-------|-----------|
//! | Startup | `persist::load` verifies every entry, dropping corrupt ones |
//! | Build | stages look up and insert-if-absent concurrently |
//! | Shutdown | optional `prune`, then `persist::flush` |

pub mod evict;
pub mod persist;
pub mod store;

pub use evict::{format_bytes, sum_bytes, EvictionPolicy, PruneReport};
pub use persist::{flush, load, LoadReport};
pub use store::{CacheEntry, CacheStore, InsertOutcome, Layer};
