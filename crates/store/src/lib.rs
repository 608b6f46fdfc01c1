//! `store` crate — the distributed state store.
//!
//! Everything a run shares across engine instances lives behind the
//! [`StateStore`] trait: run and node state, the per-run lock lease, the
//! time-indexed retry schedule, circuit-breaker records, and the error log.
//! Two backends ship: [`MemoryStore`] for tests and single-process
//! simulation, and [`RedisStore`] for production.

pub mod error;
pub mod keys;
pub mod lock;
pub mod memory;
pub mod redis_store;
pub mod traits;

pub use error::StoreError;
pub use keys::Keyspace;
pub use lock::{acquire_lock_with_renewal, RunLock};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use traits::{StateStore, StoreConfig};
