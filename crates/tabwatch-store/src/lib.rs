//! Durable session storage for tabwatch.
//!
//! - [`RecordStore`]: keyed durable backing store (SQLite, or in-memory for tests)
//! - [`RetryingExecutor`]: retry + circuit breaker around every store call
//! - [`DurableWriteQueue`]: crash-safe FIFO feeding the store from the hot path
//! - [`SessionStore`]: the versioned session ledger built on all of the above

pub mod coalesce;
pub mod database;
pub mod error;
pub mod idempotency;
pub mod lock;
pub mod mock;
pub mod queue;
pub mod record_store;
pub mod reliable;
pub mod schema;
pub mod session_store;

pub use coalesce::HeartbeatCoalescer;
pub use database::Database;
pub use error::StoreError;
pub use idempotency::IdempotencyCache;
pub use lock::KeyLockManager;
pub use mock::MemoryRecordStore;
pub use queue::{DurableWriteQueue, PersistAction, PersistTask, TaskApplier};
pub use record_store::{RecordStore, SqliteRecordStore};
pub use reliable::RetryingExecutor;
pub use session_store::{SessionStore, WriteMode};
