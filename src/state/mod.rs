//! Persistent record of applied resources.
//!
//! This module stores one snapshot per project environment: the record of
//! every applied resource (provider id, last applied properties, outputs)
//! plus a short run history. Backends are a local directory or an S3 bucket;
//! during a run all writes go through a single [`StateWriter`].

mod local;
mod lock;
mod s3;
mod store;
mod types;
mod writer;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id, holder_or_generated};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    MAX_HISTORY, RunHistoryEntry, RunOperation, RunStatus, STATE_VERSION, StateRecord,
    StateSnapshot,
};
pub use writer::{StateMutation, StateWriter, WriterOutcome};
