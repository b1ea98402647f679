//! Single writer for the state store.
//!
//! Concurrent actions never touch the store directly. They hand a
//! [`StateMutation`] to the [`StateWriter`], whose task owns the snapshot,
//! applies mutations in arrival order and saves the whole snapshot after
//! each one.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{DeployError, Result, StateError};

use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot};

/// Pending mutations before `submit` waits.
const QUEUE_SIZE: usize = 64;

/// A change to the recorded state after a confirmed provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateMutation {
    /// Insert or replace the record.
    Upsert(StateRecord),
    /// Drop the record with this name.
    Remove(String),
}

/// What the writer did over its lifetime.
#[derive(Debug)]
pub struct WriterOutcome {
    /// The final snapshot, including every mutation received.
    pub snapshot: StateSnapshot,
    /// Number of successful saves.
    pub writes: usize,
    /// Messages of saves that failed.
    pub errors: Vec<String>,
}

/// Handle to the state writer task.
#[derive(Debug)]
pub struct StateWriter {
    tx: mpsc::Sender<StateMutation>,
    handle: JoinHandle<WriterOutcome>,
}

impl StateMutation {
    /// Name of the resource this mutation concerns.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::Upsert(record) => &record.name,
            Self::Remove(name) => name,
        }
    }
}

impl StateWriter {
    /// Spawns the writer task, seeded with the current snapshot.
    #[must_use]
    pub fn spawn(store: Arc<dyn StateStore>, snapshot: StateSnapshot) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let handle = tokio::spawn(run_writer(store, snapshot, rx));
        Self { tx, handle }
    }

    /// Queues a mutation.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::WriterClosed`] if the writer task has stopped.
    pub async fn submit(&self, mutation: StateMutation) -> std::result::Result<(), StateError> {
        self.tx
            .send(mutation)
            .await
            .map_err(|_| StateError::WriterClosed)
    }

    /// Waits for every queued mutation to be saved and returns the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer task panicked.
    pub async fn finish(self) -> Result<WriterOutcome> {
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| DeployError::internal(format!("State writer task failed: {e}")))
    }
}

async fn run_writer(
    store: Arc<dyn StateStore>,
    mut snapshot: StateSnapshot,
    mut rx: mpsc::Receiver<StateMutation>,
) -> WriterOutcome {
    let mut writes = 0;
    let mut errors = Vec::new();

    while let Some(mutation) = rx.recv().await {
        debug!("Recording state change for '{}'", mutation.resource());
        match mutation {
            StateMutation::Upsert(record) => snapshot.upsert(record),
            StateMutation::Remove(name) => {
                snapshot.remove(&name);
            }
        }

        snapshot.touch();
        match store.save(&snapshot).await {
            Ok(()) => writes += 1,
            Err(e) => {
                error!("Failed to save state: {e}");
                errors.push(e.to_string());
            }
        }
    }

    WriterOutcome {
        snapshot,
        writes,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;
    use crate::state::LocalStateStore;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn record(name: &str) -> StateRecord {
        StateRecord::new(
            name,
            ResourceKind::Disk,
            &format!("disk/{name}-1"),
            Default::default(),
            Default::default(),
            BTreeSet::new(),
        )
    }

    #[tokio::test]
    async fn test_every_mutation_is_saved() {
        let temp = TempDir::new().expect("temp dir");
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));

        let writer = StateWriter::spawn(store.clone(), StateSnapshot::new("gpu-batch", "dev"));
        writer
            .submit(StateMutation::Upsert(record("a")))
            .await
            .expect("submit");
        writer
            .submit(StateMutation::Upsert(record("b")))
            .await
            .expect("submit");
        writer
            .submit(StateMutation::Remove("a".to_string()))
            .await
            .expect("submit");

        let outcome = writer.finish().await.expect("finish");
        assert_eq!(outcome.writes, 3);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.snapshot.serial, 3);
        assert_eq!(outcome.snapshot.names(), vec!["b"]);

        let persisted = store.load().await.expect("load").expect("state exists");
        assert_eq!(persisted, outcome.snapshot);
    }

    #[tokio::test]
    async fn test_finish_without_mutations() {
        let temp = TempDir::new().expect("temp dir");
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));

        let writer = StateWriter::spawn(store.clone(), StateSnapshot::new("gpu-batch", "dev"));
        let outcome = writer.finish().await.expect("finish");

        assert_eq!(outcome.writes, 0);
        assert!(store.load().await.expect("load").is_none());
    }
}
