use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{PoisonError, RwLock};

use super::{ChangeSet, CommitNotice, Notifier, Snapshot, Store};
use crate::error::{Result, SyncError};
use crate::model::item::ItemRecord;

/// Process-local store. Used by tests and by callers that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<Snapshot>,
    notifier: Notifier,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ItemRecord>) -> Self {
        Self {
            state: RwLock::new(Snapshot::from_records(0, records)),
            ..Self::default()
        }
    }

    /// Make every following commit fail as if the disk were full.
    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl Store for MemoryStore {
    fn snapshot(&self) -> Result<Snapshot> {
        Ok(self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn commit(&self, base_commit: u64, changes: &ChangeSet) -> Result<Snapshot> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(SyncError::WriteFailed("simulated write failure".to_string()));
        }

        let committed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.commit() != base_commit {
                return Err(SyncError::WriteFailed(format!(
                    "stale base commit {base_commit}, store is at {}",
                    state.commit()
                )));
            }
            let next = state.apply(changes, base_commit + 1);
            *state = next.clone();
            next
        };

        self.notifier.notify(committed.commit(), changes);
        Ok(committed)
    }

    fn subscribe(&self) -> Receiver<CommitNotice> {
        self.notifier.subscribe()
    }
}
