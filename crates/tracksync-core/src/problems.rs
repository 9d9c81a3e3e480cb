//! Observable registry of per-item synchronization failures.
//!
//! A problem is recorded whenever an item could not be brought in sync and
//! the rest of the batch went on without it. Problems never expire: they stay
//! until the user dismisses them with [`SyncProblem::disappear`] or a
//! successful discard clears the item.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::model::item::{ConnectionId, ItemId};

/// Identifier of one recorded problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ProblemId(u64);

impl fmt::Display for ProblemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProblemCause {
    /// The store refused a transaction; nothing of it was persisted.
    DurableWriteFailed { message: String },
    /// One mutation failed and was rolled back; the rest of its batch committed.
    MutationFailed { message: String },
    RemoteFailure {
        connection: Option<ConnectionId>,
        message: String,
    },
    UploadRejected { reason: String },
    /// The server deleted an item that still has unsynced local changes.
    RemovedOnServer,
}

impl ProblemCause {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DurableWriteFailed { .. } => "durable_write_failed",
            Self::MutationFailed { .. } => "mutation_failed",
            Self::RemoteFailure { .. } => "remote_failure",
            Self::UploadRejected { .. } => "upload_rejected",
            Self::RemovedOnServer => "removed_on_server",
        }
    }
}

impl fmt::Display for ProblemCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DurableWriteFailed { message } => write!(f, "local write failed: {message}"),
            Self::MutationFailed { message } => write!(f, "change not applied: {message}"),
            Self::RemoteFailure {
                connection: Some(connection),
                message,
            } => write!(f, "{connection}: {message}"),
            Self::RemoteFailure {
                connection: None,
                message,
            } => write!(f, "remote failure: {message}"),
            Self::UploadRejected { reason } => write!(f, "upload rejected: {reason}"),
            Self::RemovedOnServer => {
                f.write_str("removed on the server with unsynced local changes")
            }
        }
    }
}

/// One recorded failure. Clones refer to the same registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct SyncProblem {
    id: ProblemId,
    item: ItemId,
    cause: ProblemCause,
    recorded_at: DateTime<Utc>,
    #[serde(skip)]
    registry: Weak<Inner>,
}

impl SyncProblem {
    #[must_use]
    pub const fn id(&self) -> ProblemId {
        self.id
    }

    #[must_use]
    pub const fn item(&self) -> ItemId {
        self.item
    }

    #[must_use]
    pub const fn cause(&self) -> &ProblemCause {
        &self.cause
    }

    #[must_use]
    pub const fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    /// Remove exactly this entry from its registry.
    ///
    /// Returns `false` if it was already removed or the registry is gone.
    pub fn disappear(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|inner| inner.remove(self.id).is_some())
    }
}

impl PartialEq for SyncProblem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.item == other.item && self.cause == other.cause
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProblemEvent {
    Added(SyncProblem),
    Removed(SyncProblem),
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    problems: BTreeMap<ProblemId, SyncProblem>,
    subscribers: Vec<Sender<ProblemEvent>>,
}

impl State {
    fn publish(&mut self, event: &ProblemEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: ProblemId) -> Option<SyncProblem> {
        let mut state = self.lock();
        let removed = state.problems.remove(&id)?;
        state.publish(&ProblemEvent::Removed(removed.clone()));
        Some(removed)
    }
}

/// Shared problem registry. Clones observe the same set.
#[derive(Debug, Clone, Default)]
pub struct SyncProblemRegistry {
    inner: Arc<Inner>,
}

impl SyncProblemRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, item: ItemId, cause: ProblemCause) -> SyncProblem {
        let mut state = self.inner.lock();
        state.next_id += 1;
        let problem = SyncProblem {
            id: ProblemId(state.next_id),
            item,
            cause,
            recorded_at: Utc::now(),
            registry: Arc::downgrade(&self.inner),
        };
        warn!(
            item = %item,
            problem = %problem.id,
            kind = problem.cause.kind(),
            cause = %problem.cause,
            "sync problem recorded"
        );
        state.problems.insert(problem.id, problem.clone());
        state.publish(&ProblemEvent::Added(problem.clone()));
        problem
    }

    #[must_use]
    pub fn problems_for(&self, item: ItemId) -> Vec<SyncProblem> {
        self.inner
            .lock()
            .problems
            .values()
            .filter(|problem| problem.item == item)
            .cloned()
            .collect()
    }

    /// Every live problem, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<SyncProblem> {
        self.inner.lock().problems.values().cloned().collect()
    }

    /// Problems recorded after `after`, oldest first.
    #[must_use]
    pub fn since(&self, after: Option<ProblemId>) -> Vec<SyncProblem> {
        self.inner
            .lock()
            .problems
            .values()
            .filter(|problem| after.is_none_or(|after| problem.id > after))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn latest_id(&self) -> Option<ProblemId> {
        self.inner.lock().problems.keys().next_back().copied()
    }

    pub fn remove(&self, id: ProblemId) -> Option<SyncProblem> {
        self.inner.remove(id)
    }

    /// Remove every problem of `item`. Returns how many were removed.
    pub fn clear_item(&self, item: ItemId) -> usize {
        let mut state = self.inner.lock();
        let ids: Vec<ProblemId> = state
            .problems
            .values()
            .filter(|problem| problem.item == item)
            .map(|problem| problem.id)
            .collect();
        for id in &ids {
            if let Some(removed) = state.problems.remove(id) {
                state.publish(&ProblemEvent::Removed(removed));
            }
        }
        if !ids.is_empty() {
            info!(item = %item, cleared = ids.len(), "sync problems cleared");
        }
        ids.len()
    }

    pub fn subscribe(&self) -> Receiver<ProblemEvent> {
        let (tx, rx) = mpsc::channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().problems.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
