//! [`SyncManager`]: the entry point presentation code and connections use.
//!
//! It owns the lock table, the upload claims, the problem registry and the
//! connection registry, and runs every download, merge and upload step as a
//! single write transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::Receiver;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::commit::{CommitEnv, CommitOutcome, CommitTransaction, Mutation, NewItem};
use crate::config::SyncConfig;
use crate::connection::ConnectionRegistry;
use crate::diff::DiffEngine;
use crate::error::{Result, SyncError};
use crate::lock::{EditLock, EditLocks, LockHandle};
use crate::merge::{
    self, BuiltinPolicy, ConflictPolicy, DownloadWrite, Downloaded, MergeOutcome, Resolution,
    ServerItem,
};
use crate::model::item::{ConnectionId, ItemId};
use crate::model::schema::Schema;
use crate::mutations::{Discard, Reconcile, Remove};
use crate::problems::{ProblemCause, ProblemEvent, SyncProblem, SyncProblemRegistry};
use crate::slaves;
use crate::state::{self, SyncState};
use crate::store::{CommitNotice, Database, ItemSource, Snapshot, SqliteStore, Store, WriteTxn};
use crate::upload::{UploadBatch, UploadItem, UploadLocks, UploadReport, UploadResult};

/// What [`SyncManager::write_downloaded`] did per item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    /// Store commit sequence visible afterwards.
    pub commit: u64,
    /// Items the store did not know before.
    pub created: Vec<ItemId>,
    pub merged: Vec<(ItemId, MergeOutcome)>,
    /// Staged in the download shadow; merged once the lock or upload ends.
    pub deferred: Vec<ItemId>,
    /// Deleted together with their slaves.
    pub removed: Vec<ItemId>,
    /// Deleted on the server but kept locally because of unsynced changes.
    pub kept: Vec<ItemId>,
}

impl DownloadReport {
    #[must_use]
    pub fn conflicted(&self) -> Vec<ItemId> {
        self.merged
            .iter()
            .filter(|(_, outcome)| *outcome == MergeOutcome::Conflicted)
            .map(|(item, _)| *item)
            .collect()
    }
}

pub struct SyncManager {
    env: CommitEnv,
    locks: EditLocks,
    uploads: UploadLocks,
    connections: ConnectionRegistry,
}

impl SyncManager {
    /// Manager over `store` with the manual conflict policy.
    pub fn new(store: Arc<dyn Store>, schema: Schema) -> Self {
        Self {
            env: CommitEnv {
                db: Arc::new(Database::new(store)),
                schema: Arc::new(schema),
                policy: Arc::new(BuiltinPolicy::default()),
                problems: SyncProblemRegistry::new(),
            },
            locks: EditLocks::new(),
            uploads: UploadLocks::new(),
            connections: ConnectionRegistry::new(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.env.policy = policy;
        self
    }

    /// Open the SQLite store of the project at `project_root`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StoreLockTimeout`] if another process holds the
    /// store, or any error from opening it.
    pub fn open(project_root: &Path, config: &SyncConfig) -> Result<Self> {
        let path = config.store.resolve_path(project_root);
        let store = SqliteStore::open(&path, config.store.lock_timeout())?;
        let policy = Arc::new(config.merge.policy());
        Ok(Self::new(Arc::new(store), config.schema.schema()).with_policy(policy))
    }

    #[must_use]
    pub const fn env(&self) -> &CommitEnv {
        &self.env
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.env.schema
    }

    #[must_use]
    pub const fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    #[must_use]
    pub const fn locks(&self) -> &EditLocks {
        &self.locks
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot produce a snapshot.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.env.db.snapshot()
    }

    pub fn subscribe(&self) -> Receiver<CommitNotice> {
        self.env.db.subscribe()
    }

    // ---------------------------------------------------------------------
    // Locks and local edits
    // ---------------------------------------------------------------------

    #[must_use]
    pub fn find_lock(&self, item: ItemId) -> Option<LockHandle> {
        self.locks.find_lock(item)
    }

    #[must_use]
    pub fn find_any_lock(&self, items: &[ItemId]) -> Option<LockHandle> {
        self.locks.find_any_lock(items)
    }

    /// Lock `primaries` with their slaves against the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockContention`] if any item is already locked.
    pub fn acquire_lock(&self, primaries: &[ItemId]) -> Result<EditLock> {
        let snapshot = self.snapshot()?;
        self.locks.acquire(&snapshot, primaries)
    }

    /// Wrap `lock` in a transaction over `items`.
    ///
    /// Call [`merge_pending`](Self::merge_pending) after committing it so that
    /// downloads deferred by the lock get merged.
    ///
    /// # Errors
    ///
    /// See [`CommitTransaction::open`].
    pub fn open_commit(&self, lock: EditLock, items: &[ItemId]) -> Result<CommitTransaction> {
        CommitTransaction::open(self.env.clone(), lock, items)
    }

    /// Lock `primaries` and open a transaction over them.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockContention`] if any item is already locked.
    pub fn prepare_edit(&self, primaries: &[ItemId]) -> Result<CommitTransaction> {
        let lock = self.acquire_lock(primaries)?;
        self.open_commit(lock, primaries)
    }

    /// Apply one mutation to `item` and merge whatever the lock deferred.
    ///
    /// # Errors
    ///
    /// Lock contention, cancellation and durable failures abort; a failing
    /// mutation is reported in the outcome and as a sync problem.
    pub fn commit_edit(
        &self,
        item: ItemId,
        mutation: impl Mutation + 'static,
        cancel: &CancelToken,
    ) -> Result<CommitOutcome> {
        let before = self.states_of(&[item])?;
        let mut txn = self.prepare_edit(&[item])?.with_cancel(cancel.clone());
        txn.add_mutation(item, mutation)?;
        let outcome = txn.commit()?;
        self.observe(&before);
        self.merge_released(cancel);
        Ok(outcome)
    }

    /// Create a local item. A parent, if given, is locked for the duration.
    ///
    /// # Errors
    ///
    /// See [`commit_edit`](Self::commit_edit).
    pub fn create(&self, new: NewItem, cancel: &CancelToken) -> Result<CommitOutcome> {
        let primaries: Vec<ItemId> = new.parent.into_iter().collect();
        let mut txn = self.prepare_edit(&primaries)?.with_cancel(cancel.clone());
        txn.create(new)?;
        let outcome = txn.commit()?;
        self.merge_released(cancel);
        Ok(outcome)
    }

    /// Drop local edits of `item` and its slaves; clears their sync problems.
    ///
    /// # Errors
    ///
    /// See [`commit_edit`](Self::commit_edit).
    pub fn discard(&self, item: ItemId, cancel: &CancelToken) -> Result<CommitOutcome> {
        let subtree = slaves::subtree(&self.snapshot()?, item);
        let outcome = self.commit_edit(item, Discard, cancel)?;
        if outcome.result_for(item).is_some_and(|result| result.is_applied()) {
            for id in subtree {
                self.env.problems.clear_item(id);
            }
        }
        Ok(outcome)
    }

    /// # Errors
    ///
    /// See [`commit_edit`](Self::commit_edit).
    pub fn reconcile(
        &self,
        item: ItemId,
        resolution: Resolution,
        cancel: &CancelToken,
    ) -> Result<CommitOutcome> {
        self.commit_edit(item, Reconcile(resolution), cancel)
    }

    /// # Errors
    ///
    /// See [`commit_edit`](Self::commit_edit).
    pub fn remove(&self, item: ItemId, cancel: &CancelToken) -> Result<CommitOutcome> {
        self.commit_edit(item, Remove, cancel)
    }

    // ---------------------------------------------------------------------
    // Downloads
    // ---------------------------------------------------------------------

    /// Store a download batch and merge it, all in one write transaction.
    ///
    /// Locked and in-flight items only get their download shadow written.
    /// Server-side removals of items with unsynced changes are kept and
    /// reported as `RemovedOnServer`.
    ///
    /// # Errors
    ///
    /// Cancellation writes nothing. A durable failure writes nothing and is
    /// recorded as a problem on every item of the batch.
    pub fn write_downloaded(
        &self,
        batch: &[Downloaded],
        cancel: &CancelToken,
    ) -> Result<DownloadReport> {
        let ids: Vec<ItemId> = batch.iter().map(Downloaded::id).collect();
        let before = self.states_of(&ids)?;
        let now = Utc::now();

        let written = self.env.db.write(cancel, |txn| {
            let mut report = DownloadReport::default();
            for entry in batch {
                cancel.check()?;
                match entry {
                    Downloaded::Updated(server) => {
                        self.apply_download(txn, server, now, &mut report)?;
                    }
                    Downloaded::Removed { id } => self.apply_removal(txn, *id, &mut report),
                }
            }
            Ok(report)
        });

        match written {
            Ok((mut report, commit)) => {
                report.commit = commit;
                for item in &report.kept {
                    self.env.problems.record(*item, ProblemCause::RemovedOnServer);
                }
                info!(
                    commit,
                    created = report.created.len(),
                    merged = report.merged.len(),
                    conflicted = report.conflicted().len(),
                    deferred = report.deferred.len(),
                    removed = report.removed.len(),
                    "download written"
                );
                self.observe(&before);
                Ok(report)
            }
            Err(err) => {
                self.record_durable_failure(&ids, &err);
                Err(err)
            }
        }
    }

    fn apply_download(
        &self,
        txn: &mut WriteTxn,
        server: &ServerItem,
        now: DateTime<Utc>,
        report: &mut DownloadReport,
    ) -> Result<()> {
        let written = merge::write_download(txn, &self.env.schema, server);
        if let Some(parent) = txn.get(server.id).and_then(|record| record.parent) {
            self.locks.adopt(&*txn, server.id, parent);
        }
        if written == DownloadWrite::Created {
            report.created.push(server.id);
            return Ok(());
        }
        if self.locks.defer_merge(server.id) || self.uploads.is_locked(server.id) {
            report.deferred.push(server.id);
            return Ok(());
        }
        let outcome = self.merge_in(txn, server.id, now)?;
        report.merged.push((server.id, outcome));
        Ok(())
    }

    fn merge_in(
        &self,
        txn: &mut WriteTxn,
        item: ItemId,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        merge::auto_merge(txn, &self.env.schema, self.env.policy.as_ref(), item, now)
    }

    fn apply_removal(&self, txn: &mut WriteTxn, id: ItemId, report: &mut DownloadReport) {
        if !txn.contains(id) {
            debug!(item = %id, "server removal of unknown item ignored");
            return;
        }
        let subtree = slaves::subtree(&*txn, id);
        let held = subtree.iter().any(|item| {
            self.locks.is_locked(*item)
                || self.uploads.is_locked(*item)
                || merge::has_local_state(&*txn, &self.env.schema, *item)
        });
        if held {
            info!(item = %id, "removed on server; kept for unsynced local changes");
            report.kept.push(id);
            return;
        }
        report.removed.extend(slaves::clear_subtree(txn, id));
    }

    /// Merge every staged download whose item is neither locked nor in flight.
    ///
    /// # Errors
    ///
    /// Cancellation merges nothing. A durable failure is recorded as a problem
    /// on every pending item.
    pub fn merge_pending(&self, cancel: &CancelToken) -> Result<Vec<(ItemId, MergeOutcome)>> {
        let requested = self.locks.take_merge_requests();
        let snapshot = self.snapshot()?;
        let pending: BTreeSet<ItemId> = requested
            .into_iter()
            .chain(
                snapshot
                    .items()
                    .filter(|record| record.download.is_some())
                    .map(|record| record.id),
            )
            .filter(|item| !self.locks.is_locked(*item) && !self.uploads.is_locked(*item))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ItemId> = pending.iter().copied().collect();
        let before = self.states_of(&ids)?;
        let now = Utc::now();
        let written = self.env.db.write(cancel, |txn| {
            let mut merged = Vec::with_capacity(pending.len());
            for item in &pending {
                cancel.check()?;
                if txn.contains(*item) {
                    let outcome = self.merge_in(txn, *item, now)?;
                    merged.push((*item, outcome));
                }
            }
            Ok(merged)
        });

        match written {
            Ok((merged, commit)) => {
                debug!(commit, merged = merged.len(), "pending merges applied");
                self.observe(&before);
                Ok(merged)
            }
            Err(err) => {
                self.record_durable_failure(&ids, &err);
                Err(err)
            }
        }
    }

    /// The edit already committed, so a failed merge is only logged.
    fn merge_released(&self, cancel: &CancelToken) {
        if let Err(err) = self.merge_pending(cancel) {
            warn!(error = %err, "deferred merges not applied");
        }
    }

    /// Ask `connection` for fresh values of `items`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Remote`] and records a `RemoteFailure` problem per
    /// item when the request cannot be made.
    pub fn request_download(&self, connection: &ConnectionId, items: &[ItemId]) -> Result<()> {
        let result = match self.connections.get(connection) {
            Some(remote) => remote.request_download(items),
            None => Err(unknown_connection(connection)),
        };
        result.inspect_err(|err| {
            self.report_remote_failure(Some(connection), items, &err.to_string());
        })
    }

    /// Record a failed exchange with a server as a problem on each item.
    pub fn report_remote_failure(
        &self,
        connection: Option<&ConnectionId>,
        items: &[ItemId],
        message: &str,
    ) -> Vec<SyncProblem> {
        items
            .iter()
            .map(|item| {
                self.env.problems.record(
                    *item,
                    ProblemCause::RemoteFailure {
                        connection: connection.cloned(),
                        message: message.to_string(),
                    },
                )
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Uploads
    // ---------------------------------------------------------------------

    fn uploadable(&self, snapshot: &Snapshot, item: ItemId) -> bool {
        let Some(record) = snapshot.get(item) else {
            return false;
        };
        if self.locks.is_locked(item) || self.uploads.is_locked(item) {
            return false;
        }
        let engine = DiffEngine::new(&self.env.schema, snapshot);
        if !state::classify(Some(record), false, &engine).needs_upload() {
            return false;
        }
        record
            .connection
            .as_ref()
            .and_then(|id| self.connections.get(id))
            .is_some_and(|remote| remote.is_upload_allowed() && !remote.is_degraded())
    }

    /// Whether `item` has local changes its connection can take right now.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot produce a snapshot.
    pub fn can_upload(&self, item: ItemId) -> Result<bool> {
        let snapshot = self.snapshot()?;
        Ok(self.uploadable(&snapshot, item))
    }

    /// Every item that [`can_upload`](Self::can_upload) now.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot produce a snapshot.
    pub fn pending_uploads(&self) -> Result<Vec<ItemId>> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .items()
            .map(|record| record.id)
            .filter(|item| self.uploadable(&snapshot, *item))
            .collect())
    }

    /// Claim `items` for upload and capture the values to send.
    ///
    /// Items that are edit-locked, already in flight, conflicted, in sync or
    /// whose connection refuses uploads are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] or a snapshot error.
    pub fn begin_upload(&self, items: &[ItemId], cancel: &CancelToken) -> Result<UploadBatch> {
        cancel.check()?;
        let snapshot = self.snapshot()?;
        let candidates: Vec<ItemId> = items
            .iter()
            .copied()
            .filter(|item| self.uploadable(&snapshot, *item))
            .collect();

        let captured: Vec<UploadItem> = self
            .uploads
            .claim(candidates)
            .into_iter()
            .filter_map(|item| {
                snapshot.get(item).map(|record| UploadItem {
                    item,
                    connection: record.connection.clone(),
                    values: self.env.schema.shadowable_part(&record.trunk),
                })
            })
            .collect();
        debug!(requested = items.len(), claimed = captured.len(), "upload batch prepared");
        Ok(UploadBatch::new(captured, self.uploads.clone()))
    }

    /// Hand the batch to the connections that own its items.
    ///
    /// # Errors
    ///
    /// Returns the first [`SyncError::Remote`]; every item of a failing
    /// connection gets a `RemoteFailure` problem.
    pub fn request_upload(&self, batch: &UploadBatch) -> Result<()> {
        let mut by_connection: BTreeMap<ConnectionId, Vec<ItemId>> = BTreeMap::new();
        for captured in batch.items() {
            if let Some(connection) = &captured.connection {
                by_connection
                    .entry(connection.clone())
                    .or_default()
                    .push(captured.item);
            }
        }

        let mut first_error = None;
        for (connection, items) in by_connection {
            let result = match self.connections.get(&connection) {
                Some(remote) => remote.request_upload(&items),
                None => Err(unknown_connection(&connection)),
            };
            if let Err(err) = result {
                self.report_remote_failure(Some(&connection), &items, &err.to_string());
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Apply the server's answers for a batch and release its claims.
    ///
    /// Confirmed items get base := the captured value. Items without an
    /// answer count as failed. Downloads staged during the upload are merged
    /// unless an edit lock defers them.
    ///
    /// # Errors
    ///
    /// Cancellation writes nothing and keeps the items dirty. A durable
    /// failure is recorded as a problem on every item of the batch.
    pub fn finish_upload(
        &self,
        batch: UploadBatch,
        results: &BTreeMap<ItemId, UploadResult>,
        cancel: &CancelToken,
    ) -> Result<UploadReport> {
        let ids = batch.ids();
        let before = self.states_of(&ids)?;
        let now = Utc::now();

        let written = self.env.db.write(cancel, |txn| {
            let mut report = UploadReport::default();
            for captured in batch.items() {
                cancel.check()?;
                let item = captured.item;
                if !txn.contains(item) {
                    debug!(item = %item, "item removed during upload");
                    continue;
                }
                match results.get(&item) {
                    Some(UploadResult::Confirmed) => {
                        merge::confirm_upload(txn, &self.env.schema, item, &captured.values)?;
                        report.confirmed.push(item);
                    }
                    Some(UploadResult::Rejected { .. }) => report.rejected.push(item),
                    Some(UploadResult::Failed { .. }) | None => report.failed.push(item),
                }

                if txn.get(item).is_some_and(|record| record.download.is_some()) {
                    if self.locks.defer_merge(item) {
                        report.deferred.push(item);
                    } else {
                        let outcome = self.merge_in(txn, item, now)?;
                        report.merged.push((item, outcome));
                    }
                }
            }
            Ok(report)
        });

        let report = match written {
            Ok((report, commit)) => {
                info!(
                    commit,
                    confirmed = report.confirmed.len(),
                    rejected = report.rejected.len(),
                    failed = report.failed.len(),
                    "upload finished"
                );
                report
            }
            Err(err) => {
                self.record_durable_failure(&ids, &err);
                return Err(err);
            }
        };

        for item in &report.rejected {
            if let Some(UploadResult::Rejected { reason }) = results.get(item) {
                self.env.problems.record(
                    *item,
                    ProblemCause::UploadRejected {
                        reason: reason.clone(),
                    },
                );
            }
        }
        for item in &report.failed {
            let message = match results.get(item) {
                Some(UploadResult::Failed { message }) => message.clone(),
                _ => "no upload result reported".to_string(),
            };
            let connection = batch.get(*item).and_then(|captured| captured.connection.as_ref());
            self.report_remote_failure(connection, &[*item], &message);
        }

        drop(batch);
        self.observe(&before);
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    fn classify_in(&self, snapshot: &Snapshot, item: ItemId) -> SyncState {
        let engine = DiffEngine::new(&self.env.schema, snapshot);
        state::classify(snapshot.get(item), self.locks.is_locked(item), &engine)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot produce a snapshot.
    pub fn state(&self, item: ItemId) -> Result<SyncState> {
        let snapshot = self.snapshot()?;
        Ok(self.classify_in(&snapshot, item))
    }

    /// State of every stored item, by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot produce a snapshot.
    pub fn states(&self) -> Result<Vec<(ItemId, SyncState)>> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .items()
            .map(|record| (record.id, self.classify_in(&snapshot, record.id)))
            .collect())
    }

    #[must_use]
    pub fn problems(&self) -> Vec<SyncProblem> {
        self.env.problems.all()
    }

    /// Problems of `item` and its slaves.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot produce a snapshot.
    pub fn item_problems(&self, item: ItemId) -> Result<Vec<SyncProblem>> {
        let snapshot = self.snapshot()?;
        Ok(slaves::subtree(&snapshot, item)
            .into_iter()
            .flat_map(|id| self.env.problems.problems_for(id))
            .collect())
    }

    #[must_use]
    pub const fn problem_registry(&self) -> &SyncProblemRegistry {
        &self.env.problems
    }

    pub fn subscribe_problems(&self) -> Receiver<ProblemEvent> {
        self.env.problems.subscribe()
    }

    fn states_of(&self, items: &[ItemId]) -> Result<BTreeMap<ItemId, SyncState>> {
        let snapshot = self.snapshot()?;
        Ok(slaves::subtrees(&snapshot, items)
            .into_iter()
            .map(|item| (item, self.classify_in(&snapshot, item)))
            .collect())
    }

    /// Log every observed state change that the transition table forbids.
    ///
    /// Runs after a durable commit, so an unreadable store is only logged.
    fn observe(&self, before: &BTreeMap<ItemId, SyncState>) {
        let snapshot = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "state transitions not checked after commit");
                return;
            }
        };
        for (item, from) in before {
            let to = self.classify_in(&snapshot, *item);
            if to == *from {
                continue;
            }
            if let Err(invalid) = from.can_transition_to(to) {
                warn!(item = %item, error = %invalid, "unexpected sync state transition");
            }
        }
    }

    fn record_durable_failure(&self, items: &[ItemId], err: &SyncError) {
        if !err.is_durable_failure() {
            return;
        }
        warn!(items = items.len(), error = %err, "sync write could not be persisted");
        for item in items {
            self.env.problems.record(
                *item,
                ProblemCause::DurableWriteFailed {
                    message: err.to_string(),
                },
            );
        }
    }
}

fn unknown_connection(connection: &ConnectionId) -> SyncError {
    SyncError::Remote {
        connection: connection.clone(),
        message: "connection is not registered".to_string(),
    }
}
