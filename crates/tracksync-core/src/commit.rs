//! Atomic multi-item commits with per-item outcomes.
//!
//! A [`CommitTransaction`] owns an [`EditLock`] and a queue of mutations.
//! [`CommitTransaction::commit`] runs the whole queue inside one write
//! transaction. Each entry runs behind its own savepoint, so an entry that
//! fails or turns out to be a no-op is rolled back alone while the rest of
//! the batch still commits. Failures become [`SyncProblem`]s instead of
//! aborting unrelated items.
//!
//! The completion callback fires exactly once: when `commit` finishes, or
//! when the transaction is dropped without committing. The lock is released
//! at the same point.
//!
//! [`SyncProblem`]: crate::problems::SyncProblem

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::cancel::CancelToken;
use crate::error::{Result, SyncError};
use crate::lock::{EditLock, LockId};
use crate::merge::{self, ConflictPolicy, MergeOutcome, Resolution};
use crate::model::item::{AttributeMap, ConnectionId, ItemId, ItemRecord};
use crate::model::schema::Schema;
use crate::problems::{ProblemCause, SyncProblemRegistry};
use crate::slaves;
use crate::store::{Database, WriteTxn};

/// Shared services a transaction needs besides its lock.
#[derive(Clone)]
pub struct CommitEnv {
    pub db: Arc<Database>,
    pub schema: Arc<Schema>,
    pub policy: Arc<dyn ConflictPolicy>,
    pub problems: SyncProblemRegistry,
}

/// What a mutation reports for the item it was applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    /// Nothing to do. Whatever the mutation wrote is rolled back.
    NotApplied { reason: String },
}

impl MutationOutcome {
    pub fn not_applied(reason: impl Into<String>) -> Self {
        Self::NotApplied {
            reason: reason.into(),
        }
    }
}

/// One queued change.
///
/// Returning an error marks the entry `Failed`: its writes are rolled back
/// and a `MutationFailed` problem is recorded. Returning
/// [`SyncError::Cancelled`] aborts the whole transaction instead.
pub trait Mutation: Send {
    fn apply(&self, item: ItemId, ctx: &mut MutationContext<'_>) -> Result<MutationOutcome>;
}

impl<F> Mutation for F
where
    F: Fn(ItemId, &mut MutationContext<'_>) -> Result<MutationOutcome> + Send,
{
    fn apply(&self, item: ItemId, ctx: &mut MutationContext<'_>) -> Result<MutationOutcome> {
        self(item, ctx)
    }
}

/// Pin a closure to the [`Mutation`] signature.
pub fn mutation<F>(f: F) -> F
where
    F: Fn(ItemId, &mut MutationContext<'_>) -> Result<MutationOutcome> + Send,
{
    f
}

/// A local creation queued with [`CommitTransaction::create`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewItem {
    pub connection: Option<ConnectionId>,
    pub parent: Option<ItemId>,
    pub values: AttributeMap,
}

/// Write access handed to a mutation, restricted to the lock's items.
pub struct MutationContext<'a> {
    txn: &'a mut WriteTxn,
    lock: &'a EditLock,
    env: &'a CommitEnv,
    now: DateTime<Utc>,
}

impl MutationContext<'_> {
    /// Read any item, locked or not.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ItemNotFound`] if the item does not exist.
    pub fn item(&self, id: ItemId) -> Result<&ItemRecord> {
        self.txn.get(id).ok_or(SyncError::ItemNotFound(id))
    }

    /// Read-only view of the transaction, e.g. for a [`DiffEngine`](crate::diff::DiffEngine).
    #[must_use]
    pub fn source(&self) -> &WriteTxn {
        &*self.txn
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.env.schema
    }

    /// Timestamp shared by every entry of the transaction.
    #[must_use]
    pub const fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn ensure_scope(&self, id: ItemId) -> Result<()> {
        if self.lock.covers(id) {
            Ok(())
        } else {
            Err(SyncError::NotInLockScope {
                item: id,
                lock: self.lock.id(),
            })
        }
    }

    /// Mutable access to a locked item.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInLockScope`] for items outside the lock and
    /// [`SyncError::ItemNotFound`] for missing items.
    pub fn edit(&mut self, id: ItemId) -> Result<&mut ItemRecord> {
        self.ensure_scope(id)?;
        self.txn.get_mut(id).ok_or(SyncError::ItemNotFound(id))
    }

    /// Delete a locked item with its whole slave subtree.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInLockScope`] or [`SyncError::ItemNotFound`].
    pub fn clear_subtree(&mut self, id: ItemId) -> Result<Vec<ItemId>> {
        self.ensure_scope(id)?;
        if self.txn.get(id).is_none() {
            return Err(SyncError::ItemNotFound(id));
        }
        for slave in slaves::subtree(&*self.txn, id) {
            self.ensure_scope(slave)?;
        }
        Ok(slaves::clear_subtree(self.txn, id))
    }

    fn create_with_id(&mut self, id: ItemId, new: NewItem) -> Result<()> {
        if let Some(parent) = new.parent {
            self.ensure_scope(parent)?;
            if self.txn.get(parent).is_none() {
                return Err(SyncError::ItemNotFound(parent));
            }
        }
        if let Some((attr, value)) = self.env.schema.first_invalid(&new.values) {
            return Err(SyncError::InvalidMutation {
                item: id,
                reason: format!("value {value} does not fit attribute {attr}"),
            });
        }

        let mut record = ItemRecord::new_local(id, new.connection, new.parent, new.values);
        record.edited_at = Some(self.now);
        self.txn.insert(record);
        self.lock.include(&*self.txn, &[id])
    }

    /// Create a new item inside the transaction. Its parent must be locked.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInLockScope`] when the parent is not locked or
    /// [`SyncError::InvalidMutation`] when a value does not fit the schema.
    pub fn create(&mut self, new: NewItem) -> Result<ItemId> {
        let id = self.txn.allocate_id();
        self.create_with_id(id, new)?;
        Ok(id)
    }

    /// Run the auto-merge for a locked item.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInLockScope`] or [`SyncError::ItemNotFound`].
    pub fn auto_merge(&mut self, id: ItemId) -> Result<MergeOutcome> {
        self.ensure_scope(id)?;
        merge::auto_merge(self.txn, &self.env.schema, self.env.policy.as_ref(), id, self.now)
    }

    /// Settle the conflict of a locked item.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInLockScope`] or [`SyncError::ItemNotFound`].
    pub fn reconcile(&mut self, id: ItemId, resolution: Resolution) -> Result<bool> {
        self.ensure_scope(id)?;
        merge::reconcile(self.txn, &self.env.schema, id, resolution)
    }

    /// Drop the local edits of a locked item and its slaves.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInLockScope`] or [`SyncError::ItemNotFound`].
    pub fn discard(&mut self, id: ItemId) -> Result<Vec<ItemId>> {
        self.ensure_scope(id)?;
        merge::discard_local(self.txn, &self.env.schema, id)
    }
}

/// Terminal outcome of one queued entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ItemResult {
    Applied,
    NotApplied { reason: String },
    Failed { message: String },
}

impl ItemResult {
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

impl fmt::Display for ItemResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => f.write_str("applied"),
            Self::NotApplied { reason } => write!(f, "not applied: {reason}"),
            Self::Failed { message } => write!(f, "failed: {message}"),
        }
    }
}

/// Overall result of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    /// Store commit sequence visible after the transaction.
    pub commit: u64,
    /// One entry per queued mutation or creation, in queue order.
    pub results: Vec<(ItemId, ItemResult)>,
    /// Ids of items created by the transaction.
    pub created: Vec<ItemId>,
}

impl CommitOutcome {
    #[must_use]
    pub fn result_for(&self, item: ItemId) -> Option<&ItemResult> {
        self.results
            .iter()
            .find(|(id, _)| *id == item)
            .map(|(_, result)| result)
    }

    #[must_use]
    pub fn all_applied(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_applied())
    }
}

enum Entry {
    Mutate {
        item: ItemId,
        mutation: Box<dyn Mutation>,
    },
    Create(NewItem),
}

impl Entry {
    /// Item a durable failure is reported against.
    const fn problem_item(&self) -> Option<ItemId> {
        match self {
            Self::Mutate { item, .. } => Some(*item),
            Self::Create(new) => new.parent,
        }
    }
}

type FinishHook = Box<dyn FnOnce(bool) + Send>;

pub struct CommitTransaction {
    env: CommitEnv,
    lock: EditLock,
    entries: Vec<Entry>,
    on_finished: Option<FinishHook>,
    cancel: CancelToken,
    finished: bool,
}

impl CommitTransaction {
    /// Open a transaction over `items`, which must all be covered by `lock`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockNotHeld`] if the lock was released and
    /// [`SyncError::NotInLockScope`] if it does not cover every item.
    pub fn open(env: CommitEnv, lock: EditLock, items: &[ItemId]) -> Result<Self> {
        if !lock.is_alive() {
            return Err(SyncError::LockNotHeld { lock: lock.id() });
        }
        if let Some(item) = items.iter().find(|item| !lock.covers(**item)) {
            return Err(SyncError::NotInLockScope {
                item: *item,
                lock: lock.id(),
            });
        }
        debug!(lock = %lock.id(), items = items.len(), "commit transaction opened");

        Ok(Self {
            env,
            lock,
            entries: Vec::new(),
            on_finished: None,
            cancel: CancelToken::new(),
            finished: false,
        })
    }

    #[must_use]
    pub const fn lock_id(&self) -> LockId {
        self.lock.id()
    }

    #[must_use]
    pub const fn lock(&self) -> &EditLock {
        &self.lock
    }

    /// Abort the transaction when `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Called exactly once with `true` after a successful commit, `false` otherwise.
    pub fn on_finished(&mut self, hook: impl FnOnce(bool) + Send + 'static) {
        self.on_finished = Some(Box::new(hook));
    }

    fn ensure_scope(&self, item: ItemId) -> Result<()> {
        if !self.lock.is_alive() {
            return Err(SyncError::LockNotHeld {
                lock: self.lock.id(),
            });
        }
        if self.lock.covers(item) {
            Ok(())
        } else {
            Err(SyncError::NotInLockScope {
                item,
                lock: self.lock.id(),
            })
        }
    }

    /// Queue `mutation` for `item`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInLockScope`] if the lock does not cover `item`.
    pub fn add_mutation(&mut self, item: ItemId, mutation: impl Mutation + 'static) -> Result<()> {
        self.ensure_scope(item)?;
        self.entries.push(Entry::Mutate {
            item,
            mutation: Box::new(mutation),
        });
        Ok(())
    }

    /// Queue a local creation.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInLockScope`] if the parent is not locked.
    pub fn create(&mut self, new: NewItem) -> Result<()> {
        if let Some(parent) = new.parent {
            self.ensure_scope(parent)?;
        }
        self.entries.push(Entry::Create(new));
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn finish(&mut self, success: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.lock.release();
        if let Some(hook) = self.on_finished.take() {
            hook(success);
        }
    }

    /// Apply every queued entry in one write transaction.
    ///
    /// # Errors
    ///
    /// - [`SyncError::LockNotHeld`] if the lock was released meanwhile.
    /// - [`SyncError::Cancelled`] if cancelled; nothing is written and no
    ///   problem is recorded.
    /// - a durable failure such as [`SyncError::WriteFailed`]; nothing is
    ///   written and a `DurableWriteFailed` problem is recorded per item.
    pub fn commit(mut self) -> Result<CommitOutcome> {
        if !self.lock.is_alive() {
            let lock = self.lock.id();
            self.finish(false);
            return Err(SyncError::LockNotHeld { lock });
        }

        let entries = std::mem::take(&mut self.entries);
        let affected: BTreeSet<ItemId> = entries.iter().filter_map(Entry::problem_item).collect();
        let env = self.env.clone();
        let now = Utc::now();
        let lock = &self.lock;
        let cancel = &self.cancel;

        let written = env.db.write(cancel, |txn| {
            let mut results = Vec::with_capacity(entries.len());
            let mut created = Vec::new();
            for entry in entries {
                cancel.check()?;
                let savepoint = txn.savepoint();
                let problem_item = entry.problem_item();
                let (item, applied) = match entry {
                    Entry::Mutate { item, mutation } => {
                        let mut ctx = MutationContext {
                            txn: &mut *txn,
                            lock,
                            env: &env,
                            now,
                        };
                        (item, mutation.apply(item, &mut ctx))
                    }
                    Entry::Create(new) => {
                        let id = txn.allocate_id();
                        let mut ctx = MutationContext {
                            txn: &mut *txn,
                            lock,
                            env: &env,
                            now,
                        };
                        let applied =
                            ctx.create_with_id(id, new).map(|()| MutationOutcome::Applied);
                        if applied.is_ok() {
                            created.push(id);
                        }
                        (id, applied)
                    }
                };

                let result = match applied {
                    Ok(MutationOutcome::Applied) => ItemResult::Applied,
                    Ok(MutationOutcome::NotApplied { reason }) => {
                        txn.rollback_to(savepoint);
                        debug!(item = %item, reason = %reason, "mutation not applied");
                        ItemResult::NotApplied { reason }
                    }
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        txn.rollback_to(savepoint);
                        debug!(item = %item, error = %err, "mutation failed; rolled back");
                        ItemResult::Failed {
                            message: err.to_string(),
                        }
                    }
                };
                results.push((item, problem_item, result));
            }
            Ok((results, created))
        });

        match written {
            Ok(((results, created), commit)) => {
                for (item, problem_item, result) in &results {
                    let ItemResult::Failed { message } = result else {
                        continue;
                    };
                    // A failed creation stored nothing; only its parent carries the problem.
                    let Some(target) = problem_item else {
                        debug!(item = %item, "failed creation has no stored item to report on");
                        continue;
                    };
                    env.problems.record(
                        *target,
                        ProblemCause::MutationFailed {
                            message: message.clone(),
                        },
                    );
                }
                let outcome = CommitOutcome {
                    commit,
                    results: results
                        .into_iter()
                        .map(|(item, _, result)| (item, result))
                        .collect(),
                    created,
                };
                info!(
                    commit,
                    lock = %self.lock.id(),
                    entries = outcome.results.len(),
                    created = outcome.created.len(),
                    applied = outcome.results.iter().filter(|(_, r)| r.is_applied()).count(),
                    "commit transaction finished"
                );
                self.finish(true);
                Ok(outcome)
            }
            Err(err) if err.is_cancelled() => {
                debug!(lock = %self.lock.id(), "commit transaction cancelled");
                self.finish(false);
                Err(err)
            }
            Err(err) => {
                if err.is_durable_failure() {
                    error!(
                        lock = %self.lock.id(),
                        items = affected.len(),
                        error = %err,
                        "commit transaction could not be persisted"
                    );
                    for item in &affected {
                        env.problems.record(
                            *item,
                            ProblemCause::DurableWriteFailed {
                                message: err.to_string(),
                            },
                        );
                    }
                }
                self.finish(false);
                Err(err)
            }
        }
    }
}

impl Drop for CommitTransaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(lock = %self.lock.id(), "commit transaction dropped without commit");
        }
        self.finish(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::EditLocks;
    use crate::merge::BuiltinPolicy;
    use crate::store::{MemoryStore, Store};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn synced(id: u64, parent: Option<u64>) -> ItemRecord {
        let values = AttributeMap::new().with("status", "open");
        let mut record =
            ItemRecord::new_local(ItemId::new(id), None, parent.map(ItemId::new), values.clone());
        record.base = Some(values);
        record
    }

    fn env_with(store: Arc<MemoryStore>) -> CommitEnv {
        CommitEnv {
            db: Arc::new(Database::new(store)),
            schema: Arc::new(Schema::new()),
            policy: Arc::new(BuiltinPolicy::Manual),
            problems: SyncProblemRegistry::new(),
        }
    }

    fn set_status(status: &'static str) -> impl Mutation {
        mutation(move |item, ctx| {
            ctx.edit(item)?.trunk.set("status", status);
            Ok(MutationOutcome::Applied)
        })
    }

    #[test]
    fn open_rejects_items_outside_the_lock() {
        let store = Arc::new(MemoryStore::with_records([synced(1, None), synced(2, None)]));
        let env = env_with(Arc::clone(&store));
        let locks = EditLocks::new();
        let snapshot = store.snapshot().expect("snapshot");

        let lock = locks.acquire(&snapshot, &[ItemId::new(1)]).expect("lock");
        let err = CommitTransaction::open(env.clone(), lock, &[ItemId::new(2)])
            .err()
            .expect("item 2 not covered");
        assert!(matches!(err, SyncError::NotInLockScope { .. }));
        assert!(locks.is_empty(), "a rejected open releases the lock");

        let lock = locks.acquire(&snapshot, &[ItemId::new(1)]).expect("lock");
        lock.release();
        let err = CommitTransaction::open(env, lock, &[ItemId::new(1)]).err().expect("released");
        assert!(matches!(err, SyncError::LockNotHeld { .. }));
    }

    #[test]
    fn failing_entry_is_rolled_back_alone() {
        let store = Arc::new(MemoryStore::with_records([synced(1, None), synced(2, None)]));
        let env = env_with(Arc::clone(&store));
        let locks = EditLocks::new();
        let snapshot = store.snapshot().expect("snapshot");
        let lock = locks.acquire(&snapshot, &[ItemId::new(1), ItemId::new(2)]).expect("lock");

        let items = [ItemId::new(1), ItemId::new(2)];
        let mut txn = CommitTransaction::open(env.clone(), lock, &items).expect("open");
        txn.add_mutation(ItemId::new(1), set_status("closed")).expect("queue 1");
        txn.add_mutation(
            ItemId::new(2),
            mutation(|item, ctx| {
                ctx.edit(item)?.trunk.set("status", "half-written");
                Err(SyncError::InvalidMutation {
                    item,
                    reason: "validation failed".to_string(),
                })
            }),
        )
        .expect("queue 2");

        let outcome = txn.commit().expect("commit");
        assert_eq!(outcome.result_for(ItemId::new(1)), Some(&ItemResult::Applied));
        assert!(matches!(outcome.result_for(ItemId::new(2)), Some(ItemResult::Failed { .. })));

        let after = store.snapshot().expect("snapshot");
        assert_eq!(
            after.get(ItemId::new(1)).and_then(|r| r.trunk.get(&"status".into())).cloned(),
            Some("closed".into())
        );
        assert_eq!(after.get(ItemId::new(2)), Some(&synced(2, None)));
        assert_eq!(env.problems.problems_for(ItemId::new(2)).len(), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn finish_hook_fires_once_on_commit_and_on_drop() {
        let store = Arc::new(MemoryStore::with_records([synced(1, None)]));
        let env = env_with(Arc::clone(&store));
        let locks = EditLocks::new();
        let snapshot = store.snapshot().expect("snapshot");
        let calls = Arc::new(Mutex::new(Vec::new()));

        let lock = locks.acquire(&snapshot, &[ItemId::new(1)]).expect("lock");
        let mut txn = CommitTransaction::open(env.clone(), lock, &[ItemId::new(1)]).expect("open");
        let sink = Arc::clone(&calls);
        txn.on_finished(move |ok| sink.lock().expect("sink").push(ok));
        txn.add_mutation(ItemId::new(1), set_status("closed")).expect("queue");
        txn.commit().expect("commit");

        let lock = locks.acquire(&snapshot, &[ItemId::new(1)]).expect("lock again");
        let mut dropped = CommitTransaction::open(env, lock, &[ItemId::new(1)]).expect("open");
        let sink = Arc::clone(&calls);
        dropped.on_finished(move |ok| sink.lock().expect("sink").push(ok));
        drop(dropped);

        assert_eq!(*calls.lock().expect("calls"), vec![true, false]);
        assert!(locks.is_empty());
    }

    #[test]
    fn durable_failure_records_problems_and_writes_nothing() {
        let store = Arc::new(MemoryStore::with_records([synced(1, None)]));
        let env = env_with(Arc::clone(&store));
        let locks = EditLocks::new();
        let snapshot = store.snapshot().expect("snapshot");
        let lock = locks.acquire(&snapshot, &[ItemId::new(1)]).expect("lock");

        let finished = Arc::new(AtomicUsize::new(0));
        let mut txn = CommitTransaction::open(env.clone(), lock, &[ItemId::new(1)]).expect("open");
        let counter = Arc::clone(&finished);
        txn.on_finished(move |ok| {
            assert!(!ok);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        txn.add_mutation(ItemId::new(1), set_status("closed")).expect("queue");

        store.set_write_failure(true);
        let err = txn.commit().expect_err("disk full");
        assert!(err.is_durable_failure());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(store.snapshot().expect("snapshot").get(ItemId::new(1)), Some(&synced(1, None)));

        let problems = env.problems.problems_for(ItemId::new(1));
        assert_eq!(problems.len(), 1);
        assert!(matches!(problems[0].cause(), ProblemCause::DurableWriteFailed { .. }));
    }

    #[test]
    fn cancellation_records_no_problem() {
        let store = Arc::new(MemoryStore::with_records([synced(1, None)]));
        let env = env_with(Arc::clone(&store));
        let locks = EditLocks::new();
        let snapshot = store.snapshot().expect("snapshot");
        let lock = locks.acquire(&snapshot, &[ItemId::new(1)]).expect("lock");

        let cancel = CancelToken::new();
        let mut txn = CommitTransaction::open(env.clone(), lock, &[ItemId::new(1)])
            .expect("open")
            .with_cancel(cancel.clone());
        txn.add_mutation(ItemId::new(1), set_status("closed")).expect("queue");
        cancel.cancel();

        assert!(txn.commit().expect_err("cancelled").is_cancelled());
        assert!(env.problems.is_empty());
        assert!(locks.is_empty());
    }

    #[test]
    fn creation_extends_the_lock_and_reports_new_ids() {
        let store = Arc::new(MemoryStore::with_records([synced(1, None)]));
        let env = env_with(Arc::clone(&store));
        let locks = EditLocks::new();
        let snapshot = store.snapshot().expect("snapshot");
        let lock = locks.acquire(&snapshot, &[ItemId::new(1)]).expect("lock");

        let mut txn = CommitTransaction::open(env, lock, &[ItemId::new(1)]).expect("open");
        txn.create(NewItem {
            parent: Some(ItemId::new(1)),
            values: AttributeMap::new().with("body", "first comment"),
            ..NewItem::default()
        })
        .expect("queue creation");
        let outcome = txn.commit().expect("commit");

        assert_eq!(outcome.created, vec![ItemId::new(2)]);
        let after = store.snapshot().expect("snapshot");
        assert_eq!(after.children_of(ItemId::new(1)), vec![ItemId::new(2)]);
        assert!(after.get(ItemId::new(2)).is_some_and(ItemRecord::is_new));
    }
}
