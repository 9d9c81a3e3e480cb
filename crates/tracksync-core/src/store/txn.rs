//! Serialized write transactions over a [`Store`].

use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::{ChangeSet, CommitNotice, ItemSource, Snapshot, Store};
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::model::item::{ItemId, ItemRecord};

/// Entry point for transactional access to a store.
///
/// Reads run against an immutable snapshot. Writes are serialized through a
/// writer mutex: at most one [`WriteTxn`] exists at a time per database.
pub struct Database {
    store: Arc<dyn Store>,
    writer: Mutex<()>,
}

impl Database {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            writer: Mutex::new(()),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot produce a snapshot.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.store.snapshot()
    }

    /// Run `f` against a consistent snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fired before or after `f`, or whatever
    /// `f` returns.
    pub fn read<T>(
        &self,
        cancel: &CancelToken,
        f: impl FnOnce(&Snapshot) -> Result<T>,
    ) -> Result<T> {
        cancel.check()?;
        let snapshot = self.store.snapshot()?;
        let value = f(&snapshot)?;
        cancel.check()?;
        Ok(value)
    }

    /// Run `f` inside the single write transaction and commit its changes.
    ///
    /// Returns the closure's value and the commit sequence number visible
    /// afterwards. A transaction without net changes commits nothing.
    ///
    /// # Errors
    ///
    /// Nothing is persisted when `f` fails, when `cancel` fires before the
    /// store commit, or when the store rejects the change set.
    pub fn write<T>(
        &self,
        cancel: &CancelToken,
        f: impl FnOnce(&mut WriteTxn) -> Result<T>,
    ) -> Result<(T, u64)> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        cancel.check()?;

        let snapshot = self.store.snapshot()?;
        let base_commit = snapshot.commit();
        let mut txn = WriteTxn::new(snapshot);
        let value = f(&mut txn)?;
        cancel.check()?;

        let changes = txn.into_changes();
        if changes.is_empty() {
            debug!(commit = base_commit, "write transaction without changes");
            return Ok((value, base_commit));
        }

        match self.store.commit(base_commit, &changes) {
            Ok(committed) => {
                debug!(
                    commit = committed.commit(),
                    items = changes.len(),
                    "write transaction committed"
                );
                Ok((value, committed.commit()))
            }
            Err(err) => {
                warn!(error = %err, items = changes.len(), "write transaction failed");
                Err(err)
            }
        }
    }

    pub fn subscribe(&self) -> Receiver<CommitNotice> {
        self.store.subscribe()
    }
}

/// Restore point inside a [`WriteTxn`]. Ids reserved after it stay reserved.
#[derive(Debug, Clone)]
pub struct Savepoint {
    overlay: BTreeMap<ItemId, Option<ItemRecord>>,
}

/// Copy-on-write overlay over the snapshot a write transaction started from.
#[derive(Debug)]
pub struct WriteTxn {
    base: Snapshot,
    overlay: BTreeMap<ItemId, Option<ItemRecord>>,
    next_id: u64,
}

impl WriteTxn {
    #[must_use]
    pub fn new(base: Snapshot) -> Self {
        let next_id = base.next_free_id().get();
        Self {
            base,
            overlay: BTreeMap::new(),
            next_id,
        }
    }

    /// The snapshot this transaction started from.
    #[must_use]
    pub const fn base(&self) -> &Snapshot {
        &self.base
    }

    #[must_use]
    pub fn get(&self, id: ItemId) -> Option<&ItemRecord> {
        match self.overlay.get(&id) {
            Some(write) => write.as_ref(),
            None => self.base.get(id),
        }
    }

    pub fn get_mut(&mut self, id: ItemId) -> Option<&mut ItemRecord> {
        if !self.overlay.contains_key(&id) {
            let record = self.base.get(id)?.clone();
            self.overlay.insert(id, Some(record));
        }
        self.overlay.get_mut(&id).and_then(Option::as_mut)
    }

    /// Insert or replace a whole record.
    pub fn insert(&mut self, record: ItemRecord) {
        self.next_id = self.next_id.max(record.id.get() + 1);
        self.overlay.insert(record.id, Some(record));
    }

    /// Delete one item. Slaves are not touched; see [`crate::slaves`].
    pub fn clear(&mut self, id: ItemId) -> Option<ItemRecord> {
        let previous = self.get(id).cloned();
        if previous.is_some() {
            self.overlay.insert(id, None);
        }
        previous
    }

    /// Reserve a fresh item id.
    pub fn allocate_id(&mut self) -> ItemId {
        let id = ItemId::new(self.next_id);
        self.next_id += 1;
        id
    }

    #[must_use]
    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            overlay: self.overlay.clone(),
        }
    }

    /// Discard everything written since `savepoint` was taken.
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        self.overlay = savepoint.overlay;
    }

    /// Items whose stored value differs from the base snapshot.
    #[must_use]
    pub fn changed_items(&self) -> Vec<ItemId> {
        self.net_writes().map(|(id, _)| id).collect()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.net_writes().next().is_some()
    }

    #[must_use]
    pub fn into_changes(self) -> ChangeSet {
        let writes = self
            .net_writes()
            .map(|(id, write)| (id, write.cloned()))
            .collect();
        let next_id = (self.next_id > self.base.next_free_id().get()).then_some(self.next_id);
        ChangeSet { writes, next_id }
    }

    fn net_writes(&self) -> impl Iterator<Item = (ItemId, Option<&ItemRecord>)> + '_ {
        self.overlay.iter().filter_map(|(id, write)| {
            let before = self.base.get(*id);
            let after = write.as_ref();
            (before != after).then_some((*id, after))
        })
    }
}

impl ItemSource for WriteTxn {
    fn item(&self, id: ItemId) -> Option<&ItemRecord> {
        self.get(id)
    }

    fn children(&self, id: ItemId) -> Vec<ItemId> {
        let mut children: Vec<ItemId> = self
            .base
            .children_of(id)
            .into_iter()
            .filter(|child| !self.overlay.contains_key(child))
            .collect();
        children.extend(self.overlay.iter().filter_map(|(child, write)| {
            write
                .as_ref()
                .filter(|record| record.parent == Some(id))
                .map(|_| *child)
        }));
        children.sort_unstable();
        children
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::item::AttributeMap;
    use crate::store::MemoryStore;

    fn record(id: u64, parent: Option<u64>) -> ItemRecord {
        ItemRecord::new_local(
            ItemId::new(id),
            None,
            parent.map(ItemId::new),
            AttributeMap::new().with("summary", "x"),
        )
    }

    fn seeded() -> Database {
        let store = MemoryStore::with_records([record(1, None), record(2, Some(1))]);
        Database::new(Arc::new(store))
    }

    #[test]
    fn rollback_restores_overlay_but_keeps_reserved_ids() {
        let mut txn = WriteTxn::new(Snapshot::from_records(0, [record(1, None)]));
        let savepoint = txn.savepoint();

        let id = txn.allocate_id();
        txn.insert(record(id.get(), Some(1)));
        if let Some(rec) = txn.get_mut(ItemId::new(1)) {
            rec.trunk.set("summary", "changed");
        }
        assert!(txn.is_dirty());

        txn.rollback_to(savepoint);
        assert!(!txn.is_dirty());
        assert_eq!(txn.allocate_id(), ItemId::new(id.get() + 1));

        let changes = txn.into_changes();
        assert!(changes.writes.is_empty());
        assert_eq!(changes.next_id, Some(id.get() + 2));
    }

    #[test]
    fn untouched_get_mut_is_not_a_change() {
        let mut txn = WriteTxn::new(Snapshot::from_records(0, [record(1, None)]));
        let _ = txn.get_mut(ItemId::new(1));
        assert!(txn.into_changes().is_empty());
    }

    #[test]
    fn children_see_uncommitted_writes() {
        let base = Snapshot::from_records(0, [record(1, None), record(2, Some(1))]);
        let mut txn = WriteTxn::new(base);
        txn.insert(record(3, Some(1)));
        txn.clear(ItemId::new(2));
        assert_eq!(txn.children(ItemId::new(1)), vec![ItemId::new(3)]);
    }

    #[test]
    fn write_commits_and_advances_sequence() {
        let db = seeded();
        let cancel = CancelToken::new();
        let before = db.snapshot().expect("snapshot").commit();

        let ((), commit) = db
            .write(&cancel, |txn| {
                txn.clear(ItemId::new(2));
                Ok(())
            })
            .expect("write");

        assert_eq!(commit, before + 1);
        assert!(db.snapshot().expect("snapshot").get(ItemId::new(2)).is_none());
    }

    #[test]
    fn cancelled_write_persists_nothing() {
        let db = seeded();
        let cancel = CancelToken::new();
        let err = db
            .write(&cancel, |txn| {
                txn.clear(ItemId::new(2));
                cancel.cancel();
                Ok(())
            })
            .expect_err("cancelled");

        assert!(err.is_cancelled());
        assert!(db.snapshot().expect("snapshot").get(ItemId::new(2)).is_some());
    }
}
