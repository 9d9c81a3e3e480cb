//! Storage seam: immutable snapshots, change sets and the [`Store`] trait.
//!
//! A store owns the committed item state. Readers work on a [`Snapshot`], a
//! cheap `Arc`-shared point-in-time view. All writes go through
//! [`txn::Database::write`], which serializes writers and hands the store a
//! [`ChangeSet`] computed against the snapshot it started from.

pub mod file_lock;
pub mod memory;
pub mod migrations;
pub mod sqlite;
pub mod txn;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::model::item::{ItemId, ItemRecord};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use txn::{Database, Savepoint, WriteTxn};

/// Read access to items, implemented by snapshots and open write transactions.
pub trait ItemSource {
    fn item(&self, id: ItemId) -> Option<&ItemRecord>;

    /// Direct slaves of `id`, in id order.
    fn children(&self, id: ItemId) -> Vec<ItemId>;

    fn contains(&self, id: ItemId) -> bool {
        self.item(id).is_some()
    }
}

/// Point-in-time view of the committed store.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    commit: u64,
    /// Ids below this were handed out once and are never reused.
    next_id: u64,
    items: Arc<BTreeMap<ItemId, ItemRecord>>,
    children: Arc<BTreeMap<ItemId, BTreeSet<ItemId>>>,
}

impl Snapshot {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(commit: u64, records: impl IntoIterator<Item = ItemRecord>) -> Self {
        let items: BTreeMap<ItemId, ItemRecord> =
            records.into_iter().map(|record| (record.id, record)).collect();
        let children = index_children(&items);
        Self {
            commit,
            next_id: 0,
            items: Arc::new(items),
            children: Arc::new(children),
        }
    }

    /// Same snapshot, remembering that ids below `next_id` were already used.
    #[must_use]
    pub fn with_next_id(mut self, next_id: u64) -> Self {
        self.next_id = self.next_id.max(next_id);
        self
    }

    /// Sequence number of the last commit visible in this snapshot.
    #[must_use]
    pub const fn commit(&self) -> u64 {
        self.commit
    }

    #[must_use]
    pub fn get(&self, id: ItemId) -> Option<&ItemRecord> {
        self.items.get(&id)
    }

    #[must_use]
    pub fn children_of(&self, id: ItemId) -> Vec<ItemId> {
        self.children
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn items(&self) -> impl Iterator<Item = &ItemRecord> {
        self.items.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Smallest id greater than every stored id and every id ever reserved.
    #[must_use]
    pub fn next_free_id(&self) -> ItemId {
        let last = self.items.keys().next_back().map_or(0, |id| id.get());
        ItemId::new(self.next_id.max(last + 1))
    }

    /// New snapshot with `changes` applied and the commit counter set to `commit`.
    #[must_use]
    pub fn apply(&self, changes: &ChangeSet, commit: u64) -> Self {
        let mut items = (*self.items).clone();
        for (id, write) in &changes.writes {
            match write {
                Some(record) => {
                    items.insert(*id, record.clone());
                }
                None => {
                    items.remove(id);
                }
            }
        }
        let children = index_children(&items);
        let next_id = self.next_free_id().get().max(changes.next_id.unwrap_or(0));
        Self {
            commit,
            next_id,
            items: Arc::new(items),
            children: Arc::new(children),
        }
    }
}

impl ItemSource for Snapshot {
    fn item(&self, id: ItemId) -> Option<&ItemRecord> {
        self.get(id)
    }

    fn children(&self, id: ItemId) -> Vec<ItemId> {
        self.children_of(id)
    }
}

fn index_children(items: &BTreeMap<ItemId, ItemRecord>) -> BTreeMap<ItemId, BTreeSet<ItemId>> {
    let mut children: BTreeMap<ItemId, BTreeSet<ItemId>> = BTreeMap::new();
    for record in items.values() {
        if let Some(parent) = record.parent {
            children.entry(parent).or_default().insert(record.id);
        }
    }
    children
}

/// Net effect of one write transaction. `None` deletes the item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub writes: BTreeMap<ItemId, Option<ItemRecord>>,
    /// New id high-water mark, when the transaction reserved ids. Reserved
    /// ids stay used even if the item that took them was rolled back.
    pub next_id: Option<u64>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.next_id.is_none()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn items(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.writes.keys().copied()
    }
}

/// Broadcast after every successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotice {
    pub commit: u64,
    pub items: Vec<ItemId>,
}

/// Durable item storage.
///
/// `commit` must be atomic: either every write in the change set becomes
/// visible under the returned snapshot, or none does and an error is returned.
pub trait Store: Send + Sync {
    /// Current committed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn snapshot(&self) -> Result<Snapshot>;

    /// Apply `changes` on top of commit `base_commit`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::WriteFailed`](crate::error::SyncError::WriteFailed)
    /// when nothing could be persisted, including when `base_commit` is stale.
    fn commit(&self, base_commit: u64, changes: &ChangeSet) -> Result<Snapshot>;

    /// Receive a [`CommitNotice`] after each successful commit.
    fn subscribe(&self) -> Receiver<CommitNotice>;
}

/// Fan-out of commit notices to subscribers. Disconnected receivers are pruned.
#[derive(Debug, Default)]
pub struct Notifier {
    subscribers: Mutex<Vec<Sender<CommitNotice>>>,
}

impl Notifier {
    pub fn subscribe(&self) -> Receiver<CommitNotice> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn notify(&self, commit: u64, changes: &ChangeSet) {
        let notice = CommitNotice {
            commit,
            items: changes.items().collect(),
        };
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::item::AttributeMap;

    fn record(id: u64, parent: Option<u64>) -> ItemRecord {
        ItemRecord::new_local(
            ItemId::new(id),
            None,
            parent.map(ItemId::new),
            AttributeMap::new().with("summary", format!("item {id}")),
        )
    }

    #[test]
    fn snapshot_indexes_children() {
        let snapshot =
            Snapshot::from_records(3, [record(1, None), record(2, Some(1)), record(3, Some(1))]);
        assert_eq!(snapshot.commit(), 3);
        assert_eq!(
            snapshot.children_of(ItemId::new(1)),
            vec![ItemId::new(2), ItemId::new(3)]
        );
        assert!(snapshot.children_of(ItemId::new(2)).is_empty());
        assert_eq!(snapshot.next_free_id(), ItemId::new(4));
    }

    #[test]
    fn apply_leaves_the_original_snapshot_untouched() {
        let before = Snapshot::from_records(1, [record(1, None), record(2, Some(1))]);
        let mut changes = ChangeSet::default();
        changes.writes.insert(ItemId::new(2), None);
        changes.writes.insert(ItemId::new(5), Some(record(5, Some(1))));

        let after = before.apply(&changes, 2);
        assert_eq!(after.commit(), 2);
        assert!(after.get(ItemId::new(2)).is_none());
        assert_eq!(after.children_of(ItemId::new(1)), vec![ItemId::new(5)]);

        assert!(before.get(ItemId::new(2)).is_some());
        assert_eq!(before.children_of(ItemId::new(1)), vec![ItemId::new(2)]);
    }

    #[test]
    fn removed_and_reserved_ids_are_not_handed_out_again() {
        let before = Snapshot::from_records(1, [record(1, None), record(2, None)]);
        let mut changes = ChangeSet::default();
        changes.writes.insert(ItemId::new(2), None);
        let after = before.apply(&changes, 2);
        assert_eq!(after.next_free_id(), ItemId::new(3));
        assert_eq!(after.clone().with_next_id(2).next_free_id(), ItemId::new(3));

        let reserved = ChangeSet {
            writes: BTreeMap::new(),
            next_id: Some(6),
        };
        assert!(!reserved.is_empty());
        assert_eq!(after.apply(&reserved, 3).next_free_id(), ItemId::new(6));
    }

    #[test]
    fn notifier_prunes_dropped_receivers() {
        let notifier = Notifier::default();
        let kept = notifier.subscribe();
        drop(notifier.subscribe());

        let mut changes = ChangeSet::default();
        changes.writes.insert(ItemId::new(9), None);
        notifier.notify(4, &changes);

        let notice = kept.try_recv().expect("notice delivered");
        assert_eq!(notice.commit, 4);
        assert_eq!(notice.items, vec![ItemId::new(9)]);
        assert_eq!(notifier.subscribers.lock().map(|s| s.len()).unwrap_or(0), 1);
    }
}
