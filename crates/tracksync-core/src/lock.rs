//! Per-item edit locks.
//!
//! An [`EditLock`] claims a set of items plus their slave closure for one
//! editor. Background synchronization checks the table before touching an
//! item: a locked item is never auto-merged. The merge is recorded on the
//! lock instead and queued once the lock is released.
//!
//! Acquisition never blocks. Contention returns
//! [`SyncError::LockContention`] immediately.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::item::ItemId;
use crate::slaves;
use crate::store::ItemSource;

/// Identifier of one acquired edit lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(u64);

impl LockId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Default)]
struct LockEntry {
    items: BTreeSet<ItemId>,
    deferred: BTreeSet<ItemId>,
}

#[derive(Debug, Default)]
struct TableState {
    next_id: u64,
    owners: HashMap<ItemId, LockId>,
    locks: HashMap<LockId, LockEntry>,
    merge_queue: BTreeSet<ItemId>,
}

impl TableState {
    fn holder_of<'a>(
        &self,
        items: impl IntoIterator<Item = &'a ItemId>,
    ) -> Option<(ItemId, LockId)> {
        items
            .into_iter()
            .find_map(|item| self.owners.get(item).map(|holder| (*item, *holder)))
    }

    fn release(&mut self, id: LockId) -> bool {
        let Some(entry) = self.locks.remove(&id) else {
            return false;
        };
        for item in &entry.items {
            self.owners.remove(item);
        }
        self.merge_queue.extend(entry.deferred.iter().copied());
        debug!(
            lock = %id,
            items = entry.items.len(),
            deferred = entry.deferred.len(),
            "edit lock released"
        );
        true
    }
}

type Table = Arc<Mutex<TableState>>;

fn lock_table(table: &Mutex<TableState>) -> MutexGuard<'_, TableState> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide lock table. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct EditLocks {
    table: Table,
}

impl EditLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `primaries` and their slave closure, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockContention`] naming the first contended item
    /// and its holder. No item is claimed in that case.
    pub fn acquire<S: ItemSource + ?Sized>(
        &self,
        source: &S,
        primaries: &[ItemId],
    ) -> Result<EditLock> {
        let items = slaves::subtrees(source, primaries);

        let mut state = lock_table(&self.table);
        if let Some((item, holder)) = state.holder_of(&items) {
            debug!(item = %item, holder = %holder, "edit lock contention");
            return Err(SyncError::LockContention { item, holder });
        }

        state.next_id += 1;
        let id = LockId(state.next_id);
        for item in &items {
            state.owners.insert(*item, id);
        }
        debug!(lock = %id, items = items.len(), "edit lock acquired");
        state.locks.insert(
            id,
            LockEntry {
                items,
                deferred: BTreeSet::new(),
            },
        );

        Ok(EditLock {
            id,
            table: Arc::clone(&self.table),
        })
    }

    /// The live lock covering `item`, if any.
    #[must_use]
    pub fn find_lock(&self, item: ItemId) -> Option<LockHandle> {
        let state = lock_table(&self.table);
        state.owners.get(&item).map(|id| LockHandle {
            id: *id,
            table: Arc::downgrade(&self.table),
        })
    }

    /// A live lock covering any of `items`.
    #[must_use]
    pub fn find_any_lock(&self, items: &[ItemId]) -> Option<LockHandle> {
        let state = lock_table(&self.table);
        state.holder_of(items).map(|(_, id)| LockHandle {
            id,
            table: Arc::downgrade(&self.table),
        })
    }

    #[must_use]
    pub fn is_locked(&self, item: ItemId) -> bool {
        lock_table(&self.table).owners.contains_key(&item)
    }

    /// Put `item` and its unclaimed slaves under the lock holding `parent`.
    ///
    /// Used when a download attaches an item below a locked master after the
    /// lock was taken. Returns the extended lock, or `None` if `parent` is not
    /// locked.
    pub fn adopt<S: ItemSource + ?Sized>(
        &self,
        source: &S,
        item: ItemId,
        parent: ItemId,
    ) -> Option<LockId> {
        let subtree = slaves::subtree(source, item);

        let mut state = lock_table(&self.table);
        let id = state.owners.get(&parent).copied()?;
        let unclaimed: Vec<ItemId> = subtree
            .into_iter()
            .filter(|slave| !state.owners.contains_key(slave))
            .collect();
        for slave in &unclaimed {
            state.owners.insert(*slave, id);
        }
        if let Some(entry) = state.locks.get_mut(&id) {
            entry.items.extend(unclaimed.iter().copied());
        }
        debug!(item = %item, lock = %id, adopted = unclaimed.len(), "lock extended to new slave");
        Some(id)
    }

    /// Record that an automatic merge of `item` was skipped.
    ///
    /// Returns `false` when the item is not locked and the caller may merge now.
    pub fn defer_merge(&self, item: ItemId) -> bool {
        let mut state = lock_table(&self.table);
        let Some(id) = state.owners.get(&item).copied() else {
            return false;
        };
        if let Some(entry) = state.locks.get_mut(&id) {
            entry.deferred.insert(item);
        }
        debug!(item = %item, lock = %id, "auto-merge deferred");
        true
    }

    /// Drain items whose deferred merge became possible.
    pub fn take_merge_requests(&self) -> Vec<ItemId> {
        let mut state = lock_table(&self.table);
        std::mem::take(&mut state.merge_queue).into_iter().collect()
    }

    /// Number of live locks.
    #[must_use]
    pub fn len(&self) -> usize {
        lock_table(&self.table).locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owning edit lock. Dropping it releases every claimed item.
#[derive(Debug)]
pub struct EditLock {
    id: LockId,
    table: Table,
}

impl EditLock {
    #[must_use]
    pub const fn id(&self) -> LockId {
        self.id
    }

    /// Whether the lock still holds its items.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        lock_table(&self.table).locks.contains_key(&self.id)
    }

    #[must_use]
    pub fn covers(&self, item: ItemId) -> bool {
        lock_table(&self.table).owners.get(&item) == Some(&self.id)
    }

    /// Every item claimed by this lock. Empty once released.
    #[must_use]
    pub fn items(&self) -> BTreeSet<ItemId> {
        lock_table(&self.table)
            .locks
            .get(&self.id)
            .map(|entry| entry.items.clone())
            .unwrap_or_default()
    }

    /// Extend the lock over `items` and their slaves, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LockNotHeld`] after release, or
    /// [`SyncError::LockContention`] when another lock holds one of the items.
    pub fn include<S: ItemSource + ?Sized>(&self, source: &S, items: &[ItemId]) -> Result<()> {
        let extra = slaves::subtrees(source, items);

        let mut state = lock_table(&self.table);
        if !state.locks.contains_key(&self.id) {
            return Err(SyncError::LockNotHeld { lock: self.id });
        }
        let foreign = extra
            .iter()
            .find_map(|item| match state.owners.get(item) {
                Some(holder) if *holder != self.id => Some((*item, *holder)),
                _ => None,
            });
        if let Some((item, holder)) = foreign {
            return Err(SyncError::LockContention { item, holder });
        }

        for item in &extra {
            state.owners.insert(*item, self.id);
        }
        if let Some(entry) = state.locks.get_mut(&self.id) {
            entry.items.extend(extra);
        }
        Ok(())
    }

    /// Release every claimed item. Calling it again has no effect.
    pub fn release(&self) {
        lock_table(&self.table).release(self.id);
    }
}

impl Drop for EditLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Non-owning view of a lock returned by queries.
#[derive(Debug, Clone)]
pub struct LockHandle {
    id: LockId,
    table: Weak<Mutex<TableState>>,
}

impl LockHandle {
    #[must_use]
    pub const fn id(&self) -> LockId {
        self.id
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.table
            .upgrade()
            .is_some_and(|table| lock_table(&table).locks.contains_key(&self.id))
    }

    /// Items held by the lock at the time of the call.
    #[must_use]
    pub fn items(&self) -> BTreeSet<ItemId> {
        self.table
            .upgrade()
            .and_then(|table| {
                lock_table(&table)
                    .locks
                    .get(&self.id)
                    .map(|entry| entry.items.clone())
            })
            .unwrap_or_default()
    }
}

impl PartialEq for LockHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
