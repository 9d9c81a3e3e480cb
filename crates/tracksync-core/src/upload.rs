//! Upload bookkeeping: which items are in flight and what was sent.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::merge::MergeOutcome;
use crate::model::item::{AttributeMap, ConnectionId, ItemId};

/// Items currently being uploaded. An item is sent by at most one batch.
#[derive(Debug, Clone, Default)]
pub struct UploadLocks {
    held: Arc<Mutex<BTreeSet<ItemId>>>,
}

impl UploadLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, BTreeSet<ItemId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_locked(&self, item: ItemId) -> bool {
        self.held().contains(&item)
    }

    /// Claim every item not already in flight. Returns the claimed ones.
    pub fn claim(&self, items: impl IntoIterator<Item = ItemId>) -> Vec<ItemId> {
        let mut held = self.held();
        items.into_iter().filter(|item| held.insert(*item)).collect()
    }

    pub fn release(&self, items: impl IntoIterator<Item = ItemId>) {
        let mut held = self.held();
        for item in items {
            held.remove(&item);
        }
    }
}

/// Captured value of one item as handed to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadItem {
    pub item: ItemId,
    pub connection: Option<ConnectionId>,
    /// Shadowable trunk at the time of capture.
    pub values: AttributeMap,
}

/// Items claimed for one upload. Dropping the batch releases the claims.
#[derive(Debug)]
pub struct UploadBatch {
    items: Vec<UploadItem>,
    locks: UploadLocks,
}

impl UploadBatch {
    pub(crate) fn new(items: Vec<UploadItem>, locks: UploadLocks) -> Self {
        Self { items, locks }
    }

    #[must_use]
    pub fn items(&self) -> &[UploadItem] {
        &self.items
    }

    #[must_use]
    pub fn get(&self, item: ItemId) -> Option<&UploadItem> {
        self.items.iter().find(|captured| captured.item == item)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|captured| captured.item).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Drop for UploadBatch {
    fn drop(&mut self) {
        if !self.items.is_empty() {
            debug!(items = self.items.len(), "upload claims released");
        }
        self.locks.release(self.items.iter().map(|captured| captured.item));
    }
}

/// Server answer for one uploaded item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UploadResult {
    Confirmed,
    /// The server refused the change; the item stays dirty.
    Rejected { reason: String },
    /// The request never completed.
    Failed { message: String },
}

/// What [`finish_upload`](crate::manager::SyncManager::finish_upload) did per item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub confirmed: Vec<ItemId>,
    pub rejected: Vec<ItemId>,
    pub failed: Vec<ItemId>,
    /// Pending downloads merged right after confirmation.
    pub merged: Vec<(ItemId, MergeOutcome)>,
    /// Confirmed items whose pending merge waits for an edit lock.
    pub deferred: Vec<ItemId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_are_exclusive_until_the_batch_drops() {
        let locks = UploadLocks::new();
        let first = locks.claim([ItemId::new(1), ItemId::new(2)]);
        assert_eq!(first, vec![ItemId::new(1), ItemId::new(2)]);
        assert_eq!(locks.claim([ItemId::new(2), ItemId::new(3)]), vec![ItemId::new(3)]);

        let batch = UploadBatch::new(
            vec![UploadItem {
                item: ItemId::new(1),
                connection: None,
                values: AttributeMap::new(),
            }],
            locks.clone(),
        );
        assert!(locks.is_locked(ItemId::new(1)));
        drop(batch);
        assert!(!locks.is_locked(ItemId::new(1)));
        assert!(locks.is_locked(ItemId::new(2)));
    }

    #[test]
    fn results_parse_from_json() {
        let parsed: UploadResult =
            serde_json::from_str(r#"{"result":"rejected","reason":"workflow forbids"}"#)
                .expect("parse");
        assert_eq!(
            parsed,
            UploadResult::Rejected {
                reason: "workflow forbids".to_string()
            }
        );
    }
}
