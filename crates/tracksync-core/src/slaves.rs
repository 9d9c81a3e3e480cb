//! Primary/slave hierarchy: an issue owns its comments, attachments and links.
//!
//! Locks, removal and discard always act on a whole subtree.

use std::collections::{BTreeSet, HashSet, VecDeque};

use crate::model::item::ItemId;
use crate::store::{ItemSource, WriteTxn};

/// `root` and all transitive slaves, in breadth-first order.
///
/// `root` is always the first element, even when it does not exist yet.
/// Cycles in the parent links terminate the walk.
pub fn subtree<S: ItemSource + ?Sized>(source: &S, root: ItemId) -> Vec<ItemId> {
    let mut visited: HashSet<ItemId> = HashSet::new();
    let mut queue: VecDeque<ItemId> = VecDeque::new();
    let mut result: Vec<ItemId> = Vec::new();

    queue.push_back(root);

    while let Some(current) = queue.pop_front() {
        if !visited.insert(current) {
            continue;
        }
        result.push(current);

        for child in source.children(current) {
            if !visited.contains(&child) {
                queue.push_back(child);
            }
        }
    }

    result
}

/// Union of the subtrees of `roots`.
pub fn subtrees<S: ItemSource + ?Sized>(source: &S, roots: &[ItemId]) -> BTreeSet<ItemId> {
    roots
        .iter()
        .flat_map(|root| subtree(source, *root))
        .collect()
}

/// Delete `root` with its whole subtree. Returns the deleted ids.
pub fn clear_subtree(txn: &mut WriteTxn, root: ItemId) -> Vec<ItemId> {
    subtree(&*txn, root)
        .into_iter()
        .filter(|id| txn.clear(*id).is_some())
        .collect()
}
