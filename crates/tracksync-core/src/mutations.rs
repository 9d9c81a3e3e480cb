//! Built-in mutations for user edits, removal, discard and reconciliation.

use crate::commit::{Mutation, MutationContext, MutationOutcome};
use crate::diff::DiffEngine;
use crate::error::{Result, SyncError};
use crate::merge::Resolution;
use crate::model::item::{AttrId, AttributeMap, ItemId};

/// A user edit: set attribute values on the trunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetAttributes {
    pub values: AttributeMap,
}

impl SetAttributes {
    #[must_use]
    pub const fn new(values: AttributeMap) -> Self {
        Self { values }
    }
}

impl Mutation for SetAttributes {
    fn apply(&self, item: ItemId, ctx: &mut MutationContext<'_>) -> Result<MutationOutcome> {
        if let Some((attr, value)) = ctx.schema().first_invalid(&self.values) {
            return Err(SyncError::InvalidMutation {
                item,
                reason: format!("value {value} does not fit attribute {attr}"),
            });
        }

        let unchanged = {
            let record = ctx.item(item)?;
            let engine = DiffEngine::new(ctx.schema(), ctx.source());
            self.values.iter().all(|(attr, value)| {
                record
                    .trunk
                    .get(attr)
                    .is_some_and(|current| engine.values_equal(current, value))
            })
        };
        if unchanged {
            return Ok(MutationOutcome::not_applied("values already set"));
        }

        let now = ctx.now();
        let record = ctx.edit(item)?;
        for (attr, value) in self.values.iter() {
            record.trunk.set(attr.clone(), value.clone());
        }
        record.edited_at = Some(now);
        Ok(MutationOutcome::Applied)
    }
}

/// Remove attributes from the trunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsetAttributes {
    pub attrs: Vec<AttrId>,
}

impl Mutation for UnsetAttributes {
    fn apply(&self, item: ItemId, ctx: &mut MutationContext<'_>) -> Result<MutationOutcome> {
        let now = ctx.now();
        let record = ctx.edit(item)?;
        let removed = self
            .attrs
            .iter()
            .filter(|attr| record.trunk.remove(attr).is_some())
            .count();
        if removed == 0 {
            return Ok(MutationOutcome::not_applied("attributes not set"));
        }
        record.edited_at = Some(now);
        Ok(MutationOutcome::Applied)
    }
}

/// Revert an item and its slaves to the last server value.
///
/// Items that were never synced are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Discard;

impl Mutation for Discard {
    fn apply(&self, item: ItemId, ctx: &mut MutationContext<'_>) -> Result<MutationOutcome> {
        if ctx.discard(item)?.is_empty() {
            Ok(MutationOutcome::not_applied("nothing to discard"))
        } else {
            Ok(MutationOutcome::Applied)
        }
    }
}

/// Delete an item together with its slave subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Remove;

impl Mutation for Remove {
    fn apply(&self, item: ItemId, ctx: &mut MutationContext<'_>) -> Result<MutationOutcome> {
        ctx.clear_subtree(item)?;
        Ok(MutationOutcome::Applied)
    }
}

/// Settle a conflict by explicit choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconcile(pub Resolution);

impl Mutation for Reconcile {
    fn apply(&self, item: ItemId, ctx: &mut MutationContext<'_>) -> Result<MutationOutcome> {
        if ctx.reconcile(item, self.0)? {
            Ok(MutationOutcome::Applied)
        } else {
            Ok(MutationOutcome::not_applied("no conflict to reconcile"))
        }
    }
}
