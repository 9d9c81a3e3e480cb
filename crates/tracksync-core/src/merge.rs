//! Auto-merge, reconciliation and the other shadow-moving algorithms.
//!
//! Every function here runs inside an open [`WriteTxn`] and touches exactly
//! the items it is given. Callers are responsible for lock checks: nothing in
//! this module consults the edit-lock table.
//!
//! The merge of one item, with `local = diff(trunk, base)` and `server` the
//! pending download (or the retained conflict):
//!
//! 1. no local edits: trunk takes the server value, base := server, all
//!    pending shadows are dropped;
//! 2. a fresh download whose changes do not overlap the local edits: the
//!    server changes are copied into trunk and base := server, the local edits
//!    stay unsynced;
//! 3. otherwise the [`ConflictPolicy`] decides; without a decision the server
//!    value is retained as the conflict shadow and trunk is left alone.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::diff::DiffEngine;
use crate::error::{Result, SyncError};
use crate::model::item::{AttrId, AttributeMap, ConnectionId, ItemId, ItemRecord, ShadowKind};
use crate::model::schema::Schema;
use crate::shadow;
use crate::slaves;
use crate::store::{ItemSource, WriteTxn};

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Keep the local value of every overlapping attribute; take the rest from the server.
    KeepLocal,
    /// Drop every local edit and take the server value.
    TakeServer,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::KeepLocal => "keep-local",
            Self::TakeServer => "take-server",
        })
    }
}

/// Everything a policy may look at when asked to settle a conflict.
#[derive(Debug)]
pub struct ConflictContext<'a> {
    pub record: &'a ItemRecord,
    pub server: &'a AttributeMap,
    pub overlap: &'a BTreeSet<AttrId>,
    pub now: DateTime<Utc>,
}

/// Pluggable automatic conflict resolution.
pub trait ConflictPolicy: Send + Sync + fmt::Debug {
    /// `None` leaves the item conflicted for the user.
    fn resolve(&self, conflict: &ConflictContext<'_>) -> Option<Resolution>;
}

/// Policies selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuiltinPolicy {
    /// Never resolve automatically.
    #[default]
    Manual,
    ServerWins,
    LocalWins,
    /// The server wins when the last local edit is older than the given age.
    ServerWinsAfter(TimeDelta),
}

impl ConflictPolicy for BuiltinPolicy {
    fn resolve(&self, conflict: &ConflictContext<'_>) -> Option<Resolution> {
        match self {
            Self::Manual => None,
            Self::ServerWins => Some(Resolution::TakeServer),
            Self::LocalWins => Some(Resolution::KeepLocal),
            Self::ServerWinsAfter(age) => conflict
                .record
                .edited_at
                .filter(|edited| conflict.now.signed_duration_since(*edited) >= *age)
                .map(|_| Resolution::TakeServer),
        }
    }
}

/// Result of [`auto_merge`] for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeOutcome {
    /// Nothing pending from the server.
    UpToDate,
    /// No local edits; the server value was taken as is.
    FastForward,
    /// Server edits merged beside non-overlapping local edits.
    Merged,
    /// Overlapping edits; the server value is retained as the conflict shadow.
    Conflicted,
    /// The conflict policy settled the overlap.
    AutoResolved(Resolution),
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => f.write_str("up-to-date"),
            Self::FastForward => f.write_str("fast-forward"),
            Self::Merged => f.write_str("merged"),
            Self::Conflicted => f.write_str("conflicted"),
            Self::AutoResolved(resolution) => write!(f, "auto-resolved ({resolution})"),
        }
    }
}

/// Server view of one item as delivered by a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerItem {
    pub id: ItemId,
    #[serde(default)]
    pub connection: Option<ConnectionId>,
    #[serde(default)]
    pub parent: Option<ItemId>,
    pub values: AttributeMap,
}

/// One entry of a download batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Downloaded {
    Updated(ServerItem),
    Removed { id: ItemId },
}

impl Downloaded {
    #[must_use]
    pub const fn id(&self) -> ItemId {
        match self {
            Self::Updated(item) => item.id,
            Self::Removed { id } => *id,
        }
    }
}

/// Whether [`write_download`] created the item or staged a download shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadWrite {
    Created,
    Staged,
}

fn pending_server(record: &ItemRecord) -> Option<(AttributeMap, bool)> {
    match (&record.download, &record.conflict) {
        (Some(download), _) => Some((download.clone(), true)),
        (None, Some(conflict)) => Some((conflict.clone(), false)),
        (None, None) => None,
    }
}

fn take_server(record: &mut ItemRecord, server: &AttributeMap, schema: &Schema) {
    record.trunk = shadow::trunk_from_server(&record.trunk, server, schema);
    record.base = Some(schema.shadowable_part(server));
    record.conflict = None;
    record.download = None;
}

fn keep_local(
    record: &mut ItemRecord,
    server: &AttributeMap,
    remote: &BTreeSet<AttrId>,
    overlap: &BTreeSet<AttrId>,
    schema: &Schema,
) {
    for attr in remote.difference(overlap) {
        record.trunk.put(attr.clone(), server.get(attr).cloned());
    }
    record.base = Some(schema.shadowable_part(server));
    record.conflict = None;
    record.download = None;
}

struct Divergence {
    local: BTreeSet<AttrId>,
    remote: BTreeSet<AttrId>,
    overlap: BTreeSet<AttrId>,
}

fn divergence(
    txn: &WriteTxn,
    schema: &Schema,
    record: &ItemRecord,
    server: &AttributeMap,
) -> Divergence {
    let engine = DiffEngine::new(schema, txn);
    let (local, remote) = if record.base.is_some() {
        (engine.local_changes(record), engine.server_changes(record, server))
    } else {
        // Never synced: every trunk value is a local edit.
        let nothing = AttributeMap::new();
        (
            engine.diff(Some(&record.trunk), Some(&nothing)),
            engine.diff(Some(server), Some(&nothing)),
        )
    };
    let overlap = local.intersection(&remote).cloned().collect();
    Divergence {
        local,
        remote,
        overlap,
    }
}

fn record_mut(txn: &mut WriteTxn, item: ItemId) -> Result<&mut ItemRecord> {
    txn.get_mut(item).ok_or(SyncError::ItemNotFound(item))
}

/// Merge the pending server value of `item` into its trunk.
///
/// Running it twice has the same effect as running it once.
///
/// # Errors
///
/// Returns [`SyncError::ItemNotFound`] if the item does not exist.
pub fn auto_merge(
    txn: &mut WriteTxn,
    schema: &Schema,
    policy: &dyn ConflictPolicy,
    item: ItemId,
    now: DateTime<Utc>,
) -> Result<MergeOutcome> {
    let record = txn.get(item).cloned().ok_or(SyncError::ItemNotFound(item))?;
    let Some((server, fresh)) = pending_server(&record) else {
        return Ok(MergeOutcome::UpToDate);
    };
    let split = divergence(txn, schema, &record, &server);

    if split.local.is_empty() {
        take_server(record_mut(txn, item)?, &server, schema);
        debug!(item = %item, "fast-forward to server value");
        return Ok(MergeOutcome::FastForward);
    }

    if fresh && split.overlap.is_empty() {
        keep_local(record_mut(txn, item)?, &server, &split.remote, &split.overlap, schema);
        debug!(
            item = %item,
            server_changes = split.remote.len(),
            local_changes = split.local.len(),
            "merged server changes beside local edits"
        );
        return Ok(MergeOutcome::Merged);
    }

    let decision = policy.resolve(&ConflictContext {
        record: &record,
        server: &server,
        overlap: &split.overlap,
        now,
    });
    let target = record_mut(txn, item)?;
    match decision {
        None => {
            if fresh {
                target.conflict = Some(server);
                target.download = None;
                info!(
                    item = %item,
                    overlap = split.overlap.len(),
                    "conflicting edits; server value kept as conflict"
                );
            }
            Ok(MergeOutcome::Conflicted)
        }
        Some(Resolution::TakeServer) => {
            take_server(target, &server, schema);
            info!(item = %item, "conflict auto-resolved: server wins");
            Ok(MergeOutcome::AutoResolved(Resolution::TakeServer))
        }
        Some(Resolution::KeepLocal) => {
            keep_local(target, &server, &split.remote, &split.overlap, schema);
            info!(item = %item, "conflict auto-resolved: local wins");
            Ok(MergeOutcome::AutoResolved(Resolution::KeepLocal))
        }
    }
}

/// Settle a conflict by explicit user choice.
///
/// Returns `false` when the item has nothing to reconcile.
///
/// # Errors
///
/// Returns [`SyncError::ItemNotFound`] if the item does not exist.
pub fn reconcile(
    txn: &mut WriteTxn,
    schema: &Schema,
    item: ItemId,
    resolution: Resolution,
) -> Result<bool> {
    let record = txn.get(item).cloned().ok_or(SyncError::ItemNotFound(item))?;
    let Some((server, _)) = pending_server(&record) else {
        return Ok(false);
    };
    let split = divergence(txn, schema, &record, &server);

    let target = record_mut(txn, item)?;
    match resolution {
        Resolution::TakeServer => take_server(target, &server, schema),
        Resolution::KeepLocal => keep_local(target, &server, &split.remote, &split.overlap, schema),
    }
    info!(item = %item, resolution = %resolution, "conflict reconciled");
    Ok(true)
}

/// Drop local edits of `item` and its slaves.
///
/// Never-synced items are deleted together with their subtree; the others
/// revert to their last server value. Returns the ids that changed.
///
/// # Errors
///
/// Returns [`SyncError::ItemNotFound`] if `item` does not exist.
pub fn discard_local(txn: &mut WriteTxn, schema: &Schema, item: ItemId) -> Result<Vec<ItemId>> {
    if !txn.contains(item) {
        return Err(SyncError::ItemNotFound(item));
    }

    let mut changed = Vec::new();
    for id in slaves::subtree(&*txn, item) {
        let Some(record) = txn.get(id).cloned() else {
            continue;
        };
        let Some(server) = record.last_server().cloned() else {
            changed.extend(slaves::clear_subtree(txn, id));
            continue;
        };

        let mut reverted = record.clone();
        take_server(&mut reverted, &server, schema);
        reverted.edited_at = None;
        if reverted != record {
            txn.insert(reverted);
            changed.push(id);
        }
    }

    if !changed.is_empty() {
        info!(item = %item, changed = changed.len(), "local edits discarded");
    }
    Ok(changed)
}

/// Record a confirmed upload: base becomes the value that was sent.
///
/// # Errors
///
/// Returns [`SyncError::ItemNotFound`] if the item was removed meanwhile.
pub fn confirm_upload(
    txn: &mut WriteTxn,
    schema: &Schema,
    item: ItemId,
    uploaded: &AttributeMap,
) -> Result<()> {
    let record = record_mut(txn, item)?;
    record.base = Some(schema.shadowable_part(uploaded));
    debug!(item = %item, "upload confirmed");
    Ok(())
}

/// Store a downloaded server value.
///
/// Unknown items are created with trunk = base = server value. Known items
/// get the value staged in their download shadow for [`auto_merge`].
pub fn write_download(txn: &mut WriteTxn, schema: &Schema, server: &ServerItem) -> DownloadWrite {
    match txn.get_mut(server.id) {
        Some(record) => {
            shadow::write_shadow(record, schema, ShadowKind::Download, Some(&server.values));
            if server.connection.is_some() {
                record.connection.clone_from(&server.connection);
            }
            if server.parent.is_some() {
                record.parent = server.parent;
            }
            DownloadWrite::Staged
        }
        None => {
            let mut record = ItemRecord::new_local(
                server.id,
                server.connection.clone(),
                server.parent,
                server.values.clone(),
            );
            shadow::write_shadow(&mut record, schema, ShadowKind::Base, Some(&server.values));
            txn.insert(record);
            DownloadWrite::Created
        }
    }
}

/// Whether `item` holds anything the server does not know: a never-synced
/// item, unsynced edits or an unresolved conflict.
pub fn has_local_state<S: ItemSource + ?Sized>(
    source: &S,
    schema: &Schema,
    item: ItemId,
) -> bool {
    source.item(item).is_some_and(|record| {
        record.base.is_none()
            || record.conflict.is_some()
            || !DiffEngine::new(schema, source).local_changes(record).is_empty()
    })
}
