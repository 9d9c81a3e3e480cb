//! SQLite-backed item store.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so readers in other processes never block the writer
//! - `busy_timeout = 5s` to ride out transient lock failures
//! - an exclusive advisory lock file beside the database for the store's lifetime
//!
//! The full item set is loaded once at open and kept as the current
//! [`Snapshot`]. Each commit writes the changed rows and the commit counter in
//! one SQLite transaction, then swaps the snapshot.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use super::file_lock::StoreLock;
use super::{ChangeSet, CommitNotice, Notifier, Snapshot, Store, migrations};
use crate::error::{Result, SyncError};
use crate::model::item::{ItemId, ItemRecord};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
    state: RwLock<Snapshot>,
    notifier: Notifier,
    path: PathBuf,
    _lock: StoreLock,
}

impl SqliteStore {
    /// Open (or create) the store at `path`, migrate it and load every item.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StoreLockTimeout`] if another process holds the
    /// store, or an error if opening, migrating or decoding fails.
    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = StoreLock::acquire(&path.with_extension("lock"), lock_timeout)?;

        let mut conn = Connection::open(path)?;
        configure_connection(&conn)?;
        let version = migrations::migrate(&mut conn)?;
        let snapshot = load_snapshot(&conn)?;
        info!(
            path = %path.display(),
            schema_version = version,
            commit = snapshot.commit(),
            items = snapshot.len(),
            "opened item store"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            state: RwLock::new(snapshot),
            notifier: Notifier::default(),
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

fn load_snapshot(conn: &Connection) -> Result<Snapshot> {
    let (commit, next_id): (i64, i64) = conn
        .query_row(
            "SELECT commit_seq, next_item_id FROM store_meta WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .unwrap_or((0, 0));
    let commit = u64::try_from(commit)
        .map_err(|_| SyncError::CorruptStore(format!("negative commit counter {commit}")))?;
    let next_id = u64::try_from(next_id)
        .map_err(|_| SyncError::CorruptStore(format!("negative item id counter {next_id}")))?;

    let mut stmt = conn.prepare("SELECT item_id, record_json FROM items ORDER BY item_id")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

    let mut records = Vec::new();
    for row in rows {
        let (raw_id, json) = row?;
        let record: ItemRecord = serde_json::from_str(&json)?;
        if i64::try_from(record.id.get()).ok() != Some(raw_id) {
            return Err(SyncError::CorruptStore(format!(
                "row {raw_id} holds record for item {}",
                record.id
            )));
        }
        records.push(record);
    }

    Ok(Snapshot::from_records(commit, records).with_next_id(next_id))
}

fn sql_id(id: ItemId) -> Result<i64> {
    i64::try_from(id.get())
        .map_err(|_| SyncError::WriteFailed(format!("item id {id} exceeds storage range")))
}

fn persist(conn: &mut Connection, next: &Snapshot, changes: &ChangeSet) -> Result<()> {
    let tx = conn.transaction()?;
    for (id, write) in &changes.writes {
        match write {
            Some(record) => {
                let json = serde_json::to_string(record)?;
                let parent = record.parent.map(sql_id).transpose()?;
                let connection = record.connection.as_ref().map(|c| c.as_str().to_string());
                tx.execute(
                    "INSERT INTO items (item_id, parent_id, connection, record_json)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(item_id) DO UPDATE SET
                        parent_id = excluded.parent_id,
                        connection = excluded.connection,
                        record_json = excluded.record_json",
                    params![sql_id(*id)?, parent, connection, json],
                )?;
            }
            None => {
                tx.execute("DELETE FROM items WHERE item_id = ?1", params![sql_id(*id)?])?;
            }
        }
    }
    let commit = i64::try_from(next.commit())
        .map_err(|_| SyncError::WriteFailed("commit counter overflow".to_string()))?;
    tx.execute(
        "UPDATE store_meta SET commit_seq = ?1, next_item_id = ?2 WHERE id = 1",
        params![commit, sql_id(next.next_free_id())?],
    )?;
    tx.commit()?;
    Ok(())
}

impl Store for SqliteStore {
    fn snapshot(&self) -> Result<Snapshot> {
        Ok(self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn commit(&self, base_commit: u64, changes: &ChangeSet) -> Result<Snapshot> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot()?;
        if current.commit() != base_commit {
            return Err(SyncError::WriteFailed(format!(
                "stale base commit {base_commit}, store is at {}",
                current.commit()
            )));
        }

        let commit = base_commit + 1;
        let next = current.apply(changes, commit);
        persist(&mut conn, &next, changes).map_err(|err| match err {
            SyncError::Sqlite(inner) => SyncError::WriteFailed(inner.to_string()),
            other => other,
        })?;

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        drop(conn);

        debug!(commit, items = changes.len(), "persisted changes");
        self.notifier.notify(commit, changes);
        Ok(next)
    }

    fn subscribe(&self) -> Receiver<CommitNotice> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::item::{AttributeMap, ConnectionId};

    fn record(id: u64, parent: Option<u64>) -> ItemRecord {
        let mut record = ItemRecord::new_local(
            ItemId::new(id),
            Some(ConnectionId::new("jira")),
            parent.map(ItemId::new),
            AttributeMap::new().with("summary", format!("item {id}")),
        );
        record.base = Some(record.trunk.clone());
        record
    }

    #[test]
    fn open_sets_wal_and_busy_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("items.db"), Duration::from_millis(100))
            .expect("open store");
        let conn = store.conn.lock().expect("conn");

        let journal_mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("query journal_mode");
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

        let busy_timeout_ms: u64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("query busy_timeout");
        assert_eq!(u128::from(busy_timeout_ms), DEFAULT_BUSY_TIMEOUT.as_millis());
    }

    #[test]
    fn committed_items_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("items.db");
        {
            let store = SqliteStore::open(&path, Duration::from_millis(100)).expect("open");
            let mut changes = ChangeSet::default();
            changes.writes.insert(ItemId::new(1), Some(record(1, None)));
            changes.writes.insert(ItemId::new(2), Some(record(2, Some(1))));
            store.commit(0, &changes).expect("commit");

            let mut removal = ChangeSet::default();
            removal.writes.insert(ItemId::new(2), None);
            store.commit(1, &removal).expect("second commit");
        }

        let store = SqliteStore::open(&path, Duration::from_millis(100)).expect("reopen");
        let snapshot = store.snapshot().expect("snapshot");
        assert_eq!(snapshot.commit(), 2);
        assert_eq!(snapshot.get(ItemId::new(1)), Some(&record(1, None)));
        assert!(snapshot.get(ItemId::new(2)).is_none());
    }

    #[test]
    fn removed_item_ids_stay_used_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("items.db");
        {
            let store = SqliteStore::open(&path, Duration::from_millis(100)).expect("open");
            let mut changes = ChangeSet::default();
            changes.writes.insert(ItemId::new(1), Some(record(1, None)));
            changes.writes.insert(ItemId::new(2), Some(record(2, None)));
            store.commit(0, &changes).expect("commit");

            let mut removal = ChangeSet::default();
            removal.writes.insert(ItemId::new(2), None);
            removal.next_id = Some(5);
            store.commit(1, &removal).expect("second commit");
        }

        let store = SqliteStore::open(&path, Duration::from_millis(100)).expect("reopen");
        assert_eq!(store.snapshot().expect("snapshot").next_free_id(), ItemId::new(5));
    }

    #[test]
    fn second_open_of_the_same_store_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("items.db");
        let _first = SqliteStore::open(&path, Duration::from_millis(100)).expect("open");

        let Err(err) = SqliteStore::open(&path, Duration::from_millis(20)) else {
            panic!("second open must fail while the first holds the lock");
        };
        assert!(matches!(err, SyncError::StoreLockTimeout { .. }));
    }

    #[test]
    fn stale_commit_is_a_durable_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("items.db"), Duration::from_millis(100))
            .expect("open");
        let mut changes = ChangeSet::default();
        changes.writes.insert(ItemId::new(1), Some(record(1, None)));

        let err = store.commit(5, &changes).expect_err("stale base");
        assert!(err.is_durable_failure());
        assert!(store.snapshot().expect("snapshot").is_empty());
    }
}
