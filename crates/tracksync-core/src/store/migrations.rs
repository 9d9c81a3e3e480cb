//! SQLite schema migrations for the item store.

use rusqlite::{Connection, types::Type};

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 3;

/// Items are stored as one JSON document per row. `parent_id` is duplicated
/// out of the document so that subtree queries can use an index.
const MIGRATION_V1_SQL: &str = "
CREATE TABLE IF NOT EXISTS items (
    item_id     INTEGER PRIMARY KEY,
    parent_id   INTEGER,
    record_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_parent ON items(parent_id);

CREATE TABLE IF NOT EXISTS store_meta (
    id             INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    commit_seq     INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (id, schema_version, commit_seq) VALUES (1, 0, 0);
";

const MIGRATION_V2_SQL: &str = "
ALTER TABLE items ADD COLUMN connection TEXT;

CREATE INDEX IF NOT EXISTS idx_items_connection ON items(connection);
";

/// Item ids are never reused, so the id high-water mark outlives deletions.
const MIGRATION_V3_SQL: &str = "
ALTER TABLE store_meta ADD COLUMN next_item_id INTEGER NOT NULL DEFAULT 0;

UPDATE store_meta
SET next_item_id = (SELECT COALESCE(MAX(item_id), 0) + 1 FROM items)
WHERE id = 1;
";

const MIGRATIONS: &[(u32, &str)] = &[
    (1, MIGRATION_V1_SQL),
    (2, MIGRATION_V2_SQL),
    (3, MIGRATION_V3_SQL),
];

/// Indexes every fully migrated store must have.
pub const REQUIRED_INDEXES: &[&str] = &["idx_items_parent", "idx_items_connection"];

/// Read `PRAGMA user_version` and convert it to a Rust `u32`.
///
/// # Errors
///
/// Returns an error if querying SQLite fails or the version value cannot be
/// represented as `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply all pending migrations in ascending order.
///
/// Each migration runs only when its version is above `user_version`, inside
/// its own transaction.
///
/// # Errors
///
/// Returns an error if any migration fails.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.execute(
            "UPDATE store_meta SET schema_version = ?1 WHERE id = 1",
            [i64::from(*version)],
        )?;
        tx.commit()?;
        current = *version;
    }

    Ok(current)
}
