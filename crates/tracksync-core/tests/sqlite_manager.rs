//! `SyncManager` over the SQLite store opened from project configuration.

use tempfile::TempDir;
use tracksync_core::commit::NewItem;
use tracksync_core::config::SyncConfig;
use tracksync_core::merge::{Downloaded, ServerItem};
use tracksync_core::model::{AttrId, AttributeMap, ConnectionId, ItemId};
use tracksync_core::mutations::SetAttributes;
use tracksync_core::state::SyncState;
use tracksync_core::{CancelToken, ErrorCode, SyncManager};

fn project() -> (TempDir, SyncConfig) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = SyncConfig::default();
    config.store.lock_timeout_ms = 50;
    config.schema.derived = vec!["summary_html".to_string()];
    (dir, config)
}

#[test]
fn state_survives_reopen() {
    let (dir, config) = project();
    let cancel = CancelToken::new();

    let created = {
        let manager = SyncManager::open(dir.path(), &config).expect("open");
        let outcome = manager
            .create(
                NewItem {
                    connection: Some(ConnectionId::new("jira")),
                    values: AttributeMap::new().with("status", "open"),
                    ..NewItem::default()
                },
                &cancel,
            )
            .expect("create");
        let created = outcome.created[0];

        manager
            .write_downloaded(
                &[Downloaded::Updated(ServerItem {
                    id: ItemId::new(100),
                    connection: Some(ConnectionId::new("jira")),
                    parent: None,
                    values: AttributeMap::new()
                        .with("status", "open")
                        .with("summary_html", "<p>x</p>"),
                })],
                &cancel,
            )
            .expect("download");
        manager
            .commit_edit(
                ItemId::new(100),
                SetAttributes::new(AttributeMap::new().with("status", "closed")),
                &cancel,
            )
            .expect("edit");
        created
    };

    let manager = SyncManager::open(dir.path(), &config).expect("reopen");
    assert_eq!(manager.state(created).expect("state"), SyncState::LocalDirty);
    assert_eq!(manager.state(ItemId::new(100)).expect("state"), SyncState::LocalDirty);

    let snapshot = manager.snapshot().expect("snapshot");
    let downloaded = snapshot.get(ItemId::new(100)).expect("downloaded item");
    assert_eq!(downloaded.trunk.get(&AttrId::from("status")), Some(&"closed".into()));
    let base = downloaded.base.as_ref().expect("base");
    assert!(!base.contains(&AttrId::from("summary_html")));
}

#[test]
fn second_manager_on_the_same_project_times_out() {
    let (dir, config) = project();
    let _first = SyncManager::open(dir.path(), &config).expect("open");

    let err = SyncManager::open(dir.path(), &config)
        .err()
        .expect("store is held by the first manager");
    assert_eq!(err.code(), ErrorCode::StoreLockTimeout);
}
