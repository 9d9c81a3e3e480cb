//! Connection seam: capability queries and sync entry points per remote server.
//!
//! Wire protocols live outside this crate. A [`Connection`] only answers
//! whether uploads are currently possible and accepts fire-and-forget
//! download/upload requests; results come back through
//! [`SyncManager::write_downloaded`](crate::manager::SyncManager::write_downloaded)
//! and [`SyncManager::finish_upload`](crate::manager::SyncManager::finish_upload).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::{Result, SyncError};
use crate::model::item::{ConnectionId, ItemId};

pub trait Connection: Send + Sync {
    fn id(&self) -> &ConnectionId;

    fn is_upload_allowed(&self) -> bool;

    /// A degraded connection accepts downloads but no uploads.
    fn is_degraded(&self) -> bool {
        false
    }

    /// Ask the remote side for fresh values of `items`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Remote`] if the request could not be queued.
    fn request_download(&self, items: &[ItemId]) -> Result<()>;

    /// Ask the remote side to send `items`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Remote`] if the request could not be queued.
    fn request_upload(&self, items: &[ItemId]) -> Result<()>;
}

/// Known connections by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Arc<dyn Connection>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<dyn Connection>) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.id().clone(), connection);
    }

    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<dyn Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Direction of a recorded [`StaticConnection`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Download,
    Upload,
}

/// Connection with switchable capabilities that records requests instead of
/// sending them. Backs the CLI and tests.
#[derive(Debug)]
pub struct StaticConnection {
    id: ConnectionId,
    upload_allowed: AtomicBool,
    degraded: AtomicBool,
    offline: AtomicBool,
    requests: Mutex<Vec<(RequestKind, Vec<ItemId>)>>,
}

impl StaticConnection {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::new(id),
            upload_allowed: AtomicBool::new(true),
            degraded: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_upload_allowed(&self, allowed: bool) {
        self.upload_allowed.store(allowed, Ordering::Release);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Release);
    }

    /// While offline every request fails with a remote error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    #[must_use]
    pub fn requests(&self) -> Vec<(RequestKind, Vec<ItemId>)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, kind: RequestKind, items: &[ItemId]) -> Result<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(SyncError::Remote {
                connection: self.id.clone(),
                message: "server unreachable".to_string(),
            });
        }
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, items.to_vec()));
        Ok(())
    }
}

impl Connection for StaticConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_upload_allowed(&self) -> bool {
        self.upload_allowed.load(Ordering::Acquire)
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn request_download(&self, items: &[ItemId]) -> Result<()> {
        self.push(RequestKind::Download, items)
    }

    fn request_upload(&self, items: &[ItemId]) -> Result<()> {
        self.push(RequestKind::Upload, items)
    }
}
