//! tracksync-core library.
//!
//! Client-side replica synchronization for offline tracker clients: shadow
//! versions per item, edit locks over slave subtrees, commit transactions with
//! per-item outcomes, auto-merge and the sync-problem registry.
//!
//! # Conventions
//!
//! - **Errors**: core operations return [`error::Result`]; configuration
//!   loading uses `anyhow::Result`.
//! - **Logging**: use `tracing` macros with structured fields
//!   (`item = %id`, `lock = %lock_id`, `commit`).

pub mod cancel;
pub mod commit;
pub mod config;
pub mod connection;
pub mod diff;
pub mod error;
pub mod lock;
pub mod manager;
pub mod merge;
pub mod model;
pub mod mutations;
pub mod problems;
pub mod shadow;
pub mod slaves;
pub mod state;
pub mod store;
pub mod upload;

pub use cancel::CancelToken;
pub use error::{ErrorCode, Result, SyncError};
pub use manager::SyncManager;
