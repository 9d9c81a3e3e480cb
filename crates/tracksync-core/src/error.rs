use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::lock::LockId;
use crate::model::item::{ConnectionId, ItemId};

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    ItemNotFound,
    InvalidStateTransition,
    InvalidMutation,
    CorruptStore,
    StoreWriteFailed,
    LockContention,
    LockNotHeld,
    NotInLockScope,
    StoreLockTimeout,
    RemoteFailure,
    Cancelled,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1002",
            Self::ItemNotFound => "E2001",
            Self::InvalidStateTransition => "E2002",
            Self::InvalidMutation => "E2006",
            Self::CorruptStore => "E3003",
            Self::StoreWriteFailed => "E5001",
            Self::LockContention => "E5002",
            Self::LockNotHeld => "E5003",
            Self::NotInLockScope => "E5004",
            Self::StoreLockTimeout => "E5005",
            Self::RemoteFailure => "E6001",
            Self::Cancelled => "E9002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::ItemNotFound => "Item not found",
            Self::InvalidStateTransition => "Invalid sync state transition",
            Self::InvalidMutation => "Mutation cannot be applied",
            Self::CorruptStore => "Corrupt item store",
            Self::StoreWriteFailed => "Item store write failed",
            Self::LockContention => "Edit lock contention",
            Self::LockNotHeld => "Edit lock no longer held",
            Self::NotInLockScope => "Item outside edit lock scope",
            Self::StoreLockTimeout => "Store lock timed out",
            Self::RemoteFailure => "Remote server request failed",
            Self::Cancelled => "Operation cancelled",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .tracksync/config.toml and retry."),
            Self::ItemNotFound | Self::Cancelled => None,
            Self::InvalidStateTransition => {
                Some("Reconcile the conflict or wait for the pending upload to finish.")
            }
            Self::InvalidMutation => Some("Check the attribute values and item hierarchy."),
            Self::CorruptStore => {
                Some("Restore the item store from the server with a full download.")
            }
            Self::StoreWriteFailed => Some("Check disk space and write permissions, then retry."),
            Self::LockContention => Some("Retry after the other editor releases the item."),
            Self::LockNotHeld => Some("Prepare the edit again; the previous lock was released."),
            Self::NotInLockScope => Some("Include the item in the edit lock before changing it."),
            Self::StoreLockTimeout => {
                Some("Retry after the other `tsync` process releases the store.")
            }
            Self::RemoteFailure => Some("Check the connection and retry the sync."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors produced by the synchronization core.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The governing lifetime ended or the caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    #[error("item {item} is locked by edit lock {holder}")]
    LockContention { item: ItemId, holder: LockId },

    #[error("edit lock {lock} is no longer held")]
    LockNotHeld { lock: LockId },

    #[error("item {item} is not covered by edit lock {lock}")]
    NotInLockScope { item: ItemId, lock: LockId },

    #[error("item {0} not found")]
    ItemNotFound(ItemId),

    #[error("cannot change item {item}: {reason}")]
    InvalidMutation { item: ItemId, reason: String },

    /// The store refused or failed to persist a transaction. Nothing was written.
    #[error("durable write failed: {0}")]
    WriteFailed(String),

    #[error("item store is corrupt: {0}")]
    CorruptStore(String),

    #[error("store lock timed out after {waited:?} at {}", path.display())]
    StoreLockTimeout { path: PathBuf, waited: Duration },

    #[error("connection {connection} failed: {message}")]
    Remote {
        connection: ConnectionId,
        message: String,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Cancelled => ErrorCode::Cancelled,
            Self::LockContention { .. } => ErrorCode::LockContention,
            Self::LockNotHeld { .. } => ErrorCode::LockNotHeld,
            Self::NotInLockScope { .. } => ErrorCode::NotInLockScope,
            Self::ItemNotFound(_) => ErrorCode::ItemNotFound,
            Self::InvalidMutation { .. } => ErrorCode::InvalidMutation,
            Self::WriteFailed(_) | Self::Sqlite(_) | Self::Io(_) => ErrorCode::StoreWriteFailed,
            Self::CorruptStore(_) | Self::Serialization(_) => ErrorCode::CorruptStore,
            Self::StoreLockTimeout { .. } => ErrorCode::StoreLockTimeout,
            Self::Remote { .. } => ErrorCode::RemoteFailure,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Cancellation is a benign terminal outcome, never a sync problem.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when nothing could be persisted and the caller has to retry.
    #[must_use]
    pub const fn is_durable_failure(&self) -> bool {
        matches!(self, Self::WriteFailed(_) | Self::Sqlite(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::{ErrorCode, SyncError};
    use crate::lock::LockId;
    use crate::model::item::ItemId;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::ConfigParseError,
            ErrorCode::ItemNotFound,
            ErrorCode::InvalidStateTransition,
            ErrorCode::InvalidMutation,
            ErrorCode::CorruptStore,
            ErrorCode::StoreWriteFailed,
            ErrorCode::LockContention,
            ErrorCode::LockNotHeld,
            ErrorCode::NotInLockScope,
            ErrorCode::StoreLockTimeout,
            ErrorCode::RemoteFailure,
            ErrorCode::Cancelled,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::LockContention.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn contention_maps_to_machine_code() {
        let err = SyncError::LockContention {
            item: ItemId::new(42),
            holder: LockId::new(7),
        };
        assert_eq!(err.code(), ErrorCode::LockContention);
        assert!(err.hint().is_some());
        assert_eq!(err.to_string(), "item 42 is locked by edit lock L7");
    }

    #[test]
    fn cancellation_is_not_a_durable_failure() {
        assert!(SyncError::Cancelled.is_cancelled());
        assert!(!SyncError::Cancelled.is_durable_failure());
        assert!(SyncError::WriteFailed("disk full".into()).is_durable_failure());
    }
}
