use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::diff::DiffEngine;
use crate::model::item::{ItemRecord, ParseEnumError};
use crate::store::ItemSource;

/// Synchronization state of one item, derived from its record and the lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    Clean,
    LocalDirty,
    DownloadPending,
    Conflicted,
    Locked,
    Removed,
}

impl SyncState {
    pub const ALL: [Self; 6] = [
        Self::Clean,
        Self::LocalDirty,
        Self::DownloadPending,
        Self::Conflicted,
        Self::Locked,
        Self::Removed,
    ];

    const fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::LocalDirty => "local-dirty",
            Self::DownloadPending => "download-pending",
            Self::Conflicted => "conflicted",
            Self::Locked => "locked",
            Self::Removed => "removed",
        }
    }

    /// Whether the item needs an upload before it is in sync.
    #[must_use]
    pub const fn needs_upload(self) -> bool {
        matches!(self, Self::LocalDirty)
    }

    /// Validate whether an observed change from `self` to `target` is allowed.
    ///
    /// Download, diff and merge run in one write transaction, so collapsed
    /// transitions through `DownloadPending` (for example `Clean -> Conflicted`)
    /// are valid as well. Every state may become `Locked` or `Removed`, and a
    /// released lock may reveal any state.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for any other change, including no-ops.
    pub fn can_transition_to(&self, target: Self) -> Result<(), InvalidTransition> {
        if *self == target {
            return Err(InvalidTransition {
                from: *self,
                to: target,
                reason: "no-op transition is not allowed",
            });
        }

        let allowed = matches!(
            (*self, target),
            (_, Self::Locked | Self::Removed)
                | (Self::Locked, _)
                | (Self::Removed, Self::Clean | Self::LocalDirty)
                | (Self::Clean, Self::LocalDirty | Self::DownloadPending | Self::Conflicted)
                | (
                    Self::LocalDirty,
                    Self::Clean | Self::DownloadPending | Self::Conflicted
                )
                | (
                    Self::DownloadPending,
                    Self::Clean | Self::LocalDirty | Self::Conflicted
                )
                | (Self::Conflicted, Self::Clean | Self::LocalDirty)
        );

        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: *self,
                to: target,
                reason: "transition not allowed by sync rules",
            })
        }
    }
}

/// Derive the state of an item.
///
/// Precedence: removed, locked, conflicted, download pending, local dirty
/// (new item or trunk differs from base), clean.
pub fn classify<S: ItemSource + ?Sized>(
    record: Option<&ItemRecord>,
    locked: bool,
    engine: &DiffEngine<'_, S>,
) -> SyncState {
    let Some(record) = record else {
        return SyncState::Removed;
    };
    if locked {
        SyncState::Locked
    } else if record.conflict.is_some() {
        SyncState::Conflicted
    } else if record.download.is_some() {
        SyncState::DownloadPending
    } else if record.is_new() || !engine.local_changes(record).is_empty() {
        SyncState::LocalDirty
    } else {
        SyncState::Clean
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| ParseEnumError {
                expected: "sync state",
                got: s.to_string(),
            })
    }
}

/// Error returned when an observed state change is not valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SyncState,
    pub to: SyncState,
    pub reason: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid sync transition {} -> {}: {}",
            self.from, self.to, self.reason
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::item::{AttributeMap, ItemId};
    use crate::model::schema::Schema;
    use crate::store::Snapshot;

    #[test]
    fn sync_transitions_follow_the_table() {
        assert!(SyncState::Clean.can_transition_to(SyncState::LocalDirty).is_ok());
        assert!(SyncState::LocalDirty.can_transition_to(SyncState::Clean).is_ok());
        assert!(SyncState::DownloadPending.can_transition_to(SyncState::Conflicted).is_ok());
        assert!(SyncState::Conflicted.can_transition_to(SyncState::LocalDirty).is_ok());
        assert!(SyncState::Clean.can_transition_to(SyncState::Locked).is_ok());
        assert!(SyncState::Locked.can_transition_to(SyncState::Conflicted).is_ok());

        assert!(matches!(
            SyncState::Conflicted.can_transition_to(SyncState::DownloadPending),
            Err(InvalidTransition {
                from: SyncState::Conflicted,
                to: SyncState::DownloadPending,
                ..
            })
        ));
        assert!(SyncState::Removed.can_transition_to(SyncState::Conflicted).is_err());
        assert!(SyncState::Clean.can_transition_to(SyncState::Clean).is_err());
    }

    #[test]
    fn classify_follows_precedence() {
        let schema = Schema::new();
        let snapshot = Snapshot::empty();
        let engine = DiffEngine::new(&schema, &snapshot);

        let open = AttributeMap::new().with("status", "open");
        let mut record = ItemRecord::new_local(ItemId::new(1), None, None, open.clone());
        assert_eq!(classify(None, false, &engine), SyncState::Removed);
        assert_eq!(classify(Some(&record), false, &engine), SyncState::LocalDirty);

        record.base = Some(open.clone());
        assert_eq!(classify(Some(&record), false, &engine), SyncState::Clean);
        assert_eq!(classify(Some(&record), true, &engine), SyncState::Locked);

        record.trunk.set("status", "closed");
        assert_eq!(classify(Some(&record), false, &engine), SyncState::LocalDirty);

        record.download = Some(open.clone());
        assert_eq!(classify(Some(&record), false, &engine), SyncState::DownloadPending);

        record.conflict = Some(open);
        assert_eq!(classify(Some(&record), false, &engine), SyncState::Conflicted);
    }

    #[test]
    fn state_parses_from_display() {
        for state in SyncState::ALL {
            assert_eq!(state.to_string().parse::<SyncState>(), Ok(state));
        }
        assert_eq!("local_dirty".parse::<SyncState>(), Ok(SyncState::LocalDirty));
    }
}
