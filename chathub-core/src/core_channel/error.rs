//! Error types surfaced by the channel hierarchy

use super::storage::StoreError;
use super::types::ChannelId;
use thiserror::Error;

/// Errors returned by [`ChannelManager`](super::ChannelManager) operations
///
/// Validation variants are terminal per call and never retried; callers map
/// them to user-facing messages.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not found")]
    NotFound,

    #[error("Invalid channel name")]
    InvalidName,

    #[error("Channel name conflicts with an existing sibling")]
    NameConflict,

    #[error("Invalid parent channel")]
    InvalidParent,

    #[error("Channel is archived")]
    Archived,

    #[error("Channel hierarchy is too deep")]
    TooDeep,

    #[error("Not a public channel")]
    InvalidChannel,

    #[error("Channel has forced notification")]
    ForcedNotification,

    #[error("Failed to {op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Failed to build channel tree: {0}")]
    Bootstrap(#[from] TreeError),

    #[error("Lock poisoned: a thread panicked while mutating the channel tree")]
    Poisoned,
}

impl ChannelError {
    /// Wrap a store failure with the name of the operation that issued it
    pub fn store(op: &'static str) -> impl FnOnce(StoreError) -> ChannelError {
        move |source| ChannelError::Store { op, source }
    }

    /// Whether this is a validation outcome rather than an infrastructure failure
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            ChannelError::Store { .. } | ChannelError::Bootstrap(_) | ChannelError::Poisoned
        )
    }
}

/// Structural inconsistencies detected by the in-memory tree
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("Channel {0} is not in the tree")]
    UnknownChannel(ChannelId),

    #[error("Parent {parent} of channel {child} is not in the tree")]
    UnknownParent { child: ChannelId, parent: ChannelId },

    #[error("Channel {0} is already in the tree")]
    DuplicateChannel(ChannelId),

    #[error("Channel {0} is part of a parent cycle")]
    Cycle(ChannelId),
}
