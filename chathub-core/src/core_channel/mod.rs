//! Channel Hierarchy
//!
//! Public channels form a forest below a root sentinel. This module keeps
//! that forest in memory, enforces its structural rules and writes every
//! change through to a persistent store.
//!
//! ## Architecture
//!
//! - **ChannelTree**: in-memory index of all public channels
//! - **ChannelManager**: sole writer of the tree; validates, persists, applies
//! - **AuditEmitter**: records channel events in the background
//! - **ChannelStore**: persistence seam (SQLite or in-memory)
//!
//! ## Rules
//!
//! 1. No channel is its own ancestor
//! 2. No channel sits deeper than the configured maximum depth
//! 3. Sibling names are unique (case-sensitive)
//! 4. Archiving a channel archives everything below it
//!
//! Direct-message channels live outside the tree and are keyed by their
//! unordered member pair.

pub mod audit;
pub mod channel;
pub mod error;
pub mod manager;
pub mod storage;
pub mod tree;
pub mod types;

pub use audit::AuditEmitter;
pub use channel::{
    is_valid_channel_name, Channel, ChannelEvent, ChannelEventKind, DmChannelMapping, EventDetail,
    SubscriptionLevel, UpdateChannelArgs,
};
pub use error::{ChannelError, TreeError};
pub use manager::ChannelManager;
pub use storage::{
    ChangeChannelSubscriptionArgs, ChannelStore, MemoryChannelStore, SqlChannelStore, StoreError,
    StoreResult, SubscriptionDiff,
};
pub use tree::{ChannelTree, PublicChannelTree};
pub use types::{ChannelId, Timestamp, UserId};
