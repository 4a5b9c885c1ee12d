//! Persistent channel store
//!
//! The hierarchy manager only talks to storage through [`ChannelStore`], which
//! has a SQL-backed implementation for production and an in-memory one for
//! embedding and tests. Every call is atomic on its own; the manager is
//! responsible for ordering calls against its in-memory tree.

pub mod errors;
pub mod memory;
pub mod migrations;
pub mod sql_store;

pub use errors::{StoreError, StoreResult};
pub use memory::MemoryChannelStore;
pub use migrations::{migrate, CURRENT_CHANNEL_SCHEMA_VERSION};
pub use sql_store::SqlChannelStore;

use super::channel::{Channel, ChannelEvent, DmChannelMapping, SubscriptionLevel, UpdateChannelArgs};
use super::types::{ChannelId, UserId};
use std::collections::{HashMap, HashSet};

/// Arguments for [`ChannelStore::change_channel_subscription`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeChannelSubscriptionArgs {
    /// Requested level per user
    pub subscription: HashMap<UserId, SubscriptionLevel>,
    /// Leave users currently at [`SubscriptionLevel::None`] untouched
    pub keep_off_level: bool,
}

/// Users whose subscription was switched on and off by a change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    pub on: Vec<UserId>,
    pub off: Vec<UserId>,
}

impl SubscriptionDiff {
    pub fn is_empty(&self) -> bool {
        self.on.is_empty() && self.off.is_empty()
    }

    /// Compute the diff between current and requested levels, returning the
    /// levels to write alongside it. Shared by every store implementation.
    pub fn compute(
        current: &HashMap<UserId, SubscriptionLevel>,
        args: &ChangeChannelSubscriptionArgs,
    ) -> (Self, Vec<(UserId, SubscriptionLevel)>) {
        let mut diff = SubscriptionDiff::default();
        let mut writes = Vec::new();

        for (user, &requested) in &args.subscription {
            let existing = current.get(user).copied().unwrap_or(SubscriptionLevel::None);
            if existing == requested {
                continue;
            }
            if args.keep_off_level && existing == SubscriptionLevel::None {
                continue;
            }

            if requested == SubscriptionLevel::None {
                diff.off.push(*user);
            } else {
                diff.on.push(*user);
            }
            writes.push((*user, requested));
        }

        diff.on.sort();
        diff.off.sort();
        (diff, writes)
    }
}

/// Durable storage consumed by the hierarchy manager
pub trait ChannelStore: Send + Sync {
    /// All public (non-DM) channels, used once to bootstrap the tree
    fn get_public_channels(&self) -> StoreResult<Vec<Channel>>;

    /// A single channel, public or DM
    fn get_channel(&self, id: ChannelId) -> StoreResult<Channel>;

    /// Persist a new channel. DM channels carry their member set.
    fn create_channel(
        &self,
        channel: Channel,
        members: Option<&HashSet<UserId>>,
        is_dm: bool,
    ) -> StoreResult<Channel>;

    /// Apply an update and return the stored row
    fn update_channel(&self, id: ChannelId, args: &UpdateChannelArgs) -> StoreResult<Channel>;

    fn record_channel_event(&self, event: &ChannelEvent) -> StoreResult<()>;

    /// Audit trail of a channel, oldest first
    fn get_channel_events(&self, id: ChannelId) -> StoreResult<Vec<ChannelEvent>>;

    /// DM channel shared by an unordered pair of users
    fn get_direct_message_channel(&self, a: UserId, b: UserId) -> StoreResult<Channel>;

    fn get_private_channel_member_ids(&self, id: ChannelId) -> StoreResult<Vec<UserId>>;

    fn get_direct_message_channel_mapping(&self, user: UserId) -> StoreResult<Vec<DmChannelMapping>>;

    fn change_channel_subscription(
        &self,
        id: ChannelId,
        args: &ChangeChannelSubscriptionArgs,
    ) -> StoreResult<SubscriptionDiff>;

    fn get_channel_subscriptions(&self, id: ChannelId) -> StoreResult<HashMap<UserId, SubscriptionLevel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_diff() {
        let a = UserId::generate();
        let b = UserId::generate();
        let c = UserId::generate();

        let mut current = HashMap::new();
        current.insert(a, SubscriptionLevel::Mark);
        current.insert(b, SubscriptionLevel::MarkAndNotify);

        let mut subscription = HashMap::new();
        subscription.insert(a, SubscriptionLevel::Mark);
        subscription.insert(b, SubscriptionLevel::None);
        subscription.insert(c, SubscriptionLevel::MarkAndNotify);

        let args = ChangeChannelSubscriptionArgs {
            subscription,
            keep_off_level: false,
        };
        let (diff, writes) = SubscriptionDiff::compute(&current, &args);

        assert_eq!(diff.on, vec![c]);
        assert_eq!(diff.off, vec![b]);
        assert_eq!(writes.len(), 2);
    }

    #[test]
    fn test_keep_off_level_skips_unsubscribed_users() {
        let a = UserId::generate();
        let b = UserId::generate();

        let mut current = HashMap::new();
        current.insert(a, SubscriptionLevel::Mark);

        let mut subscription = HashMap::new();
        subscription.insert(a, SubscriptionLevel::MarkAndNotify);
        subscription.insert(b, SubscriptionLevel::MarkAndNotify);

        let args = ChangeChannelSubscriptionArgs {
            subscription,
            keep_off_level: true,
        };
        let (diff, writes) = SubscriptionDiff::compute(&current, &args);

        assert_eq!(diff.on, vec![a]);
        assert!(diff.off.is_empty());
        assert_eq!(writes, vec![(a, SubscriptionLevel::MarkAndNotify)]);
    }
}
