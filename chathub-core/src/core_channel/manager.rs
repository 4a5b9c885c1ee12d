//! Channel hierarchy manager
//!
//! The only writer of the public [`ChannelTree`]. Every structural mutation
//! runs Validate → Persist → Apply → Emit while holding the tree's write lock,
//! including the store round-trip. That lock is the serialization point for
//! all hierarchy changes: two mutations never interleave, and readers never
//! see a tree state the store has not committed.

use super::audit::AuditEmitter;
use super::channel::{
    is_valid_channel_name, random_dm_channel_name, Channel, ChannelEvent, ChannelEventKind,
    SubscriptionLevel, UpdateChannelArgs,
};
use super::error::{ChannelError, TreeError};
use super::storage::{ChangeChannelSubscriptionArgs, ChannelStore, StoreError, SubscriptionDiff};
use super::tree::{ChannelTree, PublicChannelTree};
use super::types::{ChannelId, Timestamp, UserId};
use crate::config::{AuditConfig, HierarchyConfig};
use crate::metrics::Timer;
use metrics::counter;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

/// Events staged during validation, emitted once the mutation is applied
type StagedEvents = Vec<(ChannelEventKind, Value)>;

/// Store errors where "not found" is a caller-facing outcome
fn not_found_or(op: &'static str) -> impl FnOnce(StoreError) -> ChannelError {
    move |err| match err {
        StoreError::NotFound(_) => ChannelError::NotFound,
        source => ChannelError::Store { op, source },
    }
}

/// The tree no longer mirrors a committed store state. Nothing can repair
/// that in place, so the write lock is poisoned on purpose.
fn diverged(op: &'static str, channel_id: ChannelId, err: TreeError) -> ! {
    error!(op, channel_id = %channel_id, error = %err, "Channel tree diverged from store");
    panic!("channel tree diverged from store during {}: {}", op, err);
}

/// Hierarchy manager for public channels plus DM get-or-create
pub struct ChannelManager {
    store: Arc<dyn ChannelStore>,
    tree: Arc<RwLock<ChannelTree>>,
    audit: AuditEmitter,
    max_depth: usize,
}

impl ChannelManager {
    /// Load every public channel from `store` and build the tree
    ///
    /// Audit tasks are spawned onto `runtime`; the manager's own operations
    /// are synchronous and may be called from any thread.
    pub fn init(
        store: Arc<dyn ChannelStore>,
        hierarchy: &HierarchyConfig,
        audit: &AuditConfig,
        runtime: Handle,
    ) -> Result<Self, ChannelError> {
        let channels = store
            .get_public_channels()
            .map_err(ChannelError::store("load public channels"))?;
        let tree = ChannelTree::build(channels)?;

        info!(
            channels = tree.len(),
            max_depth = hierarchy.max_channel_depth,
            "Channel tree loaded"
        );

        Ok(Self {
            audit: AuditEmitter::new(Arc::clone(&store), audit, runtime),
            store,
            tree: Arc::new(RwLock::new(tree)),
            max_depth: hierarchy.max_channel_depth,
        })
    }

    pub fn max_channel_depth(&self) -> usize {
        self.max_depth
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, ChannelTree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tree(&self) -> Result<RwLockWriteGuard<'_, ChannelTree>, ChannelError> {
        self.tree.write().map_err(|_| ChannelError::Poisoned)
    }

    fn rejected(op: &'static str, err: ChannelError) -> ChannelError {
        if err.is_validation() {
            counter!("channel.mutation.rejected", "op" => op).increment(1);
            debug!(op, reason = %err, "Channel mutation rejected");
        }
        err
    }

    fn emit_all(&self, channel_id: ChannelId, staged: StagedEvents) {
        let now = Timestamp::now();
        for (kind, detail) in staged {
            self.audit.emit(ChannelEvent::new(channel_id, kind, detail, now));
        }
    }

    /// Channel by id, public or DM. Public channels carry their children.
    pub fn get_channel(&self, id: ChannelId) -> Result<Channel, ChannelError> {
        if let Some(channel) = self.read_tree().get(id) {
            return Ok(channel);
        }
        self.store.get_channel(id).map_err(not_found_or("get channel"))
    }

    /// Create a public channel under `parent_id` ([`ChannelId::ROOT`] for the
    /// top level)
    pub fn create_public_channel(
        &self,
        name: &str,
        parent_id: ChannelId,
        creator_id: UserId,
    ) -> Result<Channel, ChannelError> {
        const OP: &str = "create_public_channel";
        let mut tree = self.write_tree()?;
        let held = Timer::new("channel.mutation.duration_ms");

        self.validate_create(&tree, name, parent_id)
            .map_err(|e| Self::rejected(OP, e))?;

        let channel = self
            .store
            .create_channel(Channel::new(name.to_string(), parent_id, creator_id), None, false)
            .map_err(|err| match err {
                StoreError::Conflict(_) => Self::rejected(OP, ChannelError::NameConflict),
                source => ChannelError::Store { op: "create channel", source },
            })?;

        if let Err(err) = tree.add(channel.clone()) {
            diverged(OP, channel.id, err);
        }
        drop(tree);
        held.stop();

        counter!("channel.created").increment(1);
        debug!(channel_id = %channel.id, parent_id = %parent_id, name, "Created public channel");

        if !parent_id.is_root() {
            self.audit.emit(ChannelEvent::new(
                parent_id,
                ChannelEventKind::ChildCreated,
                json!({ "userId": creator_id, "channelId": channel.id }),
                channel.created_at,
            ));
        }

        Ok(channel)
    }

    fn validate_create(
        &self,
        tree: &ChannelTree,
        name: &str,
        parent_id: ChannelId,
    ) -> Result<(), ChannelError> {
        if !is_valid_channel_name(name) {
            return Err(ChannelError::InvalidName);
        }
        if tree.is_child_name_present(name, parent_id) {
            return Err(ChannelError::NameConflict);
        }
        if !parent_id.is_root() {
            if !tree.is_channel_present(parent_id) {
                return Err(ChannelError::InvalidParent);
            }
            if tree.is_archived_channel(parent_id) {
                return Err(ChannelError::Archived);
            }
            if tree.ascendant_ids(parent_id).len() + 2 > self.max_depth {
                return Err(ChannelError::TooDeep);
            }
        }
        Ok(())
    }

    /// Change a channel's attributes and/or move it in the hierarchy
    ///
    /// Returns the channel as stored after the update.
    pub fn update_channel(
        &self,
        id: ChannelId,
        args: &UpdateChannelArgs,
    ) -> Result<Channel, ChannelError> {
        const OP: &str = "update_channel";
        let mut tree = self.write_tree()?;
        let held = Timer::new("channel.mutation.duration_ms");

        let current = match tree.get(id) {
            Some(channel) => channel,
            None => self.store.get_channel(id).map_err(not_found_or("get channel"))?,
        };
        let is_public = tree.is_channel_present(id);

        let staged = self
            .validate_update(&tree, &current, is_public, args)
            .map_err(|e| Self::rejected(OP, e))?;

        let mut updated = self
            .store
            .update_channel(id, args)
            .map_err(|err| match err {
                StoreError::Conflict(_) => Self::rejected(OP, ChannelError::NameConflict),
                source => not_found_or("update channel")(source),
            })?;

        if is_public {
            if args.is_structural() {
                if let Err(err) = tree.move_channel(id, args.parent, args.name.clone()) {
                    diverged(OP, id, err);
                }
            }
            if let Err(err) = tree.update(id, &updated) {
                diverged(OP, id, err);
            }
            updated.children = tree.children_ids(id);
        }
        drop(tree);
        held.stop();

        counter!("channel.updated").increment(1);
        debug!(channel_id = %id, events = staged.len(), "Updated channel");

        self.emit_all(id, staged);
        Ok(updated)
    }

    fn validate_update(
        &self,
        tree: &ChannelTree,
        current: &Channel,
        is_public: bool,
        args: &UpdateChannelArgs,
    ) -> Result<StagedEvents, ChannelError> {
        let user = args.updater_id;
        let mut staged = StagedEvents::new();

        if let Some(topic) = args.topic.as_ref().filter(|t| **t != current.topic) {
            staged.push((
                ChannelEventKind::TopicChanged,
                json!({ "userId": user, "before": current.topic, "after": topic }),
            ));
        }
        if let Some(visible) = args.visibility.filter(|v| *v != current.is_visible) {
            staged.push((
                ChannelEventKind::VisibilityChanged,
                json!({ "userId": user, "visibility": visible }),
            ));
        }
        if let Some(forced) = args.forced_notification.filter(|f| *f != current.is_forced) {
            staged.push((
                ChannelEventKind::ForcedNotificationChanged,
                json!({ "userId": user, "force": forced }),
            ));
        }

        if !args.is_structural() {
            return Ok(staged);
        }
        // DM channels live outside the hierarchy
        if !is_public {
            return Err(ChannelError::InvalidChannel);
        }

        let name = args.name.as_deref().unwrap_or(&current.name);
        let parent = args.parent.unwrap_or(current.parent_id);
        if tree.is_child_name_taken(name, parent, current.id) {
            return Err(ChannelError::NameConflict);
        }

        if let Some(new_name) = &args.name {
            if !is_valid_channel_name(new_name) {
                return Err(ChannelError::InvalidName);
            }
            if *new_name != current.name {
                staged.push((
                    ChannelEventKind::NameChanged,
                    json!({ "userId": user, "before": current.name, "after": new_name }),
                ));
            }
        }

        if let Some(new_parent) = args.parent {
            if !new_parent.is_root() {
                if !tree.is_channel_present(new_parent) {
                    return Err(ChannelError::InvalidParent);
                }
                let ascendants = tree.ascendant_ids(new_parent);
                if new_parent == current.id || ascendants.contains(&current.id) {
                    return Err(ChannelError::TooDeep);
                }
                if ascendants.len() + 1 + tree.subtree_height(current.id) > self.max_depth {
                    return Err(ChannelError::TooDeep);
                }
            }
            if new_parent != current.parent_id {
                staged.push((
                    ChannelEventKind::ParentChanged,
                    json!({ "userId": user, "before": current.parent_id, "after": new_parent }),
                ));
            }
        }

        Ok(staged)
    }

    /// Apply subscription changes to a public channel
    ///
    /// With `keep_off_level`, users who are currently unsubscribed stay
    /// unsubscribed whatever level is requested for them.
    pub fn change_channel_subscriptions(
        &self,
        channel_id: ChannelId,
        subscriptions: HashMap<UserId, SubscriptionLevel>,
        keep_off_level: bool,
        updater_id: UserId,
    ) -> Result<SubscriptionDiff, ChannelError> {
        const OP: &str = "change_channel_subscriptions";
        // shared lock: the channel cannot be forced or archived meanwhile
        let tree = self.tree.read().map_err(|_| ChannelError::Poisoned)?;

        if !tree.is_channel_present(channel_id) {
            return Err(Self::rejected(OP, ChannelError::InvalidChannel));
        }
        if tree.is_force_channel(channel_id) {
            return Err(Self::rejected(OP, ChannelError::ForcedNotification));
        }

        let args = ChangeChannelSubscriptionArgs {
            subscription: subscriptions,
            keep_off_level,
        };
        let diff = self
            .store
            .change_channel_subscription(channel_id, &args)
            .map_err(ChannelError::store("change channel subscription"))?;
        drop(tree);

        if !diff.is_empty() {
            debug!(
                channel_id = %channel_id,
                on = diff.on.len(),
                off = diff.off.len(),
                "Changed channel subscriptions"
            );
            self.audit.emit(ChannelEvent::new(
                channel_id,
                ChannelEventKind::SubscribersChanged,
                json!({ "userId": updater_id, "on": diff.on, "off": diff.off }),
                Timestamp::now(),
            ));
        }

        Ok(diff)
    }

    /// Current subscription levels of a channel; unsubscribed users are absent
    pub fn get_channel_subscriptions(
        &self,
        channel_id: ChannelId,
    ) -> Result<HashMap<UserId, SubscriptionLevel>, ChannelError> {
        self.store
            .get_channel_subscriptions(channel_id)
            .map_err(ChannelError::store("get channel subscriptions"))
    }

    /// Recorded audit trail of a channel, oldest first
    pub fn get_channel_events(&self, channel_id: ChannelId) -> Result<Vec<ChannelEvent>, ChannelError> {
        self.store
            .get_channel_events(channel_id)
            .map_err(ChannelError::store("get channel events"))
    }

    /// DM channel shared by `a` and `b`, created on first access
    ///
    /// The store's uniqueness constraint on the user pair settles concurrent
    /// first access: the losing create sees a conflict and re-reads.
    pub fn get_dm_channel(&self, a: UserId, b: UserId) -> Result<Channel, ChannelError> {
        if a.is_nil() || b.is_nil() {
            return Err(ChannelError::NotFound);
        }

        match self.store.get_direct_message_channel(a, b) {
            Ok(channel) => return Ok(channel),
            Err(StoreError::NotFound(_)) => {}
            Err(source) => {
                return Err(ChannelError::Store {
                    op: "get direct message channel",
                    source,
                })
            }
        }

        let members: HashSet<UserId> = [a, b].into_iter().collect();
        let channel = Channel::new(random_dm_channel_name(), ChannelId::ROOT, UserId::NIL);

        match self.store.create_channel(channel, Some(&members), true) {
            Ok(channel) => {
                counter!("channel.dm.created").increment(1);
                debug!(channel_id = %channel.id, "Created direct message channel");
                Ok(channel)
            }
            Err(StoreError::Conflict(_)) => {
                debug!(user_a = %a, user_b = %b, "Direct message channel created concurrently");
                self.store
                    .get_direct_message_channel(a, b)
                    .map_err(not_found_or("get direct message channel"))
            }
            Err(source) => Err(ChannelError::Store {
                op: "create direct message channel",
                source,
            }),
        }
    }

    /// Members of a DM channel
    pub fn get_dm_channel_members(&self, channel_id: ChannelId) -> Result<Vec<UserId>, ChannelError> {
        self.store
            .get_private_channel_member_ids(channel_id)
            .map_err(ChannelError::store("get private channel members"))
    }

    /// DM channels of `user`, mapped to the other member
    pub fn get_dm_channel_mapping(&self, user: UserId) -> Result<HashMap<ChannelId, UserId>, ChannelError> {
        let mappings = self
            .store
            .get_direct_message_channel_mapping(user)
            .map_err(ChannelError::store("get direct message channel mapping"))?;

        Ok(mappings
            .into_iter()
            .map(|m| (m.channel_id, m.other(&user)))
            .collect())
    }

    /// Public channels are open to everyone; anything else only to its members
    pub fn is_channel_accessible_to_user(
        &self,
        user: UserId,
        channel_id: ChannelId,
    ) -> Result<bool, ChannelError> {
        if self.is_public_channel(channel_id) {
            return Ok(true);
        }
        Ok(self.get_dm_channel_members(channel_id)?.contains(&user))
    }

    pub fn is_public_channel(&self, channel_id: ChannelId) -> bool {
        self.read_tree().is_channel_present(channel_id)
    }

    /// Read-only handle sharing this manager's tree
    pub fn public_channel_tree(&self) -> PublicChannelTree {
        PublicChannelTree::new(Arc::clone(&self.tree))
    }

    pub fn audit(&self) -> &AuditEmitter {
        &self.audit
    }

    /// Wait for in-flight audit events; returns whether they all finished
    /// within `timeout`
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.audit.drain_timeout(timeout).await
    }
}
