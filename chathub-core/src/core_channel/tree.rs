//! In-memory public channel tree
//!
//! [`ChannelTree`] indexes every public channel by id together with its parent
//! and children links. It performs no validation of its own beyond refusing
//! links to unknown nodes: cycle, depth and name checks belong to the
//! [`ChannelManager`](super::ChannelManager), which is the only writer.
//!
//! Readers outside the manager get a [`PublicChannelTree`] handle, which takes
//! the shared lock for each query.

use super::channel::Channel;
use super::error::TreeError;
use super::types::ChannelId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

#[derive(Debug, Clone)]
struct Node {
    /// Stored without `children`; those are derived from `child_ids`
    channel: Channel,
    child_ids: BTreeSet<ChannelId>,
}

/// Index over all public channels
#[derive(Debug, Clone, Default)]
pub struct ChannelTree {
    nodes: HashMap<ChannelId, Node>,
    top_level: BTreeSet<ChannelId>,
}

impl ChannelTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from the store's public channels
    ///
    /// Fails if a channel references a parent that is not in the list, if an
    /// id appears twice, or if the parent links contain a cycle.
    pub fn build(channels: Vec<Channel>) -> Result<Self, TreeError> {
        let mut tree = Self::new();

        for mut channel in channels {
            if tree.nodes.contains_key(&channel.id) {
                return Err(TreeError::DuplicateChannel(channel.id));
            }
            channel.children.clear();
            tree.nodes.insert(
                channel.id,
                Node {
                    channel,
                    child_ids: BTreeSet::new(),
                },
            );
        }

        let links: Vec<(ChannelId, ChannelId)> = tree
            .nodes
            .values()
            .map(|n| (n.channel.id, n.channel.parent_id))
            .collect();
        for (child, parent) in links {
            tree.link(child, parent)?;
        }

        // A cycle is a set of nodes never reachable from the top level.
        let reachable = tree
            .top_level
            .iter()
            .map(|id| tree.descendant_ids(*id).len() + 1)
            .sum::<usize>();
        if reachable != tree.nodes.len() {
            let stranded = tree
                .nodes
                .keys()
                .find(|id| tree.ascendant_ids(**id).len() >= tree.nodes.len())
                .copied()
                .unwrap_or(ChannelId::ROOT);
            return Err(TreeError::Cycle(stranded));
        }

        Ok(tree)
    }

    fn link(&mut self, child: ChannelId, parent: ChannelId) -> Result<(), TreeError> {
        if parent.is_root() {
            self.top_level.insert(child);
            return Ok(());
        }
        match self.nodes.get_mut(&parent) {
            Some(node) => {
                node.child_ids.insert(child);
                Ok(())
            }
            None => Err(TreeError::UnknownParent { child, parent }),
        }
    }

    fn unlink(&mut self, child: ChannelId, parent: ChannelId) {
        if parent.is_root() {
            self.top_level.remove(&child);
        } else if let Some(node) = self.nodes.get_mut(&parent) {
            node.child_ids.remove(&child);
        }
    }

    fn children_of(&self, parent: ChannelId) -> Option<&BTreeSet<ChannelId>> {
        if parent.is_root() {
            Some(&self.top_level)
        } else {
            self.nodes.get(&parent).map(|n| &n.child_ids)
        }
    }

    /// Number of public channels
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Channel with its direct children filled in
    pub fn get(&self, id: ChannelId) -> Option<Channel> {
        self.nodes.get(&id).map(|node| {
            let mut channel = node.channel.clone();
            channel.children = node.child_ids.iter().copied().collect();
            channel
        })
    }

    pub fn is_channel_present(&self, id: ChannelId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Whether the channel or any of its ascendants is archived
    pub fn is_archived_channel(&self, id: ChannelId) -> bool {
        match self.nodes.get(&id) {
            Some(node) if node.channel.is_archived() => true,
            Some(_) => self
                .ascendant_ids(id)
                .iter()
                .any(|a| self.nodes.get(a).is_some_and(|n| n.channel.is_archived())),
            None => false,
        }
    }

    pub fn is_force_channel(&self, id: ChannelId) -> bool {
        self.nodes.get(&id).is_some_and(|n| n.channel.is_forced)
    }

    /// Exact, case-sensitive name lookup among `parent`'s children
    pub fn is_child_name_present(&self, name: &str, parent: ChannelId) -> bool {
        self.child_id_by_name(name, parent).is_some()
    }

    /// Like [`is_child_name_present`](Self::is_child_name_present), ignoring
    /// the channel `except` itself
    pub fn is_child_name_taken(&self, name: &str, parent: ChannelId, except: ChannelId) -> bool {
        self.child_id_by_name(name, parent).is_some_and(|id| id != except)
    }

    fn child_id_by_name(&self, name: &str, parent: ChannelId) -> Option<ChannelId> {
        self.children_of(parent)?
            .iter()
            .copied()
            .find(|id| self.nodes.get(id).is_some_and(|n| n.channel.name == name))
    }

    /// Ascendants from the immediate parent up to, excluding, the root
    pub fn ascendant_ids(&self, id: ChannelId) -> Vec<ChannelId> {
        let mut ascendants = Vec::new();
        let mut current = match self.nodes.get(&id) {
            Some(node) => node.channel.parent_id,
            None => return ascendants,
        };

        // bounded by the node count so a corrupted link cannot loop forever
        while !current.is_root() && ascendants.len() <= self.nodes.len() {
            ascendants.push(current);
            current = match self.nodes.get(&current) {
                Some(node) => node.channel.parent_id,
                None => break,
            };
        }
        ascendants
    }

    /// 1 for a top-level channel, 0 for an unknown id
    pub fn depth(&self, id: ChannelId) -> usize {
        if !self.is_channel_present(id) {
            return 0;
        }
        self.ascendant_ids(id).len() + 1
    }

    /// Height of the subtree rooted at `id`: 1 for a leaf
    pub fn subtree_height(&self, id: ChannelId) -> usize {
        match self.nodes.get(&id) {
            Some(node) => {
                1 + node
                    .child_ids
                    .iter()
                    .map(|child| self.subtree_height(*child))
                    .max()
                    .unwrap_or(0)
            }
            None => 0,
        }
    }

    pub fn children_ids(&self, id: ChannelId) -> Vec<ChannelId> {
        self.children_of(id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every channel below `id`, depth first
    pub fn descendant_ids(&self, id: ChannelId) -> Vec<ChannelId> {
        let mut descendants = Vec::new();
        let mut queue = self.children_ids(id);
        while let Some(next) = queue.pop() {
            if descendants.contains(&next) {
                continue;
            }
            descendants.push(next);
            queue.extend(self.children_ids(next));
        }
        descendants
    }

    /// Slash-separated names from the top level down, e.g. `general/random`
    pub fn channel_path(&self, id: ChannelId) -> Option<String> {
        let node = self.nodes.get(&id)?;
        let mut names: Vec<&str> = self
            .ascendant_ids(id)
            .iter()
            .filter_map(|a| self.nodes.get(a).map(|n| n.channel.name.as_str()))
            .collect();
        names.reverse();
        names.push(node.channel.name.as_str());
        Some(names.join("/"))
    }

    /// Resolve a slash-separated path to a channel id
    pub fn channel_id_by_path(&self, path: &str) -> Option<ChannelId> {
        let mut current = ChannelId::ROOT;
        for name in path.split('/') {
            current = self.child_id_by_name(name, current)?;
        }
        if current.is_root() {
            None
        } else {
            Some(current)
        }
    }

    /// All channels, unordered, with children filled in
    pub fn channels(&self) -> Vec<Channel> {
        self.nodes.keys().filter_map(|id| self.get(*id)).collect()
    }

    /// Insert a new leaf
    pub fn add(&mut self, mut channel: Channel) -> Result<(), TreeError> {
        if self.nodes.contains_key(&channel.id) {
            return Err(TreeError::DuplicateChannel(channel.id));
        }
        let (id, parent) = (channel.id, channel.parent_id);
        self.link(id, parent)?;
        channel.children.clear();
        self.nodes.insert(
            id,
            Node {
                channel,
                child_ids: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Re-parent and/or rename a node in place
    pub fn move_channel(
        &mut self,
        id: ChannelId,
        new_parent: Option<ChannelId>,
        new_name: Option<String>,
    ) -> Result<(), TreeError> {
        let old_parent = self
            .nodes
            .get(&id)
            .map(|n| n.channel.parent_id)
            .ok_or(TreeError::UnknownChannel(id))?;

        if let Some(parent) = new_parent {
            if parent != old_parent {
                self.link(id, parent)?;
                self.unlink(id, old_parent);
            }
        }

        let node = self.nodes.get_mut(&id).ok_or(TreeError::UnknownChannel(id))?;
        if let Some(parent) = new_parent {
            node.channel.parent_id = parent;
        }
        if let Some(name) = new_name {
            node.channel.name = name;
        }
        Ok(())
    }

    /// Replace a node's metadata, keeping its name and position
    pub fn update(&mut self, id: ChannelId, channel: &Channel) -> Result<(), TreeError> {
        let node = self.nodes.get_mut(&id).ok_or(TreeError::UnknownChannel(id))?;
        let stored = &mut node.channel;
        stored.topic = channel.topic.clone();
        stored.is_forced = channel.is_forced;
        stored.is_visible = channel.is_visible;
        stored.updater_id = channel.updater_id;
        stored.updated_at = channel.updated_at;
        Ok(())
    }
}

/// Read-only, cloneable handle to the manager's public channel tree
#[derive(Clone)]
pub struct PublicChannelTree {
    inner: Arc<RwLock<ChannelTree>>,
}

impl PublicChannelTree {
    pub(crate) fn new(inner: Arc<RwLock<ChannelTree>>) -> Self {
        Self { inner }
    }

    /// Shared guard for a consistent view across several queries. Reads keep
    /// working after a writer panicked; only mutations are refused then.
    pub fn read(&self) -> RwLockReadGuard<'_, ChannelTree> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: ChannelId) -> Option<Channel> {
        self.read().get(id)
    }

    pub fn is_channel_present(&self, id: ChannelId) -> bool {
        self.read().is_channel_present(id)
    }

    pub fn is_archived_channel(&self, id: ChannelId) -> bool {
        self.read().is_archived_channel(id)
    }

    pub fn is_force_channel(&self, id: ChannelId) -> bool {
        self.read().is_force_channel(id)
    }

    pub fn is_child_name_present(&self, name: &str, parent: ChannelId) -> bool {
        self.read().is_child_name_present(name, parent)
    }

    pub fn ascendant_ids(&self, id: ChannelId) -> Vec<ChannelId> {
        self.read().ascendant_ids(id)
    }

    pub fn descendant_ids(&self, id: ChannelId) -> Vec<ChannelId> {
        self.read().descendant_ids(id)
    }

    pub fn children_ids(&self, id: ChannelId) -> Vec<ChannelId> {
        self.read().children_ids(id)
    }

    pub fn depth(&self, id: ChannelId) -> usize {
        self.read().depth(id)
    }

    pub fn channel_path(&self, id: ChannelId) -> Option<String> {
        self.read().channel_path(id)
    }

    pub fn channel_id_by_path(&self, path: &str) -> Option<ChannelId> {
        self.read().channel_id_by_path(path)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
