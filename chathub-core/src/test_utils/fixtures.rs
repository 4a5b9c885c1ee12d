//! Test fixtures for creating common test objects

use crate::config::{AuditConfig, HierarchyConfig};
use crate::core_channel::{
    Channel, ChannelId, ChannelManager, ChannelStore, ChannelTree, MemoryChannelStore, UserId,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Builder for creating test channels
pub struct TestChannelBuilder {
    name: String,
    parent: ChannelId,
    creator: UserId,
    visible: bool,
    forced: bool,
}

impl TestChannelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: ChannelId::ROOT,
            creator: UserId::generate(),
            visible: true,
            forced: false,
        }
    }

    pub fn with_parent(mut self, parent: ChannelId) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_creator(mut self, creator: UserId) -> Self {
        self.creator = creator;
        self
    }

    pub fn archived(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    pub fn build(self) -> Channel {
        let mut channel = Channel::new(self.name, self.parent, self.creator);
        channel.is_visible = self.visible;
        channel.is_forced = self.forced;
        channel
    }
}

/// Manager over a fresh in-memory store
pub struct TestHierarchy {
    pub manager: ChannelManager,
    pub store: MemoryChannelStore,
    pub user: UserId,
}

impl TestHierarchy {
    /// Must be called from within a Tokio runtime
    pub fn new() -> Self {
        Self::with_max_depth(HierarchyConfig::default().max_channel_depth)
    }

    pub fn with_max_depth(max_channel_depth: usize) -> Self {
        Self::with_store(MemoryChannelStore::new(), max_channel_depth)
    }

    /// Manager bootstrapped from an already populated store
    pub fn with_store(store: MemoryChannelStore, max_channel_depth: usize) -> Self {
        let shared: Arc<dyn ChannelStore> = Arc::new(store.clone());
        let manager = ChannelManager::init(
            shared,
            &HierarchyConfig { max_channel_depth },
            &AuditConfig::default(),
            Handle::current(),
        )
        .expect("in-memory store bootstraps");

        Self {
            manager,
            store,
            user: UserId::generate(),
        }
    }

    /// Create `len` nested channels named `<prefix>1`, `<prefix>2`, ... under
    /// `parent`, outermost first
    pub fn chain(&self, parent: ChannelId, prefix: &str, len: usize) -> Vec<Channel> {
        let mut created = Vec::with_capacity(len);
        let mut parent = parent;
        for level in 1..=len {
            let channel = self
                .manager
                .create_public_channel(&format!("{}{}", prefix, level), parent, self.user)
                .expect("chain link is valid");
            parent = channel.id;
            created.push(channel);
        }
        created
    }
}

/// Panic unless `tree` satisfies every structural rule: each ascendant walk
/// reaches the root within `max_depth` steps, parent/child links agree, and
/// no two siblings share a name.
pub fn assert_tree_invariants(tree: &ChannelTree, max_depth: usize) {
    let mut siblings: HashSet<(ChannelId, String)> = HashSet::new();

    for channel in tree.channels() {
        let ascendants = tree.ascendant_ids(channel.id);
        assert!(
            ascendants.len() < max_depth,
            "channel {} is {} levels deep",
            channel.name,
            ascendants.len() + 1
        );
        assert!(!ascendants.contains(&channel.id), "channel {} is its own ancestor", channel.name);
        if let Some(top) = ascendants.last() {
            assert!(tree.get(*top).is_some_and(|c| c.parent_id.is_root()));
        }

        assert!(
            tree.children_ids(channel.parent_id).contains(&channel.id),
            "channel {} missing from its parent's children",
            channel.name
        );
        for child in &channel.children {
            assert_eq!(tree.get(*child).map(|c| c.parent_id), Some(channel.id));
        }

        assert!(
            siblings.insert((channel.parent_id, channel.name.clone())),
            "duplicate sibling name {}",
            channel.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_builder() {
        let parent = ChannelId::generate();
        let channel = TestChannelBuilder::new("ops").with_parent(parent).archived().forced().build();

        assert_eq!(channel.name, "ops");
        assert_eq!(channel.parent_id, parent);
        assert!(channel.is_archived());
        assert!(channel.is_forced);
    }

    #[test]
    fn test_invariants_hold_for_built_tree() {
        let top = TestChannelBuilder::new("top").build();
        let child = TestChannelBuilder::new("child").with_parent(top.id).build();
        let tree = ChannelTree::build(vec![top, child]).unwrap();

        assert_tree_invariants(&tree, 2);
    }

    #[test]
    #[should_panic(expected = "levels deep")]
    fn test_invariants_detect_depth_violation() {
        let top = TestChannelBuilder::new("top").build();
        let child = TestChannelBuilder::new("child").with_parent(top.id).build();
        let tree = ChannelTree::build(vec![top, child]).unwrap();

        assert_tree_invariants(&tree, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hierarchy_chain() {
        let hierarchy = TestHierarchy::new();
        let chain = hierarchy.chain(ChannelId::ROOT, "level", 3);

        let tree = hierarchy.manager.public_channel_tree();
        assert_eq!(tree.channel_path(chain[2].id).as_deref(), Some("level1/level2/level3"));
        assert_tree_invariants(&tree.read(), 5);
    }
}
