//! Channel data structures, audit events and the channel-name grammar

use super::types::{ChannelId, Timestamp, UserId};
use rand::distr::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Grammar every channel name must match. Matching is case-sensitive.
static CHANNEL_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,20}$").expect("channel name regex is valid"));

/// Length of the random suffix of a direct-message channel name
const DM_NAME_SUFFIX_LEN: usize = 17;

/// Check a name against the channel-name grammar
pub fn is_valid_channel_name(name: &str) -> bool {
    CHANNEL_NAME_REGEX.is_match(name)
}

/// Internal name for a freshly created direct-message channel
pub fn random_dm_channel_name() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(DM_NAME_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("dm_{}", suffix)
}

/// A channel node
///
/// `children` is never persisted; it is filled in from the public tree when a
/// channel is read and is empty for channels outside the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Unique identifier
    pub id: ChannelId,

    /// Name, unique among siblings
    pub name: String,

    /// Parent channel, [`ChannelId::ROOT`] for top-level channels
    pub parent_id: ChannelId,

    /// Free-text topic
    pub topic: String,

    /// Members cannot opt out of notifications
    pub is_forced: bool,

    /// Listed and writable; a channel that is not visible is archived
    pub is_visible: bool,

    pub creator_id: UserId,

    pub updater_id: UserId,

    pub created_at: Timestamp,

    pub updated_at: Timestamp,

    /// Direct child ids, derived on read
    #[serde(default)]
    pub children: Vec<ChannelId>,
}

impl Channel {
    /// Create a new visible, non-forced Channel
    pub fn new(name: String, parent_id: ChannelId, creator_id: UserId) -> Self {
        let now = Timestamp::now();
        Channel {
            id: ChannelId::generate(),
            name,
            parent_id,
            topic: String::new(),
            is_forced: false,
            is_visible: true,
            creator_id,
            updater_id: creator_id,
            created_at: now,
            updated_at: now,
            children: Vec::new(),
        }
    }

    /// Archival is the absence of visibility
    pub fn is_archived(&self) -> bool {
        !self.is_visible
    }

    /// Apply the attribute part of an update (everything but name/parent)
    pub fn apply_attributes(&mut self, args: &UpdateChannelArgs, at: Timestamp) {
        if let Some(topic) = &args.topic {
            self.topic = topic.clone();
        }
        if let Some(visible) = args.visibility {
            self.is_visible = visible;
        }
        if let Some(forced) = args.forced_notification {
            self.is_forced = forced;
        }
        self.updater_id = args.updater_id;
        self.updated_at = at;
    }
}

/// Optional changes for [`ChannelManager::update_channel`](super::ChannelManager::update_channel)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateChannelArgs {
    pub updater_id: UserId,
    pub topic: Option<String>,
    pub visibility: Option<bool>,
    pub forced_notification: Option<bool>,
    pub name: Option<String>,
    pub parent: Option<ChannelId>,
}

impl UpdateChannelArgs {
    pub fn new(updater_id: UserId) -> Self {
        Self {
            updater_id,
            ..Default::default()
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn visibility(mut self, visible: bool) -> Self {
        self.visibility = Some(visible);
        self
    }

    pub fn forced_notification(mut self, forced: bool) -> Self {
        self.forced_notification = Some(forced);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn parent(mut self, parent: ChannelId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Whether the update touches the channel's position in the tree
    pub fn is_structural(&self) -> bool {
        self.name.is_some() || self.parent.is_some()
    }
}

/// Kind of a channel audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChannelEventKind {
    ChildCreated,
    NameChanged,
    TopicChanged,
    VisibilityChanged,
    ForcedNotificationChanged,
    ParentChanged,
    SubscribersChanged,
}

impl ChannelEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelEventKind::ChildCreated => "ChildCreated",
            ChannelEventKind::NameChanged => "NameChanged",
            ChannelEventKind::TopicChanged => "TopicChanged",
            ChannelEventKind::VisibilityChanged => "VisibilityChanged",
            ChannelEventKind::ForcedNotificationChanged => "ForcedNotificationChanged",
            ChannelEventKind::ParentChanged => "ParentChanged",
            ChannelEventKind::SubscribersChanged => "SubscribersChanged",
        }
    }
}

impl fmt::Display for ChannelEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ChildCreated" => Ok(ChannelEventKind::ChildCreated),
            "NameChanged" => Ok(ChannelEventKind::NameChanged),
            "TopicChanged" => Ok(ChannelEventKind::TopicChanged),
            "VisibilityChanged" => Ok(ChannelEventKind::VisibilityChanged),
            "ForcedNotificationChanged" => Ok(ChannelEventKind::ForcedNotificationChanged),
            "ParentChanged" => Ok(ChannelEventKind::ParentChanged),
            "SubscribersChanged" => Ok(ChannelEventKind::SubscribersChanged),
            other => Err(format!("unknown channel event kind: {}", other)),
        }
    }
}

/// Kind-specific event payload (`before`/`after`, acting `userId`, ...)
pub type EventDetail = serde_json::Map<String, serde_json::Value>;

/// Immutable audit record of a change to a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub channel_id: ChannelId,
    pub kind: ChannelEventKind,
    pub detail: EventDetail,
    pub timestamp: Timestamp,
}

impl ChannelEvent {
    /// Build an event from a `serde_json::json!` object literal. Non-object
    /// values are stored under a single `value` key.
    pub fn new(
        channel_id: ChannelId,
        kind: ChannelEventKind,
        detail: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        let detail = match detail {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = EventDetail::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            channel_id,
            kind,
            detail,
            timestamp,
        }
    }
}

/// Per-user subscription state for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubscriptionLevel {
    /// Not subscribed
    None,
    /// Unread tracking only
    Mark,
    /// Unread tracking plus notifications
    MarkAndNotify,
}

impl SubscriptionLevel {
    pub fn as_i64(&self) -> i64 {
        match self {
            SubscriptionLevel::None => 0,
            SubscriptionLevel::Mark => 1,
            SubscriptionLevel::MarkAndNotify => 2,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(SubscriptionLevel::None),
            1 => Some(SubscriptionLevel::Mark),
            2 => Some(SubscriptionLevel::MarkAndNotify),
            _ => None,
        }
    }
}

/// Unordered pair of users sharing a direct-message channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DmChannelMapping {
    pub channel_id: ChannelId,
    pub user1: UserId,
    pub user2: UserId,
}

impl DmChannelMapping {
    /// Normalized so that `user1 <= user2`
    pub fn new(channel_id: ChannelId, a: UserId, b: UserId) -> Self {
        let (user1, user2) = if a <= b { (a, b) } else { (b, a) };
        Self {
            channel_id,
            user1,
            user2,
        }
    }

    /// The member that is not `user`; `user` itself for a self-DM
    pub fn other(&self, user: &UserId) -> UserId {
        if &self.user1 != user {
            self.user1
        } else {
            self.user2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_name_grammar() {
        assert!(is_valid_channel_name("general"));
        assert!(is_valid_channel_name("a"));
        assert!(is_valid_channel_name("Team_A-2"));
        assert!(is_valid_channel_name("abcdefghijklmnopqrst"));

        assert!(!is_valid_channel_name(""));
        assert!(!is_valid_channel_name("abcdefghijklmnopqrstu"));
        assert!(!is_valid_channel_name("with space"));
        assert!(!is_valid_channel_name("a/b"));
        assert!(!is_valid_channel_name("日本語"));
    }

    #[test]
    fn test_dm_channel_name() {
        let name = random_dm_channel_name();
        assert!(name.starts_with("dm_"));
        assert_eq!(name.len(), 3 + DM_NAME_SUFFIX_LEN);
        assert!(name[3..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(name, random_dm_channel_name());
    }

    #[test]
    fn test_new_channel_defaults() {
        let creator = UserId::generate();
        let channel = Channel::new("general".to_string(), ChannelId::ROOT, creator);

        assert!(channel.is_visible);
        assert!(!channel.is_forced);
        assert!(!channel.is_archived());
        assert_eq!(channel.creator_id, creator);
        assert_eq!(channel.updater_id, creator);
        assert_eq!(channel.created_at, channel.updated_at);
        assert!(channel.children.is_empty());
    }

    #[test]
    fn test_apply_attributes() {
        let creator = UserId::generate();
        let updater = UserId::generate();
        let mut channel = Channel::new("general".to_string(), ChannelId::ROOT, creator);

        let args = UpdateChannelArgs::new(updater).topic("hello").visibility(false);
        channel.apply_attributes(&args, Timestamp::from_millis(42));

        assert_eq!(channel.topic, "hello");
        assert!(channel.is_archived());
        assert!(!channel.is_forced);
        assert_eq!(channel.updater_id, updater);
        assert_eq!(channel.updated_at, Timestamp::from_millis(42));
    }

    #[test]
    fn test_event_kind_string_forms() {
        for kind in [
            ChannelEventKind::ChildCreated,
            ChannelEventKind::NameChanged,
            ChannelEventKind::TopicChanged,
            ChannelEventKind::VisibilityChanged,
            ChannelEventKind::ForcedNotificationChanged,
            ChannelEventKind::ParentChanged,
            ChannelEventKind::SubscribersChanged,
        ] {
            assert_eq!(kind.as_str().parse::<ChannelEventKind>().unwrap(), kind);
        }
        assert!("Deleted".parse::<ChannelEventKind>().is_err());
    }

    #[test]
    fn test_event_detail_from_json() {
        let id = ChannelId::generate();
        let event = ChannelEvent::new(
            id,
            ChannelEventKind::TopicChanged,
            json!({ "before": "a", "after": "b" }),
            Timestamp::from_millis(1),
        );
        assert_eq!(event.detail.get("after"), Some(&json!("b")));

        let wrapped = ChannelEvent::new(id, ChannelEventKind::TopicChanged, json!(3), Timestamp::from_millis(1));
        assert_eq!(wrapped.detail.get("value"), Some(&json!(3)));
    }

    #[test]
    fn test_dm_mapping_normalization() {
        let a = UserId::generate();
        let b = UserId::generate();
        let id = ChannelId::generate();

        assert_eq!(DmChannelMapping::new(id, a, b), DmChannelMapping::new(id, b, a));

        let mapping = DmChannelMapping::new(id, a, b);
        assert_eq!(mapping.other(&a), b);
        assert_eq!(mapping.other(&b), a);

        let own = DmChannelMapping::new(id, a, a);
        assert_eq!(own.other(&a), a);
    }

    #[test]
    fn test_subscription_level_codes() {
        for level in [SubscriptionLevel::None, SubscriptionLevel::Mark, SubscriptionLevel::MarkAndNotify] {
            assert_eq!(SubscriptionLevel::from_i64(level.as_i64()), Some(level));
        }
        assert_eq!(SubscriptionLevel::from_i64(7), None);
    }
}
