//! In-memory channel store
//!
//! Mirrors the constraints of the SQL schema (unique sibling names among
//! public channels, one DM channel per unordered pair) so that the manager
//! behaves identically on top of either store.

use super::super::channel::{
    Channel, ChannelEvent, DmChannelMapping, SubscriptionLevel, UpdateChannelArgs,
};
use super::super::types::{ChannelId, Timestamp, UserId};
use super::{ChangeChannelSubscriptionArgs, ChannelStore, StoreError, StoreResult, SubscriptionDiff};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Helper to convert poison errors into StoreError
fn handle_poison<T>(_err: PoisonError<T>) -> StoreError {
    StoreError::Storage("Lock poisoned: a thread panicked while holding the lock".to_string())
}

#[derive(Default)]
struct Tables {
    channels: HashMap<ChannelId, (Channel, bool)>,
    members: HashMap<ChannelId, Vec<UserId>>,
    dm_pairs: HashMap<(UserId, UserId), ChannelId>,
    events: Vec<ChannelEvent>,
    subscriptions: HashMap<ChannelId, HashMap<UserId, SubscriptionLevel>>,
}

impl Tables {
    fn sibling_taken(&self, name: &str, parent: ChannelId, except: ChannelId) -> bool {
        self.channels.values().any(|(ch, is_dm)| {
            !is_dm && ch.id != except && ch.parent_id == parent && ch.name == name
        })
    }
}

/// In-memory store (non-persistent)
#[derive(Clone, Default)]
pub struct MemoryChannelStore {
    tables: Arc<Mutex<Tables>>,
    fail_events: Arc<AtomicBool>,
    event_delay_ms: Arc<AtomicU64>,
}

impl MemoryChannelStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `record_channel_event` call fail
    pub fn fail_event_recording(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `record_channel_event` call block for `delay`
    /// before writing
    pub fn delay_event_recording(&self, delay: Duration) {
        self.event_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of channel rows, public and DM
    pub fn channel_count(&self) -> StoreResult<usize> {
        Ok(self.lock()?.channels.len())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(handle_poison)
    }
}

impl ChannelStore for MemoryChannelStore {
    fn get_public_channels(&self) -> StoreResult<Vec<Channel>> {
        let tables = self.lock()?;
        let mut channels: Vec<_> = tables
            .channels
            .values()
            .filter(|(_, is_dm)| !is_dm)
            .map(|(ch, _)| ch.clone())
            .collect();
        channels.sort_by_key(|ch| ch.created_at);
        Ok(channels)
    }

    fn get_channel(&self, id: ChannelId) -> StoreResult<Channel> {
        self.lock()?
            .channels
            .get(&id)
            .map(|(ch, _)| ch.clone())
            .ok_or_else(|| StoreError::NotFound(format!("channel {}", id)))
    }

    fn create_channel(
        &self,
        channel: Channel,
        members: Option<&HashSet<UserId>>,
        is_dm: bool,
    ) -> StoreResult<Channel> {
        let mut tables = self.lock()?;

        if tables.channels.contains_key(&channel.id) {
            return Err(StoreError::Conflict(format!("channel {} exists", channel.id)));
        }
        if !is_dm && tables.sibling_taken(&channel.name, channel.parent_id, channel.id) {
            return Err(StoreError::Conflict(format!(
                "channel name {} is taken under {}",
                channel.name, channel.parent_id
            )));
        }

        let mut member_ids: Vec<UserId> = members.map(|m| m.iter().copied().collect()).unwrap_or_default();
        member_ids.sort();

        if is_dm {
            let (first, last) = match (member_ids.first(), member_ids.last()) {
                (Some(first), Some(last)) if member_ids.len() <= 2 => (*first, *last),
                _ => {
                    return Err(StoreError::CorruptedData(format!(
                        "direct message channel needs one or two members, got {}",
                        member_ids.len()
                    )))
                }
            };
            let pair = DmChannelMapping::new(channel.id, first, last);
            if tables.dm_pairs.contains_key(&(pair.user1, pair.user2)) {
                return Err(StoreError::Conflict(format!(
                    "direct message channel for {} / {} exists",
                    pair.user1, pair.user2
                )));
            }
            tables.dm_pairs.insert((pair.user1, pair.user2), channel.id);
        }

        if !member_ids.is_empty() {
            tables.members.insert(channel.id, member_ids);
        }
        tables.channels.insert(channel.id, (channel.clone(), is_dm));

        Ok(channel)
    }

    fn update_channel(&self, id: ChannelId, args: &UpdateChannelArgs) -> StoreResult<Channel> {
        let mut tables = self.lock()?;

        let (mut channel, is_dm) = tables
            .channels
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("channel {}", id)))?;

        channel.apply_attributes(args, Timestamp::now());
        if let Some(name) = &args.name {
            channel.name = name.clone();
        }
        if let Some(parent) = args.parent {
            channel.parent_id = parent;
        }

        if !is_dm && tables.sibling_taken(&channel.name, channel.parent_id, id) {
            return Err(StoreError::Conflict(format!(
                "channel name {} is taken under {}",
                channel.name, channel.parent_id
            )));
        }

        tables.channels.insert(id, (channel.clone(), is_dm));
        Ok(channel)
    }

    fn record_channel_event(&self, event: &ChannelEvent) -> StoreResult<()> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("event recording disabled".to_string()));
        }
        let delay = self.event_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.lock()?.events.push(event.clone());
        Ok(())
    }

    fn get_channel_events(&self, id: ChannelId) -> StoreResult<Vec<ChannelEvent>> {
        let mut events: Vec<_> = self
            .lock()?
            .events
            .iter()
            .filter(|e| e.channel_id == id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    fn get_direct_message_channel(&self, a: UserId, b: UserId) -> StoreResult<Channel> {
        let tables = self.lock()?;
        let pair = DmChannelMapping::new(ChannelId::ROOT, a, b);

        tables
            .dm_pairs
            .get(&(pair.user1, pair.user2))
            .and_then(|id| tables.channels.get(id))
            .map(|(ch, _)| ch.clone())
            .ok_or_else(|| StoreError::NotFound(format!("direct message channel {} / {}", a, b)))
    }

    fn get_private_channel_member_ids(&self, id: ChannelId) -> StoreResult<Vec<UserId>> {
        Ok(self.lock()?.members.get(&id).cloned().unwrap_or_default())
    }

    fn get_direct_message_channel_mapping(&self, user: UserId) -> StoreResult<Vec<DmChannelMapping>> {
        Ok(self
            .lock()?
            .dm_pairs
            .iter()
            .filter(|((u1, u2), _)| *u1 == user || *u2 == user)
            .map(|((u1, u2), id)| DmChannelMapping {
                channel_id: *id,
                user1: *u1,
                user2: *u2,
            })
            .collect())
    }

    fn change_channel_subscription(
        &self,
        id: ChannelId,
        args: &ChangeChannelSubscriptionArgs,
    ) -> StoreResult<SubscriptionDiff> {
        let mut tables = self.lock()?;
        let current = tables.subscriptions.entry(id).or_default();

        let (diff, writes) = SubscriptionDiff::compute(current, args);
        for (user, level) in writes {
            if level == SubscriptionLevel::None {
                current.remove(&user);
            } else {
                current.insert(user, level);
            }
        }

        Ok(diff)
    }

    fn get_channel_subscriptions(&self, id: ChannelId) -> StoreResult<HashMap<UserId, SubscriptionLevel>> {
        Ok(self.lock()?.subscriptions.get(&id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_channel::channel::ChannelEventKind;

    #[test]
    fn test_sibling_conflict_on_rename() {
        let store = MemoryChannelStore::new();
        let user = UserId::generate();

        let a = store
            .create_channel(Channel::new("a".to_string(), ChannelId::ROOT, user), None, false)
            .unwrap();
        store
            .create_channel(Channel::new("b".to_string(), ChannelId::ROOT, user), None, false)
            .unwrap();

        let result = store.update_channel(a.id, &UpdateChannelArgs::new(user).name("b"));
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // renaming to its own name is not a conflict
        store.update_channel(a.id, &UpdateChannelArgs::new(user).name("a")).unwrap();
    }

    #[test]
    fn test_self_dm() {
        let store = MemoryChannelStore::new();
        let user = UserId::generate();
        let members: HashSet<_> = [user].into_iter().collect();

        let dm = store
            .create_channel(Channel::new("dm_self".to_string(), ChannelId::ROOT, UserId::NIL), Some(&members), true)
            .unwrap();

        assert_eq!(store.get_direct_message_channel(user, user).unwrap().id, dm.id);
        assert_eq!(store.get_direct_message_channel_mapping(user).unwrap()[0].other(&user), user);
    }

    #[test]
    fn test_event_failure_injection() {
        let store = MemoryChannelStore::new();
        let event = ChannelEvent::new(
            ChannelId::generate(),
            ChannelEventKind::TopicChanged,
            serde_json::json!({}),
            Timestamp::now(),
        );

        store.fail_event_recording(true);
        assert!(store.record_channel_event(&event).is_err());

        store.fail_event_recording(false);
        store.record_channel_event(&event).unwrap();
        assert_eq!(store.get_channel_events(event.channel_id).unwrap().len(), 1);
    }
}
