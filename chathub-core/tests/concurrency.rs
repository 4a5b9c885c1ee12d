/*
    concurrency.rs - Parallel callers against one manager

    Every test starts its callers behind a barrier so they race for the tree
    lock (or, for direct messages, for the store's unique constraint).
*/

use chathub_core::config::{AuditConfig, HierarchyConfig, StoreConfig};
use chathub_core::core_channel::{
    Channel, ChannelError, ChannelId, ChannelManager, ChannelStore, MemoryChannelStore,
    SqlChannelStore, UpdateChannelArgs, UserId,
};
use chathub_core::test_utils::{assert_tree_invariants, TestHierarchy};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;
use tokio::runtime::Handle;

const CALLERS: usize = 8;

fn race<T, F>(f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    let barrier = Barrier::new(CALLERS);
    thread::scope(|s| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|i| {
                let barrier = &barrier;
                let f = &f;
                s.spawn(move || {
                    barrier.wait();
                    f(i)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn sql_manager(dir: &std::path::Path) -> (ChannelManager, Arc<SqlChannelStore>) {
    let store = Arc::new(
        SqlChannelStore::open(&StoreConfig {
            database_path: Some(dir.join("channels.db")),
            pool_size: 4,
        })
        .unwrap(),
    );
    let manager = ChannelManager::init(
        store.clone(),
        &HierarchyConfig::default(),
        &AuditConfig::default(),
        Handle::current(),
    )
    .unwrap();
    (manager, store)
}

fn assert_single_winner(results: Vec<Result<Channel, ChannelError>>) {
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(ChannelError::NameConflict)))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(conflicts, CALLERS - 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_creates_same_name_memory() {
    let hierarchy = TestHierarchy::new();
    let user = hierarchy.user;

    let results = race(|_| {
        hierarchy
            .manager
            .create_public_channel("general", ChannelId::ROOT, user)
    });

    assert_single_winner(results);
    assert_eq!(hierarchy.store.channel_count().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_creates_same_name_sql() {
    let dir = tempdir().unwrap();
    let (manager, store) = sql_manager(dir.path());
    let user = UserId::generate();

    let results = race(|_| manager.create_public_channel("general", ChannelId::ROOT, user));

    assert_single_winner(results);
    assert_eq!(store.get_public_channels().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_dm_get_or_create_memory() {
    let hierarchy = TestHierarchy::new();
    let a = UserId::generate();
    let b = UserId::generate();

    let ids = race(|i| {
        let (first, second) = if i % 2 == 0 { (a, b) } else { (b, a) };
        hierarchy.manager.get_dm_channel(first, second).unwrap().id
    });

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(hierarchy.store.channel_count().unwrap(), 1);
    assert_eq!(hierarchy.manager.get_dm_channel_mapping(a).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_dm_get_or_create_sql() {
    let dir = tempdir().unwrap();
    let (manager, store) = sql_manager(dir.path());
    let a = UserId::generate();
    let b = UserId::generate();

    let ids = race(|i| {
        let (first, second) = if i % 2 == 0 { (a, b) } else { (b, a) };
        manager.get_dm_channel(first, second).unwrap().id
    });

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(store.get_direct_message_channel_mapping(b).unwrap().len(), 1);
}

/// Each caller tries to hang channel i under channel i+1; whatever order the
/// lock grants, the ring can never close.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_moves_never_form_cycle() {
    let hierarchy = TestHierarchy::new();
    let user = hierarchy.user;
    let channels: Vec<Channel> = (0..CALLERS)
        .map(|i| {
            hierarchy
                .manager
                .create_public_channel(&format!("c{}", i), ChannelId::ROOT, user)
                .unwrap()
        })
        .collect();

    let results = race(|i| {
        let target = channels[(i + 1) % CALLERS].id;
        hierarchy
            .manager
            .update_channel(channels[i].id, &UpdateChannelArgs::new(user).parent(target))
    });

    for result in &results {
        assert!(matches!(result, Ok(_) | Err(ChannelError::TooDeep)));
    }
    assert!(results.iter().any(|r| r.is_err()));

    let tree = hierarchy.manager.public_channel_tree();
    assert_eq!(tree.len(), CALLERS);
    assert_tree_invariants(&tree.read(), hierarchy.manager.max_channel_depth());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_readers_see_consistent_tree_during_moves() {
    let hierarchy = TestHierarchy::new();
    let user = hierarchy.user;
    let max_depth = hierarchy.manager.max_channel_depth();

    let chain = hierarchy.chain(ChannelId::ROOT, "a", 3);
    let spare = hierarchy.manager.create_public_channel("spare", ChannelId::ROOT, user).unwrap();
    let tree = hierarchy.manager.public_channel_tree();

    race(|i| {
        if i == 0 {
            for round in 0..50 {
                let parent = if round % 2 == 0 { spare.id } else { ChannelId::ROOT };
                hierarchy
                    .manager
                    .update_channel(chain[0].id, &UpdateChannelArgs::new(user).parent(parent))
                    .unwrap();
            }
        } else {
            for _ in 0..200 {
                let ascendants = tree.ascendant_ids(chain[2].id);
                assert!(ascendants.len() < max_depth);
                assert_eq!(ascendants[0], chain[1].id);
                assert!(ascendants.len() == 2 || ascendants.len() == 3);
            }
        }
    });

    assert_tree_invariants(&tree.read(), max_depth);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manager_shared_across_tasks() {
    let store = MemoryChannelStore::new();
    let manager = Arc::new(
        ChannelManager::init(
            Arc::new(store.clone()),
            &HierarchyConfig::default(),
            &AuditConfig::default(),
            Handle::current(),
        )
        .unwrap(),
    );
    let user = UserId::generate();

    let tasks: Vec<_> = (0..CALLERS)
        .map(|i| {
            let manager = Arc::clone(&manager);
            tokio::task::spawn_blocking(move || {
                manager.create_public_channel(&format!("team{}", i), ChannelId::ROOT, user)
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(manager.public_channel_tree().len(), CALLERS);
    assert_eq!(store.channel_count().unwrap(), CALLERS);
}
