//! Database migrations for the channel store
//!
//! Each migration is applied atomically and tracked in the
//! `channel_schema_version` table.

use super::super::types::Timestamp;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::info;

/// Current schema version for the channel store
pub const CURRENT_CHANNEL_SCHEMA_VERSION: i32 = 2;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Channels, direct messages and channel events",
            up_sql: r#"
                -- Channels (public tree nodes and DM channels)
                CREATE TABLE IF NOT EXISTS channels (
                    id TEXT PRIMARY KEY,                    -- ChannelId (uuid)
                    name TEXT NOT NULL,
                    parent_id TEXT NOT NULL,                -- nil uuid for top level
                    topic TEXT NOT NULL DEFAULT '',
                    is_forced INTEGER NOT NULL DEFAULT 0,
                    is_visible INTEGER NOT NULL DEFAULT 1,
                    is_dm INTEGER NOT NULL DEFAULT 0,
                    creator_id TEXT NOT NULL,               -- UserId
                    updater_id TEXT NOT NULL,               -- UserId
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                -- Sibling names are unique among public channels
                CREATE UNIQUE INDEX IF NOT EXISTS idx_channels_sibling_name
                    ON channels(parent_id, name) WHERE is_dm = 0;
                CREATE INDEX IF NOT EXISTS idx_channels_public ON channels(is_dm);

                -- Members of private (DM) channels
                CREATE TABLE IF NOT EXISTS private_channel_members (
                    channel_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    PRIMARY KEY (channel_id, user_id),
                    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
                );

                CREATE INDEX IF NOT EXISTS idx_private_channel_members_user
                    ON private_channel_members(user_id);

                -- One DM channel per unordered user pair (user1 <= user2)
                CREATE TABLE IF NOT EXISTS dm_channel_mappings (
                    channel_id TEXT PRIMARY KEY,
                    user1 TEXT NOT NULL,
                    user2 TEXT NOT NULL,
                    UNIQUE (user1, user2),
                    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
                );

                CREATE INDEX IF NOT EXISTS idx_dm_channel_mappings_user2 ON dm_channel_mappings(user2);

                -- Audit trail
                CREATE TABLE IF NOT EXISTS channel_events (
                    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    channel_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    detail TEXT NOT NULL,                   -- JSON object
                    recorded_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_channel_events_channel
                    ON channel_events(channel_id, recorded_at);
            "#,
        },
        Migration {
            version: 2,
            description: "Channel subscriptions",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS channel_subscriptions (
                    channel_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    level INTEGER NOT NULL CHECK(level IN (1, 2)),
                    PRIMARY KEY (channel_id, user_id),
                    FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE CASCADE
                );

                CREATE INDEX IF NOT EXISTS idx_channel_subscriptions_user
                    ON channel_subscriptions(user_id);
            "#,
        },
    ]
}

fn ensure_version_table(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS channel_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> Result<i32, rusqlite::Error> {
    ensure_version_table(conn)?;

    let version: Option<i32> = conn.query_row(
        "SELECT MAX(version) FROM channel_schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> Result<(), super::StoreError> {
    let conn = pool.get()?;
    let current_version = get_current_version(&conn)?;

    let pending: Vec<_> = get_migrations()
        .into_iter()
        .filter(|m| m.version > current_version)
        .collect();

    for migration in pending {
        let tx = conn.unchecked_transaction()?;

        tx.execute_batch(migration.up_sql)?;
        tx.execute(
            "INSERT INTO channel_schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, Timestamp::now().as_millis() as i64],
        )?;

        tx.commit()?;

        info!(
            version = migration.version,
            description = migration.description,
            "Applied channel store migration"
        );
    }

    Ok(())
}

/// Get the latest migration version available
pub fn get_latest_version() -> i32 {
    get_migrations().iter().map(|m| m.version).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_pool() -> Pool<SqliteConnectionManager> {
        let manager = SqliteConnectionManager::memory();
        Pool::builder().max_size(1).build(manager).expect("Failed to create pool")
    }

    #[test]
    fn test_initial_migration() {
        let pool = setup_test_pool();
        migrate(&pool).expect("Migration failed");

        let conn = pool.get().unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for table in [
            "channels",
            "private_channel_members",
            "dm_channel_mappings",
            "channel_events",
            "channel_subscriptions",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_migration_version_tracking() {
        let pool = setup_test_pool();
        migrate(&pool).expect("Migration failed");

        let conn = pool.get().unwrap();
        let version = get_current_version(&conn).expect("Failed to get version");
        assert_eq!(version, CURRENT_CHANNEL_SCHEMA_VERSION);
        assert_eq!(get_latest_version(), CURRENT_CHANNEL_SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_migrations() {
        let pool = setup_test_pool();

        migrate(&pool).expect("First migration failed");
        migrate(&pool).expect("Second migration failed");

        let conn = pool.get().unwrap();
        let version = get_current_version(&conn).expect("Failed to get version");
        assert_eq!(version, CURRENT_CHANNEL_SCHEMA_VERSION);
    }

    #[test]
    fn test_sibling_name_index_ignores_dm_channels() {
        let pool = setup_test_pool();
        migrate(&pool).expect("Migration failed");
        let conn = pool.get().unwrap();

        let insert = "INSERT INTO channels (id, name, parent_id, is_dm, creator_id, updater_id, created_at, updated_at)
                      VALUES (?, ?, 'root', ?, 'u', 'u', 0, 0)";

        conn.execute(insert, params!["a", "general", 0]).unwrap();
        assert!(conn.execute(insert, params!["b", "general", 0]).is_err());

        conn.execute(insert, params!["c", "dm_x", 1]).unwrap();
        conn.execute(insert, params!["d", "dm_x", 1]).unwrap();
    }
}
