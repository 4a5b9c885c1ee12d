//! SQL-based storage implementation for channels

use super::super::channel::{
    Channel, ChannelEvent, ChannelEventKind, DmChannelMapping, EventDetail, SubscriptionLevel,
    UpdateChannelArgs,
};
use super::super::types::{ChannelId, Timestamp, UserId};
use super::{ChangeChannelSubscriptionArgs, ChannelStore, StoreError, StoreResult, SubscriptionDiff};
use crate::config::StoreConfig;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

const CHANNEL_COLUMNS: &str =
    "id, name, parent_id, topic, is_forced, is_visible, creator_id, updater_id, created_at, updated_at";

/// SQL-based storage for channels, DM mappings, events and subscriptions
pub struct SqlChannelStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqlChannelStore {
    /// Create a new SQL store with the given connection pool
    pub fn new(pool: Pool<SqliteConnectionManager>) -> StoreResult<Self> {
        super::migrations::migrate(&pool)?;

        Ok(Self { pool })
    }

    /// Open the store described by `config`: a database file, or a private
    /// in-memory database when no path is configured
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        match &config.database_path {
            Some(path) => {
                let manager = SqliteConnectionManager::file(path)
                    .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;"));
                let pool = Pool::builder().max_size(config.pool_size).build(manager)?;
                Self::new(pool)
            }
            None => Self::memory(),
        }
    }

    /// Create a new in-memory store
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// limited to a single connection.
    pub fn memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;

        Self::new(pool)
    }

    fn load_channel(conn: &rusqlite::Connection, id: ChannelId) -> StoreResult<Channel> {
        conn.query_row(
            &format!("SELECT {} FROM channels WHERE id = ?", CHANNEL_COLUMNS),
            params![id.to_string()],
            channel_from_row,
        )
        .optional()
        .map_err(StoreError::from_sqlite)?
        .ok_or_else(|| StoreError::NotFound(format!("channel {}", id)))
    }

    fn load_subscriptions(
        conn: &rusqlite::Connection,
        id: ChannelId,
    ) -> StoreResult<HashMap<UserId, SubscriptionLevel>> {
        let mut stmt = conn.prepare("SELECT user_id, level FROM channel_subscriptions WHERE channel_id = ?")?;

        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                let user = parse_column::<UserId>(row, 0)?;
                let raw: i64 = row.get(1)?;
                let level = SubscriptionLevel::from_i64(raw).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        Type::Integer,
                        format!("invalid subscription level {}", raw).into(),
                    )
                })?;
                Ok((user, level))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;

        Ok(rows)
    }
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: parse_column(row, 0)?,
        name: row.get(1)?,
        parent_id: parse_column(row, 2)?,
        topic: row.get(3)?,
        is_forced: row.get(4)?,
        is_visible: row.get(5)?,
        creator_id: parse_column(row, 6)?,
        updater_id: parse_column(row, 7)?,
        created_at: Timestamp::from_millis(row.get::<_, i64>(8)?.max(0) as u64),
        updated_at: Timestamp::from_millis(row.get::<_, i64>(9)?.max(0) as u64),
        children: Vec::new(),
    })
}

impl ChannelStore for SqlChannelStore {
    fn get_public_channels(&self) -> StoreResult<Vec<Channel>> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM channels WHERE is_dm = 0 ORDER BY created_at",
            CHANNEL_COLUMNS
        ))?;

        let channels = stmt
            .query_map([], channel_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(channels)
    }

    fn get_channel(&self, id: ChannelId) -> StoreResult<Channel> {
        let conn = self.pool.get()?;
        Self::load_channel(&conn, id)
    }

    fn create_channel(
        &self,
        channel: Channel,
        members: Option<&HashSet<UserId>>,
        is_dm: bool,
    ) -> StoreResult<Channel> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO channels (id, name, parent_id, topic, is_forced, is_visible, is_dm,
                                   creator_id, updater_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                channel.id.to_string(),
                &channel.name,
                channel.parent_id.to_string(),
                &channel.topic,
                channel.is_forced,
                channel.is_visible,
                is_dm,
                channel.creator_id.to_string(),
                channel.updater_id.to_string(),
                channel.created_at.as_millis() as i64,
                channel.updated_at.as_millis() as i64,
            ],
        )
        .map_err(StoreError::from_sqlite)?;

        if let Some(members) = members {
            for user in members {
                tx.execute(
                    "INSERT INTO private_channel_members (channel_id, user_id) VALUES (?, ?)",
                    params![channel.id.to_string(), user.to_string()],
                )
                .map_err(StoreError::from_sqlite)?;
            }

            if is_dm {
                let mut users: Vec<_> = members.iter().copied().collect();
                users.sort();
                let (first, last) = match (users.first(), users.last()) {
                    (Some(first), Some(last)) if users.len() <= 2 => (*first, *last),
                    _ => {
                        return Err(StoreError::CorruptedData(format!(
                            "direct message channel needs one or two members, got {}",
                            users.len()
                        )))
                    }
                };
                let mapping = DmChannelMapping::new(channel.id, first, last);

                tx.execute(
                    "INSERT INTO dm_channel_mappings (channel_id, user1, user2) VALUES (?, ?, ?)",
                    params![
                        channel.id.to_string(),
                        mapping.user1.to_string(),
                        mapping.user2.to_string()
                    ],
                )
                .map_err(StoreError::from_sqlite)?;
            }
        }

        tx.commit()?;

        Ok(channel)
    }

    fn update_channel(&self, id: ChannelId, args: &UpdateChannelArgs) -> StoreResult<Channel> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut channel = Self::load_channel(&tx, id)?;
        channel.apply_attributes(args, Timestamp::now());
        if let Some(name) = &args.name {
            channel.name = name.clone();
        }
        if let Some(parent) = args.parent {
            channel.parent_id = parent;
        }

        tx.execute(
            "UPDATE channels
             SET name = ?, parent_id = ?, topic = ?, is_forced = ?, is_visible = ?,
                 updater_id = ?, updated_at = ?
             WHERE id = ?",
            params![
                &channel.name,
                channel.parent_id.to_string(),
                &channel.topic,
                channel.is_forced,
                channel.is_visible,
                channel.updater_id.to_string(),
                channel.updated_at.as_millis() as i64,
                channel.id.to_string(),
            ],
        )
        .map_err(StoreError::from_sqlite)?;

        tx.commit()?;

        Ok(channel)
    }

    fn record_channel_event(&self, event: &ChannelEvent) -> StoreResult<()> {
        let conn = self.pool.get()?;
        let detail = serde_json::to_string(&event.detail)?;

        conn.execute(
            "INSERT INTO channel_events (channel_id, event_type, detail, recorded_at) VALUES (?, ?, ?, ?)",
            params![
                event.channel_id.to_string(),
                event.kind.as_str(),
                detail,
                event.timestamp.as_millis() as i64,
            ],
        )
        .map_err(StoreError::from_sqlite)?;

        Ok(())
    }

    fn get_channel_events(&self, id: ChannelId) -> StoreResult<Vec<ChannelEvent>> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT event_type, detail, recorded_at FROM channel_events
             WHERE channel_id = ? ORDER BY recorded_at, event_id",
        )?;

        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(kind, detail, recorded_at)| {
                let kind = ChannelEventKind::from_str(&kind).map_err(StoreError::CorruptedData)?;
                let detail: EventDetail = serde_json::from_str(&detail)?;
                Ok::<_, StoreError>(ChannelEvent {
                    channel_id: id,
                    kind,
                    detail,
                    timestamp: Timestamp::from_millis(recorded_at.max(0) as u64),
                })
            })
            .collect()
    }

    fn get_direct_message_channel(&self, a: UserId, b: UserId) -> StoreResult<Channel> {
        let conn = self.pool.get()?;
        let pair = DmChannelMapping::new(ChannelId::ROOT, a, b);

        let channel_id: Option<String> = conn
            .query_row(
                "SELECT channel_id FROM dm_channel_mappings WHERE user1 = ? AND user2 = ?",
                params![pair.user1.to_string(), pair.user2.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let channel_id = channel_id
            .ok_or_else(|| StoreError::NotFound(format!("direct message channel {} / {}", a, b)))?;
        let channel_id = ChannelId::from_str(&channel_id)
            .map_err(|e| StoreError::CorruptedData(e.to_string()))?;

        Self::load_channel(&conn, channel_id)
    }

    fn get_private_channel_member_ids(&self, id: ChannelId) -> StoreResult<Vec<UserId>> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT user_id FROM private_channel_members WHERE channel_id = ? ORDER BY user_id",
        )?;

        let members = stmt
            .query_map(params![id.to_string()], |row| parse_column::<UserId>(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(members)
    }

    fn get_direct_message_channel_mapping(&self, user: UserId) -> StoreResult<Vec<DmChannelMapping>> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT channel_id, user1, user2 FROM dm_channel_mappings WHERE user1 = ?1 OR user2 = ?1",
        )?;

        let mappings = stmt
            .query_map(params![user.to_string()], |row| {
                Ok(DmChannelMapping {
                    channel_id: parse_column(row, 0)?,
                    user1: parse_column(row, 1)?,
                    user2: parse_column(row, 2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(mappings)
    }

    fn change_channel_subscription(
        &self,
        id: ChannelId,
        args: &ChangeChannelSubscriptionArgs,
    ) -> StoreResult<SubscriptionDiff> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::load_subscriptions(&tx, id)?;
        let (diff, writes) = SubscriptionDiff::compute(&current, args);

        for (user, level) in writes {
            match level {
                SubscriptionLevel::None => {
                    tx.execute(
                        "DELETE FROM channel_subscriptions WHERE channel_id = ? AND user_id = ?",
                        params![id.to_string(), user.to_string()],
                    )?;
                }
                level => {
                    tx.execute(
                        "INSERT INTO channel_subscriptions (channel_id, user_id, level) VALUES (?, ?, ?)
                         ON CONFLICT(channel_id, user_id) DO UPDATE SET level = excluded.level",
                        params![id.to_string(), user.to_string(), level.as_i64()],
                    )
                    .map_err(StoreError::from_sqlite)?;
                }
            }
        }

        tx.commit()?;

        Ok(diff)
    }

    fn get_channel_subscriptions(&self, id: ChannelId) -> StoreResult<HashMap<UserId, SubscriptionLevel>> {
        let conn = self.pool.get()?;
        Self::load_subscriptions(&conn, id)
    }
}
