// ABOUTME: SQLite-backed Backend: channel configuration, inbound messages, and send statuses.
// ABOUTME: One shared connection behind a mutex; tables are created on open.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use ussdgate_core::message::{ChannelLog, InboundMessage, MsgStatus, MsgStatusValue};
use ussdgate_core::{Backend, ChannelConfig, TelUrn};

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS channels (
                uuid TEXT PRIMARY KEY,
                channel_type TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                country TEXT,
                config_json TEXT NOT NULL DEFAULT '{}'
            );
            CREATE TABLE IF NOT EXISTS msgs (
                id TEXT PRIMARY KEY,
                channel_uuid TEXT NOT NULL,
                urn TEXT NOT NULL,
                text TEXT NOT NULL,
                external_id TEXT,
                received_on TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_msgs_channel ON msgs(channel_uuid, received_on);
            CREATE TABLE IF NOT EXISTS msg_statuses (
                msg_id TEXT NOT NULL,
                channel_uuid TEXT NOT NULL,
                status TEXT NOT NULL,
                logs_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_msg_statuses_msg ON msg_statuses(msg_id);",
        )
        .context("Failed to create tables")?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }

    /// Insert or replace a channel definition.
    pub fn upsert_channel(&self, channel: &ChannelConfig) -> Result<()> {
        let config_json = serde_json::to_string(&channel.config)?;
        self.conn()?.execute(
            "INSERT INTO channels (uuid, channel_type, name, country, config_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(uuid) DO UPDATE SET
                channel_type = excluded.channel_type,
                name = excluded.name,
                country = excluded.country,
                config_json = excluded.config_json",
            params![
                channel.uuid.to_string(),
                channel.channel_type,
                channel.name,
                channel.country,
                config_json
            ],
        )?;
        Ok(())
    }

    /// Inbound messages for a channel, oldest first.
    pub fn inbound_messages(&self, channel_uuid: &Uuid) -> Result<Vec<InboundMessage>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, channel_uuid, urn, text, external_id, received_on
             FROM msgs WHERE channel_uuid = ?1 ORDER BY received_on, rowid",
        )?;
        let rows = stmt.query_map(params![channel_uuid.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, channel_uuid, urn, text, external_id, received_on) = row?;
            messages.push(InboundMessage {
                id: Uuid::parse_str(&id).context("Invalid message id in database")?,
                channel_uuid: Uuid::parse_str(&channel_uuid)
                    .context("Invalid channel uuid in database")?,
                urn: TelUrn::try_from(urn)?,
                text,
                external_id,
                received_on: DateTime::parse_from_rfc3339(&received_on)
                    .context("Invalid received_on in database")?
                    .with_timezone(&Utc),
            });
        }
        Ok(messages)
    }

    /// Most recent status recorded for a message.
    pub fn latest_status(&self, msg_id: &Uuid) -> Result<Option<MsgStatus>> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT channel_uuid, status, logs_json FROM msg_statuses
                 WHERE msg_id = ?1 ORDER BY rowid DESC LIMIT 1",
                params![msg_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((channel_uuid, status, logs_json)) = row else {
            return Ok(None);
        };
        let status: MsgStatusValue = serde_json::from_value(serde_json::Value::String(status))
            .context("Invalid status in database")?;
        let logs: Vec<ChannelLog> =
            serde_json::from_str(&logs_json).context("Invalid logs in database")?;
        Ok(Some(MsgStatus {
            msg_id: *msg_id,
            channel_uuid: Uuid::parse_str(&channel_uuid).context("Invalid channel uuid in database")?,
            status,
            logs,
        }))
    }
}

#[async_trait]
impl Backend for SqliteStore {
    async fn channel(&self, uuid: &Uuid) -> Result<Option<ChannelConfig>> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT channel_type, name, country, config_json FROM channels WHERE uuid = ?1",
                params![uuid.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((channel_type, name, country, config_json)) = row else {
            return Ok(None);
        };
        Ok(Some(ChannelConfig {
            uuid: *uuid,
            channel_type,
            name,
            country,
            config: serde_json::from_str(&config_json)
                .with_context(|| format!("Invalid config for channel {}", uuid))?,
        }))
    }

    async fn write_inbound(&self, msg: &InboundMessage) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO msgs (id, channel_uuid, urn, text, external_id, received_on)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    msg.id.to_string(),
                    msg.channel_uuid.to_string(),
                    msg.urn.to_string(),
                    msg.text,
                    msg.external_id,
                    msg.received_on.to_rfc3339()
                ],
            )
            .context("Failed to insert inbound message")?;
        Ok(())
    }

    async fn write_status(&self, status: &MsgStatus) -> Result<()> {
        let logs_json = serde_json::to_string(&status.logs)?;
        self.conn()?
            .execute(
                "INSERT INTO msg_statuses (msg_id, channel_uuid, status, logs_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    status.msg_id.to_string(),
                    status.channel_uuid.to_string(),
                    status.status.code(),
                    logs_json,
                    Utc::now().to_rfc3339()
                ],
            )
            .context("Failed to insert message status")?;
        Ok(())
    }

    async fn health(&self) -> String {
        match self.conn().and_then(|db| {
            db.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(anyhow::Error::from)
        }) {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("database error: {}", e),
        }
    }
}
