/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::BotConfig;
use crate::events::{BotStatus, LogEvent, LogLevel};
use crate::now_ms;
use anyhow::{Context, Result};
use mirrorbot_protocol::Platform;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Sqlite-backed record store for everything the engine persists: bot
/// configs, dedup markers, delivery records, the profile media cache, status
/// projections, command-channel cursors, logs, and cached session cookies.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProfileMedia {
    pub url: String,
    pub fingerprint: String,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct BotRuntimeStatus {
    pub status: BotStatus,
    pub last_sync_ms: Option<i64>,
    pub next_sync_ms: Option<i64>,
    pub last_error: Option<String>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct DeliveryRecordRow {
    pub post_id: String,
    pub platform: Platform,
    pub record: Value,
    pub created_at_ms: i64,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create data dir: {}", dir.display()))?;
        }
        let conn =
            Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS bot_configs (
              bot_id INTEGER PRIMARY KEY,
              config_json BLOB NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS synced_posts (
              bot_id INTEGER NOT NULL,
              post_id TEXT NOT NULL,
              synced_at_ms INTEGER NOT NULL,
              PRIMARY KEY(bot_id, post_id)
            );

            CREATE TABLE IF NOT EXISTS delivery_records (
              bot_id INTEGER NOT NULL,
              post_id TEXT NOT NULL,
              platform TEXT NOT NULL,
              record_json BLOB NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(bot_id, post_id, platform)
            );
            CREATE INDEX IF NOT EXISTS idx_delivery_bot_created
              ON delivery_records(bot_id, created_at_ms DESC);

            CREATE TABLE IF NOT EXISTS profile_media (
              bot_id INTEGER NOT NULL,
              slot TEXT NOT NULL,
              url TEXT NOT NULL,
              fingerprint TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY(bot_id, slot)
            );

            CREATE TABLE IF NOT EXISTS bot_status (
              bot_id INTEGER PRIMARY KEY,
              status TEXT NOT NULL,
              last_sync_ms INTEGER NULL,
              next_sync_ms INTEGER NULL,
              last_error TEXT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channel_cursors (
              bot_id INTEGER PRIMARY KEY,
              last_seen_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bot_logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              bot_id INTEGER NOT NULL,
              level TEXT NOT NULL,
              message TEXT NOT NULL,
              platform TEXT NULL,
              post_id TEXT NULL,
              ts_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_bot_ts ON bot_logs(bot_id, ts_ms DESC);

            CREATE TABLE IF NOT EXISTS session_cookies (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .with_context(|| format!("open db: {}", path.display()))?;
            f(conn)
        })
        .await?
    }

    // --- bot configs ---

    pub async fn upsert_bot_config(&self, cfg: &BotConfig) -> Result<()> {
        let blob = serde_json::to_vec(cfg)?;
        let bot_id = cfg.id;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO bot_configs (bot_id, config_json, updated_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(bot_id) DO UPDATE SET config_json = ?2, updated_at_ms = ?3",
                params![bot_id, blob, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_bot_config(&self, bot_id: i64) -> Result<Option<BotConfig>> {
        self.with_conn(move |conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT config_json FROM bot_configs WHERE bot_id = ?1",
                    params![bot_id],
                    |r| r.get(0),
                )
                .optional()?;
            match blob {
                Some(b) => Ok(Some(
                    serde_json::from_slice(&b).context("decode bot config")?,
                )),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_bot_configs(&self) -> Result<Vec<BotConfig>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT config_json FROM bot_configs ORDER BY bot_id ASC")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let blob: Vec<u8> = row.get(0)?;
                out.push(serde_json::from_slice(&blob).context("decode bot config")?);
            }
            Ok(out)
        })
        .await
    }

    // --- post dedup markers ---

    pub async fn is_post_synced(&self, bot_id: i64, post_id: &str) -> Result<bool> {
        let post_id = post_id.to_string();
        self.with_conn(move |conn| {
            let hit: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM synced_posts WHERE bot_id = ?1 AND post_id = ?2",
                    params![bot_id, post_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(hit.is_some())
        })
        .await
    }

    pub async fn mark_post_synced(&self, bot_id: i64, post_id: &str) -> Result<()> {
        let post_id = post_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO synced_posts (bot_id, post_id, synced_at_ms) VALUES (?1, ?2, ?3)",
                params![bot_id, post_id, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    /// Force-resync override: the only way a synced marker is ever removed.
    pub async fn clear_synced_posts(&self, bot_id: i64) -> Result<u64> {
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM synced_posts WHERE bot_id = ?1", params![bot_id])?;
            Ok(n as u64)
        })
        .await
    }

    pub async fn count_synced_posts(&self, bot_id: i64) -> Result<u64> {
        self.with_conn(move |conn| {
            let n: u64 = conn.query_row(
                "SELECT COUNT(*) FROM synced_posts WHERE bot_id = ?1",
                params![bot_id],
                |r| r.get(0),
            )?;
            Ok(n)
        })
        .await
    }

    // --- delivery records ---

    /// Idempotent: a duplicate (bot, post, platform) insert is a no-op.
    pub async fn insert_delivery_record(
        &self,
        bot_id: i64,
        post_id: &str,
        platform: Platform,
        record: &Value,
    ) -> Result<()> {
        let post_id = post_id.to_string();
        let blob = serde_json::to_vec(record)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO delivery_records
                 (bot_id, post_id, platform, record_json, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![bot_id, post_id, platform.as_str(), blob, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_delivery_record(
        &self,
        bot_id: i64,
        post_id: &str,
        platform: Platform,
    ) -> Result<Option<Value>> {
        let post_id = post_id.to_string();
        self.with_conn(move |conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT record_json FROM delivery_records
                     WHERE bot_id = ?1 AND post_id = ?2 AND platform = ?3",
                    params![bot_id, post_id, platform.as_str()],
                    |r| r.get(0),
                )
                .optional()?;
            match blob {
                Some(b) => Ok(Some(serde_json::from_slice(&b)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn last_delivery_record(&self, bot_id: i64) -> Result<Option<DeliveryRecordRow>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT post_id, platform, record_json, created_at_ms
                     FROM delivery_records WHERE bot_id = ?1
                     ORDER BY created_at_ms DESC, post_id DESC LIMIT 1",
                    params![bot_id],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, Vec<u8>>(2)?,
                            r.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;
            let Some((post_id, platform, blob, created_at_ms)) = row else {
                return Ok(None);
            };
            let Some(platform) = Platform::parse(&platform) else {
                return Ok(None);
            };
            Ok(Some(DeliveryRecordRow {
                post_id,
                platform,
                record: serde_json::from_slice(&blob)?,
                created_at_ms,
            }))
        })
        .await
    }

    pub async fn count_delivery_records(&self, bot_id: i64) -> Result<u64> {
        self.with_conn(move |conn| {
            let n: u64 = conn.query_row(
                "SELECT COUNT(*) FROM delivery_records WHERE bot_id = ?1",
                params![bot_id],
                |r| r.get(0),
            )?;
            Ok(n)
        })
        .await
    }

    // --- profile media cache ---

    pub async fn get_profile_media(
        &self,
        bot_id: i64,
        slot: &str,
    ) -> Result<Option<ProfileMedia>> {
        let slot = slot.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT url, fingerprint, updated_at_ms FROM profile_media
                     WHERE bot_id = ?1 AND slot = ?2",
                    params![bot_id, slot],
                    |r| {
                        Ok(ProfileMedia {
                            url: r.get(0)?,
                            fingerprint: r.get(1)?,
                            updated_at_ms: r.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    pub async fn set_profile_media(
        &self,
        bot_id: i64,
        slot: &str,
        url: &str,
        fingerprint: &str,
    ) -> Result<()> {
        let slot = slot.to_string();
        let url = url.to_string();
        let fingerprint = fingerprint.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO profile_media (bot_id, slot, url, fingerprint, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(bot_id, slot) DO UPDATE SET
                   url = ?3, fingerprint = ?4, updated_at_ms = ?5",
                params![bot_id, slot, url, fingerprint, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    // --- status projection ---

    pub async fn upsert_status(
        &self,
        bot_id: i64,
        status: BotStatus,
        last_sync_ms: Option<i64>,
        next_sync_ms: Option<i64>,
        last_error: Option<String>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO bot_status
                 (bot_id, status, last_sync_ms, next_sync_ms, last_error, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(bot_id) DO UPDATE SET
                   status = ?2, last_sync_ms = ?3, next_sync_ms = ?4,
                   last_error = ?5, updated_at_ms = ?6",
                params![
                    bot_id,
                    status.as_str(),
                    last_sync_ms,
                    next_sync_ms,
                    last_error,
                    now_ms()
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_status(&self, bot_id: i64) -> Result<Option<BotRuntimeStatus>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT status, last_sync_ms, next_sync_ms, last_error, updated_at_ms
                     FROM bot_status WHERE bot_id = ?1",
                    params![bot_id],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, Option<i64>>(1)?,
                            r.get::<_, Option<i64>>(2)?,
                            r.get::<_, Option<String>>(3)?,
                            r.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;
            let Some((status, last_sync_ms, next_sync_ms, last_error, updated_at_ms)) = row
            else {
                return Ok(None);
            };
            let status = BotStatus::parse(&status).unwrap_or(BotStatus::Stopped);
            Ok(Some(BotRuntimeStatus {
                status,
                last_sync_ms,
                next_sync_ms,
                last_error,
                updated_at_ms,
            }))
        })
        .await
    }

    // --- command channel cursor ---

    pub async fn get_channel_cursor(&self, bot_id: i64) -> Result<Option<String>> {
        self.with_conn(move |conn| {
            let v = conn
                .query_row(
                    "SELECT last_seen_at FROM channel_cursors WHERE bot_id = ?1",
                    params![bot_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(v)
        })
        .await
    }

    pub async fn set_channel_cursor(&self, bot_id: i64, last_seen_at: &str) -> Result<()> {
        let last_seen_at = last_seen_at.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO channel_cursors (bot_id, last_seen_at) VALUES (?1, ?2)
                 ON CONFLICT(bot_id) DO UPDATE SET last_seen_at = ?2",
                params![bot_id, last_seen_at],
            )?;
            Ok(())
        })
        .await
    }

    // --- logs ---

    pub async fn append_log(&self, event: &LogEvent) -> Result<()> {
        let event = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO bot_logs (bot_id, level, message, platform, post_id, ts_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.bot_id,
                    event.level.as_str(),
                    event.message,
                    event.platform.map(|p| p.as_str()),
                    event.post_id,
                    event.ts_ms
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn recent_logs(&self, bot_id: i64, limit: u32) -> Result<Vec<LogEvent>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT level, message, platform, post_id, ts_ms FROM bot_logs
                 WHERE bot_id = ?1 ORDER BY ts_ms DESC, id DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(params![bot_id, limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let level: String = row.get(0)?;
                let platform: Option<String> = row.get(2)?;
                out.push(LogEvent {
                    bot_id,
                    level: LogLevel::parse(&level).unwrap_or(LogLevel::Info),
                    message: row.get(1)?,
                    platform: platform.as_deref().and_then(Platform::parse),
                    post_id: row.get(3)?,
                    ts_ms: row.get(4)?,
                });
            }
            Ok(out)
        })
        .await
    }

    // --- session cookie cache ---

    pub async fn get_session_cookies(&self) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM session_cookies")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push((row.get(0)?, row.get(1)?));
            }
            Ok(out)
        })
        .await
    }

    pub async fn replace_session_cookies(&self, cookies: &[(String, String)]) -> Result<()> {
        let cookies = cookies.to_vec();
        self.with_conn(move |mut conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM session_cookies", [])?;
            for (key, value) in cookies {
                tx.execute(
                    "INSERT INTO session_cookies (key, value, updated_at_ms) VALUES (?1, ?2, ?3)",
                    params![key, value, now_ms()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn clear_session_cookies(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM session_cookies", [])?;
            Ok(())
        })
        .await
    }
}
