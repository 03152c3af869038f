/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::now_ms;
use crate::store::Store;
use mirrorbot_protocol::Platform;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "success" => Some(LogLevel::Success),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Running,
    Stopped,
    Error,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Running => "running",
            BotStatus::Stopped => "stopped",
            BotStatus::Error => "error",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "running" => Some(BotStatus::Running),
            "stopped" => Some(BotStatus::Stopped),
            "error" => Some(BotStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub bot_id: i64,
    pub level: LogLevel,
    pub message: String,
    pub platform: Option<Platform>,
    pub post_id: Option<String>,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EngineEvent {
    Log(LogEvent),
    Status { bot_id: i64, status: BotStatus },
}

/// Broadcast fan-out for dashboards and log viewers. Lagging subscribers
/// lose the oldest events (tokio broadcast semantics), producers never block.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Per-bot sink that mirrors every event three ways: tracing, the durable
/// log table, and the broadcast channel.
#[derive(Clone)]
pub struct BotReporter {
    bot_id: i64,
    store: Store,
    bus: EventBus,
}

impl BotReporter {
    pub fn new(bot_id: i64, store: Store, bus: EventBus) -> Self {
        Self { bot_id, store, bus }
    }

    pub fn bot_id(&self) -> i64 {
        self.bot_id
    }

    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        platform: Option<Platform>,
        post_id: Option<String>,
    ) {
        let event = LogEvent {
            bot_id: self.bot_id,
            level,
            message: message.into(),
            platform,
            post_id,
            ts_ms: now_ms(),
        };
        match level {
            LogLevel::Info | LogLevel::Success => {
                info!("bot {}: {}", event.bot_id, event.message)
            }
            LogLevel::Warn => warn!("bot {}: {}", event.bot_id, event.message),
            LogLevel::Error => error!("bot {}: {}", event.bot_id, event.message),
        }
        if let Err(e) = self.store.append_log(&event).await {
            debug!("log persist failed: {e:#}");
        }
        self.bus.publish(EngineEvent::Log(event));
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, None, None).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, None, None).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, None, None).await;
    }

    pub async fn success(&self, message: impl Into<String>) {
        self.log(LogLevel::Success, message, None, None).await;
    }

    /// Overwrites the persisted status projection and broadcasts the
    /// transition. The persisted row is for external viewers only; liveness
    /// truth stays in the manager's in-memory map.
    pub async fn status(
        &self,
        status: BotStatus,
        last_sync_ms: Option<i64>,
        next_sync_ms: Option<i64>,
        last_error: Option<String>,
    ) {
        if let Err(e) = self
            .store
            .upsert_status(self.bot_id, status, last_sync_ms, next_sync_ms, last_error)
            .await
        {
            debug!("status persist failed: {e:#}");
        }
        self.bus.publish(EngineEvent::Status {
            bot_id: self.bot_id,
            status,
        });
    }
}
