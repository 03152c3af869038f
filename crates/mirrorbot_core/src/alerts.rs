/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::now_ms;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(15 * 60);

/// Best-effort operator notification with a per-error-key cooldown so a
/// flapping destination cannot storm the webhook. Failures to deliver an
/// alert are logged and dropped.
pub struct Alerts {
    webhook: Option<String>,
    http: reqwest::Client,
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl Alerts {
    pub fn new(webhook: Option<String>, http: reqwest::Client) -> Self {
        Self {
            webhook,
            http,
            cooldown: DEFAULT_COOLDOWN,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, reqwest::Client::new())
    }

    #[cfg(test)]
    pub(crate) fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// True when the alert passed the cooldown gate (whether or not the
    /// webhook call itself succeeded).
    pub async fn notify(&self, key: &str, message: &str) -> bool {
        let Some(webhook) = self.webhook.as_deref() else {
            return false;
        };
        {
            let mut last = self.last_sent.lock().unwrap_or_else(|p| p.into_inner());
            let now = Instant::now();
            if let Some(prev) = last.get(key) {
                if now.duration_since(*prev) < self.cooldown {
                    return false;
                }
            }
            last.insert(key.to_string(), now);
        }

        let body = json!({
            "key": key,
            "message": message,
            "ts_ms": now_ms(),
        });
        let webhook = webhook.to_string();
        let http = self.http.clone();
        // Fire and forget; alerting must never slow a pass down.
        tokio::spawn(async move {
            if let Err(e) = http.post(&webhook).json(&body).send().await {
                debug!("alert webhook failed: {e:#}");
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_webhook_means_no_alerts() {
        let alerts = Alerts::disabled();
        assert!(!alerts.notify("k", "boom").await);
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeats_per_key() {
        let alerts = Alerts::new(
            Some("http://127.0.0.1:1/hook".to_string()),
            reqwest::Client::new(),
        )
        .with_cooldown(Duration::from_secs(60));
        assert!(alerts.notify("bot-1-pass", "boom").await);
        assert!(!alerts.notify("bot-1-pass", "boom again").await);
        // Different key has its own cooldown window.
        assert!(alerts.notify("bot-2-pass", "boom").await);
    }
}
