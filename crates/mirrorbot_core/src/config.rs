/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::transforms::{self, TransformRule};
use anyhow::{bail, Context, Result};
use mirrorbot_protocol::Platform;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

fn default_interval_minutes() -> u64 {
    30
}

fn default_dedup_cutoff() -> u32 {
    3
}

fn default_poll_seconds() -> u64 {
    90
}

/// Credentials for one destination platform, decrypted form. Held in memory
/// only while a bot runs; encryption at rest belongs to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub platform: Platform,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamCredentials {
    pub username: String,
    pub password: String,
}

/// Response templates for the command channel. `{message}` is substituted
/// with the command outcome where present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyTemplates {
    #[serde(default = "ReplyTemplates::default_unauthorized")]
    pub unauthorized: String,
    #[serde(default = "ReplyTemplates::default_unknown")]
    pub unknown: String,
    #[serde(default = "ReplyTemplates::default_ok")]
    pub ok: String,
    #[serde(default = "ReplyTemplates::default_error")]
    pub error: String,
}

impl ReplyTemplates {
    fn default_unauthorized() -> String {
        "Sorry, you are not allowed to control this bot.".to_string()
    }
    fn default_unknown() -> String {
        "Unknown command. Try !help.".to_string()
    }
    fn default_ok() -> String {
        "{message}".to_string()
    }
    fn default_error() -> String {
        "Command failed: {message}".to_string()
    }

    pub fn render(template: &str, message: &str) -> String {
        template.replace("{message}", message)
    }
}

impl Default for ReplyTemplates {
    fn default() -> Self {
        Self {
            unauthorized: Self::default_unauthorized(),
            unknown: Self::default_unknown(),
            ok: Self::default_ok(),
            error: Self::default_error(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub trusted_handles: Vec<String>,
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,
    #[serde(default)]
    pub templates: ReplyTemplates,
}

impl Default for CommandChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trusted_handles: Vec::new(),
            poll_seconds: default_poll_seconds(),
            templates: ReplyTemplates::default(),
        }
    }
}

/// Everything one bot needs: identity, source account, sync policy, and the
/// destination set. Mutated only through the manager/executor; never while a
/// pass for the same bot is mid-flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: i64,
    #[serde(alias = "sourceHandle")]
    pub source_handle: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_minutes", alias = "intervalMinutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_true")]
    pub sync_posts: bool,
    #[serde(default)]
    pub sync_bio: bool,
    #[serde(default)]
    pub sync_avatar: bool,
    #[serde(default)]
    pub sync_banner: bool,
    #[serde(default)]
    pub sync_name: bool,
    #[serde(default)]
    pub backdate: bool,
    #[serde(default = "default_dedup_cutoff")]
    pub dedup_cutoff: u32,
    #[serde(default)]
    pub transforms: Vec<TransformRule>,
    #[serde(default)]
    pub destination_transforms: HashMap<Platform, Vec<TransformRule>>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    pub upstream: UpstreamCredentials,
    #[serde(default)]
    pub command_channel: CommandChannelConfig,
}

impl BotConfig {
    /// Load-time validation: at most one destination per platform, an
    /// interval of at least one minute, and compilable transform rules.
    pub fn validate(&self) -> Result<()> {
        if self.source_handle.trim().is_empty() {
            bail!("bot {}: empty source handle", self.id);
        }
        if self.interval_minutes == 0 {
            bail!("bot {}: sync interval must be at least 1 minute", self.id);
        }
        let mut seen = HashSet::new();
        for d in &self.destinations {
            if !seen.insert(d.platform) {
                bail!("bot {}: duplicate destination {}", self.id, d.platform);
            }
        }
        transforms::compile(&self.transforms)
            .with_context(|| format!("bot {}: global transforms", self.id))?;
        for (platform, rules) in &self.destination_transforms {
            transforms::compile(rules)
                .with_context(|| format!("bot {}: {platform} transforms", self.id))?;
        }
        Ok(())
    }

    pub fn wants_profile_sync(&self) -> bool {
        self.sync_bio || self.sync_avatar || self.sync_banner || self.sync_name
    }
}

/// Top-level config for the service binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default, alias = "dataDir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "alertWebhook")]
    pub alert_webhook: Option<String>,
    #[serde(default)]
    pub bots: Vec<BotConfig>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for bot in &self.bots {
            if !ids.insert(bot.id) {
                bail!("duplicate bot id {}", bot.id);
            }
            bot.validate()?;
        }
        Ok(())
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("MIRRORBOT_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = directories::ProjectDirs::from("net", "mirrorbot", "Mirrorbot")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}
