/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Standalone service: loads a JSON config, starts every enabled bot, and
//! runs until ctrl-c.
//!
//! Platform client crates plug in through `SynchronizerBuilder` and
//! `UpstreamClient`. This binary wires a file-backed upstream feed and a
//! dry-run destination set, which is enough to operate and observe the whole
//! engine (dedup, fan-out, status, command flow) without live accounts.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mirrorbot_core::alerts::Alerts;
use mirrorbot_core::config::{default_data_dir, DestinationConfig, EngineConfig};
use mirrorbot_core::events::{EngineEvent, EventBus};
use mirrorbot_core::manager::Manager;
use mirrorbot_core::profile_sync::HttpMediaFetcher;
use mirrorbot_core::session::{SharedSession, UpstreamClient};
use mirrorbot_core::store::Store;
use mirrorbot_core::synchronizer::{Synchronizer, SynchronizerBuilder};
use mirrorbot_protocol::{Platform, PostView, SourcePost, SourceProfile};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// On-disk feed standing in for the upstream platform: one profile plus a
/// newest-first post list, re-read on every call so edits show up on the
/// next pass.
#[derive(Debug, Deserialize)]
struct FeedFile {
    profile: SourceProfile,
    #[serde(default)]
    posts: Vec<SourcePost>,
}

struct FileUpstream {
    feed_path: PathBuf,
    logged_in: AtomicBool,
}

impl FileUpstream {
    fn new(feed_path: PathBuf) -> Self {
        Self {
            feed_path,
            logged_in: AtomicBool::new(false),
        }
    }

    fn read_feed(&self) -> Result<FeedFile> {
        let text = std::fs::read_to_string(&self.feed_path)
            .with_context(|| format!("read feed: {}", self.feed_path.display()))?;
        serde_json::from_str(&text).context("decode feed json")
    }
}

#[async_trait]
impl UpstreamClient for FileUpstream {
    async fn login(&self, username: &str, _password: &str) -> Result<()> {
        // The feed file must exist and decode before the session counts as
        // authenticated, so bots fail at start instead of on the first pass.
        self.read_feed()?;
        info!("feed upstream ready for {username}");
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn get_cookies(&self) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    async fn set_cookies(&self, _cookies: &[(String, String)]) -> Result<()> {
        Ok(())
    }

    async fn clear_cookies(&self) -> Result<()> {
        self.logged_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_profile(&self, _handle: &str) -> Result<SourceProfile> {
        Ok(self.read_feed()?.profile)
    }

    async fn get_posts(&self, _handle: &str, limit: usize) -> Result<Vec<SourcePost>> {
        let mut posts = self.read_feed()?.posts;
        posts.truncate(limit);
        Ok(posts)
    }
}

/// Destination that logs every delivery instead of calling a platform API.
struct DryRunSynchronizer {
    bot_id: i64,
    platform: Platform,
}

#[async_trait]
impl Synchronizer for DryRunSynchronizer {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn sync_post(
        &self,
        post: &PostView,
        prior: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>> {
        info!(
            "bot {}: [dry-run] {} <- post {} ({} chars, {} media{})",
            self.bot_id,
            self.platform,
            post.post_id,
            post.text.chars().count(),
            post.media.len(),
            if prior.is_some() { ", edit" } else { "" },
        );
        Ok(Some(serde_json::json!({
            "dry_run": true,
            "remote_id": post.post_id,
        })))
    }
}

struct DryRunBuilder;

impl SynchronizerBuilder for DryRunBuilder {
    fn build(&self, bot_id: i64, cfg: &DestinationConfig) -> Result<Arc<dyn Synchronizer>> {
        Ok(Arc::new(DryRunSynchronizer {
            bot_id,
            platform: cfg.platform,
        }))
    }
}

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            match args.next() {
                Some(path) => return Ok(PathBuf::from(path)),
                None => bail!("--config requires a path"),
            }
        }
    }
    if let Ok(path) = std::env::var("MIRRORBOT_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(default_data_dir()?.join("config.json"))
}

fn load_engine_config(path: &PathBuf) -> Result<EngineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: EngineConfig = serde_json::from_str(&text).context("decode config json")?;
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("static directive")),
        )
        .init();

    let cfg_path = parse_config_path()?;
    info!("mirrorbot service starting");
    info!("config: {}", cfg_path.display());
    let cfg = load_engine_config(&cfg_path)?;

    let data_dir = match &cfg.data_dir {
        Some(dir) => PathBuf::from(dir),
        None => default_data_dir()?,
    };
    let store = Store::open(data_dir.join("mirrorbot.db"))?;
    for bot in &cfg.bots {
        store.upsert_bot_config(bot).await?;
    }
    info!("{} bot config(s) loaded", cfg.bots.len());

    let http = reqwest::Client::new();
    let upstream: Arc<dyn UpstreamClient> =
        Arc::new(FileUpstream::new(data_dir.join("source_feed.json")));
    let session = Arc::new(SharedSession::new(upstream, store.clone()));
    let manager = Manager::new(
        store,
        session,
        EventBus::default(),
        Arc::new(DryRunBuilder),
        Arc::new(Alerts::new(cfg.alert_webhook.clone(), http.clone())),
        Arc::new(HttpMediaFetcher::new(http)),
    );

    // Status transitions are broadcast-only (per-pass logs already reach
    // tracing through the reporter), so mirror them here.
    let mut events = manager.bus().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Status { bot_id, status }) => {
                    info!("bot {bot_id}: status -> {}", status.as_str());
                }
                Ok(EngineEvent::Log(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("event viewer lagged, {n} events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    manager.start_all().await?;
    if manager.running_bots().is_empty() {
        warn!("no bots running; check config and logs");
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    manager.stop_all().await;
    info!("mirrorbot service stopped");
    Ok(())
}
