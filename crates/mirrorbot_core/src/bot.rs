/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::alerts::Alerts;
use crate::config::BotConfig;
use crate::events::{BotReporter, BotStatus, EventBus};
use crate::now_ms;
use crate::post_sync::{self, POST_PAGE_LIMIT};
use crate::profile_sync::{self, MediaFetcher};
use crate::retry::retry_fixed;
use crate::session::SharedSession;
use crate::store::Store;
use crate::synchronizer::{MentionGateway, Synchronizer, SynchronizerBuilder};
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Stopped,
    Starting,
    Running,
    Syncing,
    Error,
}

impl BotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotState::Stopped => "stopped",
            BotState::Starting => "starting",
            BotState::Running => "running",
            BotState::Syncing => "syncing",
            BotState::Error => "error",
        }
    }
}

/// Shared control surface the manager keeps for a live instance.
#[derive(Clone)]
pub struct BotControls {
    pub muted: Arc<AtomicBool>,
    pub sync_now: Arc<Notify>,
    pub force_next: Arc<AtomicBool>,
    pub state: watch::Receiver<BotState>,
}

/// One live bot: its synchronizer set, its reporter, and the recurring sync
/// loop. Created by `start`, driven by `spawn`, torn down via the shutdown
/// watch the manager holds.
pub struct BotInstance {
    bot_id: i64,
    store: Store,
    session: Arc<SharedSession>,
    fetcher: Arc<dyn MediaFetcher>,
    reporter: BotReporter,
    alerts: Arc<Alerts>,
    synchronizers: Vec<Arc<dyn Synchronizer>>,
    muted: Arc<AtomicBool>,
    sync_now: Arc<Notify>,
    force_next: Arc<AtomicBool>,
    state_tx: watch::Sender<BotState>,
}

impl BotInstance {
    /// Authenticates the shared session with this bot's credentials and
    /// builds the synchronizer set. Configuration problems (unknown bot, no
    /// usable destinations) are fatal to start: the error status is
    /// persisted and the instance never becomes live.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        bot_id: i64,
        store: Store,
        session: Arc<SharedSession>,
        fetcher: Arc<dyn MediaFetcher>,
        bus: EventBus,
        alerts: Arc<Alerts>,
        builder: &Arc<dyn SynchronizerBuilder>,
    ) -> Result<Self> {
        let reporter = BotReporter::new(bot_id, store.clone(), bus);
        let (state_tx, _) = watch::channel(BotState::Starting);

        let cfg = match store.get_bot_config(bot_id).await? {
            Some(c) => c,
            None => bail!("unknown bot id {bot_id}"),
        };
        if let Err(e) = cfg.validate() {
            let msg = format!("{e:#}");
            reporter
                .status(BotStatus::Error, None, None, Some(msg.clone()))
                .await;
            bail!("invalid config: {msg}");
        }

        reporter
            .info(format!("starting mirror of @{}", cfg.source_handle))
            .await;

        if let Err(e) = session
            .ensure_login(&cfg.upstream.username, &cfg.upstream.password)
            .await
        {
            let msg = format!("upstream login failed: {e:#}");
            reporter
                .status(BotStatus::Error, None, None, Some(msg.clone()))
                .await;
            bail!(msg);
        }

        let synchronizers = build_synchronizers(&cfg, builder, &reporter).await;
        if synchronizers.is_empty() {
            let msg = "no usable destinations".to_string();
            reporter
                .status(BotStatus::Error, None, None, Some(msg.clone()))
                .await;
            bail!(msg);
        }

        state_tx.send_replace(BotState::Running);
        Ok(Self {
            bot_id,
            store,
            session,
            fetcher,
            reporter,
            alerts,
            synchronizers,
            muted: Arc::new(AtomicBool::new(false)),
            sync_now: Arc::new(Notify::new()),
            force_next: Arc::new(AtomicBool::new(false)),
            state_tx,
        })
    }

    pub fn bot_id(&self) -> i64 {
        self.bot_id
    }

    pub fn controls(&self) -> BotControls {
        BotControls {
            muted: self.muted.clone(),
            sync_now: self.sync_now.clone(),
            force_next: self.force_next.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    /// The first destination that can receive mentions, for the command
    /// channel.
    pub fn mention_gateway(&self) -> Option<Arc<dyn MentionGateway>> {
        self.synchronizers
            .iter()
            .find_map(|s| s.mention_gateway())
    }

    /// Immediate first pass, then a recurring timer. A failed pass still
    /// arms the next one.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
        })
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut last_sync: Option<i64> = None;
        // The immediate first pass runs even when the bot starts muted.
        let mut manual = true;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = self.pass_cycle(manual, &mut last_sync).await;
            manual = false;
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.sync_now.notified() => {
                    manual = true;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.state_tx.send_replace(BotState::Stopped);
        self.reporter
            .status(BotStatus::Stopped, last_sync, None, None)
            .await;
        self.reporter.info("bot stopped").await;
    }

    /// Runs one scheduled (or manual) pass, persists the resulting status
    /// projection, and returns the delay until the next pass. Mute skips the
    /// pass but keeps the schedule armed. The interval is re-read from
    /// config so frequency changes apply without a restart.
    pub(crate) async fn pass_cycle(&self, manual: bool, last_sync: &mut Option<i64>) -> Duration {
        let mut pass_error: Option<String> = None;
        let skip = self.muted.load(Ordering::SeqCst) && !manual;
        if !skip {
            let force = self.force_next.swap(false, Ordering::SeqCst);
            self.state_tx.send_replace(BotState::Syncing);
            match self.run_pass(force).await {
                Ok(()) => {
                    *last_sync = Some(now_ms());
                }
                Err(e) => {
                    pass_error = Some(format!("{e:#}"));
                }
            }
        }

        let minutes = self
            .store
            .get_bot_config(self.bot_id)
            .await
            .ok()
            .flatten()
            .map(|c| c.interval_minutes)
            .unwrap_or(30)
            .max(1);
        let delay = Duration::from_secs(minutes * 60);
        let next = now_ms() + delay.as_millis() as i64;

        match pass_error {
            None => {
                self.state_tx.send_replace(BotState::Running);
                self.reporter
                    .status(BotStatus::Running, *last_sync, Some(next), None)
                    .await;
            }
            Some(msg) => {
                self.state_tx.send_replace(BotState::Error);
                self.reporter
                    .error(format!("sync pass failed: {msg}"))
                    .await;
                self.reporter
                    .status(BotStatus::Error, *last_sync, Some(next), Some(msg.clone()))
                    .await;
                self.alerts
                    .notify(&format!("bot-{}-pass", self.bot_id), &msg)
                    .await;
            }
        }
        delay
    }

    /// One complete pass: posts then profile, per the config's toggles.
    pub async fn run_pass(&self, force: bool) -> Result<()> {
        let cfg = self
            .store
            .get_bot_config(self.bot_id)
            .await?
            .context("bot config missing")?;

        if cfg.sync_posts {
            let client = self.session.client();
            let posts = retry_fixed("fetch posts", 3, Duration::from_secs(5), || {
                client.get_posts(&cfg.source_handle, POST_PAGE_LIMIT)
            })
            .await?;
            let outcome = post_sync::run_post_pass(
                &self.store,
                &self.reporter,
                &cfg,
                &posts,
                &self.synchronizers,
                force,
            )
            .await?;
            if outcome.new_posts > 0 {
                self.reporter
                    .info(format!(
                        "pass: {} new posts, {} delivered, {} failed",
                        outcome.new_posts, outcome.delivered, outcome.failed
                    ))
                    .await;
            }
        }

        if cfg.wants_profile_sync() {
            profile_sync::run_profile_pass(
                &self.store,
                &self.reporter,
                self.session.client(),
                self.fetcher.as_ref(),
                &cfg,
                &self.synchronizers,
            )
            .await?;
        }
        Ok(())
    }
}

async fn build_synchronizers(
    cfg: &BotConfig,
    builder: &Arc<dyn SynchronizerBuilder>,
    reporter: &BotReporter,
) -> Vec<Arc<dyn Synchronizer>> {
    let mut out = Vec::new();
    for dest in cfg.destinations.iter().filter(|d| d.enabled) {
        match builder.build(cfg.id, dest) {
            Ok(sync) => out.push(sync),
            Err(e) => {
                warn!("bot {}: destination {} skipped: {e:#}", cfg.id, dest.platform);
                reporter
                    .warn(format!("destination {} skipped: {e:#}", dest.platform))
                    .await;
            }
        }
    }
    out
}
