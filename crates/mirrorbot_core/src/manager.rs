/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::alerts::Alerts;
use crate::bot::{BotControls, BotInstance, BotState};
use crate::commands::{CommandChannel, Executor, ToggleKey};
use crate::events::{BotReporter, EventBus};
use crate::now_ms;
use crate::profile_sync::MediaFetcher;
use crate::session::SharedSession;
use crate::store::{BotRuntimeStatus, Store};
use crate::synchronizer::SynchronizerBuilder;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct LiveBot {
    shutdown: watch::Sender<bool>,
    controls: BotControls,
    loop_handle: JoinHandle<()>,
    channel_handle: Option<JoinHandle<()>>,
}

struct ManagerInner {
    store: Store,
    session: Arc<SharedSession>,
    bus: EventBus,
    builder: Arc<dyn SynchronizerBuilder>,
    alerts: Arc<Alerts>,
    fetcher: Arc<dyn MediaFetcher>,
    /// The only source of truth for liveness. The persisted status table is a
    /// projection for external viewers and is never consulted here.
    live: Mutex<HashMap<i64, LiveBot>>,
    /// Per-bot operation locks so start/stop/restart for one bot serialize
    /// while different bots proceed concurrently.
    op_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

/// Coordinates every bot sharing one upstream session: lifecycle, the
/// command-channel wiring, and the mutations commands are allowed to make.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    pub fn new(
        store: Store,
        session: Arc<SharedSession>,
        bus: EventBus,
        builder: Arc<dyn SynchronizerBuilder>,
        alerts: Arc<Alerts>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                session,
                bus,
                builder,
                alerts,
                fetcher,
                live: Mutex::new(HashMap::new()),
                op_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    fn op_lock(&self, bot_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .op_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        locks.entry(bot_id).or_default().clone()
    }

    pub fn is_running(&self, bot_id: i64) -> bool {
        self.inner
            .live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&bot_id)
    }

    pub fn running_bots(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .inner
            .live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn get_status(&self, bot_id: i64) -> Result<Option<BotRuntimeStatus>> {
        self.inner.store.get_status(bot_id).await
    }

    pub async fn start(&self, bot_id: i64) -> Result<()> {
        let lock = self.op_lock(bot_id);
        let _guard = lock.lock().await;
        self.start_locked(bot_id).await
    }

    pub async fn stop(&self, bot_id: i64) -> Result<()> {
        let lock = self.op_lock(bot_id);
        let _guard = lock.lock().await;
        self.stop_locked(bot_id).await
    }

    /// Stop-then-start under one operation lock, so a concurrent start cannot
    /// interleave between the two halves.
    pub async fn restart(&self, bot_id: i64) -> Result<()> {
        let lock = self.op_lock(bot_id);
        let _guard = lock.lock().await;
        self.stop_locked(bot_id).await?;
        self.start_locked(bot_id).await
    }

    async fn start_locked(&self, bot_id: i64) -> Result<()> {
        if self.is_running(bot_id) {
            bail!("bot {bot_id} is already running");
        }

        let instance = BotInstance::start(
            bot_id,
            self.inner.store.clone(),
            self.inner.session.clone(),
            self.inner.fetcher.clone(),
            self.inner.bus.clone(),
            self.inner.alerts.clone(),
            &self.inner.builder,
        )
        .await?;

        let controls = instance.controls();
        let gateway = instance.mention_gateway();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let channel_handle = match gateway {
            Some(gateway) => {
                let cfg = self
                    .inner
                    .store
                    .get_bot_config(bot_id)
                    .await?
                    .context("bot config missing")?;
                if cfg.command_channel.enabled {
                    let reporter =
                        BotReporter::new(bot_id, self.inner.store.clone(), self.inner.bus.clone());
                    let executor: Arc<dyn Executor> = Arc::new(self.clone());
                    let channel = CommandChannel::new(
                        bot_id,
                        self.inner.store.clone(),
                        executor,
                        gateway,
                        reporter,
                    );
                    Some(channel.spawn(shutdown_rx.clone()))
                } else {
                    None
                }
            }
            None => None,
        };

        let loop_handle = instance.spawn(shutdown_rx);
        self.inner
            .live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                bot_id,
                LiveBot {
                    shutdown: shutdown_tx,
                    controls,
                    loop_handle,
                    channel_handle,
                },
            );
        info!("bot {bot_id} started");
        Ok(())
    }

    /// Idempotent: stopping a bot that is not running is a no-op. The entry
    /// leaves the live map before the tasks wind down, so the bot reads as
    /// stopped immediately.
    async fn stop_locked(&self, bot_id: i64) -> Result<()> {
        let live = self
            .inner
            .live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&bot_id);
        let Some(live) = live else {
            return Ok(());
        };
        let _ = live.shutdown.send(true);
        let _ = live.loop_handle.await;
        if let Some(handle) = live.channel_handle {
            let _ = handle.await;
        }
        info!("bot {bot_id} stopped");
        Ok(())
    }

    /// Starts every enabled bot concurrently. Concurrency is deliberate: the
    /// first login wins the single-flight gate and the rest reuse the
    /// session. Individual failures are logged and do not stop the batch.
    pub async fn start_all(&self) -> Result<()> {
        let configs = self.inner.store.list_bot_configs().await?;
        let starts = configs.into_iter().filter(|c| c.enabled).map(|cfg| {
            let mgr = self.clone();
            async move {
                if let Err(e) = mgr.start(cfg.id).await {
                    warn!("bot {}: start failed: {e:#}", cfg.id);
                }
            }
        });
        join_all(starts).await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        for bot_id in self.running_bots() {
            if let Err(e) = self.stop(bot_id).await {
                warn!("bot {bot_id}: stop failed: {e:#}");
            }
        }
    }

    /// Explicit force-resync: drops every dedup marker for the bot and
    /// triggers an immediate pass with the cutoff disabled, so the whole
    /// upstream page is re-delivered. The only path that ever unsets a
    /// synced marker.
    pub async fn force_resync(&self, bot_id: i64) -> Result<()> {
        let controls = self.controls(bot_id)?;
        let cleared = self.inner.store.clear_synced_posts(bot_id).await?;
        info!("bot {bot_id}: force resync, {cleared} markers cleared");
        controls.force_next.store(true, Ordering::SeqCst);
        controls.sync_now.notify_one();
        Ok(())
    }

    fn controls(&self, bot_id: i64) -> Result<BotControls> {
        let live = self.inner.live.lock().unwrap_or_else(|p| p.into_inner());
        match live.get(&bot_id) {
            Some(l) => Ok(l.controls.clone()),
            None => bail!("bot {bot_id} is not running"),
        }
    }

    async fn load_config(&self, bot_id: i64) -> Result<crate::config::BotConfig> {
        self.inner
            .store
            .get_bot_config(bot_id)
            .await?
            .with_context(|| format!("unknown bot id {bot_id}"))
    }

    async fn update_config<F>(&self, bot_id: i64, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut crate::config::BotConfig),
    {
        let mut cfg = self.load_config(bot_id).await?;
        mutate(&mut cfg);
        cfg.validate()?;
        self.inner.store.upsert_bot_config(&cfg).await
    }
}

fn fmt_minutes(delta_ms: i64) -> String {
    format!("{}m", delta_ms.max(0) / 60_000)
}

#[async_trait]
impl Executor for Manager {
    async fn restart(&self, bot_id: i64) -> Result<()> {
        Manager::restart(self, bot_id).await
    }

    async fn sync_now(&self, bot_id: i64) -> Result<()> {
        self.controls(bot_id)?.sync_now.notify_one();
        Ok(())
    }

    async fn source_handle(&self, bot_id: i64) -> Result<String> {
        Ok(self.load_config(bot_id).await?.source_handle)
    }

    /// Takes effect on the next pass; dedup markers for the old source stay,
    /// keyed by post ids that the new source will never produce.
    async fn change_source(&self, bot_id: i64, handle: &str) -> Result<()> {
        let handle = handle.to_string();
        self.update_config(bot_id, move |cfg| cfg.source_handle = handle)
            .await
    }

    async fn status_summary(&self, bot_id: i64) -> Result<String> {
        // The live state watch distinguishes running from mid-pass syncing;
        // a bot absent from the live map is stopped regardless of what the
        // projection row says.
        let state: Option<BotState> = self.controls(bot_id).ok().map(|c| *c.state.borrow());
        let mut parts = vec![state.map(|s| s.as_str()).unwrap_or("stopped").to_string()];
        if let Some(s) = self.inner.store.get_status(bot_id).await? {
            let now = now_ms();
            if let Some(last) = s.last_sync_ms {
                parts.push(format!("last sync {} ago", fmt_minutes(now - last)));
            }
            if state.is_some() {
                if let Some(next) = s.next_sync_ms {
                    parts.push(format!("next sync in {}", fmt_minutes(next - now)));
                }
            }
            if let Some(err) = s.last_error {
                parts.push(format!("last error: {err}"));
            }
        }
        Ok(parts.join(" | "))
    }

    async fn set_frequency(&self, bot_id: i64, minutes: u64) -> Result<()> {
        if minutes == 0 {
            bail!("frequency must be at least 1 minute");
        }
        self.update_config(bot_id, move |cfg| cfg.interval_minutes = minutes)
            .await
    }

    async fn toggle(&self, bot_id: i64, key: ToggleKey, value: Option<bool>) -> Result<bool> {
        let mut new_value = false;
        self.update_config(bot_id, |cfg| {
            let field = match key {
                ToggleKey::Posts => &mut cfg.sync_posts,
                ToggleKey::Bio => &mut cfg.sync_bio,
                ToggleKey::Avatar => &mut cfg.sync_avatar,
                ToggleKey::Name => &mut cfg.sync_name,
                ToggleKey::Header => &mut cfg.sync_banner,
                ToggleKey::Backdate => &mut cfg.backdate,
            };
            *field = value.unwrap_or(!*field);
            new_value = *field;
        })
        .await?;
        Ok(new_value)
    }

    async fn last_post_link(&self, bot_id: i64) -> Result<Option<String>> {
        let Some(row) = self.inner.store.last_delivery_record(bot_id).await? else {
            return Ok(None);
        };
        let link = row.record["url"]
            .as_str()
            .or_else(|| row.record["remote_id"].as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}:{}", row.platform, row.post_id));
        Ok(Some(link))
    }

    async fn stats_summary(&self, bot_id: i64) -> Result<String> {
        let tracked = self.inner.store.count_synced_posts(bot_id).await?;
        let delivered = self.inner.store.count_delivery_records(bot_id).await?;
        Ok(format!(
            "{tracked} posts tracked, {delivered} deliveries recorded"
        ))
    }

    async fn mute(&self, bot_id: i64) -> Result<()> {
        self.controls(bot_id)?.muted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unmute(&self, bot_id: i64) -> Result<()> {
        self.controls(bot_id)?.muted.store(false, Ordering::SeqCst);
        Ok(())
    }
}
