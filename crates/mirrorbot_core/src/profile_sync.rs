/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::BotConfig;
use crate::events::{BotReporter, LogLevel};
use crate::retry::{retry, retry_fixed, RetryPolicy};
use crate::session::UpstreamClient;
use crate::store::Store;
use crate::synchronizer::Synchronizer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use mirrorbot_protocol::MediaBlob;
use sha2::Digest as _;
use std::sync::Arc;
use std::time::Duration;

/// Downloads profile media for fingerprinting. Separated from the upstream
/// client because avatar/banner URLs may point at arbitrary CDN hosts.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<MediaBlob>;
}

pub struct HttpMediaFetcher {
    http: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<MediaBlob> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("fetch media: {url}"))?
            .error_for_status()
            .with_context(|| format!("media not ok: {url}"))?;
        let media_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = resp.bytes().await?.to_vec();
        Ok(MediaBlob { bytes, media_type })
    }
}

fn fingerprint(bytes: &[u8]) -> String {
    let mut h = sha2::Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

#[derive(Clone, Copy)]
enum ImageSlot {
    Avatar,
    Banner,
}

impl ImageSlot {
    fn key(&self) -> &'static str {
        match self {
            ImageSlot::Avatar => "avatar",
            ImageSlot::Banner => "banner",
        }
    }
}

#[derive(Clone, Copy)]
enum TextDim {
    Name,
    Bio,
}

impl TextDim {
    fn label(&self) -> &'static str {
        match self {
            TextDim::Name => "name",
            TextDim::Bio => "bio",
        }
    }
}

/// One profile pass: fetch the current profile, then sync each enabled
/// dimension. Avatar and banner are double-gated (URL change, then content
/// fingerprint change) so upstream URL churn with identical bytes never
/// reaches a destination. Name and bio are gated only by their toggles and
/// non-emptiness.
pub async fn run_profile_pass(
    store: &Store,
    reporter: &BotReporter,
    client: &Arc<dyn UpstreamClient>,
    fetcher: &dyn MediaFetcher,
    cfg: &BotConfig,
    synchronizers: &[Arc<dyn Synchronizer>],
) -> Result<()> {
    let profile = retry_fixed("fetch profile", 3, Duration::from_secs(5), || {
        client.get_profile(&cfg.source_handle)
    })
    .await?;

    if cfg.sync_name {
        sync_text_dim(reporter, synchronizers, TextDim::Name, &profile.display_name).await;
    }
    if cfg.sync_bio {
        sync_text_dim(reporter, synchronizers, TextDim::Bio, &profile.bio).await;
    }
    if cfg.sync_avatar {
        sync_image_slot(
            store,
            reporter,
            fetcher,
            cfg.id,
            ImageSlot::Avatar,
            profile.avatar_url.as_deref(),
            synchronizers,
        )
        .await?;
    }
    if cfg.sync_banner {
        sync_image_slot(
            store,
            reporter,
            fetcher,
            cfg.id,
            ImageSlot::Banner,
            profile.banner_url.as_deref(),
            synchronizers,
        )
        .await?;
    }
    Ok(())
}

async fn sync_text_dim(
    reporter: &BotReporter,
    synchronizers: &[Arc<dyn Synchronizer>],
    dim: TextDim,
    value: &str,
) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    let calls = synchronizers.iter().map(|sync| async move {
        let result = retry("sync profile text", RetryPolicy::default(), || async {
            match dim {
                TextDim::Name => sync.sync_user_name(value).await,
                TextDim::Bio => sync.sync_bio(value).await,
            }
        })
        .await;
        (sync.platform(), result)
    });
    for (platform, result) in join_all(calls).await {
        match result {
            Ok(Some(_)) => {
                reporter
                    .log(
                        LogLevel::Success,
                        format!("{} synced to {platform}", dim.label()),
                        Some(platform),
                        None,
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                reporter
                    .log(
                        LogLevel::Error,
                        format!("{} sync to {platform} failed: {e:#}", dim.label()),
                        Some(platform),
                        None,
                    )
                    .await;
            }
        }
    }
}

async fn sync_image_slot(
    store: &Store,
    reporter: &BotReporter,
    fetcher: &dyn MediaFetcher,
    bot_id: i64,
    slot: ImageSlot,
    url: Option<&str>,
    synchronizers: &[Arc<dyn Synchronizer>],
) -> Result<()> {
    let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) else {
        return Ok(());
    };

    let cached = store.get_profile_media(bot_id, slot.key()).await?;
    if cached.as_ref().map(|c| c.url.as_str()) == Some(url) {
        // Same URL as last pass: no download, no comparison.
        return Ok(());
    }

    let blob = match retry("download profile media", RetryPolicy::default(), || {
        fetcher.fetch(url)
    })
    .await
    {
        Ok(b) => b,
        Err(e) => {
            reporter
                .warn(format!("{} download failed: {e:#}", slot.key()))
                .await;
            return Ok(());
        }
    };

    let fp = fingerprint(&blob.bytes);
    let changed = cached.map(|c| c.fingerprint) != Some(fp.clone());
    // Cache the latest URL even when the bytes are unchanged, so the next
    // pass compares against the URL upstream is currently serving.
    store.set_profile_media(bot_id, slot.key(), url, &fp).await?;
    if !changed {
        return Ok(());
    }

    let blob = &blob;
    let calls = synchronizers.iter().map(|sync| async move {
        let result = retry("sync profile media", RetryPolicy::default(), || async {
            match slot {
                ImageSlot::Avatar => sync.sync_profile_pic(blob).await,
                ImageSlot::Banner => sync.sync_banner(blob).await,
            }
        })
        .await;
        (sync.platform(), result)
    });
    for (platform, result) in join_all(calls).await {
        match result {
            Ok(Some(_)) => {
                reporter
                    .log(
                        LogLevel::Success,
                        format!("{} synced to {platform}", slot.key()),
                        Some(platform),
                        None,
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                reporter
                    .log(
                        LogLevel::Error,
                        format!("{} sync to {platform} failed: {e:#}", slot.key()),
                        Some(platform),
                        None,
                    )
                    .await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        mock_reporter, temp_store, test_bot_config, MockFetcher, MockSynchronizer, MockUpstream,
    };
    use mirrorbot_protocol::Platform;
    use std::sync::atomic::Ordering;

    fn setup() -> (
        crate::store::Store,
        tempfile::TempDir,
        Arc<dyn UpstreamClient>,
        Arc<MockUpstream>,
        Arc<MockSynchronizer>,
        Vec<Arc<dyn Synchronizer>>,
    ) {
        let (store, dir) = temp_store();
        let upstream = Arc::new(MockUpstream::default());
        let dest = Arc::new(MockSynchronizer::new(Platform::Mastodon));
        let synchronizers: Vec<Arc<dyn Synchronizer>> = vec![dest.clone()];
        (store, dir, upstream.clone(), upstream, dest, synchronizers)
    }

    #[tokio::test]
    async fn unchanged_url_never_downloads() {
        let (store, _dir, client, upstream, _dest, syncs) = setup();
        upstream.set_avatar_url("https://cdn.example/a.png");
        let mut cfg = test_bot_config(1);
        cfg.sync_avatar = true;
        let reporter = mock_reporter(1, &store);
        let fetcher = MockFetcher::returning(vec![1, 2, 3]);

        run_profile_pass(&store, &reporter, &client, &fetcher, &cfg, &syncs)
            .await
            .unwrap();
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 1);

        run_profile_pass(&store, &reporter, &client, &fetcher, &cfg, &syncs)
            .await
            .unwrap();
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_url_with_identical_bytes_skips_destinations() {
        let (store, _dir, client, upstream, dest, syncs) = setup();
        let mut cfg = test_bot_config(1);
        cfg.sync_avatar = true;
        let reporter = mock_reporter(1, &store);
        let fetcher = MockFetcher::returning(vec![9, 9, 9]);

        upstream.set_avatar_url("https://cdn.example/a.png");
        run_profile_pass(&store, &reporter, &client, &fetcher, &cfg, &syncs)
            .await
            .unwrap();
        assert_eq!(dest.pic_calls.load(Ordering::SeqCst), 1);

        // URL churn, same bytes: downloaded once more, delivered zero times.
        upstream.set_avatar_url("https://cdn.example/a.png?v=2");
        run_profile_pass(&store, &reporter, &client, &fetcher, &cfg, &syncs)
            .await
            .unwrap();
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 2);
        assert_eq!(dest.pic_calls.load(Ordering::SeqCst), 1);

        // And the cached URL moved forward, so the next pass skips entirely.
        run_profile_pass(&store, &reporter, &client, &fetcher, &cfg, &syncs)
            .await
            .unwrap();
        assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn name_and_bio_gated_by_toggle_and_emptiness() {
        let (store, _dir, client, upstream, dest, syncs) = setup();
        upstream.set_profile_text("Alice", "");
        let mut cfg = test_bot_config(1);
        cfg.sync_name = true;
        cfg.sync_bio = true;
        let reporter = mock_reporter(1, &store);
        let fetcher = MockFetcher::returning(Vec::new());

        run_profile_pass(&store, &reporter, &client, &fetcher, &cfg, &syncs)
            .await
            .unwrap();
        assert_eq!(dest.name_calls.load(Ordering::SeqCst), 1);
        // Empty bio: non-emptiness gate holds even with the toggle on.
        assert_eq!(dest.bio_calls.load(Ordering::SeqCst), 0);
    }
}
