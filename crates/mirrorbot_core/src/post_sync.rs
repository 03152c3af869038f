/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::BotConfig;
use crate::events::{BotReporter, LogLevel};
use crate::retry::{retry, RetryPolicy};
use crate::store::Store;
use crate::synchronizer::Synchronizer;
use crate::transforms::{self, CompiledRules};
use anyhow::{Context, Result};
use futures_util::future::join_all;
use mirrorbot_protocol::{Platform, SourcePost};
use std::collections::HashMap;
use std::sync::Arc;

/// Hard cap on the upstream page the pass works from.
pub const POST_PAGE_LIMIT: usize = 200;

#[derive(Debug, Default, Clone, Copy)]
pub struct PostSyncOutcome {
    /// Posts looked at before the consecutive-cached cutoff stopped the scan.
    pub examined: usize,
    /// Posts that were not yet marked synced and structurally valid.
    pub new_posts: usize,
    /// Successful `sync_post` deliveries across all destinations.
    pub delivered: usize,
    /// Destination attempts that exhausted their retries.
    pub failed: usize,
}

/// One post pass over a newest-first page. Scanning stops after
/// `dedup_cutoff` consecutive already-synced posts: hitting the dedup
/// boundary means everything older was already delivered. `force` disables
/// the cutoff (and the per-post dedup check) for explicit resyncs.
///
/// A post is marked synced once every enabled destination has been
/// attempted; a destination that exhausted its retries is not re-attempted
/// on later passes (attempted counts as synced — deliberate, to avoid
/// duplicate posts on flaky destinations).
pub async fn run_post_pass(
    store: &Store,
    reporter: &BotReporter,
    cfg: &BotConfig,
    posts: &[SourcePost],
    synchronizers: &[Arc<dyn Synchronizer>],
    force: bool,
) -> Result<PostSyncOutcome> {
    let bot_id = cfg.id;
    let global = transforms::compile(&cfg.transforms).context("compile global transforms")?;
    let mut dest_rules: HashMap<Platform, CompiledRules> = HashMap::new();
    for (platform, rules) in &cfg.destination_transforms {
        dest_rules.insert(
            *platform,
            transforms::compile(rules).with_context(|| format!("compile {platform} transforms"))?,
        );
    }

    let cutoff = cfg.dedup_cutoff.max(1) as usize;
    let mut outcome = PostSyncOutcome::default();
    let mut cached_streak = 0usize;

    for post in posts.iter().take(POST_PAGE_LIMIT) {
        outcome.examined += 1;

        if !force && store.is_post_synced(bot_id, &post.id).await? {
            cached_streak += 1;
            if cached_streak >= cutoff {
                break;
            }
            continue;
        }
        cached_streak = 0;

        if !post.is_valid() {
            reporter
                .log(
                    LogLevel::Warn,
                    "skipping malformed post",
                    None,
                    Some(post.id.clone()),
                )
                .await;
            continue;
        }
        outcome.new_posts += 1;

        // Destination fan-out for one post is concurrent and unordered.
        let attempts = synchronizers.iter().map(|sync| {
            let platform = sync.platform();
            let view = transforms::render_view(
                post,
                platform,
                &global,
                dest_rules.get(&platform),
                cfg.backdate,
            );
            async move {
                let prior = store
                    .get_delivery_record(bot_id, &post.id, platform)
                    .await
                    .unwrap_or(None);
                let result = retry("sync_post", RetryPolicy::default(), || {
                    sync.sync_post(&view, prior.as_ref())
                })
                .await;
                (platform, result)
            }
        });

        for (platform, result) in join_all(attempts).await {
            match result {
                Ok(Some(record)) => {
                    store
                        .insert_delivery_record(bot_id, &post.id, platform, &record)
                        .await?;
                    outcome.delivered += 1;
                    reporter
                        .log(
                            LogLevel::Success,
                            format!("post delivered to {platform}"),
                            Some(platform),
                            Some(post.id.clone()),
                        )
                        .await;
                }
                // Capability absent on this platform: silent no-op.
                Ok(None) => {}
                Err(e) => {
                    outcome.failed += 1;
                    reporter
                        .log(
                            LogLevel::Error,
                            format!("delivery to {platform} failed: {e:#}"),
                            Some(platform),
                            Some(post.id.clone()),
                        )
                        .await;
                }
            }
        }

        // All destinations attempted, success or not.
        store.mark_post_synced(bot_id, &post.id).await?;
    }

    Ok(outcome)
}
