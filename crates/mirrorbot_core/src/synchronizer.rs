/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::DestinationConfig;
use anyhow::Result;
use async_trait::async_trait;
use mirrorbot_protocol::{DeliveryAck, MediaBlob, Notification, Platform, PostView};
use std::sync::Arc;

/// Capability surface a destination platform implements. Every method has a
/// no-op default: `Ok(None)` means "this platform does not support that sync
/// dimension" and the orchestrator treats it as silently skipped, not as an
/// error. Calls must be individually retryable and must not assume any
/// ordering relative to other destinations.
#[async_trait]
pub trait Synchronizer: Send + Sync {
    fn platform(&self) -> Platform;

    async fn sync_bio(&self, _bio: &str) -> Result<Option<DeliveryAck>> {
        Ok(None)
    }

    async fn sync_user_name(&self, _name: &str) -> Result<Option<DeliveryAck>> {
        Ok(None)
    }

    async fn sync_profile_pic(&self, _image: &MediaBlob) -> Result<Option<DeliveryAck>> {
        Ok(None)
    }

    async fn sync_banner(&self, _image: &MediaBlob) -> Result<Option<DeliveryAck>> {
        Ok(None)
    }

    /// Delivers one post. `prior` is the delivery record from an earlier
    /// attempt for this (post, platform) pair, if any, so the implementation
    /// can decide to edit instead of create. The returned JSON blob is
    /// persisted as the delivery record.
    async fn sync_post(
        &self,
        _post: &PostView,
        _prior: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Present when this destination can receive mentions; the command
    /// channel attaches to the first destination that provides one.
    fn mention_gateway(&self) -> Option<Arc<dyn MentionGateway>> {
        None
    }
}

/// Mention-capable side of a destination, consumed by the command channel.
#[async_trait]
pub trait MentionGateway: Send + Sync {
    /// The bot's own handle on this platform, used to drop self-mentions.
    fn self_handle(&self) -> String;
    async fn fetch_notifications(&self, limit: usize) -> Result<Vec<Notification>>;
    /// Replies threaded onto the original mention.
    async fn reply(&self, to: &Notification, text: &str) -> Result<()>;
    async fn mark_read(&self) -> Result<()>;
}

/// Constructs a live synchronizer from a destination config. Implemented by
/// the crate that owns the platform client libraries; an error means the
/// destination's required credentials are absent or unusable, which the bot
/// treats as skip-with-warning, not as fatal.
pub trait SynchronizerBuilder: Send + Sync {
    fn build(&self, bot_id: i64, cfg: &DestinationConfig) -> Result<Arc<dyn Synchronizer>>;
}
