/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Closed set of destination platforms the engine can fan out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Mastodon,
    Bluesky,
    Telegram,
    Discord,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mastodon => "mastodon",
            Platform::Bluesky => "bluesky",
            Platform::Telegram => "telegram",
            Platform::Discord => "discord",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "mastodon" => Some(Platform::Mastodon),
            "bluesky" | "bsky" => Some(Platform::Bluesky),
            "telegram" => Some(Platform::Telegram),
            "discord" => Some(Platform::Discord),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One media attachment on a source post, by upstream URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub alt: Option<String>,
}

/// A post as read from the source account, newest-first ordering upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePost {
    pub id: String,
    pub text: String,
    pub created_at_ms: i64,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl SourcePost {
    /// A post needs an id and at least one of text or media to be deliverable.
    pub fn is_valid(&self) -> bool {
        !self.id.trim().is_empty() && (!self.text.trim().is_empty() || !self.media.is_empty())
    }
}

/// Profile state as read from the source account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProfile {
    pub handle: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub banner_url: Option<String>,
}

/// Downloaded media bytes plus the content type the server reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaBlob {
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub media_type: Option<String>,
}

/// The per-destination view of one post, after text transforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostView {
    pub post_id: String,
    pub platform: Platform,
    pub text: String,
    pub media: Vec<MediaRef>,
    pub created_at_ms: i64,
    /// When set, the synchronizer should date the delivered post at
    /// `created_at_ms` instead of "now" (platform permitting).
    pub backdate: bool,
}

/// Acknowledgement for a profile-dimension sync call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub platform: Platform,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationReason {
    Mention,
    Reply,
    Follow,
    Like,
    Repost,
    Other,
}

/// One destination-side notification, as surfaced by a mention gateway.
/// `created_at` is an RFC 3339 timestamp; the command channel cursor is
/// compared against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub reason: NotificationReason,
    pub author_handle: String,
    pub text: String,
    pub created_at: String,
    /// Platform-native threading reference for replies, when the platform
    /// distinguishes it from the notification id.
    #[serde(default)]
    pub thread_root_id: Option<String>,
}
