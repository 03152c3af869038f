/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Shared fixtures and fakes for the unit tests.

use crate::commands::{Executor, ToggleKey};
use crate::config::{BotConfig, DestinationConfig, UpstreamCredentials};
use crate::events::{BotReporter, EventBus};
use crate::profile_sync::MediaFetcher;
use crate::session::UpstreamClient;
use crate::store::Store;
use crate::synchronizer::{MentionGateway, Synchronizer, SynchronizerBuilder};
use anyhow::{bail, Result};
use async_trait::async_trait;
use mirrorbot_protocol::{
    DeliveryAck, MediaBlob, Notification, NotificationReason, Platform, PostView, SourcePost,
    SourceProfile,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub fn temp_store() -> (Store, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path().join("test.db")).expect("open store");
    (store, dir)
}

pub fn mock_bus() -> EventBus {
    EventBus::new(64)
}

pub fn mock_reporter(bot_id: i64, store: &Store) -> BotReporter {
    BotReporter::new(bot_id, store.clone(), mock_bus())
}

/// A minimal valid bot: mirrors @alice to one Mastodon destination with the
/// default sync policy.
pub fn test_bot_config(id: i64) -> BotConfig {
    let mut credentials = HashMap::new();
    credentials.insert("token".to_string(), "t".to_string());
    BotConfig {
        id,
        source_handle: "alice".to_string(),
        enabled: true,
        interval_minutes: 30,
        sync_posts: true,
        sync_bio: false,
        sync_avatar: false,
        sync_banner: false,
        sync_name: false,
        backdate: false,
        dedup_cutoff: 3,
        transforms: Vec::new(),
        destination_transforms: HashMap::new(),
        destinations: vec![DestinationConfig {
            platform: Platform::Mastodon,
            enabled: true,
            credentials,
        }],
        upstream: UpstreamCredentials {
            username: "alice".to_string(),
            password: "pw".to_string(),
        },
        command_channel: Default::default(),
    }
}

pub fn valid_post(id: &str, created_at_ms: i64) -> SourcePost {
    SourcePost {
        id: id.to_string(),
        text: format!("post {id}"),
        created_at_ms,
        media: Vec::new(),
        in_reply_to: None,
        url: Some(format!("https://source.example/{id}")),
    }
}

pub fn mention(id: &str, author: &str, text: &str, created_at: &str) -> Notification {
    Notification {
        id: id.to_string(),
        reason: NotificationReason::Mention,
        author_handle: author.to_string(),
        text: text.to_string(),
        created_at: created_at.to_string(),
        thread_root_id: None,
    }
}

/// Fake upstream account. Login always succeeds (optionally after a delay,
/// to widen single-flight races); cookie restore succeeds only when
/// `cookie_login_ok` is set.
pub struct MockUpstream {
    pub login_calls: AtomicU32,
    pub login_delay_ms: AtomicU64,
    pub cookie_login_ok: AtomicBool,
    pub fail_get_posts: AtomicBool,
    logged_in: AtomicBool,
    posts: Mutex<Vec<SourcePost>>,
    profile: Mutex<SourceProfile>,
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self {
            login_calls: AtomicU32::new(0),
            login_delay_ms: AtomicU64::new(0),
            cookie_login_ok: AtomicBool::new(false),
            fail_get_posts: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            posts: Mutex::new(Vec::new()),
            profile: Mutex::new(SourceProfile {
                handle: "alice".to_string(),
                display_name: String::new(),
                bio: String::new(),
                avatar_url: None,
                banner_url: None,
            }),
        }
    }
}

impl MockUpstream {
    pub fn set_posts(&self, posts: Vec<SourcePost>) {
        *self.posts.lock().unwrap() = posts;
    }

    pub fn set_avatar_url(&self, url: &str) {
        self.profile.lock().unwrap().avatar_url = Some(url.to_string());
    }

    pub fn set_profile_text(&self, name: &str, bio: &str) {
        let mut p = self.profile.lock().unwrap();
        p.display_name = name.to_string();
        p.bio = bio.to_string();
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn login(&self, _username: &str, _password: &str) -> Result<()> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.login_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    async fn get_cookies(&self) -> Result<Vec<(String, String)>> {
        if self.logged_in.load(Ordering::SeqCst) {
            Ok(vec![("auth".to_string(), "tok".to_string())])
        } else {
            Ok(Vec::new())
        }
    }

    async fn set_cookies(&self, _cookies: &[(String, String)]) -> Result<()> {
        if self.cookie_login_ok.load(Ordering::SeqCst) {
            self.logged_in.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn clear_cookies(&self) -> Result<()> {
        self.logged_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_profile(&self, _handle: &str) -> Result<SourceProfile> {
        Ok(self.profile.lock().unwrap().clone())
    }

    async fn get_posts(&self, _handle: &str, limit: usize) -> Result<Vec<SourcePost>> {
        if self.fail_get_posts.load(Ordering::SeqCst) {
            bail!("upstream timeline unavailable");
        }
        let posts = self.posts.lock().unwrap();
        Ok(posts.iter().take(limit).cloned().collect())
    }
}

/// Fake destination that counts every capability call.
pub struct MockSynchronizer {
    platform: Platform,
    pub post_calls: AtomicU32,
    pub pic_calls: AtomicU32,
    pub name_calls: AtomicU32,
    pub bio_calls: AtomicU32,
    pub fail_posts: AtomicBool,
    pub saw_prior: AtomicBool,
    gateway: Mutex<Option<Arc<MockGateway>>>,
}

impl MockSynchronizer {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            post_calls: AtomicU32::new(0),
            pic_calls: AtomicU32::new(0),
            name_calls: AtomicU32::new(0),
            bio_calls: AtomicU32::new(0),
            fail_posts: AtomicBool::new(false),
            saw_prior: AtomicBool::new(false),
            gateway: Mutex::new(None),
        }
    }

    fn ack(&self) -> Option<DeliveryAck> {
        Some(DeliveryAck {
            platform: self.platform,
            remote_id: None,
            url: None,
        })
    }
}

#[async_trait]
impl Synchronizer for MockSynchronizer {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn mention_gateway(&self) -> Option<Arc<dyn MentionGateway>> {
        self.gateway
            .lock()
            .unwrap()
            .clone()
            .map(|g| g as Arc<dyn MentionGateway>)
    }

    async fn sync_bio(&self, _bio: &str) -> Result<Option<DeliveryAck>> {
        self.bio_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ack())
    }

    async fn sync_user_name(&self, _name: &str) -> Result<Option<DeliveryAck>> {
        self.name_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ack())
    }

    async fn sync_profile_pic(&self, _image: &MediaBlob) -> Result<Option<DeliveryAck>> {
        self.pic_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ack())
    }

    async fn sync_post(
        &self,
        post: &PostView,
        prior: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>> {
        if prior.is_some() {
            self.saw_prior.store(true, Ordering::SeqCst);
        }
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_posts.load(Ordering::SeqCst) {
            bail!("{} is down", self.platform);
        }
        Ok(Some(serde_json::json!({
            "remote_id": format!("r-{}", post.post_id),
            "url": format!("https://{}.example/{}", self.platform, post.post_id),
        })))
    }
}

/// Builder that supports the platforms it was told about and keeps every
/// synchronizer it hands out, so tests can inspect call counts afterwards.
pub struct MockBuilder {
    supported: Mutex<HashSet<Platform>>,
    pub built: Mutex<Vec<Arc<MockSynchronizer>>>,
    gateway: Mutex<Option<Arc<MockGateway>>>,
}

impl MockBuilder {
    pub fn new(platform: Platform) -> Self {
        let mut supported = HashSet::new();
        supported.insert(platform);
        Self {
            supported: Mutex::new(supported),
            built: Mutex::new(Vec::new()),
            gateway: Mutex::new(None),
        }
    }

    pub fn reject_platform(&self, platform: Platform) {
        self.supported.lock().unwrap().remove(&platform);
    }

    /// Every synchronizer built from now on exposes this gateway, so the
    /// command channel attaches to it.
    pub fn with_gateway(&self, gateway: Arc<MockGateway>) {
        *self.gateway.lock().unwrap() = Some(gateway);
    }
}

impl SynchronizerBuilder for MockBuilder {
    fn build(&self, _bot_id: i64, cfg: &DestinationConfig) -> Result<Arc<dyn Synchronizer>> {
        if !self.supported.lock().unwrap().contains(&cfg.platform) {
            bail!("{}: credentials missing", cfg.platform);
        }
        let sync = Arc::new(MockSynchronizer::new(cfg.platform));
        *sync.gateway.lock().unwrap() = self.gateway.lock().unwrap().clone();
        self.built.lock().unwrap().push(sync.clone());
        Ok(sync)
    }
}

/// Fake media host that serves one fixed body.
pub struct MockFetcher {
    bytes: Vec<u8>,
    pub fetch_calls: AtomicU32,
}

impl MockFetcher {
    pub fn returning(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            fetch_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl MediaFetcher for MockFetcher {
    async fn fetch(&self, _url: &str) -> Result<MediaBlob> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(MediaBlob {
            bytes: self.bytes.clone(),
            media_type: Some("image/png".to_string()),
        })
    }
}

/// Fake mention source: a fixed notification page plus captured replies.
pub struct MockGateway {
    self_handle: String,
    notifications: Mutex<Vec<Notification>>,
    pub replies: Mutex<Vec<(String, String)>>,
    pub mark_read_calls: AtomicUsize,
}

impl MockGateway {
    pub fn new(self_handle: &str) -> Self {
        Self {
            self_handle: self_handle.to_string(),
            notifications: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            mark_read_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_notifications(&self, notifications: Vec<Notification>) {
        *self.notifications.lock().unwrap() = notifications;
    }
}

#[async_trait]
impl MentionGateway for MockGateway {
    fn self_handle(&self) -> String {
        self.self_handle.clone()
    }

    async fn fetch_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let n = self.notifications.lock().unwrap();
        Ok(n.iter().take(limit).cloned().collect())
    }

    async fn reply(&self, to: &Notification, text: &str) -> Result<()> {
        self.replies
            .lock()
            .unwrap()
            .push((to.id.clone(), text.to_string()));
        Ok(())
    }

    async fn mark_read(&self) -> Result<()> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records executor calls by method name; every method can be made to fail.
#[derive(Default)]
pub struct MockExecutor {
    pub calls: Mutex<Vec<String>>,
    pub fail_all: AtomicBool,
}

impl MockExecutor {
    fn record(&self, name: &str) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            bail!("executor refused {name}");
        }
        self.calls.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn restart(&self, _bot_id: i64) -> Result<()> {
        self.record("restart")
    }

    async fn sync_now(&self, _bot_id: i64) -> Result<()> {
        self.record("sync_now")
    }

    async fn source_handle(&self, _bot_id: i64) -> Result<String> {
        self.record("source_handle")?;
        Ok("alice".to_string())
    }

    async fn change_source(&self, _bot_id: i64, handle: &str) -> Result<()> {
        self.record(&format!("change_source:{handle}"))
    }

    async fn status_summary(&self, _bot_id: i64) -> Result<String> {
        self.record("status_summary")?;
        Ok("running".to_string())
    }

    async fn set_frequency(&self, _bot_id: i64, minutes: u64) -> Result<()> {
        self.record(&format!("set_frequency:{minutes}"))
    }

    async fn toggle(&self, _bot_id: i64, key: ToggleKey, value: Option<bool>) -> Result<bool> {
        self.record(&format!("toggle:{}", key.as_str()))?;
        Ok(value.unwrap_or(true))
    }

    async fn last_post_link(&self, _bot_id: i64) -> Result<Option<String>> {
        self.record("last_post_link")?;
        Ok(Some("https://mastodon.example/p1".to_string()))
    }

    async fn stats_summary(&self, _bot_id: i64) -> Result<String> {
        self.record("stats_summary")?;
        Ok("1 post delivered".to_string())
    }

    async fn mute(&self, _bot_id: i64) -> Result<()> {
        self.record("mute")
    }

    async fn unmute(&self, _bot_id: i64) -> Result<()> {
        self.record("unmute")
    }
}
