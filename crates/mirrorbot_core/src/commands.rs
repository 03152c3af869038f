/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::ReplyTemplates;
use crate::events::BotReporter;
use crate::store::Store;
use crate::synchronizer::MentionGateway;
use anyhow::Result;
use async_trait::async_trait;
use mirrorbot_protocol::{Notification, NotificationReason};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const NOTIFICATION_FETCH_LIMIT: usize = 50;
const MIN_POLL_SECONDS: u64 = 5;

pub const HELP_TEXT: &str = "Commands: !restart, !sync-now, !change-source <handle>, \
!get-status, !set-frequency <minutes>, !toggle <posts|bio|avatar|name|header|backdate> [on|off], \
!get-last-post, !get-stats, !mute, !unmute, !help";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleKey {
    Posts,
    Bio,
    Avatar,
    Name,
    Header,
    Backdate,
}

impl ToggleKey {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "posts" => Some(ToggleKey::Posts),
            "bio" => Some(ToggleKey::Bio),
            "avatar" => Some(ToggleKey::Avatar),
            "name" => Some(ToggleKey::Name),
            "header" => Some(ToggleKey::Header),
            "backdate" => Some(ToggleKey::Backdate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToggleKey::Posts => "posts",
            ToggleKey::Bio => "bio",
            ToggleKey::Avatar => "avatar",
            ToggleKey::Name => "name",
            ToggleKey::Header => "header",
            ToggleKey::Backdate => "backdate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Restart,
    SyncNow,
    ChangeSource(String),
    GetStatus,
    SetFrequency(u64),
    Toggle(ToggleKey, Option<bool>),
    GetLastPost,
    GetStats,
    Mute,
    Unmute,
    Help,
}

pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_ascii_lowercase()
}

fn parse_on_off(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

/// Extracts one command from free-form mention text. Tokens are scanned left
/// to right; the first `!name` that matches the vocabulary (with any
/// required argument present and valid) wins. No match means "unknown
/// command".
pub fn parse_command(text: &str) -> Option<Command> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for (i, token) in tokens.iter().enumerate() {
        let Some(name) = token.strip_prefix('!') else {
            continue;
        };
        let arg = |n: usize| tokens.get(i + n).copied();
        let cmd = match name.to_ascii_lowercase().as_str() {
            "restart" => Some(Command::Restart),
            "sync-now" => Some(Command::SyncNow),
            "get-status" => Some(Command::GetStatus),
            "get-last-post" => Some(Command::GetLastPost),
            "get-stats" => Some(Command::GetStats),
            "mute" => Some(Command::Mute),
            "unmute" => Some(Command::Unmute),
            "help" => Some(Command::Help),
            "change-source" => arg(1)
                .map(normalize_handle)
                .filter(|h| !h.is_empty())
                .map(Command::ChangeSource),
            "set-frequency" => arg(1)
                .and_then(|m| m.parse::<u64>().ok())
                .filter(|m| *m > 0)
                .map(Command::SetFrequency),
            "toggle" => arg(1).and_then(ToggleKey::parse).map(|key| {
                let value = arg(2).and_then(parse_on_off);
                Command::Toggle(key, value)
            }),
            _ => None,
        };
        if let Some(cmd) = cmd {
            return Some(cmd);
        }
    }
    None
}

/// What a recognized command may do to a running bot. Implemented by the
/// manager; the channel never touches instances directly.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn restart(&self, bot_id: i64) -> Result<()>;
    async fn sync_now(&self, bot_id: i64) -> Result<()>;
    async fn source_handle(&self, bot_id: i64) -> Result<String>;
    async fn change_source(&self, bot_id: i64, handle: &str) -> Result<()>;
    async fn status_summary(&self, bot_id: i64) -> Result<String>;
    async fn set_frequency(&self, bot_id: i64, minutes: u64) -> Result<()>;
    /// Sets the toggle to `value`, or flips it when `value` is None; returns
    /// the new state.
    async fn toggle(&self, bot_id: i64, key: ToggleKey, value: Option<bool>) -> Result<bool>;
    async fn last_post_link(&self, bot_id: i64) -> Result<Option<String>>;
    async fn stats_summary(&self, bot_id: i64) -> Result<String>;
    async fn mute(&self, bot_id: i64) -> Result<()>;
    async fn unmute(&self, bot_id: i64) -> Result<()>;
}

/// Mention-driven remote control for one bot: an independent poll loop over
/// the destination's notifications, gated by a trusted-handle allow-list.
pub struct CommandChannel {
    bot_id: i64,
    store: Store,
    executor: Arc<dyn Executor>,
    gateway: Arc<dyn MentionGateway>,
    reporter: BotReporter,
}

impl CommandChannel {
    pub fn new(
        bot_id: i64,
        store: Store,
        executor: Arc<dyn Executor>,
        gateway: Arc<dyn MentionGateway>,
        reporter: BotReporter,
    ) -> Self {
        Self {
            bot_id,
            store,
            executor,
            gateway,
            reporter,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
        })
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let poll_seconds = self
                .store
                .get_bot_config(self.bot_id)
                .await
                .ok()
                .flatten()
                .map(|c| c.command_channel.poll_seconds)
                .unwrap_or(90)
                .max(MIN_POLL_SECONDS);
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(poll_seconds)) => {
                    if let Err(e) = self.poll_once().await {
                        warn!("bot {}: command poll failed: {e:#}", self.bot_id);
                    }
                }
            }
        }
        debug!("bot {}: command channel stopped", self.bot_id);
    }

    /// One poll tick. Channel config is re-read so allow-list and template
    /// edits apply without a restart. The cursor is advanced and persisted
    /// before each command executes: a command lost to a crash is preferred
    /// over a command executed twice after restart.
    pub async fn poll_once(&self) -> Result<()> {
        let Some(cfg) = self.store.get_bot_config(self.bot_id).await? else {
            return Ok(());
        };
        let channel = cfg.command_channel;
        if !channel.enabled {
            return Ok(());
        }

        let cursor = match self.store.get_channel_cursor(self.bot_id).await? {
            Some(s) => match OffsetDateTime::parse(&s, &Rfc3339) {
                Ok(t) => Some(t),
                Err(e) => {
                    // A corrupt cursor replays the fetched page; leave a
                    // trace so the re-runs are explainable.
                    warn!("bot {}: ignoring unparsable channel cursor {s:?}: {e}", self.bot_id);
                    None
                }
            },
            None => None,
        };

        let notifications = self
            .gateway
            .fetch_notifications(NOTIFICATION_FETCH_LIMIT)
            .await?;
        if notifications.is_empty() {
            return Ok(());
        }

        let self_handle = normalize_handle(&self.gateway.self_handle());
        let trusted: Vec<String> = channel
            .trusted_handles
            .iter()
            .map(|h| normalize_handle(h))
            .collect();

        let mut pending: Vec<(OffsetDateTime, Notification)> = Vec::new();
        for n in notifications {
            if n.reason != NotificationReason::Mention {
                continue;
            }
            if normalize_handle(&n.author_handle) == self_handle {
                continue;
            }
            let ts = match OffsetDateTime::parse(&n.created_at, &Rfc3339) {
                Ok(t) => t,
                Err(e) => {
                    warn!("bot {}: unparsable mention timestamp: {e}", self.bot_id);
                    continue;
                }
            };
            if let Some(c) = cursor {
                if ts <= c {
                    continue;
                }
            }
            pending.push((ts, n));
        }
        // Oldest first, so commands execute in issuance order.
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, mention) in &pending {
            self.store
                .set_channel_cursor(self.bot_id, &mention.created_at)
                .await?;

            let reply_text = if !trusted.contains(&normalize_handle(&mention.author_handle)) {
                self.reporter
                    .warn(format!(
                        "unauthorized command from @{}",
                        mention.author_handle
                    ))
                    .await;
                channel.templates.unauthorized.clone()
            } else {
                match parse_command(&mention.text) {
                    None => channel.templates.unknown.clone(),
                    Some(cmd) => match self.execute(cmd).await {
                        Ok(msg) => ReplyTemplates::render(&channel.templates.ok, &msg),
                        Err(e) => {
                            ReplyTemplates::render(&channel.templates.error, &format!("{e:#}"))
                        }
                    },
                }
            };

            if let Err(e) = self.gateway.reply(mention, &reply_text).await {
                warn!("bot {}: mention reply failed: {e:#}", self.bot_id);
            }
        }

        if let Err(e) = self.gateway.mark_read().await {
            debug!("bot {}: mark notifications read failed: {e:#}", self.bot_id);
        }
        Ok(())
    }

    async fn execute(&self, cmd: Command) -> Result<String> {
        let bot_id = self.bot_id;
        Ok(match cmd {
            Command::Restart => {
                // Restart tears down this channel's own task; executing it
                // inline would leave the manager joining on the task it is
                // running inside. Run it detached and reply before it lands.
                let executor = self.executor.clone();
                tokio::spawn(async move {
                    if let Err(e) = executor.restart(bot_id).await {
                        warn!("bot {bot_id}: restart failed: {e:#}");
                    }
                });
                "restarting".to_string()
            }
            Command::SyncNow => {
                self.executor.sync_now(bot_id).await?;
                "sync triggered".to_string()
            }
            Command::ChangeSource(handle) => {
                self.executor.change_source(bot_id, &handle).await?;
                format!("source changed to @{handle}")
            }
            Command::GetStatus => self.executor.status_summary(bot_id).await?,
            Command::SetFrequency(minutes) => {
                self.executor.set_frequency(bot_id, minutes).await?;
                format!("sync frequency set to {minutes} minutes")
            }
            Command::Toggle(key, value) => {
                let new_value = self.executor.toggle(bot_id, key, value).await?;
                format!(
                    "{} is now {}",
                    key.as_str(),
                    if new_value { "on" } else { "off" }
                )
            }
            Command::GetLastPost => match self.executor.last_post_link(bot_id).await? {
                Some(link) => link,
                None => "no posts delivered yet".to_string(),
            },
            Command::GetStats => self.executor.stats_summary(bot_id).await?,
            Command::Mute => {
                self.executor.mute(bot_id).await?;
                "bot muted".to_string()
            }
            Command::Unmute => {
                self.executor.unmute(bot_id).await?;
                "bot unmuted".to_string()
            }
            Command::Help => HELP_TEXT.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        mention, mock_reporter, temp_store, test_bot_config, MockExecutor, MockGateway,
    };

    #[test]
    fn parser_accepts_the_closed_vocabulary() {
        assert_eq!(parse_command("!restart"), Some(Command::Restart));
        assert_eq!(parse_command("hey !sync-now please"), Some(Command::SyncNow));
        assert_eq!(
            parse_command("!change-source @alice"),
            Some(Command::ChangeSource("alice".into()))
        );
        assert_eq!(
            parse_command("!set-frequency 15"),
            Some(Command::SetFrequency(15))
        );
        assert_eq!(
            parse_command("!toggle posts off"),
            Some(Command::Toggle(ToggleKey::Posts, Some(false)))
        );
        assert_eq!(
            parse_command("!toggle header"),
            Some(Command::Toggle(ToggleKey::Header, None))
        );
        assert_eq!(parse_command("!help"), Some(Command::Help));
    }

    #[test]
    fn parser_first_valid_token_wins() {
        assert_eq!(
            parse_command("!frobnicate !mute !restart"),
            Some(Command::Mute)
        );
    }

    #[test]
    fn parser_rejects_junk() {
        assert_eq!(parse_command("just a mention"), None);
        assert_eq!(parse_command("!set-frequency zero"), None);
        assert_eq!(parse_command("!set-frequency 0"), None);
        assert_eq!(parse_command("!toggle everything"), None);
        assert_eq!(parse_command("!change-source"), None);
    }

    fn channel_with(
        store: &Store,
        executor: Arc<MockExecutor>,
        gateway: Arc<MockGateway>,
    ) -> CommandChannel {
        CommandChannel::new(
            1,
            store.clone(),
            executor,
            gateway,
            mock_reporter(1, store),
        )
    }

    async fn seed_channel_config(store: &Store) {
        let mut cfg = test_bot_config(1);
        cfg.command_channel.enabled = true;
        cfg.command_channel.trusted_handles = vec!["@Operator".to_string()];
        store.upsert_bot_config(&cfg).await.unwrap();
    }

    #[tokio::test]
    async fn commands_execute_oldest_first_and_cursor_advances() {
        let (store, _dir) = temp_store();
        seed_channel_config(&store).await;
        let executor = Arc::new(MockExecutor::default());
        let gateway = Arc::new(MockGateway::new("mirror_bot"));
        gateway.set_notifications(vec![
            mention("n2", "operator", "!sync-now", "2026-02-01T10:00:05Z"),
            mention("n1", "operator", "!mute", "2026-02-01T10:00:00Z"),
        ]);

        let channel = channel_with(&store, executor.clone(), gateway.clone());
        channel.poll_once().await.unwrap();

        assert_eq!(
            executor.calls.lock().unwrap().as_slice(),
            ["mute", "sync_now"]
        );
        assert_eq!(
            store.get_channel_cursor(1).await.unwrap().as_deref(),
            Some("2026-02-01T10:00:05Z")
        );
        assert_eq!(gateway.replies.lock().unwrap().len(), 2);
        assert_eq!(gateway.mark_read_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repolling_never_reexecutes_acted_mentions() {
        let (store, _dir) = temp_store();
        seed_channel_config(&store).await;
        let executor = Arc::new(MockExecutor::default());
        let gateway = Arc::new(MockGateway::new("mirror_bot"));
        gateway.set_notifications(vec![mention(
            "n1",
            "operator",
            "!mute",
            "2026-02-01T10:00:00Z",
        )]);

        let channel = channel_with(&store, executor.clone(), gateway.clone());
        channel.poll_once().await.unwrap();
        assert_eq!(executor.calls.lock().unwrap().len(), 1);

        // Same notifications again, as after a crash-and-restart: the
        // persisted cursor filters the acted mention out.
        channel.poll_once().await.unwrap();
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cursor_is_persisted_before_the_side_effect() {
        let (store, _dir) = temp_store();
        seed_channel_config(&store).await;
        let executor = Arc::new(MockExecutor::default());
        executor.fail_all.store(true, std::sync::atomic::Ordering::SeqCst);
        let gateway = Arc::new(MockGateway::new("mirror_bot"));
        gateway.set_notifications(vec![mention(
            "n1",
            "operator",
            "!sync-now",
            "2026-02-01T10:00:00Z",
        )]);

        let channel = channel_with(&store, executor.clone(), gateway.clone());
        channel.poll_once().await.unwrap();

        // The command failed, but the cursor had already advanced and the
        // templated error went out.
        assert_eq!(
            store.get_channel_cursor(1).await.unwrap().as_deref(),
            Some("2026-02-01T10:00:00Z")
        );
        let replies = gateway.replies.lock().unwrap();
        assert!(replies[0].1.starts_with("Command failed:"));
    }

    #[tokio::test]
    async fn untrusted_author_gets_unauthorized_reply() {
        let (store, _dir) = temp_store();
        seed_channel_config(&store).await;
        let executor = Arc::new(MockExecutor::default());
        let gateway = Arc::new(MockGateway::new("mirror_bot"));
        gateway.set_notifications(vec![mention(
            "n1",
            "stranger",
            "!restart",
            "2026-02-01T10:00:00Z",
        )]);

        let channel = channel_with(&store, executor.clone(), gateway.clone());
        channel.poll_once().await.unwrap();

        assert!(executor.calls.lock().unwrap().is_empty());
        let replies = gateway.replies.lock().unwrap();
        assert_eq!(replies[0].1, "Sorry, you are not allowed to control this bot.");
    }

    #[tokio::test]
    async fn self_mentions_and_non_mentions_are_ignored() {
        let (store, _dir) = temp_store();
        seed_channel_config(&store).await;
        let executor = Arc::new(MockExecutor::default());
        let gateway = Arc::new(MockGateway::new("mirror_bot"));
        let mut like = mention("n2", "operator", "!restart", "2026-02-01T10:00:01Z");
        like.reason = NotificationReason::Like;
        gateway.set_notifications(vec![
            mention("n1", "mirror_bot", "!restart", "2026-02-01T10:00:00Z"),
            like,
        ]);

        let channel = channel_with(&store, executor.clone(), gateway.clone());
        channel.poll_once().await.unwrap();
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_replies_immediately_and_executes_detached() {
        let (store, _dir) = temp_store();
        seed_channel_config(&store).await;
        let executor = Arc::new(MockExecutor::default());
        let gateway = Arc::new(MockGateway::new("mirror_bot"));
        gateway.set_notifications(vec![mention(
            "n1",
            "operator",
            "!restart",
            "2026-02-01T10:00:00Z",
        )]);

        let channel = channel_with(&store, executor.clone(), gateway.clone());
        channel.poll_once().await.unwrap();

        // The reply goes out before the restart runs, so the channel task
        // never waits on its own teardown.
        assert_eq!(gateway.replies.lock().unwrap()[0].1, "restarting");
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if executor.calls.lock().unwrap().iter().any(|c| c == "restart") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("detached restart never reached the executor");
    }

    #[tokio::test]
    async fn corrupt_cursor_is_ignored_and_replaced() {
        let (store, _dir) = temp_store();
        seed_channel_config(&store).await;
        store
            .set_channel_cursor(1, "definitely-not-a-timestamp")
            .await
            .unwrap();
        let executor = Arc::new(MockExecutor::default());
        let gateway = Arc::new(MockGateway::new("mirror_bot"));
        gateway.set_notifications(vec![mention(
            "n1",
            "operator",
            "!mute",
            "2026-02-01T10:00:00Z",
        )]);

        let channel = channel_with(&store, executor.clone(), gateway.clone());
        channel.poll_once().await.unwrap();

        assert_eq!(executor.calls.lock().unwrap().as_slice(), ["mute"]);
        assert_eq!(
            store.get_channel_cursor(1).await.unwrap().as_deref(),
            Some("2026-02-01T10:00:00Z")
        );
    }

    #[tokio::test]
    async fn unknown_text_gets_templated_reply() {
        let (store, _dir) = temp_store();
        seed_channel_config(&store).await;
        let executor = Arc::new(MockExecutor::default());
        let gateway = Arc::new(MockGateway::new("mirror_bot"));
        gateway.set_notifications(vec![mention(
            "n1",
            "operator",
            "do the thing",
            "2026-02-01T10:00:00Z",
        )]);

        let channel = channel_with(&store, executor.clone(), gateway.clone());
        channel.poll_once().await.unwrap();
        let replies = gateway.replies.lock().unwrap();
        assert_eq!(replies[0].1, "Unknown command. Try !help.");
    }
}
