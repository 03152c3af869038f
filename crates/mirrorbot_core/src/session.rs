/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::retry::retry_fixed;
use crate::store::Store;
use anyhow::Result;
use async_trait::async_trait;
use mirrorbot_protocol::{SourcePost, SourceProfile};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// The authenticated upstream client used to read the source account. Wire
/// detail lives in the implementing crate; the engine only sees this surface.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<()>;
    async fn is_logged_in(&self) -> bool;
    async fn get_cookies(&self) -> Result<Vec<(String, String)>>;
    async fn set_cookies(&self, cookies: &[(String, String)]) -> Result<()>;
    async fn clear_cookies(&self) -> Result<()>;
    async fn get_profile(&self, handle: &str) -> Result<SourceProfile>;
    /// Newest-first, finite, one-shot page of recent posts.
    async fn get_posts(&self, handle: &str, limit: usize) -> Result<Vec<SourcePost>>;
}

/// One upstream session shared by every bot under a manager. Login is
/// rate-limited upstream, so it is guarded by a single-flight mutex: the
/// first caller authenticates, concurrent callers wait on the same lock and
/// then observe the session as logged in.
pub struct SharedSession {
    client: Arc<dyn UpstreamClient>,
    store: Store,
    login_gate: Mutex<()>,
}

impl SharedSession {
    pub fn new(client: Arc<dyn UpstreamClient>, store: Store) -> Self {
        Self {
            client,
            store,
            login_gate: Mutex::new(()),
        }
    }

    pub fn client(&self) -> &Arc<dyn UpstreamClient> {
        &self.client
    }

    pub async fn ensure_login(&self, username: &str, password: &str) -> Result<()> {
        let _guard = self.login_gate.lock().await;
        if self.client.is_logged_in().await {
            return Ok(());
        }

        // A process restart can skip password login when cached cookies are
        // still valid.
        match self.store.get_session_cookies().await {
            Ok(cookies) if !cookies.is_empty() => {
                if let Err(e) = self.client.set_cookies(&cookies).await {
                    warn!("restoring cached session failed: {e:#}");
                } else if self.client.is_logged_in().await {
                    info!("upstream session restored from cached cookies");
                    return Ok(());
                } else {
                    let _ = self.client.clear_cookies().await;
                }
            }
            Ok(_) => {}
            Err(e) => warn!("reading cached cookies failed: {e:#}"),
        }

        retry_fixed("upstream login", 3, Duration::from_secs(5), || {
            self.client.login(username, password)
        })
        .await?;
        info!("upstream session authenticated as {username}");

        match self.client.get_cookies().await {
            Ok(cookies) => {
                if let Err(e) = self.store.replace_session_cookies(&cookies).await {
                    warn!("persisting session cookies failed: {e:#}");
                }
            }
            Err(e) => warn!("reading session cookies failed: {e:#}"),
        }
        Ok(())
    }
}
