/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use rand::{thread_rng, Rng};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Runs `op` up to `policy.attempts` times with exponential backoff and
/// jitter between failures. The last error is returned on exhaustion.
pub async fn retry<T, F, Fut>(label: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.attempts.clamp(1, 10);
    let mut backoff = policy.base_backoff;
    for attempt in 0..max_attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt + 1 >= max_attempts {
                    return Err(e);
                }
                debug!("{label}: attempt {} failed, retrying: {e:#}", attempt + 1);
                sleep_with_jitter(backoff).await;
                backoff = backoff.saturating_mul(2).min(policy.max_backoff);
            }
        }
    }
    unreachable!("retry loop should return or error");
}

/// Fixed-delay variant for upstream transport calls that are expected to
/// recover quickly (temporarily-unready connection, timeout).
pub async fn retry_fixed<T, F, Fut>(
    label: &str,
    attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = attempts.clamp(1, 10);
    for attempt in 0..max_attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt + 1 >= max_attempts {
                    return Err(e);
                }
                debug!("{label}: attempt {} failed, retrying: {e:#}", attempt + 1);
                tokio::time::sleep(delay).await;
            }
        }
    }
    unreachable!("retry loop should return or error");
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}
