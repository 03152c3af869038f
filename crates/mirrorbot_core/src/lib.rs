/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod alerts;
pub mod bot;
pub mod commands;
pub mod config;
pub mod events;
pub mod manager;
pub mod post_sync;
pub mod profile_sync;
pub mod retry;
pub mod session;
pub mod store;
pub mod synchronizer;
pub mod transforms;

#[cfg(test)]
pub(crate) mod test_support;

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
