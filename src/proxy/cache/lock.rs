use anyhow::Result;

use super::store::{DiskLayout, read_millis, remove_file_if_exists};

/// A refresh lock older than this is treated as abandoned.
pub const REFRESH_LOCK_TTL_MS: u64 = 60_000;

/// Stamps from a clock running ahead of ours stay live only within the same
/// TTL window, so a skewed or stepped clock cannot pin a lock indefinitely.
pub(super) fn lock_is_live(started_at_ms: u64, now_ms: u64) -> bool {
    started_at_ms.abs_diff(now_ms) < REFRESH_LOCK_TTL_MS
}

/// Stamps the lock for `entry_id`, replacing any previous stamp. This is not a
/// create-if-absent primitive; callers check [`is_locked`] first.
pub(super) async fn acquire(layout: &DiskLayout, entry_id: &str, now_ms: u64) -> Result<()> {
    let path = layout.lock_path(entry_id);
    layout.publish(&path, now_ms.to_string().as_bytes()).await
}

pub(super) async fn is_locked(layout: &DiskLayout, entry_id: &str, now_ms: u64) -> Result<bool> {
    let started = read_millis(&layout.lock_path(entry_id)).await?;
    Ok(started.is_some_and(|started| lock_is_live(started, now_ms)))
}

pub(super) async fn release(layout: &DiskLayout, entry_id: &str) -> Result<()> {
    remove_file_if_exists(&layout.lock_path(entry_id)).await
}
