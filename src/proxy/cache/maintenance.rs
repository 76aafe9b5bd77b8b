use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tracing::{debug, trace, warn};

use super::CacheStore;
use super::entry::PersistedRecord;
use super::lock::lock_is_live;
use super::store::{
    BODY_EXTENSION, DiskLayout, LOCK_EXTENSION, META_EXTENSION, TEMP_PREFIX, dir_size,
    read_if_exists, read_millis, remove_dir_all_if_exists, remove_file_if_exists,
};
use crate::util::system_time_millis;

const CACHE_LAYOUT_VERSION: u32 = 1;
const CACHE_VERSION_PREFIX: &str = "v";
const CACHE_TOMBSTONE_PREFIX: &str = "tombstone-";

/// Temp metadata and metadata-less body areas older than this belong to a
/// writer that died mid-commit.
const ABANDONED_ARTIFACT_AGE_MS: u64 = 60 * 60 * 1000;

pub(super) fn cache_version_dir(root: &Path) -> PathBuf {
    root.join(format!("{CACHE_VERSION_PREFIX}{CACHE_LAYOUT_VERSION}"))
}

fn parse_cache_version(name: &str) -> Option<u32> {
    let version = name.strip_prefix(CACHE_VERSION_PREFIX)?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    version.parse().ok()
}

fn tombstone_dir_name(version_name: &str) -> String {
    format!(
        "{CACHE_TOMBSTONE_PREFIX}{version_name}-{}",
        uuid::Uuid::new_v4()
    )
}

/// Creates the active layout directory under `root` and renames directories of
/// other layout versions out of the way. Returns the active directory and the
/// tombstones that should be removed.
pub(super) async fn prepare_versioned_cache_dir(root: &Path) -> Result<(PathBuf, Vec<PathBuf>)> {
    let active_name = format!("{CACHE_VERSION_PREFIX}{CACHE_LAYOUT_VERSION}");
    let active_dir = cache_version_dir(root);
    async_fs::create_dir_all(&active_dir)
        .await
        .with_context(|| format!("failed to create cache dir {}", active_dir.display()))?;

    let mut cleanup_dirs = Vec::new();
    let mut entries = async_fs::read_dir(root)
        .await
        .with_context(|| format!("failed to list cache root {}", root.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str == active_name {
            continue;
        }
        if name_str.starts_with(CACHE_TOMBSTONE_PREFIX) {
            cleanup_dirs.push(entry.path());
            continue;
        }
        if parse_cache_version(&name_str).is_some() {
            let tombstone_path = root.join(tombstone_dir_name(&name_str));
            if let Err(err) = async_fs::rename(entry.path(), &tombstone_path).await {
                warn!(
                    error = %err,
                    path = %entry.path().display(),
                    "failed to tombstone old cache dir"
                );
                continue;
            }
            cleanup_dirs.push(tombstone_path);
        }
    }

    Ok((active_dir, cleanup_dirs))
}

pub(super) fn spawn_cache_dir_cleanup(dirs: Vec<PathBuf>) {
    for dir in dirs {
        tokio::spawn(async move {
            match remove_dir_all_if_exists(&dir).await {
                Ok(()) => debug!(path = %dir.display(), "removed old cache dir"),
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %dir.display(),
                        "failed to remove old cache dir"
                    );
                }
            }
        });
    }
}

/// Runs the cleanup sweep once right away and then every `interval`.
pub(super) fn spawn_cache_sweeper(store: CacheStore, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.run_cleanup().await {
                Ok(stats) if stats.skipped => {
                    debug!("cache sweep skipped; another sweep ran recently");
                }
                Ok(stats) => {
                    debug!(
                        expired = stats.expired,
                        evicted = stats.evicted,
                        bytes_reclaimed = stats.bytes_reclaimed,
                        locks_removed = stats.locks_removed,
                        abandoned_removed = stats.abandoned_removed,
                        "cache sweep finished"
                    );
                }
                Err(err) => warn!(error = %err, "cache sweep failed"),
            }
        }
    });
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub skipped: bool,
    pub expired: u64,
    pub evicted: u64,
    pub bytes_reclaimed: u64,
    pub locks_removed: u64,
    pub abandoned_removed: u64,
}

#[derive(Debug)]
struct LedgerEntry {
    entry_id: String,
    size: u64,
    committed_at_ms: u64,
}

/// One cleanup pass over a versioned cache directory.
pub(super) struct Sweep<'a> {
    layout: &'a DiskLayout,
    max_size: Option<u64>,
    now_ms: u64,
    stats: SweepStats,
    ledger: Vec<LedgerEntry>,
}

impl<'a> Sweep<'a> {
    pub(super) fn new(layout: &'a DiskLayout, max_size: Option<u64>, now_ms: u64) -> Self {
        Self {
            layout,
            max_size,
            now_ms,
            stats: SweepStats::default(),
            ledger: Vec::new(),
        }
    }

    /// Checks the shared stamp and claims this sweep by rewriting it. Returns
    /// false when another sweep started less than `min_gap` ago.
    pub(super) async fn claim(&self, min_gap: Duration) -> Result<bool> {
        let stamp_path = self.layout.cleanup_stamp_path();
        let min_gap_ms = u64::try_from(min_gap.as_millis()).unwrap_or(u64::MAX);
        if let Some(last) = read_millis(&stamp_path).await?
            && self.now_ms.saturating_sub(last) < min_gap_ms
        {
            return Ok(false);
        }
        self.layout
            .publish(&stamp_path, self.now_ms.to_string().as_bytes())
            .await?;
        Ok(true)
    }

    pub(super) async fn run(mut self) -> Result<SweepStats> {
        self.sweep_root().await?;
        for shard in self.shard_dirs().await? {
            self.sweep_shard(&shard).await?;
        }
        self.evict_over_budget().await?;
        Ok(self.stats)
    }

    fn is_abandoned(&self, modified_ms: u64) -> bool {
        self.now_ms.saturating_sub(modified_ms) >= ABANDONED_ARTIFACT_AGE_MS
    }

    async fn sweep_root(&mut self) -> Result<()> {
        let mut entries = match async_fs::read_dir(self.layout.disk_dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            let Some(modified_ms) = modified_millis(&entry.path()).await? else {
                continue;
            };
            if self.is_abandoned(modified_ms) {
                trace!(path = %entry.path().display(), "removing abandoned temp artifact");
                remove_file_if_exists(&entry.path()).await?;
                self.stats.abandoned_removed += 1;
            }
        }
        Ok(())
    }

    async fn shard_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut shards = Vec::new();
        for level1 in list_shard_children(self.layout.disk_dir()).await? {
            shards.extend(list_shard_children(&level1).await?);
        }
        Ok(shards)
    }

    async fn sweep_shard(&mut self, shard: &Path) -> Result<()> {
        let mut metas = Vec::new();
        let mut locks = Vec::new();
        let mut body_dirs = Vec::new();
        let mut entries = match async_fs::read_dir(shard).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(entry_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(META_EXTENSION) => metas.push(entry_id),
                Some(LOCK_EXTENSION) => locks.push(entry_id),
                Some(BODY_EXTENSION) => body_dirs.push(entry_id),
                _ => {}
            }
        }

        for entry_id in &metas {
            self.inspect_record(entry_id).await?;
        }
        for entry_id in &locks {
            self.inspect_lock(entry_id).await?;
        }
        for entry_id in body_dirs.iter().filter(|id| !metas.contains(*id)) {
            self.inspect_orphan_body(entry_id).await?;
        }
        if let Some(entry_id) = metas.iter().chain(&locks).chain(&body_dirs).next() {
            self.layout.prune_empty_shards(entry_id).await;
        } else {
            prune_empty_dir_chain(shard, self.layout.disk_dir()).await;
        }
        Ok(())
    }

    async fn inspect_record(&mut self, entry_id: &str) -> Result<()> {
        let meta_path = self.layout.meta_path(entry_id);
        let Some(data) = read_if_exists(&meta_path).await? else {
            return Ok(());
        };
        let record: PersistedRecord = match serde_json::from_slice(&data) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %meta_path.display(),
                    "removing unreadable cache metadata"
                );
                self.stats.bytes_reclaimed += self.remove_entry(entry_id).await?;
                self.stats.expired += 1;
                return Ok(());
            }
        };
        if record.expires_at_ms() <= self.now_ms {
            trace!(key = %record.key, "expiring cache record");
            self.stats.bytes_reclaimed += self.remove_entry(entry_id).await?;
            self.stats.expired += 1;
            return Ok(());
        }
        let size = data.len() as u64 + dir_size(&self.layout.body_dir(entry_id)).await?;
        self.ledger.push(LedgerEntry {
            entry_id: entry_id.to_string(),
            size,
            committed_at_ms: record.committed_at_ms,
        });
        Ok(())
    }

    async fn inspect_lock(&mut self, entry_id: &str) -> Result<()> {
        let lock_path = self.layout.lock_path(entry_id);
        let started = match read_millis(&lock_path).await? {
            Some(started) => Some(started),
            None => modified_millis(&lock_path).await?,
        };
        if let Some(started) = started
            && !lock_is_live(started, self.now_ms)
        {
            trace!(path = %lock_path.display(), "removing abandoned refresh lock");
            remove_file_if_exists(&lock_path).await?;
            self.stats.locks_removed += 1;
        }
        Ok(())
    }

    async fn inspect_orphan_body(&mut self, entry_id: &str) -> Result<()> {
        let body_dir = self.layout.body_dir(entry_id);
        let Some(modified_ms) = modified_millis(&body_dir).await? else {
            return Ok(());
        };
        // a writer may still be streaming its first body for this key
        if !self.is_abandoned(modified_ms) {
            return Ok(());
        }
        let size = dir_size(&body_dir).await?;
        remove_dir_all_if_exists(&body_dir).await?;
        self.stats.bytes_reclaimed += size;
        self.stats.abandoned_removed += 1;
        Ok(())
    }

    async fn evict_over_budget(&mut self) -> Result<()> {
        let Some(limit) = self.max_size else {
            return Ok(());
        };
        let mut total: u64 = self.ledger.iter().map(|entry| entry.size).sum();
        if total <= limit {
            return Ok(());
        }
        self.ledger
            .sort_by(|a, b| b.committed_at_ms.cmp(&a.committed_at_ms));
        while total > limit {
            let Some(oldest) = self.ledger.pop() else {
                break;
            };
            self.remove_entry(&oldest.entry_id).await?;
            self.layout.prune_empty_shards(&oldest.entry_id).await;
            total = total.saturating_sub(oldest.size);
            self.stats.evicted += 1;
            self.stats.bytes_reclaimed += oldest.size;
        }
        Ok(())
    }

    async fn remove_entry(&self, entry_id: &str) -> Result<u64> {
        let meta_path = self.layout.meta_path(entry_id);
        let body_dir = self.layout.body_dir(entry_id);
        let meta_size = match async_fs::metadata(&meta_path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        let body_size = dir_size(&body_dir).await?;
        remove_file_if_exists(&meta_path).await?;
        remove_dir_all_if_exists(&body_dir).await?;
        Ok(meta_size + body_size)
    }
}

async fn list_shard_children(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut children = Vec::new();
    let mut entries = match async_fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(children),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let is_shard_name = name.len() == 2
            && name
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_hexdigit()));
        if !is_shard_name {
            continue;
        }
        match entry.file_type().await {
            Ok(file_type) if file_type.is_dir() => children.push(entry.path()),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(children)
}

async fn modified_millis(path: &Path) -> Result<Option<u64>> {
    match async_fs::metadata(path).await {
        Ok(meta) => Ok(Some(system_time_millis(meta.modified()?))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn prune_empty_dir_chain(shard: &Path, root: &Path) {
    let _ = async_fs::remove_dir(shard).await;
    if let Some(parent) = shard.parent()
        && parent != root
    {
        let _ = async_fs::remove_dir(parent).await;
    }
}
