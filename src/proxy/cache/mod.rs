use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use hyper::body::Body;
use tokio::fs as async_fs;
use tracing::{trace, warn};

mod entry;
mod key;
mod lock;
mod maintenance;
mod policy;
mod store;
mod writer;

use entry::PersistedRecord;
pub use key::{CacheKey, ContentEncoding, normalized_accept_encoding};
pub use lock::REFRESH_LOCK_TTL_MS;
pub use maintenance::SweepStats;
use maintenance::{Sweep, prepare_versioned_cache_dir, spawn_cache_dir_cleanup, spawn_cache_sweeper};
pub use policy::{Freshness, FreshnessPolicy};
use store::{DiskLayout, read_if_exists, remove_dir_all_if_exists, remove_file_if_exists};
use writer::{remove_sibling_artifacts, write_body_artifact};

use crate::proxy::http::body::BoxError;
use crate::util::unix_millis;

/// A published record as seen by one reader.
#[derive(Debug)]
pub struct CachedResponse {
    pub policy: FreshnessPolicy,
    pub committed_at_ms: u64,
    /// Open handle on the body artifact; `None` for bodyless records.
    pub body: Option<async_fs::File>,
    pub body_size: u64,
}

impl CachedResponse {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.committed_at_ms)
    }

    pub fn freshness(&self, now_ms: u64) -> Freshness {
        self.policy.classify(self.age_ms(now_ms))
    }
}

/// Filesystem-backed response cache. Readers never lock: every commit becomes
/// visible through a single rename of the metadata artifact.
#[derive(Clone, Debug)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    layout: DiskLayout,
    max_size: Option<u64>,
    cleanup_interval: Duration,
}

impl CacheStore {
    /// Opens (creating if needed) the cache under `root`. Directories left by
    /// other on-disk layout versions are removed in the background.
    pub async fn open(
        root: PathBuf,
        max_size: Option<u64>,
        cleanup_interval: Duration,
    ) -> Result<Self> {
        let (disk_dir, cleanup_dirs) = prepare_versioned_cache_dir(&root).await?;
        spawn_cache_dir_cleanup(cleanup_dirs);
        Ok(Self {
            inner: Arc::new(StoreInner {
                layout: DiskLayout::new(disk_dir),
                max_size,
                cleanup_interval,
            }),
        })
    }

    /// Starts the periodic cleanup sweep, running the first pass immediately.
    pub fn spawn_sweeper(&self) {
        spawn_cache_sweeper(self.clone(), self.inner.cleanup_interval);
    }

    pub fn disk_dir(&self) -> &std::path::Path {
        self.inner.layout.disk_dir()
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<CachedResponse>> {
        let layout = &self.inner.layout;
        let entry_id = key.entry_id();
        let meta_path = layout.meta_path(entry_id);
        let Some(data) = read_if_exists(&meta_path).await? else {
            crate::metrics::record_cache_lookup("absent");
            return Ok(None);
        };
        let record: PersistedRecord = match serde_json::from_slice(&data) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %meta_path.display(),
                    "failed to parse cache metadata"
                );
                crate::metrics::record_cache_lookup("corrupt");
                return Ok(None);
            }
        };
        if record.key != key.key_base() {
            trace!(expected = %key, actual = %record.key, "cache metadata key mismatch");
            crate::metrics::record_cache_lookup("absent");
            return Ok(None);
        }

        let body = match &record.body {
            Some(name) => {
                let path = layout.body_dir(entry_id).join(name);
                match async_fs::File::open(&path).await {
                    Ok(file) => Some(file),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        trace!(key = %key, "cache body vanished before it could be opened");
                        crate::metrics::record_cache_lookup("vanished");
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            None => None,
        };

        crate::metrics::record_cache_lookup("found");
        Ok(Some(CachedResponse {
            policy: record.policy(),
            committed_at_ms: record.committed_at_ms,
            body,
            body_size: record.body_size,
        }))
    }

    /// Commits `body` and `policy` as the record for `key`. The previous
    /// record, if any, stays visible until the final rename.
    pub async fn set<B>(&self, key: &CacheKey, body: Option<B>, policy: &FreshnessPolicy) -> Result<()>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Into<BoxError>,
    {
        let layout = &self.inner.layout;
        let entry_id = key.entry_id();
        let body_dir = layout.body_dir(entry_id);
        let artifact = match body {
            Some(body) => Some(write_body_artifact(&body_dir, body).await?),
            None => None,
        };

        let record = PersistedRecord::new(
            key.key_base(),
            policy,
            unix_millis(),
            artifact.as_ref().map(|artifact| artifact.name.clone()),
            artifact.as_ref().map(|artifact| artifact.size).unwrap_or(0),
        );
        let published = async {
            let data = serde_json::to_vec(&record)?;
            layout.publish(&layout.meta_path(entry_id), &data).await
        }
        .await;
        if let Err(err) = published {
            if let Some(artifact) = &artifact {
                let _ = remove_file_if_exists(&body_dir.join(&artifact.name)).await;
            }
            return Err(err);
        }

        if let Err(err) = lock::release(layout, entry_id).await {
            warn!(error = %err, key = %key, "failed to clear refresh lock");
        }
        let keep = artifact.as_ref().map(|artifact| artifact.name.as_str());
        if let Err(err) = remove_sibling_artifacts(&body_dir, keep).await {
            warn!(error = %err, key = %key, "failed to remove superseded cache bodies");
        }
        crate::metrics::record_cache_store();
        trace!(key = %key, "cache record committed");
        Ok(())
    }

    /// Removes the record and all body artifacts for `key`. Missing artifacts
    /// count as already removed.
    pub async fn delete(&self, key: &CacheKey) -> Result<()> {
        let layout = &self.inner.layout;
        let entry_id = key.entry_id();
        remove_file_if_exists(&layout.meta_path(entry_id)).await?;
        remove_dir_all_if_exists(&layout.body_dir(entry_id)).await?;
        lock::release(layout, entry_id).await?;
        layout.prune_empty_shards(entry_id).await;
        Ok(())
    }

    pub async fn start_refreshing(&self, key: &CacheKey) -> Result<()> {
        lock::acquire(&self.inner.layout, key.entry_id(), unix_millis()).await
    }

    pub async fn is_refreshing(&self, key: &CacheKey) -> Result<bool> {
        lock::is_locked(&self.inner.layout, key.entry_id(), unix_millis()).await
    }

    /// One cleanup pass, skipped when another store sharing this directory
    /// swept recently.
    pub async fn run_cleanup(&self) -> Result<SweepStats> {
        let min_gap = self.inner.cleanup_interval.mul_f64(0.9);
        self.run_cleanup_at(unix_millis(), min_gap).await
    }

    async fn run_cleanup_at(&self, now_ms: u64, min_gap: Duration) -> Result<SweepStats> {
        let sweep = Sweep::new(&self.inner.layout, self.inner.max_size, now_ms);
        if !sweep.claim(min_gap).await? {
            crate::metrics::record_cache_sweep_skipped();
            return Ok(SweepStats {
                skipped: true,
                ..SweepStats::default()
            });
        }
        let stats = sweep.run().await?;
        crate::metrics::record_cache_sweep(stats.expired, stats.evicted, stats.bytes_reclaimed);
        Ok(stats)
    }
}
