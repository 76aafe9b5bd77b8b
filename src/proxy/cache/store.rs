use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;

pub(super) const TEMP_PREFIX: &str = "tmp_";
pub(super) const META_EXTENSION: &str = "meta";
pub(super) const BODY_EXTENSION: &str = "body";
pub(super) const LOCK_EXTENSION: &str = "lock";
const CLEANUP_STAMP_NAME: &str = "last-cleanup";

/// Path layout of one versioned cache directory. Every key lives in a two
/// level shard derived from its digest:
///
/// ```text
/// <disk_dir>/ab/cd/<digest>.meta      published metadata
/// <disk_dir>/ab/cd/<digest>.body/...  randomly named body artifacts
/// <disk_dir>/ab/cd/<digest>.lock      refresh lock (decimal ms)
/// <disk_dir>/tmp_<uuid>               metadata being written
/// <disk_dir>/last-cleanup             shared sweep stamp (decimal ms)
/// ```
#[derive(Debug, Clone)]
pub(super) struct DiskLayout {
    disk_dir: PathBuf,
}

impl DiskLayout {
    pub(super) fn new(disk_dir: PathBuf) -> Self {
        Self { disk_dir }
    }

    pub(super) fn disk_dir(&self) -> &Path {
        &self.disk_dir
    }

    pub(super) fn shard_dir(&self, entry_id: &str) -> PathBuf {
        let (first, remainder) = entry_id.split_at(2);
        let (second, _) = remainder.split_at(2);
        self.disk_dir.join(first).join(second)
    }

    pub(super) fn meta_path(&self, entry_id: &str) -> PathBuf {
        self.shard_dir(entry_id)
            .join(format!("{entry_id}.{META_EXTENSION}"))
    }

    pub(super) fn body_dir(&self, entry_id: &str) -> PathBuf {
        self.shard_dir(entry_id)
            .join(format!("{entry_id}.{BODY_EXTENSION}"))
    }

    pub(super) fn lock_path(&self, entry_id: &str) -> PathBuf {
        self.shard_dir(entry_id)
            .join(format!("{entry_id}.{LOCK_EXTENSION}"))
    }

    pub(super) fn temp_path(&self) -> PathBuf {
        self.disk_dir
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub(super) fn cleanup_stamp_path(&self) -> PathBuf {
        self.disk_dir.join(CLEANUP_STAMP_NAME)
    }

    /// Writes `data` to a fresh temporary artifact and renames it onto `path`,
    /// so readers observe either the previous content or the new one.
    pub(super) async fn publish(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create cache shard {}", parent.display()))?;
        }
        let temp_path = self.temp_path();
        let written = async {
            let mut file = private_options()
                .open(&temp_path)
                .await
                .with_context(|| format!("failed to create {}", temp_path.display()))?;
            file.write_all(data).await?;
            file.flush().await?;
            async_fs::rename(&temp_path, path)
                .await
                .with_context(|| format!("failed to publish {}", path.display()))?;
            anyhow::Ok(())
        }
        .await;
        if written.is_err() {
            let _ = async_fs::remove_file(&temp_path).await;
        }
        written
    }

    pub(super) async fn prune_empty_shards(&self, entry_id: &str) {
        let shard2 = self.shard_dir(entry_id);
        if dir_is_empty(&shard2).await {
            let _ = async_fs::remove_dir(&shard2).await;
        }
        let shard1 = match shard2.parent() {
            Some(path) => path.to_path_buf(),
            None => return,
        };
        if shard1 == self.disk_dir {
            return;
        }
        if dir_is_empty(&shard1).await {
            let _ = async_fs::remove_dir(&shard1).await;
        }
    }
}

pub(super) fn private_options() -> async_fs::OpenOptions {
    let mut options = async_fs::OpenOptions::new();
    options.create_new(true).write(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    options
}

/// Reads a whole artifact; a missing file is reported as `None`.
pub(super) async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match async_fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Reads a decimal millisecond timestamp artifact. Missing or unparsable
/// content yields `None`.
pub(super) async fn read_millis(path: &Path) -> Result<Option<u64>> {
    Ok(read_if_exists(path)
        .await?
        .and_then(|data| String::from_utf8(data).ok())
        .and_then(|text| text.trim().parse::<u64>().ok()))
}

pub(super) async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match async_fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

pub(super) async fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match async_fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Total size of the regular files directly inside `dir`; a missing
/// directory counts as empty.
pub(super) async fn dir_size(dir: &Path) -> Result<u64> {
    let mut entries = match async_fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut total = 0u64;
    while let Some(entry) = entries.next_entry().await? {
        match entry.metadata().await {
            Ok(meta) if meta.is_file() => total = total.saturating_add(meta.len()),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(total)
}

pub(super) async fn dir_is_empty(path: &Path) -> bool {
    let mut entries = match async_fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    matches!(entries.next_entry().await, Ok(None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn layout_shards_by_digest_prefix() {
        let layout = DiskLayout::new(PathBuf::from("/cache/v1"));
        let id = "abcdef0123";
        assert_eq!(layout.shard_dir(id), PathBuf::from("/cache/v1/ab/cd"));
        assert_eq!(
            layout.meta_path(id),
            PathBuf::from("/cache/v1/ab/cd/abcdef0123.meta")
        );
        assert_eq!(
            layout.body_dir(id),
            PathBuf::from("/cache/v1/ab/cd/abcdef0123.body")
        );
        assert_eq!(
            layout.lock_path(id),
            PathBuf::from("/cache/v1/ab/cd/abcdef0123.lock")
        );
        let temp = layout.temp_path();
        let name = temp.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(TEMP_PREFIX));
        assert_ne!(temp, layout.temp_path());
    }

    #[tokio::test]
    async fn publish_replaces_content_and_leaves_no_temp() -> Result<()> {
        let dir = TempDir::new()?;
        let layout = DiskLayout::new(dir.path().to_path_buf());
        let target = layout.lock_path("0011aabb");
        layout.publish(&target, b"1").await?;
        layout.publish(&target, b"22").await?;
        assert_eq!(read_millis(&target).await?, Some(22));

        let mut entries = async_fs::read_dir(dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            assert!(!name.to_string_lossy().starts_with(TEMP_PREFIX));
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_artifacts_are_benign() -> Result<()> {
        let dir = TempDir::new()?;
        let missing = dir.path().join("nope");
        assert!(read_if_exists(&missing).await?.is_none());
        assert!(read_millis(&missing).await?.is_none());
        remove_file_if_exists(&missing).await?;
        remove_dir_all_if_exists(&missing).await?;
        assert_eq!(dir_size(&missing).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn garbage_timestamp_reads_as_absent() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("stamp");
        async_fs::write(&path, b"not-a-number").await?;
        assert!(read_millis(&path).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn prune_removes_empty_shards_only() -> Result<()> {
        let dir = TempDir::new()?;
        let layout = DiskLayout::new(dir.path().to_path_buf());
        let id = "aabbccdd";
        async_fs::create_dir_all(layout.shard_dir(id)).await?;
        layout.prune_empty_shards(id).await;
        assert!(!dir.path().join("aa").exists());
        assert!(dir.path().exists());
        Ok(())
    }
}
