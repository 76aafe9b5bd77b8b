use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{trace, warn};

use super::store::{private_options, remove_file_if_exists};
use crate::proxy::http::body::BoxError;

/// A fully written body artifact inside a key's body area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct BodyArtifact {
    pub name: String,
    pub size: u64,
}

/// Streams `body` into a freshly named artifact under `body_dir`. The artifact
/// is removed again when the stream fails, so a failed write leaves nothing
/// for readers to reference.
pub(super) async fn write_body_artifact<B>(body_dir: &Path, mut body: B) -> Result<BodyArtifact>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    async_fs::create_dir_all(body_dir)
        .await
        .with_context(|| format!("failed to create body area {}", body_dir.display()))?;
    let name = uuid::Uuid::new_v4().to_string();
    let path = body_dir.join(&name);
    let mut file = private_options()
        .open(&path)
        .await
        .with_context(|| format!("failed to create body artifact {}", path.display()))?;

    let streamed = async {
        let mut size = 0u64;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|err| {
                let err: BoxError = err.into();
                anyhow!("cache body stream failed: {err}")
            })?;
            if let Ok(data) = frame.into_data() {
                file.write_all(&data).await?;
                size += data.len() as u64;
            }
        }
        file.flush().await?;
        anyhow::Ok(size)
    }
    .await;

    match streamed {
        Ok(size) => {
            trace!(path = %path.display(), size, "body artifact written");
            Ok(BodyArtifact { name, size })
        }
        Err(err) => {
            drop(file);
            if let Err(remove_err) = remove_file_if_exists(&path).await {
                warn!(error = %remove_err, "failed to remove incomplete body artifact");
            }
            Err(err)
        }
    }
}

/// Removes every artifact in `body_dir` except `keep`. Artifacts that vanish
/// concurrently are ignored.
pub(super) async fn remove_sibling_artifacts(body_dir: &Path, keep: Option<&str>) -> Result<()> {
    let mut entries = match async_fs::read_dir(body_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if keep.is_some_and(|keep| name.to_str() == Some(keep)) {
            continue;
        }
        remove_file_if_exists(&entry.path()).await?;
    }
    Ok(())
}
