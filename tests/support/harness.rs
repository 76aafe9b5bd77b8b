use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use swr_cache_proxy::{
    build_app,
    cli::LogFormat,
    proxy::{self, cache::CacheStore},
    settings::Settings,
};

use super::net::wait_for_listener;

pub fn default_test_settings(listen: SocketAddr, origin: &str, cache_dir: &Path) -> Settings {
    Settings {
        listen,
        origin: origin.to_string(),
        cache_dir: cache_dir.to_path_buf(),
        cache_max_size: None,
        cleanup_interval: 900,
        origin_timeout: 5,
        via: "swr-cache-proxy".to_string(),
        log: LogFormat::Text,
        metrics_listen: None,
    }
}

/// A proxy instance on an ephemeral port with its own cache directory.
pub struct ProxyHarness {
    _cache: TempDir,
    pub addr: SocketAddr,
    pub store: CacheStore,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn spawn(origin: &str) -> Result<Self> {
        Self::spawn_with(origin, |_| {}).await
    }

    pub async fn spawn_with<F>(origin: &str, configure: F) -> Result<Self>
    where
        F: FnOnce(&mut Settings),
    {
        let cache = TempDir::new()?;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let mut settings = default_test_settings(addr, origin, cache.path());
        configure(&mut settings);

        let app = build_app(settings).await?;
        let store = app.store.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = proxy::run_with_listener(listener, app).await {
                tracing::error!(error = ?err, "proxy run failed");
            }
        });
        wait_for_listener(addr).await?;

        Ok(Self {
            _cache: cache,
            addr,
            store,
            handle,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        self._cache.path()
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}
