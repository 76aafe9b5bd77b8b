pub mod cli;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::{
    proxy::{cache::CacheStore, origin::HttpOrigin},
    settings::Settings,
};

pub async fn run(settings: Settings) -> Result<()> {
    let app = build_app(settings).await?;
    if let Some(addr) = app.settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }
    app.store.spawn_sweeper();
    proxy::run(app).await
}

/// Opens the cache and the origin client described by `settings`.
pub async fn build_app(settings: Settings) -> Result<proxy::AppContext> {
    let settings = Arc::new(settings);
    let store = CacheStore::open(
        settings.cache_dir.clone(),
        settings.cache_max_size,
        settings.cleanup_interval(),
    )
    .await
    .with_context(|| format!("failed to open cache at {}", settings.cache_dir.display()))?;
    let origin_uri = settings.origin_uri()?;
    let origin = HttpOrigin::new(&origin_uri, settings.origin_timeout())
        .with_context(|| format!("failed to set up origin client for {}", settings.origin))?;
    Ok(proxy::AppContext::new(settings, store, Arc::new(origin)))
}
