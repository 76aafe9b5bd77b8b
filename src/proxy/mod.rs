pub mod cache;
pub mod forward_error;
pub mod headers;
pub mod http;
pub mod listener;
pub mod origin;
pub mod request;
pub mod request_pipeline;
pub mod revalidate;

use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::settings::Settings;
use cache::CacheStore;
use origin::OriginFetcher;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub store: CacheStore,
    pub origin: Arc<dyn OriginFetcher>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, store: CacheStore, origin: Arc<dyn OriginFetcher>) -> Self {
        Self {
            settings,
            store,
            origin,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}

/// Runs the proxy on a listener the caller already bound.
pub async fn run_with_listener(listener: TcpListener, app: AppContext) -> Result<()> {
    listener::serve(listener, app).await
}
