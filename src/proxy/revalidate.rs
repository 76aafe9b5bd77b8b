use anyhow::Result;
use http::Method;
use tracing::{debug, warn};

use super::AppContext;
use super::cache::{CacheKey, FreshnessPolicy};
use super::headers::{origin_request_headers, sanitize_origin_response};
use super::http::body;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationOutcome {
    Refreshed,
    /// The origin stopped returning a stale-while-revalidate policy, so the
    /// record was removed.
    Dropped,
}

impl RevalidationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RevalidationOutcome::Refreshed => "refreshed",
            RevalidationOutcome::Dropped => "dropped",
        }
    }
}

/// Claims the refresh lock for `key` and starts a background revalidation,
/// unless one is already believed to be running. Returns whether a refresh
/// was started.
pub async fn trigger(app: &AppContext, method: &Method, target: &str, key: &CacheKey) -> Result<bool> {
    if app.store.is_refreshing(key).await? {
        debug!(key = %key, "revalidation already in flight");
        return Ok(false);
    }
    app.store.start_refreshing(key).await?;

    let app = app.clone();
    let method = method.clone();
    let target = target.to_string();
    let key = key.clone();
    tokio::spawn(async move {
        match revalidate(&app, method, &target, &key).await {
            Ok(outcome) => {
                crate::metrics::record_revalidation(outcome.as_str());
                debug!(key = %key, outcome = outcome.as_str(), "revalidation finished");
            }
            Err(err) => {
                // the stale record stays until it expires; the lock self-heals
                crate::metrics::record_revalidation("failed");
                warn!(key = %key, error = format!("{err:#}"), "revalidation failed");
            }
        }
    });
    Ok(true)
}

async fn revalidate(
    app: &AppContext,
    method: Method,
    target: &str,
    key: &CacheKey,
) -> Result<RevalidationOutcome> {
    let is_head = method == Method::HEAD;
    let response = app
        .origin
        .request(method, target, origin_request_headers(key), body::empty())
        .await?;
    let (mut head, origin_body) = response.into_parts();
    sanitize_origin_response(&mut head.headers);

    match FreshnessPolicy::from_response(head.status, &head.headers)
        .filter(FreshnessPolicy::allows_stale_revalidate)
    {
        Some(policy) => {
            let body = (!is_head).then_some(origin_body);
            app.store.set(key, body, &policy).await?;
            Ok(RevalidationOutcome::Refreshed)
        }
        None => {
            app.store.delete(key).await?;
            Ok(RevalidationOutcome::Dropped)
        }
    }
}
