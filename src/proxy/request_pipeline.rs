use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode, header, request};
use hyper::body::{Body, Incoming};
use tracing::{debug, warn};

use super::AppContext;
use super::cache::{CacheKey, CacheStore, CachedResponse, Freshness, FreshnessPolicy};
use super::forward_error::{classify_forward_error, forward_error_spec, log_forward_error};
use super::headers::{
    CacheStatus, append_via, origin_request_headers, passthrough_request_headers,
    sanitize_origin_response, set_age, set_cache_status, strip_hop_by_hop,
};
use super::http::body::{self, BoxError, ProxyBody};
use super::http::conditional::{is_not_modified, strip_body_headers};
use super::request::{RequestRoute, classify_request};
use super::revalidate;
use crate::logging::AccessLogBuilder;
use crate::util::unix_millis;

/// A response on its way out together with what the access log needs.
struct Served {
    response: Response<ProxyBody>,
    cache_status: Option<CacheStatus>,
    revalidate: bool,
}

impl Served {
    fn new(response: Response<ProxyBody>, cache_status: Option<CacheStatus>) -> Self {
        Self {
            response,
            cache_status,
            revalidate: false,
        }
    }
}

struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        crate::metrics::inc_inflight();
        Self
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        crate::metrics::dec_inflight();
    }
}

/// Entry point for every inbound request. Never fails: errors become the
/// matching error response.
pub async fn handle_request(
    app: AppContext,
    peer: SocketAddr,
    request: Request<Incoming>,
) -> Response<ProxyBody> {
    let _inflight = InflightGuard::new();
    let started = Instant::now();
    let (parts, incoming) = request.into_parts();
    let route = classify_request(&parts.method, &parts.uri, &parts.headers);
    let mut log = AccessLogBuilder::new(peer)
        .method(parts.method.as_str())
        .path(super::request::request_target(&parts.uri));

    let result = match route {
        RequestRoute::Liveness => Ok(Served::new(text_response(StatusCode::OK, "OK"), None)),
        RequestRoute::RejectAuthorization => {
            log = log.error_reason("AUTHORIZATION_NOT_ALLOWED");
            Ok(Served::new(
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "authorization header not allowed",
                ),
                None,
            ))
        }
        RequestRoute::PassThrough { target } => {
            pass_through(&app, &parts, &target, incoming).await
        }
        RequestRoute::Cacheable { target, key } => {
            serve_cacheable(&app, &parts, &target, key).await
        }
    };

    let mut served = match result {
        Ok(served) => served,
        Err(err) => {
            let kind = classify_forward_error(&err);
            let spec = forward_error_spec(&kind);
            let target = super::request::request_target(&parts.uri);
            log_forward_error(&kind, parts.method.as_str(), &target, &err);
            log = log
                .error_reason(spec.reason)
                .error_detail(format!("{err:#}"));
            Served::new(text_response(spec.status, spec.body), None)
        }
    };

    append_via(served.response.headers_mut(), &app.settings.via);
    if let Some(status) = served.cache_status {
        log = log.cache_status(status.as_str());
    }
    log.status(served.response.status())
        .revalidate(served.revalidate)
        .elapsed(started.elapsed())
        .log();
    served.response
}

/// Forwards a request whose method is never cached. Only hop-by-hop headers
/// are touched in either direction.
async fn pass_through(
    app: &AppContext,
    parts: &request::Parts,
    target: &str,
    incoming: Incoming,
) -> Result<Served> {
    let response = app
        .origin
        .request(
            parts.method.clone(),
            target,
            passthrough_request_headers(&parts.headers),
            body::incoming(incoming),
        )
        .await?;
    let (mut head, origin_body) = response.into_parts();
    strip_hop_by_hop(&mut head.headers);
    set_cache_status(&mut head.headers, CacheStatus::Bypass);
    Ok(Served::new(
        Response::from_parts(head, origin_body),
        Some(CacheStatus::Bypass),
    ))
}

async fn serve_cacheable(
    app: &AppContext,
    parts: &request::Parts,
    target: &str,
    key: CacheKey,
) -> Result<Served> {
    let cached = app
        .store
        .get(&key)
        .await
        .with_context(|| format!("cache lookup failed for {key}"))?;
    if let Some(cached) = cached {
        let now = unix_millis();
        match cached.freshness(now) {
            Freshness::Fresh => {
                return Ok(serve_cached(cached, now, false, &parts.headers));
            }
            Freshness::StaleRevalidate => {
                revalidate::trigger(app, &parts.method, target, &key)
                    .await
                    .with_context(|| format!("failed to schedule revalidation for {key}"))?;
                return Ok(serve_cached(cached, now, true, &parts.headers));
            }
            Freshness::Expired => {
                debug!(key = %key, "cache record expired; fetching synchronously");
            }
        }
    }
    fetch_live(app, parts, target, key).await
}

fn serve_cached(
    cached: CachedResponse,
    now_ms: u64,
    revalidate: bool,
    request_headers: &HeaderMap,
) -> Served {
    let age_ms = cached.age_ms(now_ms);
    let CachedResponse {
        policy,
        body: file,
        body_size,
        ..
    } = cached;
    let FreshnessPolicy {
        status,
        mut headers,
        ..
    } = policy;
    set_cache_status(&mut headers, CacheStatus::Hit);
    set_age(&mut headers, age_ms, revalidate);

    let body = match file {
        Some(file) => body::file(file, body_size),
        None => body::empty(),
    };
    let mut served = Served::new(
        build_response(status, headers, body, request_headers),
        Some(CacheStatus::Hit),
    );
    served.revalidate = revalidate;
    served
}

/// Fetches from the origin before answering. Responses with a
/// stale-while-revalidate window are committed in the background; everything
/// else is relayed without touching the cache.
async fn fetch_live(
    app: &AppContext,
    parts: &request::Parts,
    target: &str,
    key: CacheKey,
) -> Result<Served> {
    let response = app
        .origin
        .request(
            parts.method.clone(),
            target,
            origin_request_headers(&key),
            body::empty(),
        )
        .await?;
    let (mut head, origin_body) = response.into_parts();
    sanitize_origin_response(&mut head.headers);

    let policy = FreshnessPolicy::from_response(head.status, &head.headers)
        .filter(FreshnessPolicy::allows_stale_revalidate);
    let Some(policy) = policy else {
        set_cache_status(&mut head.headers, CacheStatus::Bypass);
        let response = build_response(head.status, head.headers, origin_body, &parts.headers);
        return Ok(Served::new(response, Some(CacheStatus::Bypass)));
    };

    let not_modified = is_not_modified(&parts.headers, &head.headers);
    let client_body = if parts.method == Method::HEAD {
        spawn_commit(app.store.clone(), key, None::<ProxyBody>, policy);
        origin_body
    } else if not_modified {
        // the client gets no body, so the cache writer reads the origin directly
        spawn_commit(app.store.clone(), key, Some(origin_body), policy);
        body::empty()
    } else {
        let (client, feed) = body::tee(origin_body);
        spawn_commit(app.store.clone(), key, Some(feed), policy);
        client
    };

    set_cache_status(&mut head.headers, CacheStatus::Miss);
    let response = build_response(head.status, head.headers, client_body, &parts.headers);
    Ok(Served::new(response, Some(CacheStatus::Miss)))
}

fn spawn_commit<B>(store: CacheStore, key: CacheKey, body: Option<B>, policy: FreshnessPolicy)
where
    B: Body<Data = Bytes> + Unpin + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    tokio::spawn(async move {
        if let Err(err) = store.set(&key, body, &policy).await {
            crate::metrics::record_cache_store_error();
            warn!(key = %key, error = format!("{err:#}"), "failed to commit cache record");
        }
    });
}

/// Assembles the client response, answering 304 when the client's
/// validators still match.
fn build_response(
    status: StatusCode,
    mut headers: HeaderMap,
    body: ProxyBody,
    request_headers: &HeaderMap,
) -> Response<ProxyBody> {
    let (status, body) = if is_not_modified(request_headers, &headers) {
        strip_body_headers(&mut headers);
        (StatusCode::NOT_MODIFIED, body::empty())
    } else {
        (status, body)
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn text_response(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(body::full(text));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
