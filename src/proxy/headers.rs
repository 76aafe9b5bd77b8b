use http::header::{self, HeaderMap, HeaderName, HeaderValue};

use super::cache::CacheKey;

pub static X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub static X_AGE: HeaderName = HeaderName::from_static("x-age");

/// Cache outcome reported to the client in `X-Cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Returns true for headers that only describe a single transport hop.
pub fn is_hop_by_hop(name: &str) -> bool {
    name.starts_with("proxy-")
        || matches!(
            name,
            "connection" | "keep-alive" | "transfer-encoding" | "te" | "trailer" | "upgrade"
        )
}

/// Drops hop-by-hop headers, including any named by a `Connection` header.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
}

/// Client request headers as forwarded on the pass-through path. The origin
/// client derives `Host` from the origin URL.
pub fn passthrough_request_headers(client: &HeaderMap) -> HeaderMap {
    let mut headers = client.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers
}

/// The only headers sent to the origin for cacheable requests: the
/// normalized `Accept-Encoding` the key was derived from, if any.
pub fn origin_request_headers(key: &CacheKey) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(encoding) = key.encoding() {
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static(encoding.as_str()),
        );
    }
    headers
}

/// Cleans an origin response on the cacheable path before it is relayed or
/// snapshotted for the cache.
pub fn sanitize_origin_response(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    headers.remove(header::SET_COOKIE);
    headers.remove(header::ACCEPT_RANGES);
}

/// Appends this proxy to `Via`, keeping whatever the origin already put there.
pub fn append_via(headers: &mut HeaderMap, via: &str) {
    let existing: Vec<&str> = headers
        .get_all(header::VIA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .collect();
    let combined = if existing.is_empty() {
        via.to_string()
    } else {
        format!("{}, {via}", existing.join(", "))
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(header::VIA, value);
    }
}

pub fn set_cache_status(headers: &mut HeaderMap, status: CacheStatus) {
    headers.insert(X_CACHE.clone(), HeaderValue::from_static(status.as_str()));
}

/// `X-Age: <seconds>` or `X-Age: <seconds> revalidate` for stale hits.
pub fn set_age(headers: &mut HeaderMap, age_ms: u64, revalidate: bool) {
    let seconds = age_ms / 1000;
    let value = if revalidate {
        format!("{seconds} revalidate")
    } else {
        seconds.to_string()
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_AGE.clone(), value);
    }
}
