use http::{HeaderMap, Method, Uri, header};

use super::cache::CacheKey;

pub const LIVENESS_PATH: &str = "/.well-known/liveness";

/// What the proxy does with an inbound request before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestRoute {
    Liveness,
    /// Requests carrying credentials are refused outright.
    RejectAuthorization,
    PassThrough { target: String },
    Cacheable { target: String, key: CacheKey },
}

pub fn classify_request(method: &Method, uri: &Uri, headers: &HeaderMap) -> RequestRoute {
    let target = request_target(uri);
    if method == Method::GET && target == LIVENESS_PATH {
        return RequestRoute::Liveness;
    }
    if headers.contains_key(header::AUTHORIZATION) {
        return RequestRoute::RejectAuthorization;
    }
    if !is_cacheable_method(method) {
        return RequestRoute::PassThrough { target };
    }
    let key = CacheKey::for_request(method, &target, headers);
    RequestRoute::Cacheable { target, key }
}

pub fn is_cacheable_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Path and query of the request; absolute-form targets are reduced to
/// origin-form.
pub fn request_target(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .filter(|target| !target.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn uri(value: &str) -> Uri {
        value.parse().unwrap()
    }

    #[test]
    fn liveness_wins_over_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        let route = classify_request(&Method::GET, &uri(LIVENESS_PATH), &headers);
        assert_eq!(route, RequestRoute::Liveness);
    }

    #[test]
    fn authorization_is_rejected_for_every_method() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9v"));
        for method in [Method::GET, Method::POST, Method::OPTIONS] {
            let route = classify_request(&method, &uri("/count"), &headers);
            assert_eq!(route, RequestRoute::RejectAuthorization);
        }
    }

    #[test]
    fn unsafe_methods_pass_through() {
        let headers = HeaderMap::new();
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            let route = classify_request(&method, &uri("/count?x=1"), &headers);
            assert_eq!(
                route,
                RequestRoute::PassThrough {
                    target: "/count?x=1".to_string()
                }
            );
        }
    }

    #[test]
    fn cacheable_methods_get_a_key() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
        let route = classify_request(&Method::HEAD, &uri("/a?b=c"), &headers);
        let RequestRoute::Cacheable { target, key } = route else {
            panic!("expected cacheable route");
        };
        assert_eq!(target, "/a?b=c");
        assert_eq!(key.key_base(), "HEAD--/a?b=c--br");
    }

    #[test]
    fn absolute_form_is_reduced_to_path() {
        assert_eq!(request_target(&uri("http://example.com/x?y")), "/x?y");
        assert_eq!(request_target(&uri("http://example.com")), "/");
    }
}
