use std::time::SystemTime;

use http::{HeaderMap, header};

use super::cache_control::request_forbids_conditional;

/// Decides whether a client's conditional request is satisfied by a response
/// carrying `response` headers, in which case a 304 can be sent instead.
pub fn is_not_modified(request: &HeaderMap, response: &HeaderMap) -> bool {
    let none_match = header_str(request, header::IF_NONE_MATCH);
    let modified_since = header_str(request, header::IF_MODIFIED_SINCE);
    if none_match.is_none() && modified_since.is_none() {
        return false;
    }
    if request_forbids_conditional(request) {
        return false;
    }

    if let Some(none_match) = none_match
        && none_match.trim() != "*"
    {
        let Some(etag) = header_str(response, header::ETAG) else {
            return false;
        };
        let matched = none_match
            .split(',')
            .map(str::trim)
            .any(|candidate| weak_eq(candidate, etag));
        if !matched {
            return false;
        }
    }

    if let Some(modified_since) = modified_since {
        let Some(last_modified) = header_date(response, header::LAST_MODIFIED) else {
            return false;
        };
        let Ok(since) = httpdate::parse_http_date(modified_since) else {
            return false;
        };
        if last_modified > since {
            return false;
        }
    }

    true
}

/// Removes the headers that describe a body a 304 does not carry.
pub fn strip_body_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_TYPE);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
}

fn weak_eq(a: &str, b: &str) -> bool {
    opaque_tag(a) == opaque_tag(b)
}

fn opaque_tag(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix("W/").unwrap_or(tag)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_date(headers: &HeaderMap, name: header::HeaderName) -> Option<SystemTime> {
    header_str(headers, name).and_then(|value| httpdate::parse_http_date(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    const LAST_MODIFIED: &str = "Wed, 21 Oct 2015 07:28:00 GMT";

    fn headers(pairs: &[(header::HeaderName, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn unconditional_requests_are_never_not_modified() {
        let response = headers(&[(header::ETAG, "\"abc\"")]);
        assert!(!is_not_modified(&HeaderMap::new(), &response));
    }

    #[test]
    fn if_modified_since_matches_equal_or_later_date() {
        let response = headers(&[(header::LAST_MODIFIED, LAST_MODIFIED)]);
        let same = headers(&[(header::IF_MODIFIED_SINCE, LAST_MODIFIED)]);
        assert!(is_not_modified(&same, &response));
        let later = headers(&[(header::IF_MODIFIED_SINCE, "Thu, 22 Oct 2015 07:28:00 GMT")]);
        assert!(is_not_modified(&later, &response));
        let earlier = headers(&[(header::IF_MODIFIED_SINCE, "Tue, 20 Oct 2015 07:28:00 GMT")]);
        assert!(!is_not_modified(&earlier, &response));
    }

    #[test]
    fn if_modified_since_needs_last_modified() {
        let request = headers(&[(header::IF_MODIFIED_SINCE, LAST_MODIFIED)]);
        assert!(!is_not_modified(&request, &HeaderMap::new()));
        let garbage = headers(&[(header::IF_MODIFIED_SINCE, "yesterday")]);
        let response = headers(&[(header::LAST_MODIFIED, LAST_MODIFIED)]);
        assert!(!is_not_modified(&garbage, &response));
    }

    #[test]
    fn if_none_match_uses_weak_comparison() {
        let response = headers(&[(header::ETAG, "W/\"v1\"")]);
        let request = headers(&[(header::IF_NONE_MATCH, "\"v0\", \"v1\"")]);
        assert!(is_not_modified(&request, &response));
        let other = headers(&[(header::IF_NONE_MATCH, "\"v2\"")]);
        assert!(!is_not_modified(&other, &response));
        let star = headers(&[(header::IF_NONE_MATCH, "*")]);
        assert!(is_not_modified(&star, &HeaderMap::new()));
    }

    #[test]
    fn both_validators_must_pass() {
        let response = headers(&[
            (header::ETAG, "\"v1\""),
            (header::LAST_MODIFIED, LAST_MODIFIED),
        ]);
        let request = headers(&[
            (header::IF_NONE_MATCH, "\"v1\""),
            (header::IF_MODIFIED_SINCE, "Tue, 20 Oct 2015 07:28:00 GMT"),
        ]);
        assert!(!is_not_modified(&request, &response));
    }

    #[test]
    fn request_no_cache_disables_conditionals() {
        let response = headers(&[(header::LAST_MODIFIED, LAST_MODIFIED)]);
        let request = headers(&[
            (header::IF_MODIFIED_SINCE, LAST_MODIFIED),
            (header::CACHE_CONTROL, "no-cache"),
        ]);
        assert!(!is_not_modified(&request, &response));
    }

    #[test]
    fn strips_framing_headers() {
        let mut response = headers(&[
            (header::CONTENT_TYPE, "text/plain"),
            (header::CONTENT_LENGTH, "3"),
            (header::ETAG, "\"v1\""),
        ]);
        strip_body_headers(&mut response);
        assert!(response.get(header::CONTENT_TYPE).is_none());
        assert!(response.get(header::CONTENT_LENGTH).is_none());
        assert!(response.get(header::ETAG).is_some());
    }
}
