use std::time::Duration;

use http::HeaderMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub stale_while_revalidate: Option<Duration>,
}

impl CacheControl {
    /// Shared-cache freshness lifetime: `s-maxage` wins over `max-age`.
    pub fn freshness_lifetime(&self) -> Option<Duration> {
        self.s_maxage.or(self.max_age)
    }
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in headers.get_all(http::header::CACHE_CONTROL) {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for part in s.split(',') {
            let part = part.trim();
            let (name, argument) = match part.split_once('=') {
                Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
                None => (part, None),
            };
            if name.eq_ignore_ascii_case("private") {
                cc.private = true;
            } else if name.eq_ignore_ascii_case("no-cache") {
                cc.no_cache = true;
            } else if name.eq_ignore_ascii_case("no-store") {
                cc.no_store = true;
            } else if name.eq_ignore_ascii_case("max-age") {
                if let Some(secs) = parse_seconds(argument) {
                    cc.max_age = Some(secs);
                }
            } else if name.eq_ignore_ascii_case("s-maxage") {
                if let Some(secs) = parse_seconds(argument) {
                    cc.s_maxage = Some(secs);
                }
            } else if name.eq_ignore_ascii_case("stale-while-revalidate")
                && let Some(secs) = parse_seconds(argument)
            {
                cc.stale_while_revalidate = Some(secs);
            }
        }
    }
    cc
}

fn parse_seconds(argument: Option<&str>) -> Option<Duration> {
    argument
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// True when the client asked intermediaries not to answer from validators
/// alone (`Cache-Control: no-cache` on the request).
pub fn request_forbids_conditional(headers: &HeaderMap) -> bool {
    parse_cache_control(headers).no_cache
}
