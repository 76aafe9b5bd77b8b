use http::{HeaderMap, StatusCode};

use crate::proxy::http::cache_control::parse_cache_control;

/// Validity window and replay snapshot derived from one eligible origin response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub max_age_ms: u64,
    pub stale_while_revalidate_ms: Option<u64>,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Where a stored record sits relative to its policy at a given age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Servable, but a background refresh should be started.
    StaleRevalidate,
    Expired,
}

impl FreshnessPolicy {
    /// Returns `None` when the response must not be cached at all.
    pub fn from_response(status: StatusCode, headers: &HeaderMap) -> Option<Self> {
        if !matches!(
            status,
            StatusCode::OK | StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
        ) {
            return None;
        }

        let cc = parse_cache_control(headers);
        if cc.no_store || cc.private {
            return None;
        }
        let max_age = cc.freshness_lifetime()?;

        Some(Self {
            max_age_ms: duration_ms(max_age),
            stale_while_revalidate_ms: cc.stale_while_revalidate.map(duration_ms),
            status,
            headers: headers.clone(),
        })
    }

    /// Only resources with a non-empty stale window are ever committed.
    pub fn allows_stale_revalidate(&self) -> bool {
        self.stale_while_revalidate_ms
            .map(|window| window > 0)
            .unwrap_or(false)
    }

    pub fn classify(&self, age_ms: u64) -> Freshness {
        if age_ms < self.max_age_ms {
            return Freshness::Fresh;
        }
        match self.stale_while_revalidate_ms {
            Some(window) if age_ms < self.max_age_ms.saturating_add(window) => {
                Freshness::StaleRevalidate
            }
            _ => Freshness::Expired,
        }
    }
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
