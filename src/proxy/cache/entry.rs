use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use super::FreshnessPolicy;

/// Metadata artifact as written to disk. The rename of a fully written
/// instance onto `<digest>.meta` is what publishes a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct PersistedRecord {
    pub key: String,
    pub max_age_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_while_revalidate_ms: Option<u64>,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub committed_at_ms: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_size: u64,
}

impl PersistedRecord {
    pub(super) fn new(
        key: &str,
        policy: &FreshnessPolicy,
        committed_at_ms: u64,
        body: Option<String>,
        body_size: u64,
    ) -> Self {
        Self {
            key: key.to_string(),
            max_age_ms: policy.max_age_ms,
            stale_while_revalidate_ms: policy.stale_while_revalidate_ms,
            status: policy.status.as_u16(),
            headers: headermap_to_vec(&policy.headers),
            committed_at_ms,
            body,
            body_size,
        }
    }

    pub(super) fn policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            max_age_ms: self.max_age_ms,
            stale_while_revalidate_ms: self.stale_while_revalidate_ms,
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers: to_headermap(&self.headers),
        }
    }

    pub(super) fn expires_at_ms(&self) -> u64 {
        self.committed_at_ms.saturating_add(self.max_age_ms)
    }
}

pub(super) fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

pub(super) fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}
