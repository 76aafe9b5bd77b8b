use anyhow::Error;
use http::StatusCode;
use tracing::warn;

use super::origin::OriginError;

/// Normalized classification of request failures so every path maps them to
/// the same client response.
pub enum ForwardErrorKind<'a> {
    OriginTimeout(&'a OriginError),
    Origin(&'a OriginError),
    Other,
}

pub fn classify_forward_error(err: &Error) -> ForwardErrorKind<'_> {
    match err.downcast_ref::<OriginError>() {
        Some(origin @ OriginError::Timeout(_)) => ForwardErrorKind::OriginTimeout(origin),
        Some(origin) => ForwardErrorKind::Origin(origin),
        None => ForwardErrorKind::Other,
    }
}

pub struct ForwardErrorSpec {
    pub status: StatusCode,
    pub body: &'static str,
    pub reason: &'static str,
}

pub fn forward_error_spec(kind: &ForwardErrorKind<'_>) -> ForwardErrorSpec {
    match kind {
        ForwardErrorKind::OriginTimeout(_) => ForwardErrorSpec {
            status: StatusCode::GATEWAY_TIMEOUT,
            body: "origin request timed out",
            reason: "ORIGIN_TIMEOUT",
        },
        ForwardErrorKind::Origin(_) => ForwardErrorSpec {
            status: StatusCode::BAD_GATEWAY,
            body: "origin request failed",
            reason: "ORIGIN_ERROR",
        },
        ForwardErrorKind::Other => ForwardErrorSpec {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "internal proxy error",
            reason: "INTERNAL_ERROR",
        },
    }
}

pub fn log_forward_error(kind: &ForwardErrorKind<'_>, method: &str, target: &str, err: &Error) {
    match kind {
        ForwardErrorKind::OriginTimeout(origin) | ForwardErrorKind::Origin(origin) => {
            crate::metrics::record_origin_error(origin.kind());
            warn!(
                method,
                target,
                error = format!("{err:#}"),
                "origin request failed"
            );
        }
        ForwardErrorKind::Other => warn!(
            method,
            target,
            error = format!("{err:#}"),
            "request failed"
        ),
    }
}
