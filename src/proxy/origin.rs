use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use http::{HeaderMap, Method, Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::debug;

use super::http::body::{self, ProxyBody};

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("timed out after {0:?} waiting for origin response")]
    Timeout(Duration),
    #[error("origin request failed")]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error("invalid origin request target '{0}'")]
    InvalidTarget(String),
}

impl OriginError {
    pub fn kind(&self) -> &'static str {
        match self {
            OriginError::Timeout(_) => "timeout",
            OriginError::Transport(_) => "transport",
            OriginError::InvalidTarget(_) => "invalid_target",
        }
    }
}

/// Sends requests to the origin. Resolves once response headers are
/// available; the body streams afterwards.
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn request(
        &self,
        method: Method,
        target: &str,
        headers: HeaderMap,
        body: ProxyBody,
    ) -> Result<Response<ProxyBody>, OriginError>;
}

/// Origin reached over HTTP or HTTPS through a pooled client.
pub struct HttpOrigin {
    base: String,
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    timeout: Duration,
}

impl HttpOrigin {
    pub fn new(origin: &Uri, timeout: Duration) -> Result<Self> {
        let scheme = origin
            .scheme_str()
            .context("origin URL must include a scheme")?;
        let authority = origin
            .authority()
            .context("origin URL must include a host")?;
        if scheme != "http" && scheme != "https" {
            bail!("unsupported origin scheme '{scheme}'");
        }
        let connector = build_connector(scheme == "https")?;
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self {
            base: format!("{scheme}://{authority}"),
            client,
            timeout,
        })
    }
}

fn build_connector(require_tls: bool) -> Result<HttpsConnector<HttpConnector>> {
    let builder = match HttpsConnectorBuilder::new().with_native_roots() {
        Ok(builder) => builder,
        Err(err) if !require_tls => {
            debug!(error = %err, "no native root certificates; origin is plain HTTP");
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth();
            HttpsConnectorBuilder::new().with_tls_config(config)
        }
        Err(err) => return Err(err).context("failed to load native root certificates"),
    };
    Ok(builder.https_or_http().enable_http1().build())
}

#[async_trait]
impl OriginFetcher for HttpOrigin {
    async fn request(
        &self,
        method: Method,
        target: &str,
        headers: HeaderMap,
        body: ProxyBody,
    ) -> Result<Response<ProxyBody>, OriginError> {
        let uri: Uri = format!("{}{}", self.base, target)
            .parse()
            .map_err(|_| OriginError::InvalidTarget(target.to_string()))?;
        let mut request = Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| OriginError::Timeout(self.timeout))??;
        let (parts, incoming) = response.into_parts();
        Ok(Response::from_parts(parts, body::incoming(incoming)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_scheme() {
        let uri: Uri = "ftp://example.com".parse().unwrap();
        let err = HttpOrigin::new(&uri, Duration::from_secs(1)).err().unwrap();
        assert!(err.to_string().contains("unsupported origin scheme"));
    }

    #[test]
    fn origin_error_kinds() {
        assert_eq!(OriginError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(
            OriginError::InvalidTarget("bad".into()).kind(),
            "invalid_target"
        );
    }
}
