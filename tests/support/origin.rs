use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::Bytes;
use http::{Request, Response, StatusCode, header};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const SWR_CACHE_CONTROL: &str = "max-age=1, stale-while-revalidate=2";
pub const LONG_CACHE_CONTROL: &str = "max-age=60, stale-while-revalidate=60";
pub const LAST_MODIFIED: &str = "Wed, 21 Oct 2015 07:28:00 GMT";

/// In-process origin with a handful of fixed endpoints. Every endpoint counts
/// the requests it receives.
pub struct TestOrigin {
    addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    handle: JoinHandle<()>,
}

impl TestOrigin {
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let state = hits.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(respond(&state, request)) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        Ok(Self { addr, hits, handle })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

fn respond(
    hits: &Mutex<HashMap<String, usize>>,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let path = request.uri().path().to_string();
    let count = {
        let mut hits = hits.lock().unwrap();
        let entry = hits.entry(path.clone()).or_insert(0);
        let current = *entry;
        *entry += 1;
        current
    };

    let builder = Response::builder().header(header::CONTENT_TYPE, "text/plain");
    let response = match path.as_str() {
        "/hello" => builder.body(Full::from("hello")),
        "/count" => builder
            .header(header::CACHE_CONTROL, SWR_CACHE_CONTROL)
            .body(Full::from(count.to_string())),
        "/stale" => builder
            .header(header::CACHE_CONTROL, "max-age=1, stale-while-revalidate=10")
            .body(Full::from(count.to_string())),
        "/flip" if count == 0 => builder
            .header(header::CACHE_CONTROL, SWR_CACHE_CONTROL)
            .body(Full::from("v0")),
        "/flip" => builder
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::from("boom")),
        "/invalid" => builder
            .status(StatusCode::NOT_FOUND)
            .body(Full::from("not found")),
        "/ifmodified" => builder
            .header(header::CACHE_CONTROL, LONG_CACHE_CONTROL)
            .header(header::LAST_MODIFIED, LAST_MODIFIED)
            .body(Full::from("foo")),
        "/etag" => builder
            .header(header::CACHE_CONTROL, LONG_CACHE_CONTROL)
            .header(header::ETAG, "\"v1\"")
            .body(Full::from("tagged")),
        "/via" => builder
            .header(header::CACHE_CONTROL, LONG_CACHE_CONTROL)
            .header(header::VIA, "1.1 origin")
            .body(Full::from("via")),
        "/cookie" => builder
            .header(header::CACHE_CONTROL, LONG_CACHE_CONTROL)
            .header(header::SET_COOKIE, "session=abc")
            .body(Full::from("cookie")),
        "/maxage-only" => builder
            .header(header::CACHE_CONTROL, "max-age=60")
            .body(Full::from(count.to_string())),
        "/headers" => {
            let value = |name: header::HeaderName| {
                request
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-")
                    .to_string()
            };
            let body = format!(
                "ae={};ua={};cookie={}",
                value(header::ACCEPT_ENCODING),
                value(header::USER_AGENT),
                value(header::COOKIE)
            );
            builder
                .header(header::CACHE_CONTROL, LONG_CACHE_CONTROL)
                .body(Full::from(body))
        }
        _ => builder
            .status(StatusCode::NOT_FOUND)
            .body(Full::from("not found")),
    };
    response.unwrap_or_else(|_| Response::new(Full::from("origin error")))
}
