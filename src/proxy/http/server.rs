use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::proxy::AppContext;
use crate::proxy::request_pipeline::handle_request;

/// Serves HTTP/1.1 on one client connection until it closes.
pub async fn handle_http(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let service = service_fn(move |request| {
        let app = app.clone();
        async move { Ok::<_, std::convert::Infallible>(handle_request(app, peer, request).await) }
    });
    http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service)
        .await
        .map_err(|err| anyhow!(err))
}
