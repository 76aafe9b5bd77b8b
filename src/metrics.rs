use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{debug, info};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Total requests by cache status");
    let vec = IntCounterVec::new(opts, &["cache_status"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_status_total", "Requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_status_total");
    vec
});

static REQUEST_METHOD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_method_total", "Requests by method");
    let vec = IntCounterVec::new(opts, &["method"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_method_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "request_duration_seconds",
        "Time until response headers by cache status",
    )
    .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["cache_status"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

static INFLIGHT_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge =
        IntGauge::new("inflight_requests", "Current inflight requests").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register inflight_requests");
    gauge
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_total", "Committed cache records")
        .expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_errors_total", "Failed cache commits")
        .expect("create cache_store_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_errors_total");
    counter
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_evictions_total", "Records evicted over the size budget")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_SWEEP_RUNS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_sweep_runs_total", "Cache sweep runs").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_runs_total");
    counter
});

static CACHE_SWEEP_SKIPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_sweep_skipped_total",
        "Cache sweeps skipped because another sweep ran recently",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_skipped_total");
    counter
});

static CACHE_SWEEP_EXPIRED_ENTRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_sweep_expired_entries_total",
        "Expired cache records removed by the sweeper",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_expired_entries_total");
    counter
});

static CACHE_SWEEP_BYTES_RECLAIMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "cache_sweep_bytes_reclaimed_total",
        "Bytes reclaimed by the cache sweeper",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_sweep_bytes_reclaimed_total");
    counter
});

static REVALIDATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("revalidations_total", "Background revalidations by result"),
        &["result"],
    )
    .expect("create revalidations_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register revalidations_total");
    vec
});

static ORIGIN_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("origin_errors_total", "Origin errors by kind"),
        &["kind"],
    )
    .expect("create origin_errors_total");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register origin_errors_total");
    vec
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn inc_inflight() {
    INFLIGHT_REQUESTS.inc();
}

pub fn dec_inflight() {
    INFLIGHT_REQUESTS.dec();
}

pub fn record_request(cache_status: &str, method: &str, status: StatusCode, elapsed: Duration) {
    let cache_status = if cache_status.is_empty() {
        "none"
    } else {
        cache_status
    };
    REQUESTS_TOTAL.with_label_values(&[cache_status]).inc();
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status.as_u16())])
        .inc();
    REQUEST_METHOD_TOTAL.with_label_values(&[method]).inc();
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[cache_status])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_cache_sweep(expired: u64, evicted: u64, bytes: u64) {
    CACHE_SWEEP_RUNS_TOTAL.inc();
    CACHE_SWEEP_EXPIRED_ENTRIES_TOTAL.inc_by(expired);
    CACHE_EVICTIONS_TOTAL.inc_by(evicted);
    CACHE_SWEEP_BYTES_RECLAIMED_TOTAL.inc_by(bytes);
}

pub fn record_cache_sweep_skipped() {
    CACHE_SWEEP_SKIPPED_TOTAL.inc();
}

pub fn record_revalidation(result: &str) {
    REVALIDATIONS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_origin_error(kind: &str) {
    ORIGIN_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

/// Serves the registry as `GET /metrics` on a dedicated plain-HTTP listener.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "metrics listener started");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            let service = service_fn(handle_request);
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(peer = %peer, error = %err, "metrics connection error");
            }
        });
    }
}

async fn handle_request(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(metrics_response(req.method(), req.uri().path()))
}

fn metrics_response(method: &Method, path: &str) -> Response<Full<Bytes>> {
    let mut response = if method == Method::GET && path == "/metrics" {
        let mut response = Response::new(Full::new(Bytes::from(gather())));
        if let Ok(value) = header::HeaderValue::from_str(TextEncoder::new().format_type()) {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        response
    } else {
        let mut response = Response::new(Full::new(Bytes::from_static(b"not found")));
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    };
    response
        .headers_mut()
        .insert(header::CONNECTION, header::HeaderValue::from_static("close"));
    response
}
