use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub cache_status: Option<String>,
    pub revalidate: bool,
    pub elapsed_ms: u128,
    pub error_reason: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                client_ip: peer.ip(),
                client_port: peer.port(),
                method: String::new(),
                path: String::new(),
                status: 0,
                cache_status: None,
                revalidate: false,
                elapsed_ms: 0,
                error_reason: None,
                error_detail: None,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.event.path = path.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn cache_status(mut self, value: impl Into<String>) -> Self {
        self.event.cache_status = Some(value.into());
        self
    }

    pub fn revalidate(mut self, revalidate: bool) -> Self {
        self.event.revalidate = revalidate;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn error_reason(mut self, reason: impl Into<String>) -> Self {
        self.event.error_reason = Some(reason.into());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        client_ip,
        client_port,
        method,
        path,
        status,
        cache_status,
        revalidate,
        elapsed_ms,
        error_reason,
        error_detail,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let cache_status_field = cache_status.as_deref().unwrap_or("-");
    let error_reason_field = error_reason.as_deref();
    let error_detail_field = error_detail.as_deref();

    tracing::info!(
        target = "access_log",
        ts,
        client_ip = %client_ip,
        client_port,
        method,
        path,
        status,
        cache_status = cache_status_field,
        revalidate,
        elapsed_ms,
        error_reason = error_reason_field,
        error_detail = error_detail_field
    );

    crate::metrics::record_request(
        cache_status.as_deref().unwrap_or(""),
        &method,
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Duration::from_millis(u64::try_from(elapsed_ms).unwrap_or(u64::MAX)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct BufferWriter {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buf.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for BufferWriter {
        type Writer = BufferWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn strip_ansi(input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == '\x1b' && chars.peek() == Some(&'[') {
                chars.next();
                for next in chars.by_ref() {
                    if next == 'm' {
                        break;
                    }
                }
                continue;
            }
            out.push(ch);
        }
        out
    }

    fn capture(event: AccessLogEvent) -> String {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = BufferWriter {
            buf: buffer.clone(),
        };
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_target(false)
            .without_time()
            .compact()
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            log_access(event);
        });

        let output = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        strip_ansi(&output)
    }

    #[test]
    fn access_log_includes_cache_fields() {
        let peer: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        let event = AccessLogBuilder::new(peer)
            .method("GET")
            .path("/resource")
            .status(StatusCode::OK)
            .cache_status("HIT")
            .revalidate(true)
            .build();

        let output = capture(event);
        assert!(
            output.contains("cache_status=\"HIT\""),
            "missing cache_status in output: {output}"
        );
        assert!(
            output.contains("revalidate=true"),
            "missing revalidate in output: {output}"
        );
    }

    #[test]
    fn access_log_marks_requests_without_cache_status() {
        let peer: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        let event = AccessLogBuilder::new(peer)
            .method("GET")
            .path("/.well-known/liveness")
            .status(StatusCode::OK)
            .build();
        let output = capture(event);
        assert!(
            output.contains("cache_status=\"-\""),
            "missing placeholder in output: {output}"
        );
    }
}
