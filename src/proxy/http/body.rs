use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Empty, Full, combinators::UnsyncBoxBody};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio_util::io::poll_read_buf;
use tracing::trace;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on every edge of the proxy: client responses, origin
/// requests and origin responses.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const FILE_CHUNK_SIZE: usize = 16 * 1024;

/// Frames the cache side of a [`tee`] may lag behind the client before the
/// cache copy is abandoned.
pub const FEED_CAPACITY: usize = 256;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn incoming(body: Incoming) -> ProxyBody {
    body.map_err(BoxError::from).boxed_unsync()
}

/// Streams a cached body artifact of a known size.
pub fn file(file: File, size: u64) -> ProxyBody {
    FileBody {
        file,
        buf: BytesMut::new(),
        remaining: size,
        done: false,
    }
    .map_err(BoxError::from)
    .boxed_unsync()
}

struct FileBody {
    file: File,
    buf: BytesMut,
    remaining: u64,
    done: bool,
}

impl Body for FileBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        this.buf.reserve(FILE_CHUNK_SIZE);
        match ready!(poll_read_buf(Pin::new(&mut this.file), cx, &mut this.buf)) {
            Ok(0) => {
                this.done = true;
                Poll::Ready(None)
            }
            Ok(read) => {
                this.remaining = this.remaining.saturating_sub(read as u64);
                Poll::Ready(Some(Ok(Frame::data(this.buf.split().freeze()))))
            }
            Err(err) => {
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> SizeHint {
        if self.done {
            SizeHint::with_exact(0)
        } else {
            SizeHint::with_exact(self.remaining)
        }
    }
}

enum FeedMessage {
    Data(Bytes),
    End,
}

/// Splits an origin body into one stream for the client and a [`CacheFeed`]
/// carrying the same bytes to the cache writer. The client never waits for
/// the cache writer: once the writer falls [`FEED_CAPACITY`] frames behind,
/// the feed is cut and ends with an error. If the client goes away early the
/// rest of the origin body is still drained into the feed.
pub fn tee(body: ProxyBody) -> (ProxyBody, CacheFeed) {
    let (tx, rx) = mpsc::channel(FEED_CAPACITY);
    let client = TeeBody {
        inner: Some(body),
        feed: Some(tx),
    };
    (client.boxed_unsync(), CacheFeed { rx, finished: false })
}

struct TeeBody {
    inner: Option<ProxyBody>,
    feed: Option<mpsc::Sender<FeedMessage>>,
}

impl Body for TeeBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match ready!(Pin::new(inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref()
                    && let Some(feed) = &this.feed
                    && let Err(err) = feed.try_send(FeedMessage::Data(data.clone()))
                {
                    if matches!(err, mpsc::error::TrySendError::Full(_)) {
                        trace!("cache writer fell behind; abandoning cache copy");
                    }
                    this.feed = None;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                // dropping the sender tells the cache writer the body is incomplete
                this.feed = None;
                this.inner = None;
                Poll::Ready(Some(Err(err)))
            }
            None => {
                if let Some(feed) = this.feed.take() {
                    let _ = feed.try_send(FeedMessage::End);
                }
                this.inner = None;
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        // the End message is only sent once the inner body reports None
        match (&self.inner, &self.feed) {
            (None, _) => true,
            (Some(_), Some(_)) => false,
            (Some(inner), None) => inner.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        self.inner
            .as_ref()
            .map(|inner| inner.size_hint())
            .unwrap_or_else(|| SizeHint::with_exact(0))
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        let (Some(inner), Some(feed)) = (self.inner.take(), self.feed.take()) else {
            return;
        };
        if feed.is_closed() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            trace!("client left early; draining origin body into cache");
            handle.spawn(drain_into_feed(inner, feed));
        }
    }
}

async fn drain_into_feed(mut body: ProxyBody, feed: mpsc::Sender<FeedMessage>) {
    while let Some(frame) = body.frame().await {
        let Ok(frame) = frame else {
            return;
        };
        if let Ok(data) = frame.into_data()
            && feed.send(FeedMessage::Data(data)).await.is_err()
        {
            return;
        }
    }
    let _ = feed.send(FeedMessage::End).await;
}

/// Receiving half of [`tee`]. Ends with an error when the origin body did not
/// complete, so a truncated body is never committed.
pub struct CacheFeed {
    rx: mpsc::Receiver<FeedMessage>,
    finished: bool,
}

impl Body for CacheFeed {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match ready!(this.rx.poll_recv(cx)) {
            Some(FeedMessage::Data(data)) => Poll::Ready(Some(Ok(Frame::data(data)))),
            Some(FeedMessage::End) => {
                this.finished = true;
                Poll::Ready(None)
            }
            None => {
                this.finished = true;
                Poll::Ready(Some(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "origin body ended before completion",
                ))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }
}
