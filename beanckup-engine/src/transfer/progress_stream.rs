//! Progress-tracking stream wrapper for streamed file copies.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Callback receiving the bytes moved since its previous invocation
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Stream wrapper that counts bytes and reports them in throttled batches
pub struct ProgressStream<S> {
    inner: S,
    bytes_transferred: u64,
    bytes_reported: u64,
    last_update: Instant,
    update_interval: Duration,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    /// Create a new progress stream
    pub fn new(inner: S, callback: ProgressCallback) -> Self {
        Self::with_interval(inner, callback, Duration::from_millis(100))
    }

    pub fn with_interval(inner: S, callback: ProgressCallback, update_interval: Duration) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
            bytes_reported: 0,
            last_update: Instant::now(),
            update_interval,
            callback,
        }
    }

    /// Get total bytes transferred
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    fn report(&mut self) {
        let delta = self.bytes_transferred - self.bytes_reported;
        if delta > 0 {
            (self.callback)(delta);
            self.bytes_reported = self.bytes_transferred;
        }
        self.last_update = Instant::now();
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.bytes_transferred += bytes.len() as u64;

                if self.last_update.elapsed() >= self.update_interval {
                    self.report();
                }

                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Bytes already streamed still count toward the task total.
                self.report();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.report();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
