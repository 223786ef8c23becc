use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::Duration;

use cdc_config::shared::BatchConfig;
use futures::{Future, Stream, ready};
use pin_project_lite::pin_project;
use tracing::info;

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};

pin_project! {
    /// A stream adapter that batches items based on size limits and timeouts.
    ///
    /// Items are collected from the underlying stream into batches, emitted
    /// when either the batch reaches its maximum size or the fill timeout
    /// elapses. Shutdown takes priority over both: the accumulated batch is
    /// flushed with a shutdown marker and the stream stops.
    #[must_use = "streams do nothing unless polled"]
    #[derive(Debug)]
    pub struct BatchStream<B, S: Stream<Item = B>> {
        #[pin]
        stream: S,
        #[pin]
        deadline: Option<tokio::time::Sleep>,
        shutdown_rx: ShutdownRx,
        items: Vec<S::Item>,
        batch_config: BatchConfig,
        reset_timer: bool,
        inner_stream_ended: bool,
        stream_stopped: bool,
    }
}

impl<B, S: Stream<Item = B>> BatchStream<B, S> {
    /// Creates a new [`BatchStream`] wrapping `stream`.
    pub fn wrap(stream: S, batch_config: BatchConfig, shutdown_rx: ShutdownRx) -> Self {
        BatchStream {
            stream,
            deadline: None,
            shutdown_rx,
            items: Vec::with_capacity(batch_config.max_size),
            batch_config,
            reset_timer: true,
            inner_stream_ended: false,
            stream_stopped: false,
        }
    }
}

impl<B, S: Stream<Item = B>> Stream for BatchStream<B, S> {
    type Item = ShutdownResult<Vec<S::Item>, Vec<S::Item>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.as_mut().project();

        // Fast path: the inner stream already ended, nothing more to emit.
        if *this.inner_stream_ended {
            return Poll::Ready(None);
        }

        loop {
            if *this.stream_stopped {
                return Poll::Ready(None);
            }

            // Shutdown handling takes priority over all other operations. The
            // accumulated items are returned with a shutdown marker, even when
            // empty, so consumers always observe that shutdown occurred.
            if this.shutdown_rx.has_changed().unwrap_or(false) {
                info!("stream stopped due to shutdown signal");

                *this.stream_stopped = true;
                this.shutdown_rx.mark_unchanged();

                return Poll::Ready(Some(ShutdownResult::Shutdown(std::mem::take(this.items))));
            }

            // Arm the fill timer when starting a new batch.
            if *this.reset_timer {
                this.deadline
                    .set(Some(tokio::time::sleep(Duration::from_millis(
                        this.batch_config.max_fill_ms,
                    ))));
                *this.reset_timer = false;
            }

            if this.items.is_empty() {
                this.items.reserve_exact(this.batch_config.max_size);
            }

            match this.stream.as_mut().poll_next(cx) {
                Poll::Pending => {
                    // No more items available right now; fall through to the
                    // timeout check below.
                    break;
                }
                Poll::Ready(Some(item)) => {
                    this.items.push(item);

                    // Size-based emission keeps throughput high on busy streams.
                    if this.items.len() >= this.batch_config.max_size {
                        *this.reset_timer = true;
                        return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
                    }
                }
                Poll::Ready(None) => {
                    // The underlying stream finished: return the final batch if
                    // one accumulated, otherwise signal completion.
                    let last = if this.items.is_empty() {
                        None
                    } else {
                        *this.reset_timer = true;
                        Some(ShutdownResult::Ok(std::mem::take(this.items)))
                    };

                    *this.inner_stream_ended = true;

                    return Poll::Ready(last);
                }
            }
        }

        // Time-based emission bounds latency on quiet streams.
        if !this.items.is_empty()
            && let Some(deadline) = this.deadline.as_pin_mut()
        {
            ready!(deadline.poll(cx));
            *this.reset_timer = true;

            return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use futures::StreamExt;
    use futures::future::poll_fn;

    fn batch_config(max_size: usize, max_fill_ms: u64) -> BatchConfig {
        BatchConfig {
            max_size,
            max_fill_ms,
        }
    }

    #[tokio::test]
    async fn emits_full_batches_by_size() {
        let (_tx, shutdown_rx) = create_shutdown_channel();
        let mut stream = Box::pin(BatchStream::wrap(
            futures::stream::iter(1..=5),
            batch_config(2, 10_000),
            shutdown_rx,
        ));

        assert_eq!(stream.next().await, Some(ShutdownResult::Ok(vec![1, 2])));
        assert_eq!(stream.next().await, Some(ShutdownResult::Ok(vec![3, 4])));
        // The trailing partial batch is flushed when the inner stream ends.
        assert_eq!(stream.next().await, Some(ShutdownResult::Ok(vec![5])));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn emits_partial_batch_on_timeout() {
        let (_tx, shutdown_rx) = create_shutdown_channel();
        let inner = futures::stream::iter(vec![1, 2]).chain(futures::stream::pending());
        let mut stream = Box::pin(BatchStream::wrap(inner, batch_config(10, 50), shutdown_rx));

        assert_eq!(stream.next().await, Some(ShutdownResult::Ok(vec![1, 2])));
    }

    #[tokio::test]
    async fn flushes_accumulated_items_on_shutdown() {
        let (tx, shutdown_rx) = create_shutdown_channel();
        let inner = futures::stream::iter(vec![1, 2]).chain(futures::stream::pending());
        let mut stream = Box::pin(BatchStream::wrap(
            inner,
            batch_config(10, 10_000),
            shutdown_rx,
        ));

        // First poll buffers the two available items and suspends waiting for
        // more.
        poll_fn(|cx| match stream.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Ready(()),
            _ => panic!("expected pending"),
        })
        .await;

        tx.shutdown().unwrap();

        assert_eq!(
            stream.next().await,
            Some(ShutdownResult::Shutdown(vec![1, 2]))
        );
        assert_eq!(stream.next().await, None);
    }
}
