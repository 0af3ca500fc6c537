//! Sample-aligned audio buffering
//!
//! Providers stream PCM in arbitrarily sized network chunks, so a chunk may
//! end halfway through a 16-bit sample. [`ChunkBuffer`] re-frames a provider
//! stream so that playback can start on the very first bytes while every
//! frame stays aligned to whole samples.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures::stream::BoxStream;

use crate::Result;

/// Default target frame size (16 KiB)
pub const DEFAULT_FRAME_BYTES: usize = 16 * 1024;

/// Bytes per 16-bit PCM sample
const SAMPLE_BYTES: usize = 2;

/// Round `n` down to a whole number of samples
const fn align_down(n: usize) -> usize {
    n - n % SAMPLE_BYTES
}

/// Re-frames an audio byte stream into sample-aligned frames
///
/// - the first frame is emitted as soon as one whole sample is buffered
/// - later frames are coalesced to `frame_bytes`
/// - at end of stream the remainder is emitted, minus a trailing odd byte
pub struct ChunkBuffer<S> {
    inner: S,
    buffer: BytesMut,
    frame_bytes: usize,
    first_sent: bool,
    finished: bool,
    bytes_in: usize,
    bytes_out: usize,
}

impl<S> ChunkBuffer<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    /// Wrap a stream with the default frame size
    pub fn new(inner: S) -> Self {
        Self::with_frame_bytes(inner, DEFAULT_FRAME_BYTES)
    }

    /// Wrap a stream with a custom frame size
    ///
    /// Odd sizes are rounded down; the minimum is one sample.
    pub fn with_frame_bytes(inner: S, frame_bytes: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            frame_bytes: align_down(frame_bytes).max(SAMPLE_BYTES),
            first_sent: false,
            finished: false,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Target frame size in bytes
    pub const fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Total bytes received from the inner stream so far
    pub const fn bytes_in(&self) -> usize {
        self.bytes_in
    }

    /// Total bytes emitted so far
    pub const fn bytes_out(&self) -> usize {
        self.bytes_out
    }

    /// Type-erase into a boxed stream
    pub fn boxed(self) -> BoxStream<'static, Result<Bytes>>
    where
        S: Send + 'static,
    {
        Box::pin(self)
    }

    /// Take the next ready frame without polling the inner stream
    fn ready_frame(&mut self) -> Option<Bytes> {
        let take = if self.first_sent {
            if self.buffer.len() < self.frame_bytes {
                return None;
            }
            self.frame_bytes
        } else {
            let aligned = align_down(self.buffer.len());
            if aligned == 0 {
                return None;
            }
            aligned
        };

        self.first_sent = true;
        Some(self.split(take))
    }

    /// Drain what is left once the inner stream has ended
    fn final_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() % SAMPLE_BYTES != 0 {
            tracing::warn!(
                remaining = self.buffer.len(),
                "dropping trailing odd byte to keep 16-bit alignment"
            );
            self.buffer.truncate(align_down(self.buffer.len()));
        }
        if self.buffer.is_empty() {
            return None;
        }
        let len = self.buffer.len();
        Some(self.split(len))
    }

    fn split(&mut self, len: usize) -> Bytes {
        self.bytes_out += len;
        self.buffer.split_to(len).freeze()
    }
}

impl<S> Stream for ChunkBuffer<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(frame) = this.ready_frame() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.finished {
                return Poll::Ready(this.final_frame().map(Ok));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.bytes_in += chunk.len();
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    this.finished = true;
                    tracing::trace!(
                        bytes_in = this.bytes_in,
                        bytes_out = this.bytes_out,
                        "audio stream finished"
                    );
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
