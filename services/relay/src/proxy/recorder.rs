//! Recording reader for replaying sniffed bytes.
//!
//! Sniffers read the client's first bytes through a [`RecordedStream`],
//! which keeps a copy of everything pulled off the wire. Once a backend is
//! connected the copy is written to it verbatim, so the backend observes
//! the same handshake or request the relay parsed.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// An [`AsyncRead`] adapter that remembers every byte read through it.
///
/// The buffer always equals the concatenation of all bytes returned by the
/// inner reader, no matter how many readers or parse attempts sit on top.
#[derive(Debug)]
pub struct RecordedStream<R> {
    inner: R,
    buffer: Vec<u8>,
}

impl<R> RecordedStream<R> {
    /// Wrap a byte source.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    /// Consume the recorder, returning the recorded bytes.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RecordedStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.buffer.extend_from_slice(&buf.filled()[before..]);
        }
        poll
    }
}
