use std::{
    cmp, io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_core::stream::{LocalBoxStream, Stream};

use crate::error::Error;

/// Buffered window over the raw body stream.
///
/// Chunks are appended as the stream yields them and split off as the scanner
/// consumes them, so the window size tracks the underlying chunk and line
/// lengths rather than the overall body size.
pub(crate) struct StreamBuffer {
    stream: LocalBoxStream<'static, io::Result<Bytes>>,
    pub(crate) buf: BytesMut,
    /// EOF flag. If true, no more stream reads will be attempted.
    pub(crate) eof: bool,
}

impl StreamBuffer {
    pub(crate) fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + 'static,
    {
        StreamBuffer {
            stream: Box::pin(stream),
            buf: BytesMut::with_capacity(1_024),
            eof: false,
        }
    }

    /// Polls the underlying stream until it is pending or exhausted, moving
    /// everything it yielded into the window.
    pub(crate) fn poll_stream(&mut self, cx: &mut Context<'_>) -> Result<(), Error> {
        loop {
            match Pin::new(&mut self.stream).poll_next(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    self.buf.extend_from_slice(&data);
                    continue;
                }
                Poll::Ready(Some(Err(err))) => return Err(err.into()),
                Poll::Ready(None) => {
                    self.eof = true;
                    return Ok(());
                }
                Poll::Pending => return Ok(()),
            }
        }
    }

    /// Takes up to `size` buffered bytes.
    ///
    /// Returns:
    ///
    /// - `Ok(Some(bytes))` - window was non-empty
    /// - `Ok(None)` - window is empty but the stream may still produce data
    /// - `Err(MalformedBody)` - window is empty and the stream has ended
    pub(crate) fn read_max(&mut self, size: u64) -> Result<Option<Bytes>, Error> {
        if !self.buf.is_empty() {
            let size = cmp::min(self.buf.len() as u64, size) as usize;
            Ok(Some(self.buf.split_to(size).freeze()))
        } else if self.eof {
            Err(Error::MalformedBody)
        } else {
            Ok(None)
        }
    }

    /// Reads until the specified ending.
    ///
    /// Returns:
    ///
    /// - `Ok(Some(chunk))` - `needle` is found, with chunk ending after needle
    /// - `Ok(None)` - `needle` is not yet found
    /// - `Err(MalformedBody)` - `needle` is not found and we're at EOF
    pub(crate) fn read_until(&mut self, needle: &[u8]) -> Result<Option<Bytes>, Error> {
        match memchr::memmem::find(&self.buf, needle) {
            None if self.eof => Err(Error::MalformedBody),
            None => Ok(None),
            Some(idx) => Ok(Some(self.buf.split_to(idx + needle.len()).freeze())),
        }
    }

    /// Reads bytes until the new line delimiter (`\n`, `0x0A`).
    #[inline]
    pub(crate) fn readline(&mut self) -> Result<Option<Bytes>, Error> {
        self.read_until(b"\n")
    }

    /// Reads bytes until the new line delimiter or until EOF.
    #[inline]
    pub(crate) fn readline_or_eof(&mut self) -> Result<Option<Bytes>, Error> {
        match self.readline() {
            Err(Error::MalformedBody) if self.eof => Ok(Some(self.buf.split().freeze())),
            line => line,
        }
    }
}
