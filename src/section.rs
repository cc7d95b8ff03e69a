use std::{
    cmp, fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_core::stream::Stream;
use futures_util::TryStreamExt as _;
use http::header::{HeaderMap, CONTENT_TYPE};
use mime::Mime;

use crate::{error::Error, scanner::Scanner};

/// A single section of a multipart stream.
///
/// Sections are transient and single-pass: the body can only be read forward,
/// and the value borrows the scanner, so it must be dropped before the next
/// section can be requested. Whatever is left unread is discarded by the
/// scanner at that point.
pub struct Section<'s> {
    headers: HeaderMap,
    scanner: &'s mut Scanner,
}

impl<'s> Section<'s> {
    pub(crate) fn new(headers: HeaderMap, scanner: &'s mut Scanner) -> Self {
        Section { headers, scanner }
    }

    /// Returns the section's header block.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the section's parsed Content-Type, if one was supplied and is
    /// parseable.
    ///
    /// Per RFC 7578 §4.4 an absent Content-Type defaults to `text/plain`;
    /// that default is left to the caller.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(CONTENT_TYPE)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Collects the whole body, up to `limit` bytes.
    ///
    /// Exceeding the limit fails with [`Error::FieldTooLarge`]; stream errors
    /// are returned as-is.
    pub async fn bytes(&mut self, limit: usize) -> Result<Bytes, Error> {
        // bounded initial allocation; the buffer grows with the data
        const INITIAL_ALLOC_BYTES: usize = 2 * 1024;

        let mut buf = BytesMut::with_capacity(cmp::min(limit, INITIAL_ALLOC_BYTES));

        while let Some(chunk) = self.try_next().await? {
            if buf.len() + chunk.len() > limit {
                return Err(Error::FieldTooLarge { limit });
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(buf.freeze())
    }
}

impl Stream for Section<'_> {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.scanner.poll_fill(cx)?;
        this.scanner.poll_body_chunk()
    }
}

impl fmt::Debug for Section<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Section");
        for (name, value) in self.headers.iter() {
            dbg.field(name.as_str(), &value);
        }
        dbg.finish()
    }
}
