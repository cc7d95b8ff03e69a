//! Lazy section scanning over a raw multipart body stream.

use std::{
    future::poll_fn,
    io,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use futures_core::stream::Stream;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};

use crate::{buffer::StreamBuffer, error::Error, section::Section};

const MAX_HEADERS: usize = 32;

/// Default cap on a section's header block size.
pub const DEFAULT_HEADERS_SIZE_LIMIT: usize = 16 * 1024;

#[derive(Debug, PartialEq)]
enum State {
    /// Skip data until the first delimiter.
    Preamble,

    /// Reading a delimiter line.
    Delimiter,

    /// Reading a section's header block.
    Headers,

    /// A section body is being read (or awaits draining).
    Body,

    /// Stream end reached via the terminal delimiter.
    Eof,
}

/// Body framing for the section currently in flight.
struct BodyState {
    /// Remaining bytes according to the section's Content-Length, if stated.
    length: Option<u64>,

    /// Content fully read; the closing CRLF may still be pending.
    done: bool,
}

impl BodyState {
    fn from_headers(headers: &HeaderMap) -> Result<BodyState, Error> {
        let length = match headers.get(CONTENT_LENGTH) {
            Some(value) => Some(
                value
                    .to_str()
                    .ok()
                    .and_then(|len| len.parse::<u64>().ok())
                    .ok_or(Error::MalformedBody)?,
            ),
            None => None,
        };

        Ok(BodyState {
            length,
            done: false,
        })
    }
}

/// Turns a raw byte stream plus boundary into a lazy sequence of sections.
///
/// Sections are yielded strictly in arrival order and each one borrows the
/// scanner, so a section cannot be read once [`next_section`] has been called
/// again. Unread body bytes of the previous section are discarded
/// automatically before the next delimiter is searched; callers never need to
/// exhaust a section by hand.
///
/// [`next_section`]: Scanner::next_section
pub struct Scanner {
    buffer: StreamBuffer,
    boundary: String,
    headers_size_limit: usize,
    state: State,
    body: BodyState,
}

impl Scanner {
    /// Constructs a scanner from an already-extracted boundary token and the
    /// request body stream.
    pub fn new<S>(boundary: impl Into<String>, stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + 'static,
    {
        Scanner {
            buffer: StreamBuffer::new(stream),
            boundary: boundary.into(),
            headers_size_limit: DEFAULT_HEADERS_SIZE_LIMIT,
            state: State::Preamble,
            body: BodyState {
                length: None,
                done: true,
            },
        }
    }

    /// Sets the cap on a single section's header block size.
    pub fn headers_size_limit(mut self, limit: usize) -> Self {
        self.headers_size_limit = limit;
        self
    }

    /// Advances to the next section, discarding any unread bytes of the
    /// previous one first.
    ///
    /// Returns `Ok(None)` once the terminal delimiter has been read.
    pub async fn next_section(&mut self) -> Result<Option<Section<'_>>, Error> {
        let headers = match poll_fn(|cx| self.poll_section_headers(cx)).await? {
            Some(headers) => headers,
            None => return Ok(None),
        };

        Ok(Some(Section::new(headers, self)))
    }

    fn poll_section_headers(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Error>> {
        self.buffer.poll_stream(cx)?;

        loop {
            match self.state {
                State::Eof => return Poll::Ready(Ok(None)),

                State::Body => loop {
                    match ready!(self.poll_body_chunk()) {
                        Some(Ok(_discarded)) => {}
                        Some(Err(err)) => return Poll::Ready(Err(err)),
                        None => break,
                    }
                },

                State::Preamble => {
                    match Self::skip_until_delimiter(&mut self.buffer, &self.boundary)? {
                        None => return Poll::Pending,
                        Some(true) => self.state = State::Eof,
                        Some(false) => self.state = State::Headers,
                    }
                }

                State::Delimiter => {
                    match Self::read_delimiter(&mut self.buffer, &self.boundary)? {
                        None => return Poll::Pending,
                        Some(true) => self.state = State::Eof,
                        Some(false) => self.state = State::Headers,
                    }
                }

                State::Headers => match self.read_section_headers()? {
                    None => return Poll::Pending,
                    Some(headers) => {
                        self.body = BodyState::from_headers(&headers)?;
                        self.state = State::Body;
                        return Poll::Ready(Ok(Some(headers)));
                    }
                },
            }
        }
    }

    /// Produces the next chunk of the in-flight section's body.
    ///
    /// `Ready(None)` marks the end of the body; the scanner is then
    /// positioned at the following delimiter line.
    pub(crate) fn poll_body_chunk(&mut self) -> Poll<Option<Result<Bytes, Error>>> {
        if self.state != State::Body {
            return Poll::Ready(None);
        }

        if !self.body.done {
            let chunk = match self.body.length {
                Some(ref mut remaining) => Self::read_len(&mut self.buffer, remaining),
                None => Self::read_to_delimiter(&mut self.buffer, &self.boundary),
            };

            match ready!(chunk) {
                Some(Ok(bytes)) => return Poll::Ready(Some(Ok(bytes))),
                Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                None => self.body.done = true,
            }
        }

        // consume the line break separating body content from the delimiter
        match self.buffer.readline() {
            Ok(Some(line)) => {
                if line.as_ref() != b"\r\n" {
                    log::warn!("multipart section body not fully read or malformed");
                }
                self.state = State::Delimiter;
                Poll::Ready(None)
            }
            Ok(None) => Poll::Pending,
            Err(err) => Poll::Ready(Some(Err(err))),
        }
    }

    /// Polls the body stream into the window on behalf of a section read.
    pub(crate) fn poll_fill(&mut self, cx: &mut Context<'_>) -> Result<(), Error> {
        self.buffer.poll_stream(cx)
    }

    /// Reads a chunk of body content framed by the section's Content-Length.
    fn read_len(
        buffer: &mut StreamBuffer,
        remaining: &mut u64,
    ) -> Poll<Option<Result<Bytes, Error>>> {
        if *remaining == 0 {
            return Poll::Ready(None);
        }

        match buffer.read_max(*remaining) {
            Ok(Some(chunk)) => {
                *remaining -= chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Ok(None) => Poll::Pending,
            Err(err) => Poll::Ready(Some(Err(err))),
        }
    }

    /// Reads a chunk of body content framed by delimiter search.
    ///
    /// Emits data up to (but excluding) the CRLF that precedes the next
    /// delimiter; `Ready(None)` once that CRLF is at the front of the window.
    fn read_to_delimiter(
        buffer: &mut StreamBuffer,
        boundary: &str,
    ) -> Poll<Option<Result<Bytes, Error>>> {
        let mut pos = 0;
        let len = buffer.buf.len();

        if len == 0 {
            return if buffer.eof {
                Poll::Ready(Some(Err(Error::MalformedBody)))
            } else {
                Poll::Pending
            };
        }

        // A delimiter may sit right at the front of the window. Decide before
        // emitting anything: the window could hold only part of the prelude.
        if buffer.buf[0] == b'\r' {
            let crlf = delimiter_prefix(&buffer.buf, b"\r\n--", boundary.as_bytes());
            let cr = delimiter_prefix(&buffer.buf, b"\r--", boundary.as_bytes());

            if crlf == Prefix::Full || cr == Prefix::Full {
                return Poll::Ready(None);
            }

            if crlf == Prefix::Partial || cr == Prefix::Partial {
                return if buffer.eof {
                    Poll::Ready(Some(Err(Error::MalformedBody)))
                } else {
                    Poll::Pending
                };
            }
        }

        loop {
            return if let Some(idx) = memchr::memmem::find(&buffer.buf[pos..], b"\r") {
                let cur = pos + idx;

                if cur + 4 > len {
                    // not enough data to rule a delimiter out yet
                    if cur > 0 {
                        Poll::Ready(Some(Ok(buffer.buf.split_to(cur).freeze())))
                    } else if buffer.eof {
                        Poll::Ready(Some(Err(Error::MalformedBody)))
                    } else {
                        Poll::Pending
                    }
                } else if (&buffer.buf[cur..cur + 2] == b"\r\n"
                    && &buffer.buf[cur + 2..cur + 4] == b"--")
                    || (buffer.buf[cur] == b'\r' && &buffer.buf[cur + 1..cur + 3] == b"--")
                {
                    if cur != 0 {
                        // data before a potential delimiter is always data
                        Poll::Ready(Some(Ok(buffer.buf.split_to(cur).freeze())))
                    } else {
                        // front-of-window check already ruled this one out
                        pos = cur + 1;
                        continue;
                    }
                } else {
                    pos = cur + 1;
                    continue;
                }
            } else {
                Poll::Ready(Some(Ok(buffer.buf.split().freeze())))
            };
        }
    }

    /// Reads an in-between (`--boundary`) or terminal (`--boundary--`)
    /// delimiter line and discards it.
    ///
    /// Returns:
    ///
    /// - `Ok(Some(true))` - terminal delimiter read
    /// - `Ok(Some(false))` - in-between delimiter read
    /// - `Ok(None)` - more data needs reading
    fn read_delimiter(buffer: &mut StreamBuffer, boundary: &str) -> Result<Option<bool>, Error> {
        let line = match buffer.readline_or_eof()? {
            None => return Ok(None),
            Some(line) => line,
        };

        if line.is_empty() {
            // the stream ended where a delimiter line was required
            return Err(Error::MalformedBody);
        }

        let line = trim_line_ending(&line);

        if line.len() < boundary.len() + 2
            || !line.starts_with(b"--")
            || &line[2..boundary.len() + 2] != boundary.as_bytes()
        {
            return Err(Error::MalformedBody);
        }

        match &line[boundary.len() + 2..] {
            b"" => Ok(Some(false)),
            b"--" => Ok(Some(true)),
            _ => Err(Error::MalformedBody),
        }
    }

    /// Discards preamble lines until the first delimiter.
    fn skip_until_delimiter(
        buffer: &mut StreamBuffer,
        boundary: &str,
    ) -> Result<Option<bool>, Error> {
        loop {
            let line = match buffer.readline_or_eof()? {
                None => return Ok(None),
                Some(line) => line,
            };

            if line.is_empty() {
                // the stream ended before any delimiter showed up
                return Err(Error::MalformedBody);
            }

            let line = trim_line_ending(&line);

            if line.len() < boundary.len() + 2
                || !line.starts_with(b"--")
                || &line[2..boundary.len() + 2] != boundary.as_bytes()
            {
                continue;
            }

            match &line[boundary.len() + 2..] {
                b"" => return Ok(Some(false)),
                b"--" => return Ok(Some(true)),
                _ => continue,
            }
        }
    }

    /// Reads a section's header block, up to and including the blank line.
    ///
    /// Returns `Ok(None)` while the block's end has not arrived yet.
    fn read_section_headers(&mut self) -> Result<Option<HeaderMap>, Error> {
        // a section may carry no headers at all
        if self.buffer.buf.len() >= 2 && &self.buffer.buf[..2] == b"\r\n" {
            let _ = self.buffer.buf.split_to(2);
            return Ok(Some(HeaderMap::new()));
        }

        let block = match self.buffer.read_until(b"\r\n\r\n") {
            Ok(Some(block)) => block,
            Ok(None) => {
                return if self.buffer.buf.len() > self.headers_size_limit {
                    Err(Error::HeadersTooLarge)
                } else {
                    Ok(None)
                };
            }
            Err(err) => return Err(err),
        };

        if block.len() > self.headers_size_limit {
            return Err(Error::HeadersTooLarge);
        }

        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];

        match httparse::parse_headers(&block, &mut parsed) {
            Ok(httparse::Status::Complete((_, parsed))) => {
                let mut headers = HeaderMap::with_capacity(parsed.len());

                for header in parsed {
                    let name =
                        HeaderName::try_from(header.name).map_err(|_| Error::MalformedBody)?;
                    let value =
                        HeaderValue::try_from(header.value).map_err(|_| Error::MalformedBody)?;
                    headers.append(name, value);
                }

                Ok(Some(headers))
            }
            Ok(httparse::Status::Partial) | Err(_) => Err(Error::MalformedBody),
        }
    }
}

/// Strips one trailing `\r\n` (or lone `\n`) off a delimiter line.
fn trim_line_ending(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line)
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Prefix {
    /// The window starts with the full delimiter.
    Full,

    /// The window is a proper prefix of the delimiter; undecidable yet.
    Partial,

    /// The window cannot start with this delimiter.
    No,
}

/// Matches the front of `window` against `prelude` followed by `boundary`.
fn delimiter_prefix(window: &[u8], prelude: &[u8], boundary: &[u8]) -> Prefix {
    let total = prelude.len() + boundary.len();
    let checkable = window.len().min(total);

    for i in 0..checkable {
        let expected = if i < prelude.len() {
            prelude[i]
        } else {
            boundary[i - prelude.len()]
        };
        if window[i] != expected {
            return Prefix::No;
        }
    }

    if window.len() >= total {
        Prefix::Full
    } else {
        Prefix::Partial
    }
}
