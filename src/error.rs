//! Error and Result module.

use std::io;

use derive_more::{Display, Error};

/// A set of errors that can occur while decoding a multipart stream.
///
/// Every variant is fatal for the request being processed: the first error
/// encountered aborts the session and no partial result is returned. The
/// surrounding service decides how each kind maps onto a response (malformed
/// input is client-caused; [`Io`](Error::Io) is not).
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum Error {
    /// Content-Type is missing the multipart media type or cannot be parsed.
    #[display("Content-Type is not a parseable multipart media type")]
    InvalidContentType,

    /// Multipart boundary parameter is not found.
    #[display("Multipart boundary is not found")]
    MissingBoundary,

    /// Multipart boundary parameter exceeds the configured length limit.
    #[display("Multipart boundary is longer than {limit} bytes")]
    BoundaryTooLong {
        /// Configured boundary length limit.
        limit: usize,
    },

    /// A section's header block exceeds the configured size limit.
    #[display("Section header block exceeds the configured size limit")]
    HeadersTooLarge,

    /// Multipart body is malformed or ended mid-part.
    #[display("Multipart body is malformed or incomplete")]
    MalformedBody,

    /// A section's Content-Disposition header is present but not parseable.
    #[display("Content-Disposition header is not parseable")]
    InvalidDisposition,

    /// Total form field value count exceeds the configured limit.
    #[display("Form value count limit of {limit} exceeded")]
    TooManyFields {
        /// Configured value count limit.
        limit: usize,
    },

    /// A single form field value exceeds the configured size limit.
    #[display("Form value length limit of {limit} bytes exceeded")]
    FieldTooLarge {
        /// Configured value length limit.
        limit: usize,
    },

    /// Reading the body stream or writing a file sink failed.
    #[display("I/O failure: {_0}")]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
