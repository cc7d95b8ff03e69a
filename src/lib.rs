//! Streaming `multipart/form-data` ingestion.
//!
//! Decodes a raw multipart body stream into typed sections without ever
//! materializing the whole body in memory: file sections stream into
//! caller-resolved sinks, form-field sections accumulate into an ordered
//! name → values map, and everything else is drained and skipped. Framework
//! plumbing stays outside; the crate needs only the `Content-Type` header
//! value and a byte stream.
//!
//! [`Session`] is the turnkey entry point; [`Scanner`], [`Section`],
//! [`classify`], [`copy_section`] and [`FieldMap`] are the pieces it is built
//! from, usable on their own when the upload flow differs.
//!
//! ```no_run
//! use bytes::Bytes;
//! use futures_util::stream;
//! use multipart_ingest::{SaveDir, Session, SessionConfig};
//!
//! # async fn handle_upload() -> Result<(), multipart_ingest::Error> {
//! let content_type = "multipart/form-data; boundary=\"xYzZY\"";
//! let body = stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"..."))]);
//!
//! let session = Session::new(SessionConfig::default(), SaveDir::new("/var/uploads"));
//! let result = session.process(content_type, body).await?;
//!
//! println!("stored: {:?}, fields: {}", result.file_path(), result.fields.len());
//! # Ok(())
//! # }
//! ```

#![deny(rust_2018_idioms, nonstandard_style)]
#![warn(missing_docs)]

mod boundary;
mod buffer;
mod copier;
mod disposition;
mod error;
mod fields;
mod scanner;
mod section;
mod session;

pub use self::boundary::{extract_boundary, DEFAULT_BOUNDARY_LENGTH_LIMIT};
pub use self::copier::copy_section;
pub use self::disposition::{
    classify, ContentDisposition, DispositionParam, DispositionType, SectionKind,
};
pub use self::error::Error;
pub use self::fields::{decode_text, FieldMap, DEFAULT_VALUE_COUNT_LIMIT};
pub use self::scanner::{Scanner, DEFAULT_HEADERS_SIZE_LIMIT};
pub use self::section::Section;
pub use self::session::{
    PathResolver, SaveDir, Session, SessionConfig, UploadResult, DEFAULT_VALUE_LENGTH_LIMIT,
};
