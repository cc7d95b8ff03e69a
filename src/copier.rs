//! Bounded-memory copying of section bodies into byte sinks.

use futures_util::TryStreamExt as _;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};

use crate::{error::Error, section::Section};

/// Copies a section's body into `sink`, returning the number of bytes
/// written.
///
/// Data moves chunk by chunk, so memory stays bounded by the scanner's window
/// regardless of body size. The sink is flushed on success; on failure it is
/// left wherever the last write put it, and its disposition (close, delete,
/// keep) is the caller's to decide.
pub async fn copy_section<W>(section: &mut Section<'_>, sink: &mut W) -> Result<u64, Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0u64;

    while let Some(chunk) = section.try_next().await? {
        sink.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    sink.flush().await?;

    Ok(written)
}
