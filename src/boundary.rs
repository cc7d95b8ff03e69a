//! Content-Type inspection and boundary extraction.

use mime::Mime;

use crate::error::Error;

/// Default cap on boundary length, per the RFC 2046 ceiling of 70 characters.
pub const DEFAULT_BOUNDARY_LENGTH_LIMIT: usize = 70;

/// Extracts the boundary token from a raw `Content-Type` header value.
///
/// The media type must be `multipart/*` and must carry a non-empty `boundary`
/// parameter no longer than `length_limit` bytes. Pure parse; the body stream
/// is never touched.
pub fn extract_boundary(content_type: &str, length_limit: usize) -> Result<String, Error> {
    let mime = content_type
        .trim()
        .parse::<Mime>()
        .map_err(|_| Error::InvalidContentType)?;

    if mime.type_() != mime::MULTIPART {
        return Err(Error::InvalidContentType);
    }

    let boundary = mime
        .get_param(mime::BOUNDARY)
        .ok_or(Error::MissingBoundary)?
        .as_str();

    if boundary.is_empty() {
        return Err(Error::MissingBoundary);
    }

    if boundary.len() > length_limit {
        return Err(Error::BoundaryTooLong {
            limit: length_limit,
        });
    }

    Ok(boundary.to_owned())
}
