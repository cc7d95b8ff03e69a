//! `Content-Disposition` parsing and section classification.
//!
//! References:
//! - "The Content-Disposition Header Field":
//!   <https://datatracker.ietf.org/doc/html/rfc2183>
//! - "Returning Values from Forms: multipart/form-data":
//!   <https://datatracker.ietf.org/doc/html/rfc7578>

use http::header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION};

use crate::error::Error;

/// Split at the index of the first `needle` if it exists or at the end.
fn split_once(haystack: &str, needle: char) -> (&str, &str) {
    haystack.find(needle).map_or_else(
        || (haystack, ""),
        |sc| {
            let (first, last) = haystack.split_at(sc);
            (first, last.split_at(1).1)
        },
    )
}

/// Split at the index of the first `needle` if it exists or at the end, trim
/// the right of the first part and the left of the last part.
fn split_once_and_trim(haystack: &str, needle: char) -> (&str, &str) {
    let (first, last) = split_once(haystack, needle);
    (first.trim_end(), last.trim_start())
}

/// The disposition type of a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispositionType {
    /// `form-data`, as defined in RFC 7578 for multipart form sections.
    FormData,

    /// Any other disposition type, kept verbatim.
    Ext(String),
}

impl From<&str> for DispositionType {
    fn from(origin: &str) -> DispositionType {
        if origin.eq_ignore_ascii_case("form-data") {
            DispositionType::FormData
        } else {
            DispositionType::Ext(origin.to_owned())
        }
    }
}

/// Parameter in a [`ContentDisposition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispositionParam {
    /// The `name` of the form field.
    Name(String),

    /// The `filename`, with surrounding quotes already stripped.
    Filename(String),

    /// Any unrecognized parameter (including `name*`-style extended ones,
    /// kept raw). Recipients ignore unrecognizable parameters.
    Unknown(String, String),
}

impl DispositionParam {
    /// Returns the field name if this is the `name` parameter.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            DispositionParam::Name(name) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Returns the file name if this is the `filename` parameter.
    pub fn as_filename(&self) -> Option<&str> {
        match self {
            DispositionParam::Filename(filename) => Some(filename.as_str()),
            _ => None,
        }
    }
}

/// Parsed view of a section's `Content-Disposition` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDisposition {
    /// The disposition type.
    pub disposition: DispositionType,

    /// Disposition parameters, in the order they appeared.
    pub parameters: Vec<DispositionParam>,
}

impl ContentDisposition {
    /// Parses a raw `Content-Disposition` header value.
    pub fn from_raw(value: &HeaderValue) -> Result<Self, Error> {
        // the value may contain non-visible-ASCII bytes, so go through UTF-8
        // rather than `to_str`
        let value = String::from_utf8(value.as_bytes().to_vec())
            .map_err(|_| Error::InvalidDisposition)?;

        let (disp_type, mut left) = split_once_and_trim(value.trim(), ';');
        if disp_type.is_empty() {
            return Err(Error::InvalidDisposition);
        }

        let mut cd = ContentDisposition {
            disposition: disp_type.into(),
            parameters: Vec::new(),
        };

        while !left.is_empty() {
            let (param_name, new_left) = split_once_and_trim(left, '=');
            if param_name.is_empty() || param_name == "*" || new_left.is_empty() {
                return Err(Error::InvalidDisposition);
            }
            left = new_left;

            if param_name.ends_with('*') {
                // RFC 5987 extended parameter; kept raw and unused
                let (ext_value, new_left) = split_once_and_trim(left, ';');
                left = new_left;
                cd.parameters
                    .push(DispositionParam::Unknown(param_name.to_owned(), ext_value.to_owned()));
                continue;
            }

            let value = if left.starts_with('\"') {
                // quoted-string per RFC 6266 -> RFC 2616 §3.6
                let mut escaping = false;
                let mut quoted_string = vec![];
                let mut end = None;

                for (i, &c) in left.as_bytes().iter().skip(1).enumerate() {
                    if escaping {
                        escaping = false;
                        quoted_string.push(c);
                    } else if c == b'\\' {
                        escaping = true;
                    } else if c == b'"' {
                        end = Some(i + 1); // index 0 is the leading quote
                        break;
                    } else {
                        quoted_string.push(c);
                    }
                }

                left = &left[end.ok_or(Error::InvalidDisposition)? + 1..];
                left = split_once(left, ';').1.trim_start();

                String::from_utf8(quoted_string).map_err(|_| Error::InvalidDisposition)?
            } else {
                // token: contains no semicolon per RFC 2616 §2.2
                let (token, new_left) = split_once_and_trim(left, ';');
                left = new_left;
                if token.is_empty() {
                    // a quoted-string can be empty, a token cannot
                    return Err(Error::InvalidDisposition);
                }
                token.to_owned()
            };

            let param = if param_name.eq_ignore_ascii_case("name") {
                DispositionParam::Name(value)
            } else if param_name.eq_ignore_ascii_case("filename") {
                DispositionParam::Filename(value)
            } else {
                DispositionParam::Unknown(param_name.to_owned(), value)
            };
            cd.parameters.push(param);
        }

        Ok(cd)
    }

    /// Returns `true` if the disposition type is `form-data`.
    pub fn is_form_data(&self) -> bool {
        matches!(self.disposition, DispositionType::FormData)
    }

    /// Returns the value of the `name` parameter, if present.
    pub fn get_name(&self) -> Option<&str> {
        self.parameters.iter().find_map(DispositionParam::as_name)
    }

    /// Returns the value of the `filename` parameter, if present.
    pub fn get_filename(&self) -> Option<&str> {
        self.parameters
            .iter()
            .find_map(DispositionParam::as_filename)
    }
}

/// How a section is to be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionKind {
    /// A file part: `form-data` with both `name` and `filename`.
    File {
        /// Form field name.
        field_name: String,

        /// Client-supplied file name, quotes stripped, otherwise untrusted.
        file_name: String,
    },

    /// A form-field part: `form-data` with `name` but no `filename`.
    Field {
        /// Form field name.
        field_name: String,
    },

    /// Anything else; drained without processing.
    Skip,
}

/// Classifies a section from its header block.
///
/// A missing `Content-Disposition` header (or one whose disposition type is
/// not `form-data`, or that names neither field nor file) classifies as
/// [`SectionKind::Skip`]; a present but unparseable header is an error.
pub fn classify(headers: &HeaderMap) -> Result<SectionKind, Error> {
    let raw = match headers.get(CONTENT_DISPOSITION) {
        Some(raw) => raw,
        None => return Ok(SectionKind::Skip),
    };

    let cd = ContentDisposition::from_raw(raw)?;

    if !cd.is_form_data() {
        return Ok(SectionKind::Skip);
    }

    match (cd.get_name(), cd.get_filename()) {
        (Some(name), Some(filename)) => Ok(SectionKind::File {
            field_name: name.to_owned(),
            file_name: filename.to_owned(),
        }),
        (Some(name), None) => Ok(SectionKind::Field {
            field_name: name.to_owned(),
        }),
        _ => Ok(SectionKind::Skip),
    }
}
