//! Accumulation and decoding of form-field values.

use encoding_rs::Encoding;
use mime::Mime;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::Error;

/// Default cap on the total number of accumulated form values.
pub const DEFAULT_VALUE_COUNT_LIMIT: usize = 1024;

/// Ordered mapping from form field name to its values.
///
/// Keys keep first-appearance order and duplicates append to the existing
/// key's value list. The total value count across all keys is capped; the
/// append that would exceed the cap fails, not any earlier one.
#[derive(Debug, Clone)]
pub struct FieldMap {
    entries: Vec<(String, Vec<String>)>,
    value_count: usize,
    value_count_limit: usize,
}

impl FieldMap {
    /// Constructs an empty map with the given total value count limit.
    pub fn with_limit(value_count_limit: usize) -> Self {
        FieldMap {
            entries: Vec::new(),
            value_count: 0,
            value_count_limit,
        }
    }

    /// Appends `value` under `name`.
    ///
    /// Fails with [`Error::TooManyFields`] once the total value count would
    /// exceed the limit.
    pub fn append(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), Error> {
        if self.value_count >= self.value_count_limit {
            return Err(Error::TooManyFields {
                limit: self.value_count_limit,
            });
        }

        let name = name.into();
        let value = value.into();

        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }

        self.value_count += 1;
        Ok(())
    }

    /// Returns the first value stored under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }

    /// Returns all values stored under `name`, in arrival order.
    pub fn values(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// Iterates over `(name, values)` pairs in first-appearance order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Number of distinct field names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no values have been accumulated.
    pub fn is_empty(&self) -> bool {
        self.value_count == 0
    }

    /// Total number of accumulated values across all names.
    pub fn value_count(&self) -> usize {
        self.value_count
    }
}

impl Default for FieldMap {
    fn default() -> Self {
        FieldMap::with_limit(DEFAULT_VALUE_COUNT_LIMIT)
    }
}

impl Serialize for FieldMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, values) in &self.entries {
            map.serialize_entry(key, values)?;
        }
        map.end()
    }
}

/// Decodes a field's raw bytes into text.
///
/// The charset declared in the section's own Content-Type wins when
/// `encoding_rs` knows it, falling back to `default` otherwise; a byte-order
/// mark at the start of the data overrides both and is stripped. A decoded
/// value equal to the literal text `undefined` (any letter case) is
/// normalized to the empty string.
pub fn decode_text(
    content_type: Option<&Mime>,
    default: &'static Encoding,
    bytes: &[u8],
) -> String {
    let encoding = content_type
        .and_then(|mime| mime.get_param(mime::CHARSET))
        .and_then(|charset| Encoding::for_label(charset.as_str().as_bytes()))
        .unwrap_or(default);

    let (text, _, _) = encoding.decode(bytes);

    if text.eq_ignore_ascii_case("undefined") {
        String::new()
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use encoding_rs::UTF_8;

    use super::*;

    #[test]
    fn distinct_keys_count_individually() {
        let mut fields = FieldMap::with_limit(16);
        fields.append("a", "1").unwrap();
        fields.append("b", "2").unwrap();
        fields.append("c", "3").unwrap();

        assert_eq!(fields.value_count(), 3);
        assert_eq!(fields.len(), 3);
        assert_eq!(fields.get("b"), Some("2"));
    }

    #[test]
    fn duplicate_keys_append_in_order() {
        let mut fields = FieldMap::with_limit(16);
        fields.append("tag", "x").unwrap();
        fields.append("other", "y").unwrap();
        fields.append("tag", "z").unwrap();

        assert_eq!(fields.values("tag"), ["x", "z"]);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.value_count(), 3);

        let order: Vec<&str> = fields.iter().map(|(key, _)| key).collect();
        assert_eq!(order, ["tag", "other"]);
    }

    #[test]
    fn limit_fails_on_the_offending_append() {
        let mut fields = FieldMap::with_limit(2);
        fields.append("a", "1").unwrap();
        fields.append("b", "2").unwrap();

        assert_matches!(
            fields.append("c", "3"),
            Err(Error::TooManyFields { limit: 2 })
        );

        // the failed append left no trace
        assert_eq!(fields.value_count(), 2);
        assert!(fields.values("c").is_empty());
    }

    #[test]
    fn serializes_as_a_map_of_value_lists() {
        let mut fields = FieldMap::with_limit(16);
        fields.append("tag", "x").unwrap();
        fields.append("tag", "z").unwrap();
        fields.append("note", "n").unwrap();

        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(json, r#"{"tag":["x","z"],"note":["n"]}"#);
    }

    #[test]
    fn undefined_normalizes_to_empty() {
        assert_eq!(decode_text(None, UTF_8, b"undefined"), "");
        assert_eq!(decode_text(None, UTF_8, b"UNDEFINED"), "");
        assert_eq!(decode_text(None, UTF_8, b"uNdEfInEd"), "");
    }

    #[test]
    fn near_matches_are_left_untouched() {
        assert_eq!(decode_text(None, UTF_8, b"Undefined2"), "Undefined2");
        assert_eq!(decode_text(None, UTF_8, b" undefined"), " undefined");
    }

    #[test]
    fn declared_charset_is_used() {
        let mime: Mime = "text/plain; charset=windows-1252".parse().unwrap();
        assert_eq!(
            decode_text(Some(&mime), UTF_8, b"caf\xe9"),
            "caf\u{e9}"
        );
    }

    #[test]
    fn unknown_charset_falls_back_to_default() {
        let mime: Mime = "text/plain; charset=no-such-charset".parse().unwrap();
        assert_eq!(decode_text(Some(&mime), UTF_8, b"plain"), "plain");
    }

    #[test]
    fn byte_order_mark_overrides_declared_charset() {
        let mime: Mime = "text/plain; charset=utf-8".parse().unwrap();
        let utf16le = [0xFF, 0xFE, b'h', 0x00, b'i', 0x00];
        assert_eq!(decode_text(Some(&mime), UTF_8, &utf16le), "hi");
    }

    #[test]
    fn utf8_bom_is_stripped() {
        assert_eq!(decode_text(None, UTF_8, b"\xEF\xBB\xBFvalue"), "value");
    }
}
