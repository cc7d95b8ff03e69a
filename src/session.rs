//! Upload session orchestration.

use std::{
    io,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use futures_core::stream::Stream;
use serde::Serialize;
use tokio::fs;

use crate::{
    boundary::{extract_boundary, DEFAULT_BOUNDARY_LENGTH_LIMIT},
    copier::copy_section,
    disposition::{classify, SectionKind},
    error::Error,
    fields::{decode_text, FieldMap, DEFAULT_VALUE_COUNT_LIMIT},
    scanner::{Scanner, DEFAULT_HEADERS_SIZE_LIMIT},
    section::Section,
};

/// Default cap on a single form value's decoded size.
pub const DEFAULT_VALUE_LENGTH_LIMIT: usize = 4 * 1024 * 1024;

/// Immutable per-session processing limits and policies.
///
/// Constructed once and handed to [`Session::new`]; nothing here is shared
/// process-wide state.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    boundary_length_limit: usize,
    headers_size_limit: usize,
    value_count_limit: usize,
    value_length_limit: usize,
    default_charset: &'static Encoding,
    remove_partial_on_error: bool,
}

impl SessionConfig {
    /// Sets the cap on the multipart boundary token length.
    pub fn boundary_length_limit(mut self, limit: usize) -> Self {
        self.boundary_length_limit = limit;
        self
    }

    /// Sets the cap on a single section's header block size.
    pub fn headers_size_limit(mut self, limit: usize) -> Self {
        self.headers_size_limit = limit;
        self
    }

    /// Sets the cap on the total number of form values.
    pub fn value_count_limit(mut self, limit: usize) -> Self {
        self.value_count_limit = limit;
        self
    }

    /// Sets the cap on a single form value's size.
    pub fn value_length_limit(mut self, limit: usize) -> Self {
        self.value_length_limit = limit;
        self
    }

    /// Sets the charset used for field values that declare none.
    pub fn default_charset(mut self, charset: &'static Encoding) -> Self {
        self.default_charset = charset;
        self
    }

    /// Sets whether a partially written file is deleted when its copy fails.
    pub fn remove_partial_on_error(mut self, remove: bool) -> Self {
        self.remove_partial_on_error = remove;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            boundary_length_limit: DEFAULT_BOUNDARY_LENGTH_LIMIT,
            headers_size_limit: DEFAULT_HEADERS_SIZE_LIMIT,
            value_count_limit: DEFAULT_VALUE_COUNT_LIMIT,
            value_length_limit: DEFAULT_VALUE_LENGTH_LIMIT,
            default_charset: UTF_8,
            remove_partial_on_error: true,
        }
    }
}

/// Maps an untrusted client-supplied file name to a destination path.
///
/// The client controls the `filename` parameter entirely, so implementations
/// own whatever sanitization and collision policy the deployment needs.
pub trait PathResolver {
    /// Resolves `file_name` to the path the file section will be written to.
    fn resolve(&self, file_name: &str) -> io::Result<PathBuf>;
}

impl<F> PathResolver for F
where
    F: Fn(&str) -> io::Result<PathBuf>,
{
    fn resolve(&self, file_name: &str) -> io::Result<PathBuf> {
        (self)(file_name)
    }
}

/// Path policy that stores uploads inside one directory.
///
/// Only the final path component of the client-supplied name is kept, which
/// discards directory prefixes and rejects names like `..` that have no
/// usable component. Name collisions surface as `AlreadyExists` I/O errors
/// when the session opens the destination.
#[derive(Debug, Clone)]
pub struct SaveDir {
    root: PathBuf,
}

impl SaveDir {
    /// Creates a policy rooted at `root`. The directory must already exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SaveDir { root: root.into() }
    }
}

impl PathResolver for SaveDir {
    fn resolve(&self, file_name: &str) -> io::Result<PathBuf> {
        let name = Path::new(file_name).file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "file name has no usable final component",
            )
        })?;

        Ok(self.root.join(name))
    }
}

/// Everything a completed session produced.
#[derive(Debug, Serialize)]
pub struct UploadResult {
    /// Destination paths of the stored file sections, in arrival order.
    pub file_paths: Vec<PathBuf>,

    /// Accumulated form fields.
    pub fields: FieldMap,
}

impl UploadResult {
    /// Destination of the most recently stored file, for the common
    /// single-file upload.
    pub fn file_path(&self) -> Option<&Path> {
        self.file_paths.last().map(PathBuf::as_path)
    }
}

/// Drives one multipart request from content-type validation to the final
/// [`UploadResult`].
///
/// A `Session` value holds only the immutable config and the path policy, so
/// one instance may serve many independent requests; each `process` call owns
/// all of its transient state. Within a call, sections are handled strictly
/// in arrival order and the first error aborts the whole request.
pub struct Session<P> {
    config: SessionConfig,
    resolver: P,
}

impl<P: PathResolver> Session<P> {
    /// Creates a session from processing limits and a path policy.
    pub fn new(config: SessionConfig, resolver: P) -> Self {
        Session { config, resolver }
    }

    /// Processes one multipart request.
    ///
    /// `content_type` is the raw `Content-Type` header value; `body` is the
    /// request body stream. The body is not polled unless the content type
    /// validates.
    pub async fn process<S>(&self, content_type: &str, body: S) -> Result<UploadResult, Error>
    where
        S: Stream<Item = io::Result<Bytes>> + 'static,
    {
        let boundary = extract_boundary(content_type, self.config.boundary_length_limit)?;

        let mut scanner =
            Scanner::new(boundary, body).headers_size_limit(self.config.headers_size_limit);

        let mut fields = FieldMap::with_limit(self.config.value_count_limit);
        let mut file_paths = Vec::new();

        while let Some(mut section) = scanner.next_section().await? {
            match classify(section.headers())? {
                SectionKind::File {
                    field_name,
                    file_name,
                } => {
                    let path = self.resolver.resolve(&file_name)?;
                    let written = self.store_file(&mut section, &path).await?;

                    log::info!(
                        "stored file part `{}` at {} ({} bytes)",
                        field_name,
                        path.display(),
                        written,
                    );
                    file_paths.push(path);
                }

                SectionKind::Field { field_name } => {
                    let content_type = section.content_type();
                    let raw = section.bytes(self.config.value_length_limit).await?;
                    let value =
                        decode_text(content_type.as_ref(), self.config.default_charset, &raw);
                    fields.append(field_name, value)?;
                }

                // drained by the scanner before the next section
                SectionKind::Skip => {}
            }
        }

        Ok(UploadResult { file_paths, fields })
    }

    async fn store_file(&self, section: &mut Section<'_>, path: &Path) -> Result<u64, Error> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;

        match copy_section(section, &mut file).await {
            Ok(written) => Ok(written),
            Err(err) => {
                drop(file);
                if self.config.remove_partial_on_error {
                    if let Err(remove_err) = fs::remove_file(path).await {
                        log::warn!(
                            "failed to remove partial file {}: {}",
                            path.display(),
                            remove_err,
                        );
                    }
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::task::Poll;

    use assert_matches::assert_matches;
    use futures_test::stream::StreamTestExt as _;
    use futures_util::{stream, StreamExt as _};

    use super::*;

    const BOUNDARY: &str = "abbc761f78ff4d7cb7573b5a23f96ef0";
    const CONTENT_TYPE: &str =
        "multipart/form-data; boundary=\"abbc761f78ff4d7cb7573b5a23f96ef0\"";

    fn mixed_body() -> Bytes {
        Bytes::from(
            "--abbc761f78ff4d7cb7573b5a23f96ef0\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             no disposition here\r\n\
             --abbc761f78ff4d7cb7573b5a23f96ef0\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"report.txt\"\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             file content\r\n\
             --abbc761f78ff4d7cb7573b5a23f96ef0\r\n\
             Content-Disposition: form-data; name=\"note\"\r\n\
             \r\n\
             a note\r\n\
             --abbc761f78ff4d7cb7573b5a23f96ef0\r\n\
             Content-Disposition: form-data; name=\"note\"\r\n\
             \r\n\
             undefined\r\n\
             --abbc761f78ff4d7cb7573b5a23f96ef0--\r\n",
        )
    }

    fn whole_stream(body: Bytes) -> impl Stream<Item = io::Result<Bytes>> {
        stream::iter([Ok(body)])
    }

    #[tokio::test]
    async fn stores_files_and_accumulates_fields() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(SessionConfig::default(), SaveDir::new(dir.path()));

        let result = session
            .process(CONTENT_TYPE, whole_stream(mixed_body()))
            .await
            .unwrap();

        assert_eq!(result.file_paths.len(), 1);
        assert_eq!(result.file_path().unwrap(), dir.path().join("report.txt"));
        assert_eq!(
            std::fs::read_to_string(result.file_path().unwrap()).unwrap(),
            "file content"
        );

        // skipped section left the accumulator alone; `undefined` normalized
        assert_eq!(result.fields.values("note"), ["a note", ""]);
        assert_eq!(result.fields.value_count(), 2);
    }

    #[tokio::test]
    async fn works_byte_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(SessionConfig::default(), SaveDir::new(dir.path()));

        let body = stream::iter(mixed_body())
            .map(|byte| Ok::<_, io::Error>(Bytes::copy_from_slice(&[byte])))
            .interleave_pending();

        let result = session.process(CONTENT_TYPE, body).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(result.file_path().unwrap()).unwrap(),
            "file content"
        );
        assert_eq!(result.fields.values("note"), ["a note", ""]);
    }

    #[tokio::test]
    async fn non_multipart_fails_before_reading_the_body() {
        let session = Session::new(SessionConfig::default(), SaveDir::new("/nonexistent"));

        let body = stream::poll_fn(|_| -> Poll<Option<io::Result<Bytes>>> {
            panic!("body must not be polled")
        });

        let err = session.process("text/plain", body).await.unwrap_err();
        assert_matches!(err, Error::InvalidContentType);
    }

    #[tokio::test]
    async fn truncated_body_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(SessionConfig::default(), SaveDir::new(dir.path()));

        let body = Bytes::from(
            "--abbc761f78ff4d7cb7573b5a23f96ef0\r\n\
             Content-Disposition: form-data; name=\"note\"\r\n\
             \r\n\
             cut off mid-val",
        );

        let err = session
            .process(CONTENT_TYPE, whole_stream(body))
            .await
            .unwrap_err();
        assert_matches!(err, Error::MalformedBody);
    }

    #[tokio::test]
    async fn value_count_limit_aborts_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(
            SessionConfig::default().value_count_limit(1),
            SaveDir::new(dir.path()),
        );

        let err = session
            .process(CONTENT_TYPE, whole_stream(mixed_body()))
            .await
            .unwrap_err();
        assert_matches!(err, Error::TooManyFields { limit: 1 });
    }

    #[tokio::test]
    async fn value_length_limit_aborts_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(
            SessionConfig::default().value_length_limit(3),
            SaveDir::new(dir.path()),
        );

        let err = session
            .process(CONTENT_TYPE, whole_stream(mixed_body()))
            .await
            .unwrap_err();
        assert_matches!(err, Error::FieldTooLarge { limit: 3 });
    }

    #[tokio::test]
    async fn failed_copy_removes_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(SessionConfig::default(), SaveDir::new(dir.path()));

        // cut 8 bytes into the file part's body
        let body = mixed_body();
        let head = body.slice(..240);

        let broken = stream::iter([
            Ok(head),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ])
        .interleave_pending();

        let err = session.process(CONTENT_TYPE, broken).await.unwrap_err();
        assert_matches!(err, Error::Io(_));

        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn failed_copy_can_keep_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(
            SessionConfig::default().remove_partial_on_error(false),
            SaveDir::new(dir.path()),
        );

        // cut 8 bytes into the file part's body
        let body = mixed_body();
        let head = body.slice(..240);

        let broken = stream::iter([
            Ok(head),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ])
        .interleave_pending();

        let err = session.process(CONTENT_TYPE, broken).await.unwrap_err();
        assert_matches!(err, Error::Io(_));

        assert!(dir.path().join("report.txt").exists());
    }

    #[tokio::test]
    async fn colliding_file_names_fail() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.txt"), b"already here").unwrap();

        let session = Session::new(SessionConfig::default(), SaveDir::new(dir.path()));

        let err = session
            .process(CONTENT_TYPE, whole_stream(mixed_body()))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Io(_));
    }

    #[tokio::test]
    async fn charset_and_bom_are_honored() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(SessionConfig::default(), SaveDir::new(dir.path()));

        let mut body = Vec::new();
        body.extend_from_slice(
            b"--abbc761f78ff4d7cb7573b5a23f96ef0\r\n\
              Content-Disposition: form-data; name=\"latin\"\r\n\
              Content-Type: text/plain; charset=windows-1252\r\n\
              \r\n\
              caf\xe9\r\n\
              --abbc761f78ff4d7cb7573b5a23f96ef0\r\n\
              Content-Disposition: form-data; name=\"bom\"\r\n\
              \r\n",
        );
        body.extend_from_slice(&[0xFF, 0xFE, b'h', 0x00, b'i', 0x00]);
        body.extend_from_slice(b"\r\n--abbc761f78ff4d7cb7573b5a23f96ef0--\r\n");

        let result = session
            .process(CONTENT_TYPE, whole_stream(Bytes::from(body)))
            .await
            .unwrap();

        assert_eq!(result.fields.get("latin"), Some("caf\u{e9}"));
        assert_eq!(result.fields.get("bom"), Some("hi"));
    }

    #[test]
    fn save_dir_keeps_only_the_final_component() {
        let policy = SaveDir::new("/uploads");

        assert_eq!(
            policy.resolve("../../etc/passwd").unwrap(),
            PathBuf::from("/uploads/passwd")
        );
        assert_eq!(
            policy.resolve("nested/dir/file.txt").unwrap(),
            PathBuf::from("/uploads/file.txt")
        );
        assert!(policy.resolve("..").is_err());
        assert!(policy.resolve("").is_err());
    }

    #[test]
    fn result_serializes_to_json() {
        let mut fields = FieldMap::default();
        fields.append("note", "a note").unwrap();

        let result = UploadResult {
            file_paths: vec![PathBuf::from("/uploads/report.txt")],
            fields,
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "file_paths": ["/uploads/report.txt"],
                "fields": { "note": ["a note"] },
            })
        );
    }
}
