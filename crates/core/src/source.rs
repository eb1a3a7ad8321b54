//! Document locators and source validation
//!
//! A locator is a local path (bare or `file://`), a `content://` handle
//! served by a [`ContentResolver`], or an `http(s)://` URL served by a
//! [`RemoteStore`]. Non-file sources are staged into a local file first so
//! the native renderer and the repair scan always read from disk.

use crate::config::SessionConfig;
use crate::error::OpenError;
use quire_repair::RepairStore;
use quire_watchdog::WatchdogHandle;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const SIGNATURE: &[u8] = b"%PDF-";
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const HEAD_BYTES: usize = 1024;
const STAGING_SUFFIX: &str = "partial";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    File(PathBuf),
    /// Any `scheme://` form other than `file://`; the scheme is lowercase
    Uri { scheme: String, uri: String },
}

impl Locator {
    pub fn parse(text: &str) -> Self {
        match text.split_once("://") {
            Some((scheme, rest)) if is_scheme(scheme) => {
                let scheme = scheme.to_ascii_lowercase();
                if scheme == "file" {
                    Self::File(PathBuf::from(rest))
                } else {
                    Self::Uri {
                        scheme,
                        uri: text.to_owned(),
                    }
                }
            }
            _ => Self::File(PathBuf::from(text)),
        }
    }

    pub fn scheme(&self) -> &str {
        match self {
            Self::File(_) => "file",
            Self::Uri { scheme, .. } => scheme,
        }
    }

    /// Last path segment, for logs and MIME guessing
    pub fn display_name(&self) -> String {
        match self {
            Self::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Uri { uri, .. } => {
                let trimmed = uri.split(['?', '#']).next().unwrap_or(uri);
                trimmed
                    .rsplit('/')
                    .find(|segment| !segment.is_empty())
                    .unwrap_or(trimmed)
                    .to_owned()
            }
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Uri { uri, .. } => f.write_str(uri),
        }
    }
}

impl From<&str> for Locator {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<&Path> for Locator {
    fn from(value: &Path) -> Self {
        Self::File(value.to_path_buf())
    }
}

impl From<PathBuf> for Locator {
    fn from(value: PathBuf) -> Self {
        Self::File(value)
    }
}

fn is_scheme(text: &str) -> bool {
    let mut chars = text.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// An opened non-file source
pub struct ByteSource {
    pub reader: Box<dyn Read + Send>,
    pub mime_type: Option<String>,
    pub declared_size: Option<u64>,
    pub name: Option<String>,
}

impl ByteSource {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            mime_type: None,
            declared_size: None,
            name: None,
        }
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Resolves `content://` handles supplied by the host
pub trait ContentResolver: Send + Sync {
    fn open(&self, uri: &str) -> io::Result<ByteSource>;
}

/// Fetches `http(s)://` documents
pub trait RemoteStore: Send + Sync {
    fn open(&self, uri: &str) -> io::Result<ByteSource>;
}

/// A validated source, readable from a local file
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub locator: Locator,
    pub path: PathBuf,
    pub size: u64,
    pub name: String,
    /// `path` is a staged copy owned by the session
    pub staged: bool,
}

impl ResolvedSource {
    /// Remove the staged copy, if any
    pub fn discard(&self) {
        if self.staged {
            remove_quietly(&self.path);
        }
    }
}

/// True if `head` starts with `%PDF-` after an optional UTF-8 BOM and any
/// whitespace or NUL bytes
pub fn has_pdf_signature(head: &[u8]) -> bool {
    let head = head.strip_prefix(UTF8_BOM).unwrap_or(head);
    let start = head
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n' | 0x0C | 0x00))
        .unwrap_or(head.len());
    head[start..].starts_with(SIGNATURE)
}

/// Validates locators and stages non-file sources
pub struct SourceResolver {
    config: SessionConfig,
    staging_dir: PathBuf,
    content: Option<Arc<dyn ContentResolver>>,
    remote: Option<Arc<dyn RemoteStore>>,
    sequence: AtomicU64,
}

impl SourceResolver {
    pub fn new(config: SessionConfig, staging_dir: impl Into<PathBuf>) -> Self {
        let staging_dir = staging_dir.into();
        clean_staging(&staging_dir);
        Self {
            config,
            staging_dir,
            content: None,
            remote: None,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_content_resolver(mut self, resolver: Arc<dyn ContentResolver>) -> Self {
        self.content = Some(resolver);
        self
    }

    pub fn with_remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(store);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Validate `locator` and make it readable from a local file
    ///
    /// Checks run in order: scheme allow-list, MIME type, size ceiling,
    /// signature. The first failure wins.
    pub fn resolve(
        &self,
        locator: &Locator,
        watchdog: &WatchdogHandle,
    ) -> Result<ResolvedSource, OpenError> {
        let scheme = locator.scheme();
        if !self.config.allows_scheme(scheme) {
            return Err(OpenError::Unsupported(format!("scheme {scheme:?} is not allowed")));
        }

        match locator {
            Locator::File(path) => self.resolve_file(locator, path),
            Locator::Uri { scheme, uri } => {
                let opened = match scheme.as_str() {
                    "content" => self.content.as_ref().map(|resolver| resolver.open(uri)),
                    "http" | "https" => self.remote.as_ref().map(|store| store.open(uri)),
                    _ => None,
                };
                let source = opened
                    .ok_or_else(|| {
                        OpenError::Unsupported(format!("no handler for scheme {scheme:?}"))
                    })?
                    .map_err(|err| access_denied(locator, &err))?;
                self.stage(locator, source, watchdog)
            }
        }
    }

    fn resolve_file(&self, locator: &Locator, path: &Path) -> Result<ResolvedSource, OpenError> {
        let metadata = fs::metadata(path).map_err(|err| access_denied(locator, &err))?;
        if !metadata.is_file() {
            return Err(OpenError::AccessDenied(format!("{locator}: not a regular file")));
        }

        let name = locator.display_name();
        self.check_mime(mime_guess::from_path(path).first_raw())?;
        self.check_size(metadata.len())?;

        let mut file = File::open(path).map_err(|err| access_denied(locator, &err))?;
        let head = read_head(&mut file).map_err(|err| access_denied(locator, &err))?;
        if !has_pdf_signature(&head) {
            return Err(OpenError::Corrupted(format!("{locator}: missing %PDF- header")));
        }

        Ok(ResolvedSource {
            locator: locator.clone(),
            path: path.to_path_buf(),
            size: metadata.len(),
            name,
            staged: false,
        })
    }

    fn stage(
        &self,
        locator: &Locator,
        source: ByteSource,
        watchdog: &WatchdogHandle,
    ) -> Result<ResolvedSource, OpenError> {
        let ByteSource {
            mut reader,
            mime_type,
            declared_size,
            name,
        } = source;
        let name = name.unwrap_or_else(|| locator.display_name());

        match mime_type.as_deref() {
            Some(declared) => self.check_mime(Some(essence(declared)))?,
            None => self.check_mime(mime_guess::from_path(&name).first_raw())?,
        }
        if let Some(size) = declared_size {
            self.check_size(size)?;
        }

        fs::create_dir_all(&self.staging_dir).map_err(|err| access_denied(locator, &err))?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let final_path = self.staging_dir.join(format!(
            "{}-{}-{sequence}.pdf",
            RepairStore::key_for(&locator.to_string()),
            std::process::id()
        ));
        let partial_path = final_path.with_extension(format!("pdf.{STAGING_SUFFIX}"));

        let copied = self.copy_chunks(locator, &mut reader, &partial_path, watchdog);
        let size = match copied {
            Ok(size) => size,
            Err(err) => {
                remove_quietly(&partial_path);
                return Err(err);
            }
        };

        let head = File::open(&partial_path).and_then(|mut file| read_head(&mut file));
        match head {
            Ok(head) if has_pdf_signature(&head) => {}
            Ok(_) => {
                remove_quietly(&partial_path);
                return Err(OpenError::Corrupted(format!("{locator}: missing %PDF- header")));
            }
            Err(err) => {
                remove_quietly(&partial_path);
                return Err(access_denied(locator, &err));
            }
        }

        if let Err(err) = fs::rename(&partial_path, &final_path) {
            remove_quietly(&partial_path);
            return Err(access_denied(locator, &err));
        }
        debug!(path = %final_path.display(), size, "staged document");

        Ok(ResolvedSource {
            locator: locator.clone(),
            path: final_path,
            size,
            name,
            staged: true,
        })
    }

    fn copy_chunks(
        &self,
        locator: &Locator,
        reader: &mut dyn Read,
        target: &Path,
        watchdog: &WatchdogHandle,
    ) -> Result<u64, OpenError> {
        let mut file = File::create(target).map_err(|err| access_denied(locator, &err))?;
        let mut buffer = vec![0u8; self.config.download_chunk_bytes.max(1)];
        let ceiling = self.config.max_document_bytes();
        let mut total: u64 = 0;

        loop {
            watchdog.check()?;
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(access_denied(locator, &err)),
            };

            total = total.saturating_add(read as u64);
            if total > ceiling {
                return Err(too_large(total, ceiling));
            }
            file.write_all(&buffer[..read])
                .map_err(|err| access_denied(locator, &err))?;
            watchdog.notify_progress();
        }

        file.sync_all().map_err(|err| access_denied(locator, &err))?;
        Ok(total)
    }

    fn check_mime(&self, mime: Option<&str>) -> Result<(), OpenError> {
        match mime {
            Some(mime) if !self.config.allows_mime(mime) => {
                Err(OpenError::Unsupported(format!("MIME type {mime} is not allowed")))
            }
            _ => Ok(()),
        }
    }

    fn check_size(&self, size: u64) -> Result<(), OpenError> {
        let ceiling = self.config.max_document_bytes();
        if size > ceiling {
            Err(too_large(size, ceiling))
        } else {
            Ok(())
        }
    }
}

fn essence(mime: &str) -> &str {
    mime.split(';').next().unwrap_or(mime).trim()
}

fn too_large(size: u64, ceiling: u64) -> OpenError {
    OpenError::Unsupported(format!("document is {size} bytes, limit is {ceiling}"))
}

fn access_denied(locator: &Locator, err: &io::Error) -> OpenError {
    OpenError::AccessDenied(format!("{locator}: {err}"))
}

fn read_head(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(HEAD_BYTES);
    reader.take(HEAD_BYTES as u64).read_to_end(&mut head)?;
    Ok(head)
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), %err, "failed to remove staged file");
        }
    }
}

fn clean_staging(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == STAGING_SUFFIX) {
            remove_quietly(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_watchdog::{CancelReason, CancellationToken, Watchdog};
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    const PDF: &[u8] = b"%PDF-1.7\n%test\n";

    struct MemoryResolver {
        bytes: Vec<u8>,
        mime: Option<&'static str>,
    }

    impl ContentResolver for MemoryResolver {
        fn open(&self, _uri: &str) -> io::Result<ByteSource> {
            let mut source = ByteSource::new(Cursor::new(self.bytes.clone()));
            if let Some(mime) = self.mime {
                source = source.with_mime_type(mime);
            }
            Ok(source)
        }
    }

    fn resolve_with(
        resolver: &SourceResolver,
        locator: &str,
        token: &CancellationToken,
    ) -> Result<ResolvedSource, OpenError> {
        Watchdog::new(Duration::from_secs(5))
            .supervise(token, |handle| resolver.resolve(&Locator::parse(locator), handle))
    }

    fn resolve(resolver: &SourceResolver, locator: &str) -> Result<ResolvedSource, OpenError> {
        resolve_with(resolver, locator, &CancellationToken::new())
    }

    fn setup() -> (TempDir, SourceResolver) {
        let dir = TempDir::new().unwrap();
        let resolver = SourceResolver::new(SessionConfig::default(), dir.path().join("staging"));
        (dir, resolver)
    }

    fn in_memory(bytes: &[u8], mime: Option<&'static str>) -> Arc<dyn ContentResolver> {
        Arc::new(MemoryResolver {
            bytes: bytes.to_vec(),
            mime,
        })
    }

    #[test]
    fn test_parse_locators() {
        assert_eq!(
            Locator::parse("/tmp/a.pdf"),
            Locator::File(PathBuf::from("/tmp/a.pdf"))
        );
        assert_eq!(
            Locator::parse("FILE:///tmp/a.pdf"),
            Locator::File(PathBuf::from("/tmp/a.pdf"))
        );

        let remote = Locator::parse("HTTPS://example.com/docs/report.pdf?x=1");
        assert_eq!(remote.scheme(), "https");
        assert_eq!(remote.display_name(), "report.pdf");
        assert_eq!(remote.to_string(), "HTTPS://example.com/docs/report.pdf?x=1");
    }

    #[test]
    fn test_signature() {
        assert!(has_pdf_signature(b"%PDF-1.4"));
        assert!(has_pdf_signature(b"\xEF\xBB\xBF%PDF-1.4"));
        assert!(has_pdf_signature(b"\n\r\t \0%PDF-2.0"));
        assert!(!has_pdf_signature(b"PK\x03\x04"));
        assert!(!has_pdf_signature(b"%PDF"));
        assert!(!has_pdf_signature(b""));
    }

    #[test]
    fn test_local_file() {
        let (dir, resolver) = setup();
        let path = dir.path().join("doc.pdf");
        fs::write(&path, PDF).unwrap();

        let resolved = resolve(&resolver, path.to_str().unwrap()).unwrap();
        assert_eq!(resolved.path, path);
        assert_eq!(resolved.size, PDF.len() as u64);
        assert!(!resolved.staged);
    }

    #[test]
    fn test_missing_file_is_access_denied() {
        let (dir, resolver) = setup();
        let path = dir.path().join("nope.pdf");

        let err = resolve(&resolver, path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, OpenError::AccessDenied(_)));
    }

    #[test]
    fn test_wrong_extension_is_unsupported() {
        let (dir, resolver) = setup();
        let path = dir.path().join("notes.txt");
        fs::write(&path, PDF).unwrap();

        let err = resolve(&resolver, path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, OpenError::Unsupported(_)));
    }

    #[test]
    fn test_bad_signature_is_corrupted() {
        let (dir, resolver) = setup();
        let path = dir.path().join("fake.pdf");
        fs::write(&path, b"<html>not a pdf</html>").unwrap();

        let err = resolve(&resolver, path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, OpenError::Corrupted(_)));
    }

    #[test]
    fn test_size_ceiling() {
        let dir = TempDir::new().unwrap();
        let config = SessionConfig {
            max_document_mb: 0,
            ..SessionConfig::default()
        };
        let resolver = SourceResolver::new(config, dir.path().join("staging"));
        let path = dir.path().join("doc.pdf");
        fs::write(&path, PDF).unwrap();

        let err = resolve(&resolver, path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, OpenError::Unsupported(_)));
    }

    #[test]
    fn test_disallowed_scheme() {
        let (_dir, resolver) = setup();

        let err = resolve(&resolver, "ftp://example.com/a.pdf").unwrap_err();
        assert!(matches!(err, OpenError::Unsupported(_)));
    }

    #[test]
    fn test_content_without_resolver() {
        let (_dir, resolver) = setup();

        let err = resolve(&resolver, "content://docs/1").unwrap_err();
        assert!(matches!(err, OpenError::Unsupported(_)));
    }

    #[test]
    fn test_content_is_staged() {
        let (dir, resolver) = setup();
        let resolver = resolver.with_content_resolver(in_memory(PDF, Some("application/pdf")));

        let resolved = resolve(&resolver, "content://docs/1").unwrap();
        assert!(resolved.staged);
        assert!(resolved.path.starts_with(dir.path().join("staging")));
        assert_eq!(fs::read(&resolved.path).unwrap(), PDF);

        resolved.discard();
        assert!(!resolved.path.exists());
    }

    #[test]
    fn test_content_with_wrong_mime() {
        let (_dir, resolver) = setup();
        let resolver =
            resolver.with_content_resolver(in_memory(PDF, Some("image/png; charset=binary")));

        let err = resolve(&resolver, "content://docs/1").unwrap_err();
        assert!(matches!(err, OpenError::Unsupported(_)));
    }

    #[test]
    fn test_staged_garbage_is_removed() {
        let (dir, resolver) = setup();
        let resolver = resolver.with_content_resolver(in_memory(b"garbage", None));

        let err = resolve(&resolver, "content://docs/1").unwrap_err();
        assert!(matches!(err, OpenError::Corrupted(_)));
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_cancelled_staging_leaves_nothing() {
        let (dir, resolver) = setup();
        let resolver = resolver.with_content_resolver(in_memory(PDF, None));
        let token = CancellationToken::new();
        token.cancel();

        let err = resolve_with(&resolver, "content://docs/1", &token).unwrap_err();
        assert!(matches!(err, OpenError::Cancelled(CancelReason::Caller)));
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }
}
