//! Value types exchanged with the storage client

use crate::s3::error::{Result, StorageError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::header::HeaderMap;
use hyper::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Prefix of user metadata headers
pub const USER_METADATA_PREFIX: &str = "x-amz-meta-";

/// Identifies exactly one object, or one version of it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocator {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
}

impl ObjectLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
        }
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)?;
        if let Some(v) = &self.version_id {
            write!(f, "?versionId={}", v)?;
        }
        Ok(())
    }
}

/// User metadata with case-insensitive keys, iterated in key order.
///
/// Keys are stored lowercased, which is also how they travel on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata(BTreeMap<String, String>);

impl UserMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Collect every `x-amz-meta-*` header
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut meta = Self::new();
        for (name, value) in headers {
            if let Some(key) = name.as_str().strip_prefix(USER_METADATA_PREFIX) {
                if let Ok(v) = value.to_str() {
                    meta.insert(key, v);
                }
            }
        }
        meta
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for UserMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut meta = Self::new();
        for (k, v) in iter {
            meta.insert(k.as_ref(), v);
        }
        meta
    }
}

/// Raw response headers of the read that produced an [`ObjectMetadata`].
///
/// Kept verbatim so a copy can replay provider-specific fields without the
/// client having to understand them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderMetadata(HeaderMap);

impl ProviderMetadata {
    pub fn headers(&self) -> &HeaderMap {
        &self.0
    }
}

/// Headers that describe one stored object representation and are safe to replay on copy
const REPLAYABLE_HEADERS: &[&str] = &[
    "cache-control",
    "content-disposition",
    "content-encoding",
    "content-language",
    "content-type",
    "expires",
    "x-amz-storage-class",
    "x-amz-website-redirect-location",
];

impl ProviderMetadata {
    /// Headers to send with a `REPLACE` metadata directive copy
    pub(crate) fn replay_headers(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (name, value) in &self.0 {
            let name = name.as_str();
            if REPLAYABLE_HEADERS.contains(&name) || name.starts_with(USER_METADATA_PREFIX) {
                if let Ok(v) = value.to_str() {
                    out.insert(name.to_string(), v.to_string());
                }
            }
        }
        out
    }
}

/// Metadata of one stored object version
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMetadata {
    pub content_length: u64,
    pub etag: String,
    pub version_id: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub user_metadata: UserMetadata,
    pub provider_metadata: ProviderMetadata,
}

impl ObjectMetadata {
    /// Build metadata from GET/HEAD response headers
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let content_length = header_str(headers, "content-length")
            .map(|v| {
                v.parse::<u64>().map_err(|_| {
                    StorageError::InvalidResponse(format!("Bad Content-Length: {}", v))
                })
            })
            .transpose()?
            .unwrap_or(0);

        let last_modified = header_str(headers, "last-modified")
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|d| d.with_timezone(&Utc));

        Ok(Self {
            content_length,
            etag: header_str(headers, "etag")
                .map(|e| e.trim_matches('"').to_string())
                .unwrap_or_default(),
            version_id: header_str(headers, "x-amz-version-id")
                .filter(|v| !v.is_empty() && *v != "null")
                .map(str::to_string),
            last_modified,
            user_metadata: UserMetadata::from_headers(headers),
            provider_metadata: ProviderMetadata(headers.clone()),
        })
    }
}

impl fmt::Display for ObjectMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObjectMetadata {{ content_length: {}, etag: {}, version_id: {}, last_modified: {} }}",
            self.content_length,
            self.etag,
            self.version_id.as_deref().unwrap_or("-"),
            self.last_modified.map(|d| d.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
        )
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Inclusive byte range for ranged reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Bytes `start..=end`
    pub fn closed(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(StorageError::validation(format!(
                "range end {} is before start {}",
                end, start
            )));
        }
        Ok(Self { start, end: Some(end) })
    }

    /// Bytes from `start` to the end of the object
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    pub(crate) fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Object bytes plus the metadata of the read that produced them
#[derive(Debug, Clone)]
pub struct ObjectContent {
    pub metadata: ObjectMetadata,
    pub body: Bytes,
}

// =============================================================================
// Writes
// =============================================================================

/// A readable handle produced by a [`ContentSource`].
///
/// Clones share the underlying reader, so two handles can be compared by
/// identity with [`ContentStream::same_as`].
#[derive(Clone)]
pub struct ContentStream(Arc<Mutex<Box<dyn Read + Send>>>);

impl ContentStream {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(reader))))
    }

    /// True when both handles wrap the same reader instance
    pub fn same_as(&self, other: &ContentStream) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Drain the stream, failing unless it yields exactly `expected` bytes
    pub(crate) fn read_exact_len(&self, expected: u64) -> Result<Bytes> {
        let mut reader = self
            .0
            .lock()
            .map_err(|_| StorageError::validation("content stream lock poisoned"))?;
        let mut buf = Vec::with_capacity(expected.min(64 * 1024 * 1024) as usize);
        // One extra byte is enough to detect a stream longer than declared
        let read = reader.by_ref().take(expected.saturating_add(1)).read_to_end(&mut buf)? as u64;
        if read != expected {
            return Err(StorageError::validation(format!(
                "content stream length does not match declared content length {}",
                expected
            )));
        }
        Ok(Bytes::from(buf))
    }
}

impl fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentStream({:p})", Arc::as_ptr(&self.0))
    }
}

/// Factory for the bytes of a write.
///
/// Every call to [`open`](ContentSource::open) must return a brand-new stream
/// positioned at the beginning of the content.
pub trait ContentSource: Send + Sync {
    fn open(&self) -> std::io::Result<ContentStream>;
}

impl<F> ContentSource for F
where
    F: Fn() -> std::io::Result<ContentStream> + Send + Sync,
{
    fn open(&self) -> std::io::Result<ContentStream> {
        self()
    }
}

/// In-memory content
#[derive(Debug, Clone)]
pub struct BytesSource(pub Bytes);

impl ContentSource for BytesSource {
    fn open(&self) -> std::io::Result<ContentStream> {
        Ok(ContentStream::new(std::io::Cursor::new(self.0.clone())))
    }
}

/// Content read from a local file, reopened on every call
#[derive(Debug, Clone)]
pub struct FileSource(pub PathBuf);

impl ContentSource for FileSource {
    fn open(&self) -> std::io::Result<ContentStream> {
        Ok(ContentStream::new(std::fs::File::open(&self.0)?))
    }
}

/// A validated single-object upload
pub struct WriteRequest {
    bucket: String,
    key: String,
    source: Arc<dyn ContentSource>,
    first_stream: ContentStream,
    content_length: u64,
    timeout: Option<Duration>,
    user_metadata: UserMetadata,
}

/// Optional parts of a [`WriteRequest`]
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub timeout: Option<Duration>,
    pub user_metadata: UserMetadata,
}

impl WriteRequest {
    /// Validate and build a write.
    ///
    /// The source is opened once here; the handle is kept so a source that
    /// hands the same stream back at write time is caught before any request.
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        source: Arc<dyn ContentSource>,
        content_length: u64,
        options: WriteOptions,
    ) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(StorageError::validation("object key may not be blank"));
        }
        let first_stream = source.open()?;
        Ok(Self {
            bucket: bucket.into(),
            key,
            source,
            first_stream,
            content_length,
            timeout: options.timeout,
            user_metadata: options.user_metadata,
        })
    }

    /// Upload a local file, taking its length from the filesystem
    pub fn from_file(
        bucket: impl Into<String>,
        key: impl Into<String>,
        path: impl Into<PathBuf>,
        options: WriteOptions,
    ) -> Result<Self> {
        let path = path.into();
        let len = std::fs::metadata(&path)?.len();
        Self::new(bucket, key, Arc::new(FileSource(path)), len, options)
    }

    /// Upload in-memory bytes
    pub fn from_bytes(
        bucket: impl Into<String>,
        key: impl Into<String>,
        data: impl Into<Bytes>,
        options: WriteOptions,
    ) -> Result<Self> {
        let data = data.into();
        let len = data.len() as u64;
        Self::new(bucket, key, Arc::new(BytesSource(data)), len, options)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn user_metadata(&self) -> &UserMetadata {
        &self.user_metadata
    }

    /// Open a fresh stream and read the whole payload
    pub(crate) fn load_content(&self) -> Result<Bytes> {
        let stream = self.source.open()?;
        if stream.same_as(&self.first_stream) {
            return Err(StorageError::validation(
                "content source returned a stream that was already handed out",
            ));
        }
        stream.read_exact_len(self.content_length)
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("content_length", &self.content_length)
            .field("timeout", &self.timeout)
            .field("user_metadata", &self.user_metadata)
            .finish()
    }
}

/// Result of a verified write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub version_id: Option<String>,
    pub etag: String,
}

/// Result of a server-side copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub version_id: Option<String>,
    pub etag: String,
}

// =============================================================================
// Listing
// =============================================================================

/// One row of a flat listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: Option<String>,
    pub storage_class: Option<String>,
}

impl ObjectSummary {
    pub fn new(key: String, size: u64) -> Self {
        Self {
            key,
            size,
            etag: String::new(),
            last_modified: None,
            storage_class: None,
        }
    }
}

/// One row of a version listing (object versions and delete markers)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub key: String,
    pub version_id: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: Option<String>,
    pub is_latest: bool,
    pub is_delete_marker: bool,
}

impl VersionSummary {
    pub fn new(key: String, is_delete_marker: bool) -> Self {
        Self {
            key,
            version_id: String::new(),
            size: 0,
            etag: String::new(),
            last_modified: None,
            is_latest: false,
            is_delete_marker,
        }
    }
}

/// Knobs shared by every listing protocol
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Upper bound on items per round trip; never bounds the total
    pub page_size: Option<u32>,
    /// Ask the provider to url-encode keys in the response
    pub url_encoding: bool,
}

impl ListOptions {
    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn url_encoded(mut self) -> Self {
        self.url_encoding = true;
        self
    }
}

// =============================================================================
// Deletes
// =============================================================================

/// Request to delete one object, or one specific version of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteSpec {
    key: String,
    version_id: Option<String>,
}

impl DeleteSpec {
    pub fn new(key: impl Into<String>, version_id: Option<String>) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(StorageError::validation("delete key may not be blank"));
        }
        Ok(Self { key, version_id })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version_id(&self) -> Option<&str> {
        self.version_id.as_deref()
    }
}

// =============================================================================
// Presigned URLs
// =============================================================================

/// Lifetime used when the caller does not pick one
pub const DEFAULT_PRESIGN_LIFETIME: Duration = Duration::from_secs(3600);

/// What a presigned URL grants access to
#[derive(Debug, Clone)]
pub struct PresignedUrlSpec {
    pub bucket: String,
    pub key: String,
    pub method: Method,
    /// `None` means [`DEFAULT_PRESIGN_LIFETIME`]; zero yields an already expired URL
    pub lifetime: Option<Duration>,
    pub content_type: Option<String>,
    pub response_content_encoding: Option<String>,
}

impl PresignedUrlSpec {
    /// A GET URL with the default lifetime
    pub fn get(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            method: Method::GET,
            lifetime: None,
            content_type: None,
            response_content_encoding: None,
        }
    }

    pub fn effective_lifetime(&self) -> Duration {
        self.lifetime.unwrap_or(DEFAULT_PRESIGN_LIFETIME)
    }
}
