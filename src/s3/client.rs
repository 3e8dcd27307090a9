//! Storage client façade
//!
//! [`StorageClient`] owns a [`Transport`] handle and the effective region and
//! exposes the operations callers use: object reads (optionally ranged) and
//! metadata, verified writes, copies, deletes, paginated listings, region
//! resolution and presigned URLs.
//!
//! Every call snapshots the region when it builds its request, so
//! [`set_region`](StorageClient::set_region) only affects calls started
//! afterwards. Calls never retry; the one exception is the corrective retry
//! in region resolution.

use crate::perf::{Operation, StatSink, StatTimer};
use crate::s3::error::{ProviderError, Result, StorageError};
use crate::s3::listing::{self, ListItem, ListingKind, ListingPage};
use crate::s3::region::normalize_region;
use crate::s3::signer::S3SignerV4;
use crate::s3::transport::{HttpRequest, HttpResponse, Transport};
use crate::s3::types::{
    header_str, ByteRange, CopyOutcome, ListOptions, ObjectContent, ObjectLocator,
    ObjectMetadata, ObjectSummary, VersionSummary, WriteOutcome, WriteRequest,
    USER_METADATA_PREFIX,
};
use crate::s3::xml;
use hyper::{Method, StatusCode};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// S3-compatible storage client
pub struct StorageClient {
    transport: Arc<dyn Transport>,
    region: RwLock<String>,
    stats: Option<Arc<dyn StatSink>>,
}

impl StorageClient {
    /// Create a client. `None` or a legacy alias region is normalized.
    pub fn new(transport: Arc<dyn Transport>, region: Option<&str>) -> Self {
        Self {
            transport,
            region: RwLock::new(normalize_region(region.unwrap_or(""))),
            stats: None,
        }
    }

    /// Time every call of this client into `sink`
    pub fn with_stats(mut self, sink: Arc<dyn StatSink>) -> Self {
        self.stats = Some(sink);
        self
    }

    /// A client sharing this one's transport and current region, without stats
    pub fn unmeasured(&self) -> StorageClient {
        StorageClient {
            transport: self.transport.clone(),
            region: RwLock::new(self.region()),
            stats: None,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Current effective region
    pub fn region(&self) -> String {
        self.region
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Switch the region used by subsequent calls
    pub fn set_region(&self, region: &str) {
        let mut timer = self.timer(Operation::SetRegion, "", None);
        self.store_region(region);
        timer.succeeded(None);
    }

    /// Untimed region switch, for corrections made inside another operation
    pub(crate) fn store_region(&self, region: &str) {
        let region = normalize_region(region);
        let mut current = self
            .region
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != region {
            tracing::info!(from = %current, to = %region, "switching region");
            *current = region;
        }
    }

    pub(crate) fn timer(&self, operation: Operation, bucket: &str, key: Option<&str>) -> StatTimer {
        StatTimer::start(self.stats.clone(), operation, bucket, key)
    }

    /// A request bound to the region in effect right now
    pub(crate) fn request(&self, method: Method, bucket: &str) -> HttpRequest {
        HttpRequest::new(method, self.region(), bucket)
    }

    pub(crate) async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.transport.execute(request).await
    }

    fn object_request(&self, method: Method, locator: &ObjectLocator) -> HttpRequest {
        let mut request = self.request(method, &locator.bucket).key(locator.key.clone());
        if let Some(version) = &locator.version_id {
            request = request.query("versionId", version.clone());
        }
        request
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// GET an object, optionally only the inclusive `range`.
    ///
    /// A ranged read must come back as 206 with a `Content-Range` that
    /// starts where asked and matches the body length.
    pub async fn read_object(
        &self,
        locator: &ObjectLocator,
        range: Option<ByteRange>,
        timeout: Option<Duration>,
    ) -> Result<ObjectContent> {
        let mut timer = self.timer(Operation::GetObject, &locator.bucket, Some(&locator.key));

        let mut request = self.object_request(Method::GET, locator).timeout(timeout);
        if let Some(range) = &range {
            request = request.header("range", range.header_value());
        }
        let response = self.send(request).await?;

        if let Some(range) = range {
            verify_content_range(&range, &response)?;
        }
        let metadata = ObjectMetadata::from_headers(&response.headers)?;
        timer.succeeded(Some(response.body.len() as u64));

        Ok(ObjectContent {
            metadata,
            body: response.body,
        })
    }

    /// HEAD an object (a specific version when the locator carries one)
    pub async fn read_object_metadata(&self, locator: &ObjectLocator) -> Result<ObjectMetadata> {
        let mut timer = self.timer(Operation::GetObjectMetadata, &locator.bucket, Some(&locator.key));
        let metadata = self.head(locator).await?;
        timer.succeeded(Some(metadata.content_length));
        Ok(metadata)
    }

    async fn head(&self, locator: &ObjectLocator) -> Result<ObjectMetadata> {
        let response = self.send(self.object_request(Method::HEAD, locator)).await?;
        ObjectMetadata::from_headers(&response.headers)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Upload an object, then confirm the write by reading its metadata back.
    ///
    /// The content source is reopened here; a source that hands back the
    /// stream it produced when the request was built is rejected before any
    /// request is sent. The metadata read uses the version id the provider
    /// returned; a different version reported back is a
    /// [`StorageError::ConsistencyViolation`].
    pub async fn write_object(&self, write: &WriteRequest) -> Result<WriteOutcome> {
        let body = write.load_content()?;

        let mut request = self
            .request(Method::PUT, write.bucket())
            .key(write.key())
            .header("content-length", write.content_length().to_string())
            .timeout(write.timeout());
        for (name, value) in write.user_metadata().iter() {
            request = request.header(&format!("{}{}", USER_METADATA_PREFIX, name), value);
        }
        let request = request.body(body);

        let response = {
            let mut timer = self.timer(Operation::PutObject, write.bucket(), Some(write.key()));
            let response = self.send(request).await?;
            timer.succeeded(Some(write.content_length()));
            response
        };

        let version_id = header_str(&response.headers, "x-amz-version-id")
            .filter(|v| !v.is_empty() && *v != "null")
            .map(str::to_string);
        let etag = header_str(&response.headers, "etag")
            .map(|e| e.trim_matches('"').to_string())
            .unwrap_or_default();

        let mut locator = ObjectLocator::new(write.bucket(), write.key());
        if let Some(version) = &version_id {
            locator = locator.with_version(version.clone());
        }
        let observed = self.head(&locator).await?;

        if let Some(written) = &version_id {
            let matches = observed
                .version_id
                .as_deref()
                .is_some_and(|seen| seen.eq_ignore_ascii_case(written));
            if !matches {
                return Err(StorageError::ConsistencyViolation(format!(
                    "wrote {} as version {} but read back version {}",
                    locator,
                    written,
                    observed.version_id.as_deref().unwrap_or("<none>")
                )));
            }
        }

        tracing::info!(
            bucket = %write.bucket(),
            key = %write.key(),
            bytes = observed.content_length,
            version_id = version_id.as_deref().unwrap_or(""),
            "put object verified"
        );
        Ok(WriteOutcome { version_id, etag })
    }

    /// Server-side copy of `source` (exactly `source.version_id` when set)
    pub async fn copy_object(
        &self,
        source: &ObjectLocator,
        dest: &ObjectLocator,
    ) -> Result<CopyOutcome> {
        let request = self.copy_request(source, dest);
        self.execute_copy(request, dest).await
    }

    /// Server-side copy that replaces the destination's metadata with the
    /// replayable part of `metadata` (typically read from the source).
    pub async fn copy_object_with_metadata(
        &self,
        source: &ObjectLocator,
        dest: &ObjectLocator,
        metadata: &ObjectMetadata,
    ) -> Result<CopyOutcome> {
        let mut request = self
            .copy_request(source, dest)
            .header("x-amz-metadata-directive", "REPLACE");
        for (name, value) in metadata.provider_metadata.replay_headers() {
            request = request.header(&name, value);
        }
        self.execute_copy(request, dest).await
    }

    fn copy_request(&self, source: &ObjectLocator, dest: &ObjectLocator) -> HttpRequest {
        let mut copy_source = format!(
            "/{}/{}",
            source.bucket,
            S3SignerV4::uri_encode(&source.key, false)
        );
        if let Some(version) = &source.version_id {
            copy_source.push_str("?versionId=");
            copy_source.push_str(&S3SignerV4::uri_encode(version, true));
        }
        self.request(Method::PUT, &dest.bucket)
            .key(dest.key.clone())
            .header("x-amz-copy-source", copy_source)
    }

    async fn execute_copy(&self, request: HttpRequest, dest: &ObjectLocator) -> Result<CopyOutcome> {
        let mut timer = self.timer(Operation::CopyObject, &dest.bucket, Some(&dest.key));
        let response = self.send(request).await?;

        // A copy may fail after the 200 status line went out
        let etag = match xml::parse_copy_result(&response.body)? {
            Ok(etag) => etag,
            Err(doc) => {
                return Err(ProviderError {
                    status: StatusCode::OK,
                    code: doc.code,
                    message: doc.message,
                    request_id: doc.request_id,
                    details: doc.details,
                }
                .into())
            }
        };
        let version_id = header_str(&response.headers, "x-amz-version-id")
            .filter(|v| !v.is_empty() && *v != "null")
            .map(str::to_string);
        timer.succeeded(None);
        Ok(CopyOutcome { version_id, etag })
    }

    // =========================================================================
    // Single deletes
    // =========================================================================

    /// Delete one object, or one version of it
    pub async fn delete_object(&self, locator: &ObjectLocator) -> Result<()> {
        let mut timer = self.timer(Operation::DeleteObject, &locator.bucket, Some(&locator.key));
        self.send(self.object_request(Method::DELETE, locator)).await?;
        timer.succeeded(Some(1));
        Ok(())
    }

    // =========================================================================
    // Listings
    // =========================================================================

    /// Flat listing (ListObjects v1) of everything under `prefix`
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        options: &ListOptions,
    ) -> Result<Vec<ObjectSummary>> {
        self.list(ListingKind::Objects, Operation::ListObjects, bucket, prefix, options, xml::parse_list_v1)
            .await
    }

    /// ListObjectsV2 of everything under `prefix`
    pub async fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        options: &ListOptions,
    ) -> Result<Vec<ObjectSummary>> {
        self.list(ListingKind::ObjectsV2, Operation::ListObjectsV2, bucket, prefix, options, xml::parse_list_v2)
            .await
    }

    /// Every version and delete marker under `prefix`
    pub async fn list_versions(
        &self,
        bucket: &str,
        prefix: &str,
        options: &ListOptions,
    ) -> Result<Vec<VersionSummary>> {
        self.list(ListingKind::Versions, Operation::ListVersions, bucket, prefix, options, xml::parse_list_versions)
            .await
    }

    async fn list<T: ListItem>(
        &self,
        kind: ListingKind,
        operation: Operation,
        bucket: &str,
        prefix: &str,
        options: &ListOptions,
        parse: fn(&[u8]) -> Result<ListingPage<T>>,
    ) -> Result<Vec<T>> {
        listing::validate_options(options)?;
        let mut timer = self.timer(operation, bucket, Some(prefix));

        let region = self.region();
        let items = listing::paginate(kind, move |cursor| {
            let mut request = HttpRequest::new(Method::GET, region.clone(), bucket);
            request.query = listing::list_query(kind, prefix, options, cursor.as_ref());
            async move {
                let response = self.send(request).await?;
                parse(&response.body)
            }
        })
        .await?;

        timer.succeeded(Some(items.len() as u64));
        Ok(items)
    }
}

/// Check a ranged GET against what was asked for
fn verify_content_range(range: &ByteRange, response: &HttpResponse) -> Result<()> {
    let header = header_str(&response.headers, "content-range").ok_or_else(|| {
        StorageError::ConsistencyViolation(format!(
            "ranged read {} answered {} without Content-Range",
            range.header_value(),
            response.status
        ))
    })?;
    let (start, end, _total) = parse_content_range(header).ok_or_else(|| {
        StorageError::InvalidResponse(format!("malformed Content-Range {:?}", header))
    })?;

    let body_len = response.body.len() as u64;
    let within = range.end.map_or(true, |asked_end| end <= asked_end);
    if start != range.start || !within || end + 1 - start != body_len {
        return Err(StorageError::ConsistencyViolation(format!(
            "asked for {}, got Content-Range {} with {} bytes",
            range.header_value(),
            header,
            body_len
        )));
    }
    Ok(())
}

/// `bytes <start>-<end>/<total|*>`
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = spec.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}
