//! In-memory S3 endpoint for integration tests
//!
//! `FakeS3` implements [`Transport`] directly, so requests never touch the
//! network. Every request is recorded. Error responses are rendered as S3
//! error documents and decoded through the same path the real transport
//! uses, so tests observe exactly what a provider failure looks like.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode};
use quick_xml::events::Event;
use quick_xml::Reader;
use s3compat::s3::transport::provider_error;
use s3compat::s3::{
    HttpRequest, HttpResponse, HyperTransport, Result, StorageClient, StorageError, Transport,
    TransportOptions,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FAKE_ENDPOINT: &str = "http://fake.local";
pub const LAST_MODIFIED: &str = "Wed, 21 Oct 2026 07:28:00 GMT";
pub const LIST_TIMESTAMP: &str = "2026-10-21T07:28:00.000Z";

/// Provider behaviours tests can switch on
#[derive(Debug, Clone)]
pub struct Modes {
    /// HEAD reports a different version than the one written
    pub lie_about_versions: bool,
    /// PUT reports the version id upper-cased; HEAD reports it as stored
    pub shout_version_ids: bool,
    /// Copies answer 200 with an `<Error>` document
    pub copy_error_body: bool,
    /// v1 listings include `NextMarker` (real S3 only does with a delimiter)
    pub v1_next_marker: bool,
    /// v1 listings repeat the same `NextMarker` forever
    pub stuck_marker: bool,
    /// Keys every delete of is refused with AccessDenied
    pub refuse_keys: HashSet<String>,
    /// Requests hang until their timeout fires
    pub stall: bool,
    /// Provider-side cap on keys per listing page
    pub max_page: usize,
    /// `EncodingType` to report instead of the requested one
    pub force_encoding_type: Option<String>,
    /// The nth request (1-based) with this method answers 503 SlowDown
    pub fail_nth: Option<(Method, usize)>,
    /// Region to name in mismatch errors instead of the bucket's own
    pub region_hint: Option<String>,
}

impl Default for Modes {
    fn default() -> Self {
        Self {
            lie_about_versions: false,
            shout_version_ids: false,
            copy_error_body: false,
            v1_next_marker: false,
            stuck_marker: false,
            refuse_keys: HashSet::new(),
            stall: false,
            max_page: 1000,
            force_encoding_type: None,
            fail_nth: None,
            region_hint: None,
        }
    }
}

#[derive(Debug, Clone)]
struct FakeVersion {
    version_id: String,
    data: Bytes,
    etag: String,
    metadata: BTreeMap<String, String>,
    delete_marker: bool,
}

#[derive(Debug, Default)]
struct FakeBucket {
    region: String,
    location_constraint: String,
    versioned: bool,
    /// Versions oldest first
    objects: BTreeMap<String, Vec<FakeVersion>>,
}

impl FakeBucket {
    fn latest(&self, key: &str) -> Option<&FakeVersion> {
        self.objects.get(key).and_then(|versions| versions.last())
    }

    fn find(&self, key: &str, version_id: Option<&str>) -> Option<&FakeVersion> {
        match version_id {
            Some(v) => self
                .objects
                .get(key)?
                .iter()
                .find(|fv| fv.version_id.eq_ignore_ascii_case(v)),
            None => self.latest(key).filter(|fv| !fv.delete_marker),
        }
    }

    /// Keys whose latest version is not a delete marker
    fn live_keys(&self) -> Vec<&String> {
        self.objects
            .iter()
            .filter(|(_, versions)| versions.last().is_some_and(|v| !v.delete_marker))
            .map(|(k, _)| k)
            .collect()
    }
}

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, FakeBucket>,
    requests: Vec<HttpRequest>,
    next_version: u64,
    modes: Modes,
}

impl State {
    fn new_version_id(&mut self, versioned: bool) -> String {
        if !versioned {
            return "null".to_string();
        }
        self.next_version += 1;
        format!("v{:06}", self.next_version)
    }
}

pub struct FakeS3 {
    state: Mutex<State>,
    signer: HyperTransport,
}

impl FakeS3 {
    pub fn new() -> Arc<Self> {
        let signer = HyperTransport::new(
            FAKE_ENDPOINT,
            "AKIDEXAMPLE".to_string(),
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            TransportOptions::default(),
        )
        .unwrap();
        Arc::new(Self {
            state: Mutex::new(State::default()),
            signer,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_bucket(&self, name: &str, region: &str, versioned: bool) {
        let location_constraint = if region == "us-east-1" {
            String::new()
        } else {
            region.to_string()
        };
        self.lock().buckets.insert(
            name.to_string(),
            FakeBucket {
                region: region.to_string(),
                location_constraint,
                versioned,
                objects: BTreeMap::new(),
            },
        );
    }

    /// What `?location` reports, e.g. the legacy `EU`
    pub fn set_location_constraint(&self, bucket: &str, value: &str) {
        if let Some(b) = self.lock().buckets.get_mut(bucket) {
            b.location_constraint = value.to_string();
        }
    }

    pub fn modes(&self, f: impl FnOnce(&mut Modes)) {
        f(&mut self.lock().modes);
    }

    /// Store an object directly, returning its version id
    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) -> String {
        let mut state = self.lock();
        let versioned = state.buckets[bucket].versioned;
        let version_id = state.new_version_id(versioned);
        let data = data.into();
        let version = FakeVersion {
            version_id: version_id.clone(),
            etag: format!("{:x}", md5::compute(&data)),
            data,
            metadata: BTreeMap::new(),
            delete_marker: false,
        };
        store(state.buckets.get_mut(bucket).unwrap(), key, version);
        version_id
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Recorded requests carrying query parameter `name`
    pub fn count_with_query(&self, name: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.has_query(name))
            .count()
    }

    pub fn count_method(&self, method: &Method) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.method == *method)
            .count()
    }

    pub fn live_keys(&self, bucket: &str) -> Vec<String> {
        self.lock().buckets[bucket]
            .live_keys()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Versions plus delete markers held for `bucket`
    pub fn version_count(&self, bucket: &str) -> usize {
        self.lock().buckets[bucket]
            .objects
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn object_data(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock().buckets[bucket].find(key, None).map(|v| v.data.clone())
    }

    pub fn object_metadata(&self, bucket: &str, key: &str) -> BTreeMap<String, String> {
        self.lock().buckets[bucket]
            .find(key, None)
            .map(|v| v.metadata.clone())
            .unwrap_or_default()
    }

    fn handle(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, Fault> {
        let mut state = self.lock();
        state.requests.push(request.clone());

        if let Some((method, nth)) = &state.modes.fail_nth {
            let seen = state.requests.iter().filter(|r| r.method == *method).count();
            if request.method == *method && seen == *nth {
                return Err(Fault::new(StatusCode::SERVICE_UNAVAILABLE, "SlowDown", "Please reduce your request rate."));
            }
        }

        let Some(bucket) = state.buckets.get(&request.bucket) else {
            return Err(Fault::new(StatusCode::NOT_FOUND, "NoSuchBucket", "The specified bucket does not exist"));
        };
        if bucket.region != request.region {
            let hint = state.modes.region_hint.clone().unwrap_or_else(|| bucket.region.clone());
            return Err(Fault::new(
                StatusCode::BAD_REQUEST,
                "AuthorizationHeaderMalformed",
                format!(
                    "the region '{}' is wrong; expecting '{}'",
                    request.region, bucket.region
                ),
            )
            .detail("Region", &hint));
        }

        match (&request.method, request.key.as_deref()) {
            (&Method::GET, None) if request.has_query("location") => Ok(location(bucket)),
            (&Method::GET, None) if request.has_query("versions") => {
                list_versions(bucket, request, &state.modes)
            }
            (&Method::GET, None) if request.query_value("list-type") == Some("2") => {
                list_objects(bucket, request, &state.modes, true)
            }
            (&Method::GET, None) => list_objects(bucket, request, &state.modes, false),
            (&Method::POST, None) if request.has_query("delete") => {
                let modes = state.modes.clone();
                let bucket = state.buckets.get_mut(&request.bucket).unwrap();
                multi_delete(bucket, request, &modes)
            }
            (&Method::GET, Some(key)) => get_object(bucket, key, request),
            (&Method::HEAD, Some(key)) => head_object(bucket, key, request, &state.modes),
            (&Method::PUT, Some(key)) if request.header_value("x-amz-copy-source").is_some() => {
                copy_object(&mut state, key, request)
            }
            (&Method::PUT, Some(key)) => put_object(&mut state, key, request),
            (&Method::DELETE, Some(key)) => {
                let modes = state.modes.clone();
                let versioned = bucket.versioned;
                let marker_id = state.new_version_id(versioned);
                let bucket = state.buckets.get_mut(&request.bucket).unwrap();
                delete_object(bucket, key, request, &modes, marker_id)
            }
            _ => Err(Fault::new(StatusCode::NOT_IMPLEMENTED, "NotImplemented", "unsupported request")),
        }
    }
}

#[async_trait]
impl Transport for FakeS3 {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        if self.lock().modes.stall {
            let timeout = request.timeout.unwrap_or(Duration::from_secs(300));
            self.lock().requests.push(request.clone());
            return match tokio::time::timeout(timeout, tokio::time::sleep(Duration::from_secs(86_400))).await {
                Ok(()) => Err(StorageError::Transport("stalled request finished".to_string())),
                Err(_) => Err(StorageError::Timeout(timeout)),
            };
        }
        match self.handle(&request) {
            Ok(response) => Ok(response),
            Err(fault) => Err(fault.into_error(&request).into()),
        }
    }

    fn presign(
        &self,
        request: &HttpRequest,
        issued_at: DateTime<Utc>,
        expires_in: Duration,
    ) -> Result<String> {
        self.signer.presign(request, issued_at, expires_in)
    }
}

/// A client over `fake` signing for `region`
pub fn client(fake: &Arc<FakeS3>, region: &str) -> StorageClient {
    StorageClient::new(fake.clone(), Some(region))
}

// ============================================================================
// Presigned URL helpers
// ============================================================================

/// Query parameter `name` of `url`, still encoded
pub fn url_param<'a>(url: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

/// Whether the endpoint would still honour `url` at `at`
pub fn presigned_url_valid_at(url: &str, at: DateTime<Utc>) -> bool {
    let date = url_param(url, "X-Amz-Date").unwrap();
    let expires: i64 = url_param(url, "X-Amz-Expires").unwrap().parse().unwrap();
    let issued = chrono::NaiveDateTime::parse_from_str(date, "%Y%m%dT%H%M%SZ")
        .unwrap()
        .and_utc();
    at < issued + chrono::Duration::seconds(expires)
}

// ============================================================================
// Request handlers
// ============================================================================

struct Fault {
    status: StatusCode,
    code: String,
    message: String,
    details: Vec<(String, String)>,
}

impl Fault {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: Vec::new(),
        }
    }

    fn detail(mut self, name: &str, value: &str) -> Self {
        self.details.push((name.to_string(), value.to_string()));
        self
    }

    fn into_error(self, request: &HttpRequest) -> s3compat::s3::ProviderError {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-request-id", HeaderValue::from_static("FAKEREQUEST"));
        // HEAD responses carry no body
        if request.method == Method::HEAD {
            for (name, value) in &self.details {
                if name == "Region" {
                    headers.insert("x-amz-bucket-region", HeaderValue::from_str(value).unwrap());
                }
            }
            return provider_error(self.status, &headers, b"");
        }
        provider_error(self.status, &headers, self.document().as_bytes())
    }

    fn document(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error>");
        push_element(&mut xml, "Code", &self.code);
        push_element(&mut xml, "Message", &self.message);
        for (name, value) in &self.details {
            push_element(&mut xml, name, value);
        }
        push_element(&mut xml, "RequestId", "FAKEREQUEST");
        xml.push_str("</Error>");
        xml
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            // Providers send control characters as numeric references
            c if c.is_control() => out.push_str(&format!("&#x{:X};", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn push_element(xml: &mut String, name: &str, value: &str) {
    xml.push('<');
    xml.push_str(name);
    xml.push('>');
    xml.push_str(&escape(value));
    xml.push_str("</");
    xml.push_str(name);
    xml.push('>');
}

fn ok(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    HttpResponse::new(status, body)
}

fn set_header(response: &mut HttpResponse, name: &str, value: &str) {
    response.headers.insert(
        HeaderName::from_bytes(name.as_bytes()).unwrap(),
        HeaderValue::from_str(value).unwrap(),
    );
}

fn store(bucket: &mut FakeBucket, key: &str, version: FakeVersion) {
    let versioned = bucket.versioned;
    let versions = bucket.objects.entry(key.to_string()).or_default();
    if !versioned {
        versions.clear();
    }
    versions.push(version);
}

fn location(bucket: &FakeBucket) -> HttpResponse {
    let body = if bucket.location_constraint.is_empty() {
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><LocationConstraint xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\"/>".to_string()
    } else {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><LocationConstraint xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">{}</LocationConstraint>",
            bucket.location_constraint
        )
    };
    ok(StatusCode::OK, body)
}

fn page_size(request: &HttpRequest, modes: &Modes) -> usize {
    request
        .query_value("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000usize)
        .min(modes.max_page)
}

/// Key text as it goes into a listing element, before XML escaping
fn listed(key: &str, url: bool) -> String {
    if url {
        urlencoding::encode(key).into_owned()
    } else {
        key.to_string()
    }
}

fn encoding_element(xml: &mut String, request: &HttpRequest, modes: &Modes) -> bool {
    if let Some(forced) = &modes.force_encoding_type {
        push_element(xml, "EncodingType", forced);
        return false;
    }
    let url = request.query_value("encoding-type") == Some("url");
    if url {
        push_element(xml, "EncodingType", "url");
    }
    url
}

/// Opaque v2 token; contains `+` so any decoding of it would corrupt it
fn token_for(key: &str) -> String {
    format!("tok+{}", hex::encode(key))
}

fn key_from_token(token: &str) -> Option<String> {
    let hex_part = token.strip_prefix("tok+")?;
    String::from_utf8(hex::decode(hex_part).ok()?).ok()
}

fn list_objects(
    bucket: &FakeBucket,
    request: &HttpRequest,
    modes: &Modes,
    v2: bool,
) -> std::result::Result<HttpResponse, Fault> {
    let prefix = request.query_value("prefix").unwrap_or("");
    let start_after = if v2 {
        match request.query_value("continuation-token") {
            Some(token) => Some(key_from_token(token).ok_or_else(|| {
                Fault::new(StatusCode::BAD_REQUEST, "InvalidArgument", "The continuation token provided is incorrect")
            })?),
            None => None,
        }
    } else {
        request.query_value("marker").map(str::to_string)
    };

    let size = page_size(request, modes);
    let matching: Vec<&String> = bucket
        .live_keys()
        .into_iter()
        .filter(|k| k.starts_with(prefix))
        .filter(|k| start_after.as_ref().map_or(true, |after| k.as_str() > after.as_str()))
        .collect();
    let page: Vec<&String> = matching.iter().take(size).copied().collect();
    let truncated = matching.len() > page.len();

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">");
    push_element(&mut xml, "Name", &request.bucket);
    let url = encoding_element(&mut xml, request, modes);
    push_element(&mut xml, "Prefix", &listed(prefix, url));
    if v2 {
        push_element(&mut xml, "KeyCount", &page.len().to_string());
    }
    push_element(&mut xml, "MaxKeys", &size.to_string());
    push_element(&mut xml, "IsTruncated", if truncated { "true" } else { "false" });
    if truncated {
        let last = page.last().map(|k| k.as_str()).unwrap_or("");
        if v2 {
            push_element(&mut xml, "NextContinuationToken", &token_for(last));
        } else if modes.stuck_marker {
            let marker = request.query_value("marker").unwrap_or(last);
            push_element(&mut xml, "NextMarker", &listed(marker, url));
        } else if modes.v1_next_marker {
            push_element(&mut xml, "NextMarker", &listed(last, url));
        }
    }
    for key in page {
        let Some(version) = bucket.latest(key) else {
            continue;
        };
        xml.push_str("<Contents>");
        push_element(&mut xml, "Key", &listed(key, url));
        push_element(&mut xml, "LastModified", LIST_TIMESTAMP);
        push_element(&mut xml, "ETag", &format!("\"{}\"", version.etag));
        push_element(&mut xml, "Size", &version.data.len().to_string());
        push_element(&mut xml, "StorageClass", "STANDARD");
        xml.push_str("</Contents>");
    }
    xml.push_str("</ListBucketResult>");
    Ok(ok(StatusCode::OK, xml))
}

fn list_versions(
    bucket: &FakeBucket,
    request: &HttpRequest,
    modes: &Modes,
) -> std::result::Result<HttpResponse, Fault> {
    let prefix = request.query_value("prefix").unwrap_or("");
    let key_marker = request.query_value("key-marker");
    let version_marker = request.query_value("version-id-marker");

    // Newest first within a key, keys ascending
    let mut rows: Vec<(&String, &FakeVersion, bool)> = Vec::new();
    for (key, versions) in bucket.objects.range(prefix.to_string()..) {
        if !key.starts_with(prefix) {
            break;
        }
        for (i, version) in versions.iter().enumerate().rev() {
            rows.push((key, version, i + 1 == versions.len()));
        }
    }

    let start = match (key_marker, version_marker) {
        (Some(km), Some(vm)) => rows
            .iter()
            .position(|(k, v, _)| k.as_str() == km && v.version_id == vm)
            .map(|p| p + 1)
            .unwrap_or(rows.len()),
        (Some(km), None) => rows
            .iter()
            .position(|(k, _, _)| k.as_str() > km)
            .unwrap_or(rows.len()),
        _ => 0,
    };
    let size = page_size(request, modes);
    let remaining = &rows[start..];
    let page = &remaining[..remaining.len().min(size)];
    let truncated = remaining.len() > page.len();

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><ListVersionsResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">");
    push_element(&mut xml, "Name", &request.bucket);
    let url = encoding_element(&mut xml, request, modes);
    push_element(&mut xml, "Prefix", &listed(prefix, url));
    push_element(&mut xml, "MaxKeys", &size.to_string());
    push_element(&mut xml, "IsTruncated", if truncated { "true" } else { "false" });
    if truncated {
        if let Some((key, version, _)) = page.last() {
            push_element(&mut xml, "NextKeyMarker", &listed(key, url));
            push_element(&mut xml, "NextVersionIdMarker", &version.version_id);
        }
    }
    for (key, version, latest) in page {
        let tag = if version.delete_marker { "DeleteMarker" } else { "Version" };
        xml.push('<');
        xml.push_str(tag);
        xml.push('>');
        push_element(&mut xml, "Key", &listed(key, url));
        push_element(&mut xml, "VersionId", &version.version_id);
        push_element(&mut xml, "IsLatest", if *latest { "true" } else { "false" });
        push_element(&mut xml, "LastModified", LIST_TIMESTAMP);
        if !version.delete_marker {
            push_element(&mut xml, "ETag", &format!("\"{}\"", version.etag));
            push_element(&mut xml, "Size", &version.data.len().to_string());
        }
        xml.push_str("</");
        xml.push_str(tag);
        xml.push('>');
    }
    xml.push_str("</ListVersionsResult>");
    Ok(ok(StatusCode::OK, xml))
}

fn object_headers(response: &mut HttpResponse, version: &FakeVersion, version_id: &str) {
    set_header(response, "etag", &format!("\"{}\"", version.etag));
    set_header(response, "last-modified", LAST_MODIFIED);
    set_header(response, "x-amz-version-id", version_id);
    for (name, value) in &version.metadata {
        set_header(response, &format!("x-amz-meta-{}", name), value);
    }
}

fn no_such_key(key: &str) -> Fault {
    Fault::new(StatusCode::NOT_FOUND, "NoSuchKey", "The specified key does not exist.").detail("Key", key)
}

fn get_object(
    bucket: &FakeBucket,
    key: &str,
    request: &HttpRequest,
) -> std::result::Result<HttpResponse, Fault> {
    let version = bucket
        .find(key, request.query_value("versionId"))
        .filter(|v| !v.delete_marker)
        .ok_or_else(|| no_such_key(key))?;
    let len = version.data.len() as u64;

    let mut response = match request.header_value("range") {
        Some(range) => {
            let spec = range.trim_start_matches("bytes=");
            let (start, end) = spec.split_once('-').unwrap_or((spec, ""));
            let start: u64 = start.parse().unwrap_or(0);
            let end: u64 = if end.is_empty() {
                len.saturating_sub(1)
            } else {
                end.parse::<u64>().unwrap_or(0).min(len.saturating_sub(1))
            };
            if start >= len {
                return Err(Fault::new(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    "InvalidRange",
                    "The requested range is not satisfiable",
                ));
            }
            let body = version.data.slice(start as usize..=end as usize);
            let mut response = ok(StatusCode::PARTIAL_CONTENT, body);
            set_header(&mut response, "content-range", &format!("bytes {}-{}/{}", start, end, len));
            response
        }
        None => ok(StatusCode::OK, version.data.clone()),
    };
    let body_len = response.body.len();
    set_header(&mut response, "content-length", &body_len.to_string());
    object_headers(&mut response, version, &version.version_id);
    Ok(response)
}

fn head_object(
    bucket: &FakeBucket,
    key: &str,
    request: &HttpRequest,
    modes: &Modes,
) -> std::result::Result<HttpResponse, Fault> {
    let version = bucket
        .find(key, request.query_value("versionId"))
        .filter(|v| !v.delete_marker)
        .ok_or_else(|| no_such_key(key))?;
    let mut response = ok(StatusCode::OK, Bytes::new());
    set_header(&mut response, "content-length", &version.data.len().to_string());
    let reported = if modes.lie_about_versions {
        format!("{}-stale", version.version_id)
    } else {
        version.version_id.clone()
    };
    object_headers(&mut response, version, &reported);
    Ok(response)
}

fn request_metadata(request: &HttpRequest) -> BTreeMap<String, String> {
    request
        .headers
        .iter()
        .filter_map(|(name, value)| {
            name.strip_prefix("x-amz-meta-")
                .map(|n| (n.to_string(), value.clone()))
        })
        .collect()
}

fn put_object(
    state: &mut State,
    key: &str,
    request: &HttpRequest,
) -> std::result::Result<HttpResponse, Fault> {
    let declared: Option<usize> = request
        .header_value("content-length")
        .and_then(|v| v.parse().ok());
    if declared != Some(request.body.len()) {
        return Err(Fault::new(
            StatusCode::BAD_REQUEST,
            "IncompleteBody",
            "You did not provide the number of bytes specified by the Content-Length HTTP header",
        ));
    }

    let versioned = state.buckets[&request.bucket].versioned;
    let version_id = state.new_version_id(versioned);
    let version = FakeVersion {
        version_id: version_id.clone(),
        etag: format!("{:x}", md5::compute(&request.body)),
        data: request.body.clone(),
        metadata: request_metadata(request),
        delete_marker: false,
    };
    let etag = version.etag.clone();
    let shout = state.modes.shout_version_ids;
    store(state.buckets.get_mut(&request.bucket).unwrap(), key, version);

    let mut response = ok(StatusCode::OK, Bytes::new());
    set_header(&mut response, "etag", &format!("\"{}\"", etag));
    if versioned {
        let reported = if shout { version_id.to_uppercase() } else { version_id };
        set_header(&mut response, "x-amz-version-id", &reported);
    }
    Ok(response)
}

fn copy_object(
    state: &mut State,
    key: &str,
    request: &HttpRequest,
) -> std::result::Result<HttpResponse, Fault> {
    if state.modes.copy_error_body {
        let doc = Fault::new(StatusCode::OK, "InternalError", "We encountered an internal error. Please try again.").document();
        return Ok(ok(StatusCode::OK, doc));
    }

    let copy_source = request.header_value("x-amz-copy-source").unwrap_or("");
    let (path, version_id) = match copy_source.split_once("?versionId=") {
        Some((path, v)) => (path, Some(urlencoding::decode(v).unwrap().into_owned())),
        None => (copy_source, None),
    };
    let (source_bucket, source_key) = path
        .trim_start_matches('/')
        .split_once('/')
        .ok_or_else(|| Fault::new(StatusCode::BAD_REQUEST, "InvalidArgument", "bad copy source"))?;
    let source_key = urlencoding::decode(source_key).unwrap().into_owned();

    let source = state
        .buckets
        .get(source_bucket)
        .and_then(|b| b.find(&source_key, version_id.as_deref()))
        .filter(|v| !v.delete_marker)
        .cloned()
        .ok_or_else(|| no_such_key(&source_key))?;

    let metadata = if request.header_value("x-amz-metadata-directive") == Some("REPLACE") {
        request_metadata(request)
    } else {
        source.metadata.clone()
    };

    let versioned = state.buckets[&request.bucket].versioned;
    let new_version = state.new_version_id(versioned);
    let etag = source.etag.clone();
    store(
        state.buckets.get_mut(&request.bucket).unwrap(),
        key,
        FakeVersion {
            version_id: new_version.clone(),
            data: source.data,
            etag: etag.clone(),
            metadata,
            delete_marker: false,
        },
    );

    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><CopyObjectResult><LastModified>{}</LastModified><ETag>\"{}\"</ETag></CopyObjectResult>",
        LIST_TIMESTAMP, etag
    );
    let mut response = ok(StatusCode::OK, body);
    if versioned {
        set_header(&mut response, "x-amz-version-id", &new_version);
    }
    Ok(response)
}

fn delete_object(
    bucket: &mut FakeBucket,
    key: &str,
    request: &HttpRequest,
    modes: &Modes,
    marker_id: String,
) -> std::result::Result<HttpResponse, Fault> {
    if modes.refuse_keys.contains(key) {
        return Err(Fault::new(StatusCode::FORBIDDEN, "AccessDenied", "Access Denied"));
    }
    remove(bucket, key, request.query_value("versionId"), marker_id);
    Ok(ok(StatusCode::NO_CONTENT, Bytes::new()))
}

fn remove(bucket: &mut FakeBucket, key: &str, version_id: Option<&str>, marker_id: String) {
    let versioned = bucket.versioned;
    match version_id {
        Some(v) => {
            if let Some(versions) = bucket.objects.get_mut(key) {
                versions.retain(|fv| fv.version_id != v);
                if versions.is_empty() {
                    bucket.objects.remove(key);
                }
            }
        }
        None if versioned => {
            bucket.objects.entry(key.to_string()).or_default().push(FakeVersion {
                version_id: marker_id,
                data: Bytes::new(),
                etag: String::new(),
                metadata: BTreeMap::new(),
                delete_marker: true,
            });
        }
        None => {
            bucket.objects.remove(key);
        }
    }
}

/// `(key, version)` pairs of a multi-object delete body
fn parse_delete_body(body: &[u8]) -> Vec<(String, Option<String>)> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(false);
    let mut entries = Vec::new();
    let mut key = String::new();
    let mut version = None;
    let mut text = String::new();
    loop {
        match reader.read_event().unwrap() {
            Event::Start(_) => text.clear(),
            Event::Text(e) => text.push_str(&e.unescape().unwrap()),
            Event::End(e) => match e.local_name().as_ref() {
                b"Key" => key = std::mem::take(&mut text),
                b"VersionId" => version = Some(std::mem::take(&mut text)),
                b"Object" => entries.push((std::mem::take(&mut key), version.take())),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    entries
}

fn multi_delete(
    bucket: &mut FakeBucket,
    request: &HttpRequest,
    modes: &Modes,
) -> std::result::Result<HttpResponse, Fault> {
    let expected_md5 = base64::engine::general_purpose::STANDARD.encode(md5::compute(&request.body).0);
    if request.header_value("content-md5") != Some(expected_md5.as_str()) {
        return Err(Fault::new(StatusCode::BAD_REQUEST, "InvalidDigest", "The Content-MD5 you specified was invalid."));
    }

    let entries = parse_delete_body(&request.body);
    if entries.len() > 1000 {
        return Err(Fault::new(StatusCode::BAD_REQUEST, "MalformedXML", "too many keys"));
    }

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><DeleteResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">");
    let mut marker_counter = 0u64;
    for (key, version) in entries {
        if modes.refuse_keys.contains(&key) {
            xml.push_str("<Error>");
            push_element(&mut xml, "Key", &key);
            if let Some(v) = &version {
                push_element(&mut xml, "VersionId", v);
            }
            push_element(&mut xml, "Code", "AccessDenied");
            push_element(&mut xml, "Message", "Access Denied");
            xml.push_str("</Error>");
            continue;
        }
        let unknown_version = bucket.versioned
            && version.as_deref().is_some_and(|v| {
                !bucket
                    .objects
                    .get(&key)
                    .is_some_and(|versions| versions.iter().any(|fv| fv.version_id == v))
            });
        if unknown_version {
            xml.push_str("<Error>");
            push_element(&mut xml, "Key", &key);
            if let Some(v) = &version {
                push_element(&mut xml, "VersionId", v);
            }
            push_element(&mut xml, "Code", "NoSuchVersion");
            push_element(&mut xml, "Message", "The specified version does not exist.");
            xml.push_str("</Error>");
            continue;
        }
        marker_counter += 1;
        remove(bucket, &key, version.as_deref(), format!("dm{:06}", marker_counter));
        xml.push_str("<Deleted>");
        push_element(&mut xml, "Key", &key);
        if let Some(v) = &version {
            push_element(&mut xml, "VersionId", v);
        }
        xml.push_str("</Deleted>");
    }
    xml.push_str("</DeleteResult>");
    Ok(ok(StatusCode::OK, xml))
}
