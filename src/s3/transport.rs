//! Signed HTTP transport
//!
//! [`Transport`] is the seam between the storage client and the wire: it
//! takes a structured request (bucket, key, query, headers, body, region,
//! timeout), signs it, sends it once and hands back the raw response. Any
//! non-2xx status comes back as [`StorageError::Provider`]. There is no
//! retry at this layer.
//!
//! [`HyperTransport`] is the production implementation:
//! - HTTP/1.1 only over a pooled hyper client
//! - TCP_NODELAY and keepalive on the connector
//! - native-tls (OpenSSL) for TLS
//! - path-style addressing (`<endpoint>/<bucket>/<key>`)

use crate::s3::error::{ProviderError, Result, StorageError, REGION_DETAIL};
use crate::s3::signer::{S3SignerV4, MAX_PRESIGN_EXPIRES_SECS};
use crate::s3::xml;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Hex lookup table for URI encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Header some providers use to announce a bucket's real region
const BUCKET_REGION_HEADER: &str = "x-amz-bucket-region";

/// One S3 request before signing
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub bucket: String,
    pub key: Option<String>,
    /// Unencoded query pairs; a valueless flag like `?location` is `("location", "")`
    pub query: Vec<(String, String)>,
    /// Lowercase header names
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    /// Per-call timeout; the transport default applies when `None`
    pub timeout: Option<Duration>,
    /// Region the request is signed for
    pub region: String,
}

impl HttpRequest {
    pub fn new(method: Method, region: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            method,
            bucket: bucket.into(),
            key: None,
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
            timeout: None,
            region: region.into(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_query(&self, name: &str) -> bool {
        self.query.iter().any(|(k, _)| k == name)
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A 2xx response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// A signed-HTTP capability
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sign and send one request. Non-2xx responses are returned as errors.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Build a query-signed URL for `request` without touching the network
    fn presign(
        &self,
        request: &HttpRequest,
        issued_at: DateTime<Utc>,
        expires_in: Duration,
    ) -> Result<String>;
}

/// Turn a non-2xx response into a [`ProviderError`].
///
/// The body's `<Error>` document is preferred. Bodiless responses (HEAD)
/// get a code derived from the status. The `x-amz-bucket-region` header is
/// folded in as the region detail when the body has none.
pub fn provider_error(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ProviderError {
    let doc = xml::parse_error(body).ok().flatten();
    let mut err = match doc {
        Some(doc) => ProviderError {
            status,
            code: doc.code,
            message: doc.message,
            request_id: doc.request_id,
            details: doc.details,
        },
        None => {
            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("").to_string()
            } else {
                String::from_utf8_lossy(body).into_owned()
            };
            ProviderError::new(status, status_code_name(status), message)
        }
    };

    if err.request_id.is_none() {
        err.request_id = headers
            .get("x-amz-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    if !err.details.contains_key(REGION_DETAIL) {
        if let Some(region) = headers.get(BUCKET_REGION_HEADER).and_then(|v| v.to_str().ok()) {
            err.details.insert(REGION_DETAIL.to_string(), region.to_string());
        }
    }
    err
}

fn status_code_name(status: StatusCode) -> &'static str {
    match status {
        StatusCode::MOVED_PERMANENTLY => "PermanentRedirect",
        StatusCode::BAD_REQUEST => "BadRequest",
        StatusCode::FORBIDDEN => "Forbidden",
        StatusCode::NOT_FOUND => "NotFound",
        StatusCode::PRECONDITION_FAILED => "PreconditionFailed",
        StatusCode::RANGE_NOT_SATISFIABLE => "InvalidRange",
        StatusCode::SERVICE_UNAVAILABLE => "ServiceUnavailable",
        _ => "Unknown",
    }
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Applied to requests that carry no timeout of their own
    pub default_timeout: Duration,
    /// Skip certificate and hostname verification
    pub insecure_tls: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            insecure_tls: false,
        }
    }
}

/// hyper-backed SigV4 transport
///
/// Clone is cheap - the underlying HTTP client uses Arc internally.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    signer: S3SignerV4,
    endpoint: String,
    default_timeout: Duration,
}

impl HyperTransport {
    /// Create a transport for `endpoint` (e.g. `https://s3.eu-west-1.amazonaws.com`)
    pub fn new(
        endpoint: impl Into<String>,
        access_key: String,
        secret_key: String,
        options: TransportOptions,
    ) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if options.insecure_tls {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        }
        .map_err(|e| StorageError::Transport(format!("Failed to build TLS connector: {}", e)))?;

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(64)
            .set_host(true)
            .build(https);

        Ok(Self {
            client,
            signer: S3SignerV4::new(access_key, secret_key),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            default_timeout: options.default_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Encode an S3 key, preserving forward slashes.
    /// Returns Cow::Borrowed when no encoding is needed.
    fn encode_s3_key(key: &str) -> Cow<'_, str> {
        let needs_encoding = key
            .bytes()
            .any(|b| !matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/'));

        if !needs_encoding {
            return Cow::Borrowed(key);
        }

        let mut result = String::with_capacity(key.len() + 32);
        for byte in key.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                    result.push(byte as char);
                }
                _ => {
                    result.push('%');
                    result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                    result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
                }
            }
        }
        Cow::Owned(result)
    }

    /// Encode a query component (RFC 3986) straight into `buf`
    fn url_encode_into(buf: &mut String, s: &str) {
        for byte in s.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    buf.push(byte as char);
                }
                _ => {
                    buf.push('%');
                    buf.push(HEX_UPPER[(byte >> 4) as usize] as char);
                    buf.push(HEX_UPPER[(byte & 0xf) as usize] as char);
                }
            }
        }
    }

    /// Path-style URL. Query pairs are emitted sorted so the signer's
    /// canonical query fast path can skip re-sorting.
    fn build_url(&self, request: &HttpRequest) -> String {
        let mut url = String::with_capacity(self.endpoint.len() + request.bucket.len() + 128);
        url.push_str(&self.endpoint);
        url.push('/');
        url.push_str(&request.bucket);
        url.push('/');
        if let Some(key) = &request.key {
            url.push_str(&Self::encode_s3_key(key));
        }

        if !request.query.is_empty() {
            let mut pairs: Vec<(String, String)> = request
                .query
                .iter()
                .map(|(k, v)| {
                    let mut ek = String::with_capacity(k.len());
                    Self::url_encode_into(&mut ek, k);
                    let mut ev = String::with_capacity(v.len());
                    Self::url_encode_into(&mut ev, v);
                    (ek, ev)
                })
                .collect();
            pairs.sort_unstable();

            url.push('?');
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    url.push('&');
                }
                url.push_str(k);
                url.push('=');
                url.push_str(v);
            }
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let mut req = Request::builder().method(method).uri(url);
        for (key, value) in headers.iter() {
            req = req.header(key, value);
        }
        let request = req.body(Full::new(body))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body_bytes = response.collect().await?.to_bytes();
        Ok((status, headers, body_bytes))
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = self.build_url(&request);
        let method = request.method.clone();

        // Object uploads go out as UNSIGNED-PAYLOAD; small XML bodies are hashed
        let signed_headers = if request.body.is_empty() || method != Method::PUT {
            self.signer.sign(
                &request.region,
                method.as_str(),
                &url,
                request.headers.clone(),
                &request.body,
            )
        } else {
            self.signer.sign_unsigned_payload(
                &request.region,
                method.as_str(),
                &url,
                request.headers.clone(),
            )
        };

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            self.send(method.clone(), &url, signed_headers, request.body.clone()),
        )
        .await;

        let (status, headers, body) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(%method, %url, ?timeout, "request timed out");
                return Err(StorageError::Timeout(timeout));
            }
        };

        tracing::debug!(
            %method,
            bucket = %request.bucket,
            key = request.key.as_deref().unwrap_or(""),
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "s3 request"
        );

        if !status.is_success() {
            return Err(provider_error(status, &headers, &body).into());
        }
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn presign(
        &self,
        request: &HttpRequest,
        issued_at: DateTime<Utc>,
        expires_in: Duration,
    ) -> Result<String> {
        let expires_secs = expires_in.as_secs();
        if expires_secs > MAX_PRESIGN_EXPIRES_SECS {
            return Err(StorageError::validation(format!(
                "presigned URL lifetime {}s exceeds the {}s maximum",
                expires_secs, MAX_PRESIGN_EXPIRES_SECS
            )));
        }
        let url = self.build_url(request);
        Ok(self.signer.presign(
            &request.region,
            request.method.as_str(),
            &url,
            request.headers.clone(),
            issued_at,
            expires_secs,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn transport() -> HyperTransport {
        HyperTransport::new(
            "http://localhost:9000/",
            "access".to_string(),
            "secret".to_string(),
            TransportOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_encode_s3_key_no_encoding() {
        let key = "path/to/file.txt";
        assert!(matches!(HyperTransport::encode_s3_key(key), Cow::Borrowed(_)));
    }

    #[test]
    fn test_encode_s3_key_with_encoding() {
        assert_eq!(HyperTransport::encode_s3_key("a b/c\td"), "a%20b/c%09d");
    }

    #[tokio::test]
    async fn test_build_url_sorts_query() {
        let t = transport();
        let req = HttpRequest::new(Method::GET, "us-east-1", "bucket")
            .query("prefix", "a b")
            .query("list-type", "2")
            .query("continuation-token", "x/y=");
        assert_eq!(
            t.build_url(&req),
            "http://localhost:9000/bucket/?continuation-token=x%2Fy%3D&list-type=2&prefix=a%20b"
        );

        let req = HttpRequest::new(Method::GET, "us-east-1", "bucket").key("dir/k 1");
        assert_eq!(t.build_url(&req), "http://localhost:9000/bucket/dir/k%201");

        let req = HttpRequest::new(Method::GET, "us-east-1", "bucket").query("location", "");
        assert_eq!(t.build_url(&req), "http://localhost:9000/bucket/?location=");
    }

    #[tokio::test]
    async fn test_presign_rejects_long_lifetime() {
        let t = transport();
        let req = HttpRequest::new(Method::GET, "us-east-1", "bucket").key("k");
        let err = t
            .presign(&req, Utc::now(), Duration::from_secs(MAX_PRESIGN_EXPIRES_SECS + 1))
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
        assert!(t.presign(&req, Utc::now(), Duration::from_secs(0)).is_ok());
    }

    #[test]
    fn test_provider_error_from_document() {
        let body = b"<Error><Code>NoSuchKey</Code><Message>missing</Message><Key>k</Key></Error>";
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-request-id", HeaderValue::from_static("REQ"));
        let err = provider_error(StatusCode::NOT_FOUND, &headers, body);
        assert_eq!(err.code, "NoSuchKey");
        assert_eq!(err.request_id.as_deref(), Some("REQ"));
        assert_eq!(err.details.get("Key").map(String::as_str), Some("k"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_provider_error_bodiless_with_region_header() {
        let mut headers = HeaderMap::new();
        headers.insert(BUCKET_REGION_HEADER, HeaderValue::from_static("eu-west-1"));
        let err = provider_error(StatusCode::MOVED_PERMANENTLY, &headers, b"");
        assert_eq!(err.code, "PermanentRedirect");
        assert_eq!(err.corrected_region(), Some("eu-west-1"));
    }
}
