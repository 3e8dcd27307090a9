//! AWS Signature Version 4 signer for S3 requests
//!
//! Two flavours:
//! - header signing (`Authorization` header) for requests we send ourselves
//! - query-string signing for presigned URLs handed to third parties
//!
//! The region is a per-call argument: a client whose region is corrected
//! mid-session keeps signing in-flight requests with the region they were
//! built with.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

/// Hex lookup table for zero-allocation percent encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Pre-computed SHA256 hash of empty payload (avoids hashing empty body on every GET/DELETE)
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Longest validity SigV4 accepts for a presigned URL (7 days)
pub const MAX_PRESIGN_EXPIRES_SECS: u64 = 7 * 24 * 3600;

/// AWS Signature Version 4 signer
pub struct S3SignerV4 {
    access_key: String,
    service: String,
    /// Pre-computed "AWS4" + secret_key as bytes (avoids format!() per sign call)
    aws4_key: Vec<u8>,
    /// Cached signing key: (date_stamp, region, derived_key).
    /// Only changes daily or when the region changes.
    cached_signing_key: Mutex<Option<(String, String, [u8; 32])>>,
}

impl Clone for S3SignerV4 {
    fn clone(&self) -> Self {
        Self {
            access_key: self.access_key.clone(),
            service: self.service.clone(),
            aws4_key: self.aws4_key.clone(),
            // Each clone gets its own cache (populated on first use)
            cached_signing_key: Mutex::new(None),
        }
    }
}

impl S3SignerV4 {
    /// Create a new S3 signer
    pub fn new(access_key: String, secret_key: String) -> Self {
        let aws4_key = format!("AWS4{}", secret_key).into_bytes();
        Self {
            access_key,
            service: "s3".to_string(),
            aws4_key,
            cached_signing_key: Mutex::new(None),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// Sign an S3 request with AWS Signature V4
    ///
    /// For empty payloads (GET, DELETE, HEAD), uses pre-computed empty hash constant.
    pub fn sign(
        &self,
        region: &str,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        payload: &[u8],
    ) -> BTreeMap<String, String> {
        if payload.is_empty() {
            self.sign_with_hash(region, method, url, headers, EMPTY_SHA256, Utc::now())
        } else {
            let hash = hex::encode(Sha256::digest(payload));
            self.sign_with_hash(region, method, url, headers, &hash, Utc::now())
        }
    }

    /// Sign with UNSIGNED-PAYLOAD (for object uploads, avoids SHA256 of body)
    pub fn sign_unsigned_payload(
        &self,
        region: &str,
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        self.sign_with_hash(region, method, url, headers, UNSIGNED_PAYLOAD, Utc::now())
    }

    fn sign_with_hash(
        &self,
        region: &str,
        method: &str,
        url: &str,
        mut headers: BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let (host, path, query) = Self::parse_url_fast(url);

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        // Add required headers (all lowercase for canonical form)
        headers.insert("host".to_string(), host.to_string());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

        let canonical_query = self.create_canonical_query_string(query);
        let canonical_headers = self.create_canonical_headers(&headers);
        let signed_headers = self.create_signed_headers(&headers);

        // Path is used as-is: callers hand us an already URI-encoded path
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query, canonical_headers, signed_headers, payload_hash
        );
        tracing::trace!(%method, %url, %region, canonical_request = %canonical_request, "sigv4 canonical request");

        let credential_scope = self.credential_scope(&date_stamp, region);
        let string_to_sign = Self::string_to_sign(&amz_date, &credential_scope, &canonical_request);
        let signature = self.calculate_signature(&date_stamp, region, &string_to_sign);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key, credential_scope, signed_headers, signature
        );
        headers.insert("authorization".to_string(), authorization);

        headers
    }

    /// Build a presigned URL (query-string authentication).
    ///
    /// `headers` are extra headers the holder of the URL must send verbatim
    /// (e.g. `content-type`); they become part of the signature. The payload
    /// is always `UNSIGNED-PAYLOAD`. Any query already present on `url`
    /// (e.g. `response-content-encoding`) is signed too.
    pub fn presign(
        &self,
        region: &str,
        method: &str,
        url: &str,
        mut headers: BTreeMap<String, String>,
        issued_at: DateTime<Utc>,
        expires_in_secs: u64,
    ) -> String {
        let (host, path, query) = Self::parse_url_fast(url);
        let base_url = url.split('?').next().unwrap_or(url);

        let amz_date = issued_at.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = issued_at.format("%Y%m%d").to_string();
        let credential_scope = self.credential_scope(&date_stamp, region);

        headers.insert("host".to_string(), host.to_string());
        let signed_headers = self.create_signed_headers(&headers);

        let mut full_query = String::with_capacity(query.len() + 256);
        full_query.push_str(query);
        for (k, v) in [
            ("X-Amz-Algorithm", ALGORITHM.to_string()),
            (
                "X-Amz-Credential",
                Self::uri_encode(&format!("{}/{}", self.access_key, credential_scope), true),
            ),
            ("X-Amz-Date", amz_date.clone()),
            ("X-Amz-Expires", expires_in_secs.to_string()),
            ("X-Amz-SignedHeaders", Self::uri_encode(&signed_headers, true)),
        ] {
            if !full_query.is_empty() {
                full_query.push('&');
            }
            full_query.push_str(k);
            full_query.push('=');
            full_query.push_str(&v);
        }
        let canonical_query = self.create_canonical_query_string(&full_query);

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            path,
            canonical_query,
            self.create_canonical_headers(&headers),
            signed_headers,
            UNSIGNED_PAYLOAD
        );

        let string_to_sign = Self::string_to_sign(&amz_date, &credential_scope, &canonical_request);
        let signature = self.calculate_signature(&date_stamp, region, &string_to_sign);

        format!("{}?{}&X-Amz-Signature={}", base_url, canonical_query, signature)
    }

    fn credential_scope(&self, date_stamp: &str, region: &str) -> String {
        format!("{}/{}/{}/aws4_request", date_stamp, region, self.service)
    }

    fn string_to_sign(amz_date: &str, credential_scope: &str, canonical_request: &str) -> String {
        let canonical_request_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM, amz_date, credential_scope, canonical_request_hash
        )
    }

    /// Fast URL component extraction without heap allocation.
    ///
    /// Returns (host_with_port, path, query) as `&str` slices into the original URL.
    /// Strips default ports (:443 for https, :80 for http) from the host.
    fn parse_url_fast(url: &str) -> (&str, &str, &str) {
        let after_scheme = if let Some(rest) = url.strip_prefix("https://") {
            rest
        } else if let Some(rest) = url.strip_prefix("http://") {
            rest
        } else {
            url
        };

        let (authority, path_and_query) = match after_scheme.find('/') {
            Some(pos) => (&after_scheme[..pos], &after_scheme[pos..]),
            None => (after_scheme, "/"),
        };

        let (path, query) = match path_and_query.find('?') {
            Some(pos) => (&path_and_query[..pos], &path_and_query[pos + 1..]),
            None => (path_and_query, ""),
        };

        let host = if url.starts_with("https") {
            authority.strip_suffix(":443").unwrap_or(authority)
        } else {
            authority.strip_suffix(":80").unwrap_or(authority)
        };

        (host, path, query)
    }

    /// Create canonical query string (sorted by parameter name)
    ///
    /// Fast path: if all characters are already in canonical form, parameters
    /// are sorted, and all params have `=`, returns as-is.
    fn create_canonical_query_string(&self, query: &str) -> String {
        if query.is_empty() {
            return String::new();
        }

        let all_canonical = query.bytes().all(|b| matches!(b,
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9'
            | b'-' | b'_' | b'.' | b'~'
            | b'=' | b'&' | b'%'
        ));

        if all_canonical {
            let mut sorted = true;
            let mut all_have_equals = true;
            let mut last_key: &str = "";
            for pair in query.split('&') {
                let key = match pair.find('=') {
                    Some(pos) => &pair[..pos],
                    None => {
                        all_have_equals = false;
                        pair
                    }
                };
                if key < last_key {
                    sorted = false;
                    break;
                }
                last_key = key;
            }
            if sorted && all_have_equals {
                return query.to_string();
            }
        }

        // Slow path: decode, re-encode, sort
        let mut params: Vec<(String, String)> = Vec::new();
        for pair in query.split('&') {
            if let Some(pos) = pair.find('=') {
                let key = &pair[..pos];
                let value = &pair[pos + 1..];
                let decoded_key = urlencoding::decode(key).unwrap_or_else(|_| key.into());
                let decoded_value = urlencoding::decode(value).unwrap_or_else(|_| value.into());
                params.push((
                    Self::uri_encode(&decoded_key, true),
                    Self::uri_encode(&decoded_value, true),
                ));
            } else {
                let decoded = urlencoding::decode(pair).unwrap_or_else(|_| pair.into());
                params.push((Self::uri_encode(&decoded, true), String::new()));
            }
        }

        params.sort_unstable();

        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Create canonical headers - keys are already lowercase from our insertions
    fn create_canonical_headers(&self, headers: &BTreeMap<String, String>) -> String {
        let mut result = String::with_capacity(headers.len() * 64);
        for (k, v) in headers {
            result.push_str(k);
            result.push(':');
            result.push_str(v.trim());
            result.push('\n');
        }
        result
    }

    /// Create signed headers list - keys are already lowercase and sorted by BTreeMap
    fn create_signed_headers(&self, headers: &BTreeMap<String, String>) -> String {
        let mut result = String::with_capacity(headers.len() * 20);
        let mut first = true;
        for k in headers.keys() {
            if !first {
                result.push(';');
            }
            result.push_str(k);
            first = false;
        }
        result
    }

    /// Calculate the signature, reusing the derived key while date and region hold
    fn calculate_signature(&self, date_stamp: &str, region: &str, string_to_sign: &str) -> String {
        let signing_key = {
            let mut cache = self
                .cached_signing_key
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match cache.as_ref() {
                Some((d, r, key)) if d == date_stamp && r == region => *key,
                _ => {
                    let key = self.derive_signing_key(date_stamp, region);
                    *cache = Some((date_stamp.to_string(), region.to_string(), key));
                    key
                }
            }
        };

        hex::encode(Self::hmac_sha256(&signing_key, string_to_sign.as_bytes()))
    }

    /// Derive signing key from date stamp and region (4 chained HMAC operations)
    fn derive_signing_key(&self, date_stamp: &str, region: &str) -> [u8; 32] {
        let k_date = Self::hmac_sha256(&self.aws4_key, date_stamp.as_bytes());
        let k_region = Self::hmac_sha256(&k_date, region.as_bytes());
        let k_service = Self::hmac_sha256(&k_region, self.service.as_bytes());
        Self::hmac_sha256(&k_service, b"aws4_request")
    }

    /// HMAC-SHA256 returning fixed-size array (no heap allocation)
    fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(msg);
        let result = mac.finalize().into_bytes();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        output
    }

    /// URI encode a string (RFC 3986) using hex lookup table
    pub(crate) fn uri_encode(s: &str, encode_slash: bool) -> String {
        let mut result = String::with_capacity(s.len() + 16);
        for byte in s.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    result.push(byte as char);
                }
                b'/' if !encode_slash => {
                    result.push('/');
                }
                _ => {
                    result.push('%');
                    result.push(HEX_UPPER[(byte >> 4) as usize] as char);
                    result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
                }
            }
        }
        result
    }
}
