//! Region resolution
//!
//! A bucket lives in one region and requests signed for any other region
//! fail. The location query is the one call that corrects itself: when the
//! provider names the right region in its error, the client switches to it
//! and asks once more.

use crate::perf::Operation;
use crate::s3::client::StorageClient;
use crate::s3::error::{Result, StorageError};
use crate::s3::xml;
use hyper::Method;

/// Region assumed when none is configured or reported
pub const DEFAULT_REGION: &str = "us-east-1";

/// Map legacy location names to canonical region names.
///
/// The oldest region reports itself as an empty constraint or `US`, and
/// `EU` is the historical name of `eu-west-1`.
pub fn normalize_region(region: &str) -> String {
    let region = region.trim();
    match region {
        "" => DEFAULT_REGION.to_string(),
        r if r.eq_ignore_ascii_case("US") => DEFAULT_REGION.to_string(),
        r if r.eq_ignore_ascii_case("EU") => "eu-west-1".to_string(),
        r => r.to_string(),
    }
}

impl StorageClient {
    /// Region `bucket` lives in.
    ///
    /// A region mismatch that carries the correct region switches this
    /// client to it and retries the query exactly once. Any other failure,
    /// or a failure of the retry, is returned unchanged.
    pub async fn resolve_region(&self, bucket: &str) -> Result<String> {
        let mut timer = self.timer(Operation::GetBucketLocation, bucket, None);

        let region = match self.bucket_location(bucket).await {
            Ok(region) => region,
            Err(StorageError::Provider(err)) => {
                let corrected = match err.corrected_region() {
                    Some(corrected) => corrected.to_string(),
                    None => return Err(err.into()),
                };
                tracing::info!(
                    bucket = %bucket,
                    code = %err.code,
                    from = %self.region(),
                    to = %corrected,
                    "region mismatch, retrying location query"
                );
                self.store_region(&corrected);
                self.bucket_location(bucket).await?
            }
            Err(other) => return Err(other),
        };

        timer.succeeded(None);
        Ok(region)
    }

    /// Alias of [`resolve_region`](StorageClient::resolve_region)
    pub async fn get_bucket_location(&self, bucket: &str) -> Result<String> {
        self.resolve_region(bucket).await
    }

    async fn bucket_location(&self, bucket: &str) -> Result<String> {
        let request = self.request(Method::GET, bucket).query("location", "");
        let response = self.send(request).await?;
        Ok(normalize_region(&xml::parse_location(&response.body)?))
    }
}
