use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use crate::config::{Config, Profile};
use crate::perf::StatSink;
use crate::s3::{HyperTransport, StorageClient, TransportOptions};

/// Wires a configuration profile to a ready storage client
///
/// The transport is created once; clients derived from this core share its
/// HTTP connection pool.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    profile: Profile,
    client: Arc<StorageClient>,
}

impl Core {
    /// Build the client for `profile_name` (or the default profile).
    ///
    /// When `stats` is given every client call is timed into it.
    pub fn new(
        config: Config,
        profile_name: Option<&str>,
        stats: Option<Arc<dyn StatSink>>,
    ) -> Result<Self> {
        let profile = config
            .get_profile(profile_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No profile found in configuration"))?;

        let transport = HyperTransport::new(
            profile.endpoint.clone(),
            profile.access_key.clone(),
            profile.secret_key.clone(),
            TransportOptions {
                default_timeout: Duration::from_secs(profile.request_timeout),
                insecure_tls: profile.insecure_tls,
            },
        )
        .context("Failed to create HTTP transport")?;

        tracing::debug!(
            endpoint = %transport.endpoint(),
            region = profile.region.as_deref().unwrap_or("<unset>"),
            "storage client configured"
        );

        let mut client = StorageClient::new(Arc::new(transport), profile.region.as_deref());
        if let Some(sink) = stats {
            client = client.with_stats(sink);
        }

        Ok(Self {
            config: Arc::new(config),
            profile,
            client: Arc::new(client),
        })
    }

    pub fn client(&self) -> &Arc<StorageClient> {
        &self.client
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// The bucket to operate on: the explicit one, else the profile's
    pub fn bucket(&self, explicit: Option<&str>) -> Result<String> {
        explicit
            .map(str::to_string)
            .or_else(|| self.profile.bucket.clone())
            .ok_or_else(|| anyhow::anyhow!("No bucket given and the profile names none"))
    }

    /// Make sure the client signs for the bucket's region.
    ///
    /// Profiles without a region resolve it from the bucket's location.
    pub async fn ensure_region(&self, bucket: &str) -> Result<String> {
        if self.profile.region.is_some() {
            return Ok(self.client.region());
        }
        let region = self
            .client
            .resolve_region(bucket)
            .await
            .context(format!("Failed to resolve region of bucket {}", bucket))?;
        self.client.set_region(&region);
        Ok(region)
    }
}
