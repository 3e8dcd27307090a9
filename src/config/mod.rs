use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Endpoint and credentials of one storage provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// S3 endpoint URL (path-style addressing is used)
    pub endpoint: String,

    /// Access key ID
    pub access_key: String,

    /// Secret access key
    pub secret_key: String,

    /// Region; resolved from the bucket when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Bucket used when a command names none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure_tls: bool,
}

fn default_request_timeout() -> u64 {
    300
}

/// Performance harness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfConfig {
    /// How many times each operation runs
    #[serde(default = "default_perf_times")]
    pub times: u32,

    /// Key prefix fixtures are written under (and torn down from)
    #[serde(default = "default_perf_prefix")]
    pub prefix: String,

    /// JSON-lines file stats are appended to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_file: Option<String>,
}

fn default_perf_times() -> u32 {
    20
}

fn default_perf_prefix() -> String {
    "test-suite/perfstat".to_string()
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            times: default_perf_times(),
            prefix: default_perf_prefix(),
            stats_file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Named provider profiles
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,

    /// Profile used when none is named
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,

    /// Performance harness settings
    #[serde(default)]
    pub perf: PerfConfig,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a profile by name, or the default profile if not specified
    pub fn get_profile(&self, name: Option<&str>) -> Option<&Profile> {
        if let Some(name) = name {
            self.profiles.get(name)
        } else if let Some(default) = &self.default_profile {
            self.profiles.get(default)
        } else {
            self.profiles.values().next()
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// A `.env` file in the working directory is read first, if present.
/// - S3COMPAT_ACCESS_KEY / AWS_ACCESS_KEY_ID
/// - S3COMPAT_SECRET_KEY / AWS_SECRET_ACCESS_KEY
/// - END_POINT (required)
/// - REGION_1 / AWS_REGION (optional)
/// - BUCKET_NAME_1 (optional)
/// - REQUEST_TIMEOUT_SECS (optional, defaults to 300)
/// - S3COMPAT_INSECURE_TLS (optional, `true` or `1`)
/// - PERFSTAT_PREFIX (optional, defaults to test-suite/perfstat)
pub fn load_from_env() -> Result<Config> {
    // Don't fail if there is no .env file
    let _ = dotenvy::dotenv();
    load_from_vars(|name| std::env::var(name).ok())
}

/// [`load_from_env`] over an arbitrary variable lookup
pub fn load_from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());

    let endpoint = non_empty("END_POINT").context("END_POINT environment variable not set")?;

    let access_key = non_empty("S3COMPAT_ACCESS_KEY")
        .or_else(|| non_empty("AWS_ACCESS_KEY_ID"))
        .context("Neither S3COMPAT_ACCESS_KEY nor AWS_ACCESS_KEY_ID environment variable is set")?;

    let secret_key = non_empty("S3COMPAT_SECRET_KEY")
        .or_else(|| non_empty("AWS_SECRET_ACCESS_KEY"))
        .context("Neither S3COMPAT_SECRET_KEY nor AWS_SECRET_ACCESS_KEY environment variable is set")?;

    let region = non_empty("REGION_1").or_else(|| non_empty("AWS_REGION"));
    let bucket = non_empty("BUCKET_NAME_1");

    let request_timeout = match non_empty("REQUEST_TIMEOUT_SECS") {
        Some(v) => v
            .trim()
            .parse()
            .context(format!("REQUEST_TIMEOUT_SECS is not a number of seconds: {:?}", v))?,
        None => default_request_timeout(),
    };

    let insecure_tls = non_empty("S3COMPAT_INSECURE_TLS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let profile = Profile {
        endpoint,
        access_key,
        secret_key,
        region,
        bucket,
        request_timeout,
        insecure_tls,
    };

    let mut config = Config::new();
    config.profiles.insert("default".to_string(), profile);
    config.default_profile = Some("default".to_string());

    if let Some(prefix) = non_empty("PERFSTAT_PREFIX") {
        config.perf.prefix = prefix;
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// Loads the YAML file when a path is given, otherwise falls back to
/// environment variables.
///
/// # Arguments
/// * `config_path` - Optional path to YAML config file
/// * `profile_name` - Optional profile name to use (only relevant for YAML configs)
pub fn load_config(config_path: Option<&str>, profile_name: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        let mut config = load_from_yaml(path)?;

        // If a specific profile is requested, make it the default
        if let Some(name) = profile_name {
            if !config.profiles.contains_key(name) {
                anyhow::bail!("Profile '{}' not found in config file", name);
            }
            config.default_profile = Some(name.to_string());
        }

        Ok(config)
    } else {
        load_from_env()
    }
}
