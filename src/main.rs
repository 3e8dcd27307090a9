use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use s3compat::cli::{self, args, commands::ListMode};
use s3compat::{config, core};

#[derive(Parser)]
#[command(name = "s3compat")]
#[command(version, about = "S3-compatible storage client and compatibility probe", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (environment variables are used when absent)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Profile to use from config
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Bucket to operate on (defaults to the profile's bucket)
    #[arg(long, short, global = true)]
    bucket: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the bucket's region
    Location,

    /// Show object metadata
    Head {
        key: String,

        /// Read this version instead of the latest
        #[arg(long)]
        version_id: Option<String>,
    },

    /// Download an object
    Get {
        key: String,

        /// Inclusive byte range, e.g. 0-8 or 100-
        #[arg(long, value_parser = args::parse_range)]
        range: Option<s3compat::s3::ByteRange>,

        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Upload a file and verify the write
    Put {
        key: String,

        file: PathBuf,

        /// User metadata, name=value (repeatable)
        #[arg(long = "meta", value_parser = args::parse_metadata)]
        metadata: Vec<(String, String)>,

        /// Upload timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List everything under a prefix
    Ls {
        prefix: Option<String>,

        /// Use ListObjects v1
        #[arg(long, conflicts_with = "versions")]
        v1: bool,

        /// List every version and delete marker
        #[arg(long)]
        versions: bool,

        /// Ask the provider to URL-encode keys
        #[arg(long)]
        url_encoding: bool,

        /// Keys per page
        #[arg(long)]
        page_size: Option<u32>,
    },

    /// Delete an object or one version of it
    Rm {
        key: String,

        #[arg(long)]
        version_id: Option<String>,
    },

    /// Delete every object under a prefix
    RmPrefix {
        prefix: String,
    },

    /// Server-side copy
    Cp {
        source: String,

        destination: String,

        /// Copy this source version
        #[arg(long)]
        version_id: Option<String>,

        /// Destination bucket (defaults to the source bucket)
        #[arg(long)]
        dest_bucket: Option<String>,
    },

    /// Print a presigned URL
    Presign {
        key: String,

        /// Lifetime in seconds (default 3600, at most 604800)
        #[arg(long)]
        lifetime: Option<u64>,

        /// Sign a Content-Type header the caller must send
        #[arg(long)]
        content_type: Option<String>,

        /// Override Content-Encoding of the response
        #[arg(long)]
        response_content_encoding: Option<String>,

        /// Presign an upload instead of a download
        #[arg(long)]
        put: bool,
    },

    /// Time storage operations
    Perf {
        /// Comma-separated operation names (default: all)
        #[arg(short = 'a', long = "operations")]
        operations: Option<String>,

        /// Repetitions per operation
        #[arg(short = 't', long)]
        times: Option<u32>,

        /// Append one JSON line per timed call to this file
        #[arg(long)]
        stats_file: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Every command is a sequence of awaited calls
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Load configuration
    let config = config::load_config(cli.config.as_deref(), cli.profile.as_deref())?;

    // Perf runs time every client call
    let perf_sinks = match &cli.command {
        Commands::Perf { stats_file, .. } => {
            let path = stats_file.clone().or_else(|| config.perf.stats_file.clone());
            Some(cli::commands::perf_sinks(path.as_deref())?)
        }
        _ => None,
    };

    let core = core::Core::new(
        config,
        cli.profile.as_deref(),
        perf_sinks.as_ref().map(|(_, sink)| sink.clone()),
    )?;
    let bucket = core.bucket(cli.bucket.as_deref())?;

    match cli.command {
        Commands::Location => {
            cli::commands::cmd_location(&core, &bucket).await?;
        }
        Commands::Head { key, version_id } => {
            cli::commands::cmd_head(&core, &bucket, &key, version_id.as_deref()).await?;
        }
        Commands::Get { key, range, output } => {
            cli::commands::cmd_get(&core, &bucket, &key, range, output.as_deref()).await?;
        }
        Commands::Put {
            key,
            file,
            metadata,
            timeout,
        } => {
            let timeout = timeout.map(Duration::from_secs);
            cli::commands::cmd_put(&core, &bucket, &key, &file, &metadata, timeout).await?;
        }
        Commands::Ls {
            prefix,
            v1,
            versions,
            url_encoding,
            page_size,
        } => {
            let mode = if versions {
                ListMode::Versions
            } else if v1 {
                ListMode::V1
            } else {
                ListMode::V2
            };
            let mut options = s3compat::s3::ListOptions::default();
            if let Some(size) = page_size {
                options = options.page_size(size);
            }
            if url_encoding {
                options = options.url_encoded();
            }
            let prefix = prefix.unwrap_or_default();
            cli::commands::cmd_ls(&core, &bucket, &prefix, mode, &options).await?;
        }
        Commands::Rm { key, version_id } => {
            cli::commands::cmd_rm(&core, &bucket, &key, version_id.as_deref()).await?;
        }
        Commands::RmPrefix { prefix } => {
            cli::commands::cmd_rm_prefix(&core, &bucket, &prefix).await?;
        }
        Commands::Cp {
            source,
            destination,
            version_id,
            dest_bucket,
        } => {
            cli::commands::cmd_cp(
                &core,
                &bucket,
                &source,
                version_id.as_deref(),
                dest_bucket.as_deref(),
                &destination,
            )
            .await?;
        }
        Commands::Presign {
            key,
            lifetime,
            content_type,
            response_content_encoding,
            put,
        } => {
            cli::commands::cmd_presign(
                &core,
                &bucket,
                &key,
                put,
                lifetime,
                content_type,
                response_content_encoding,
            )
            .await?;
        }
        Commands::Perf { operations, times, .. } => {
            let Some((collector, _)) = perf_sinks else {
                anyhow::bail!("perf sinks were not set up");
            };
            let operations = match operations {
                Some(names) => args::parse_operations(&names)?,
                None => Vec::new(),
            };
            cli::commands::cmd_perf(&core, &collector, &bucket, operations, times).await?;
        }
    }

    Ok(())
}
