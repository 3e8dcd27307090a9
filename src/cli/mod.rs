//! Command-line front end
//!
//! Each subcommand maps onto one storage client operation (or the perf
//! harness). Commands resolve the bucket's region first when the profile
//! does not pin one.
//!
//! # Usage
//!
//! ```bash
//! # Where does the bucket live?
//! s3compat --bucket photos location
//!
//! # Verified upload, then a ranged read
//! s3compat --bucket photos put 2026/cat.jpg ./cat.jpg --meta owner=alice
//! s3compat --bucket photos get 2026/cat.jpg --range 0-8
//!
//! # Every version under a prefix
//! s3compat --bucket photos ls 2026/ --versions --url-encoding
//!
//! # Time getObject and putObject 50 times each
//! s3compat --bucket photos perf -a getObject,putObject -t 50 --stats-file stats.jsonl
//! ```

pub mod args;
pub mod commands;
