//! A Rust client for the MAAP (Multi-Mission Algorithm and Analysis
//! Platform) API.
//!
//! The crate covers the platform's resilience-critical paths: submitting DPS
//! jobs and tracking them to completion, searching the CMR catalog, and
//! fetching granule data with per-environment credential escalation.
//!
//! ## Quick start
//! - Configure authentication via environment variables (`MAAP_API_HOST`,
//!   `MAAP_TOKEN`) or a `.maaprc` file (supported in the current directory
//!   and in your home directory).
//! - Search with [`Client::search_granules`], run jobs end to end with
//!   [`Client::run`].
//!
//! ```no_run
//! use anyhow::Result;
//! use maap::{Client, JobSpec, SearchQuery};
//!
//! fn main() -> Result<()> {
//!     let client = Client::from_env()?;
//!
//!     let granules = client.search_granules(
//!         &SearchQuery::new()
//!             .param("short_name", "GEDI02_A")
//!             .param("bounding_box", "-73.4,-12.1,-70.5,-9.0"),
//!         5,
//!     )?;
//!     for granule in &granules {
//!         client.download_granule(granule, std::path::Path::new("data"), false)?;
//!     }
//!
//!     let job = client.run(
//!         &JobSpec::new("gedi-subset", "main")
//!             .input("bounding_box", "-73.4,-12.1,-70.5,-9.0")
//!             .queue("maap-dps-worker-8gb"),
//!     )?;
//!     println!("outputs: {:?}", job.outputs);
//!     Ok(())
//! }
//! ```
//!
//! Configuration sources and precedence are documented on [`ClientConfig`]
//! and [`Client::from_env`].

#![forbid(unsafe_code)]

mod auth;
mod client;
mod cmr;
mod config;
mod download;
mod error;
mod granule;
mod job;
mod poll;
mod util;
mod wps;

pub use auth::AuthContext;
pub use client::{Client, ClientConfig};
pub use cmr::SearchQuery;
pub use error::{Error, Result};
pub use granule::{Collection, DownloadCandidate, Granule, Location, Scheme, resolve_location};
pub use job::{AckOutcome, Job, JobMetrics, JobSpec, JobStatus, SubmissionAck};
pub use poll::PollConfig;
