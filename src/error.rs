use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client.
///
/// Remote job failure, poll-budget exhaustion, and transfer/authorization
/// failure are deliberately separate variants so callers can branch on them.
/// Submission failures are never raised as errors; they are recorded on the
/// returned [`Job`](crate::Job).
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success HTTP status.
    #[error("API request failed: HTTP {status} for url ({url})\n{body}")]
    Api { status: u16, url: String, body: String },

    /// The remote job reached the `Failed` status.
    #[error("job {id} failed: {details}")]
    JobFailed { id: String, details: String },

    /// The poll loop exhausted its total-time budget before the job left
    /// `Accepted`/`Running`. `last` reports what the final attempt saw,
    /// either a job status or a transport error.
    #[error("job {id} did not reach a terminal status within {budget:?} (last: {last})")]
    PollTimeout {
        id: String,
        budget: Duration,
        last: String,
    },

    #[error("polling cancelled")]
    Cancelled,

    /// A 401 that no credential escalation path could resolve.
    #[error("unauthorized (401) fetching {url}")]
    Unauthorized { url: String },

    /// An XML document the service returned could not be interpreted. The
    /// raw body is kept for diagnostics.
    #[error("malformed {kind} document: {detail}\nraw: {raw}")]
    MalformedDocument {
        kind: &'static str,
        detail: String,
        raw: String,
    },

    #[error("unknown job status [{0}]")]
    UnknownStatus(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error("s3 download failed: {0}")]
    S3(String),

    #[error("ftp download failed: {0}")]
    Ftp(#[from] suppaftp::FtpError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for failures the status poller tolerates and retries: transport
    /// errors and non-success API replies. Parse failures are not retried.
    pub(crate) fn is_retriable_probe_failure(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Api { .. })
    }
}
