use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle state of a DPS job.
///
/// `Accepted` and `Running` are the in-flight states; everything else is
/// terminal. `Failed` is the only terminal state that counts as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Accepted,
    Running,
    Succeeded,
    Failed,
    Dismissed,
    Deduped,
    Offline,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Accepted | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Accepted => "Accepted",
            JobStatus::Running => "Running",
            JobStatus::Succeeded => "Succeeded",
            JobStatus::Failed => "Failed",
            JobStatus::Dismissed => "Dismissed",
            JobStatus::Deduped => "Deduped",
            JobStatus::Offline => "Offline",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placeholder state for handles that have not been refreshed yet.
impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Accepted
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    /// Case-insensitive; the service is not consistent about capitalisation.
    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accepted" => Ok(JobStatus::Accepted),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "dismissed" => Ok(JobStatus::Dismissed),
            "deduped" => Ok(JobStatus::Deduped),
            "offline" => Ok(JobStatus::Offline),
            _ => Err(Error::UnknownStatus(s.trim().to_string())),
        }
    }
}

/// Resource-usage report for a finished job.
///
/// The service emits a flat XML document; `raw` keeps every field verbatim
/// while the typed accessors cover the documented names. Empty elements and
/// the literal string `None` leave the typed field unset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobMetrics {
    pub machine_type: Option<String>,
    pub architecture: Option<String>,
    pub machine_memory_size: Option<String>,
    pub directory_size: Option<u64>,
    pub operating_system: Option<String>,
    pub job_start_time: Option<DateTime<Utc>>,
    pub job_end_time: Option<DateTime<Utc>>,
    pub job_duration_seconds: Option<f64>,
    pub cpu_usage: Option<String>,
    pub cache_usage: Option<String>,
    pub mem_usage: Option<String>,
    pub max_mem_usage: Option<String>,
    pub swap_usage: Option<String>,
    pub read_io_stats: Option<String>,
    pub write_io_stats: Option<String>,
    pub sync_io_stats: Option<String>,
    pub async_io_stats: Option<String>,
    pub total_io_stats: Option<String>,
    pub raw: BTreeMap<String, String>,
}

impl JobMetrics {
    pub fn from_raw(raw: BTreeMap<String, String>) -> Self {
        fn text(raw: &BTreeMap<String, String>, key: &str) -> Option<String> {
            raw.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty() && *v != "None")
                .map(str::to_string)
        }
        fn timestamp(raw: &BTreeMap<String, String>, key: &str) -> Option<DateTime<Utc>> {
            text(raw, key)
                .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                .map(|t| t.with_timezone(&Utc))
        }

        JobMetrics {
            machine_type: text(&raw, "machine_type"),
            architecture: text(&raw, "architecture"),
            machine_memory_size: text(&raw, "machine_memory_size"),
            directory_size: text(&raw, "directory_size").and_then(|v| v.parse().ok()),
            operating_system: text(&raw, "operating_system"),
            job_start_time: timestamp(&raw, "job_start_time"),
            job_end_time: timestamp(&raw, "job_end_time"),
            job_duration_seconds: text(&raw, "job_duration_seconds").and_then(|v| v.parse().ok()),
            cpu_usage: text(&raw, "cpu_usage"),
            cache_usage: text(&raw, "cache_usage"),
            mem_usage: text(&raw, "mem_usage"),
            max_mem_usage: text(&raw, "max_mem_usage"),
            swap_usage: text(&raw, "swap_usage"),
            read_io_stats: text(&raw, "read_io_stats"),
            write_io_stats: text(&raw, "write_io_stats"),
            sync_io_stats: text(&raw, "sync_io_stats"),
            async_io_stats: text(&raw, "async_io_stats"),
            total_io_stats: text(&raw, "total_io_stats"),
            raw,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Outcome of a submission attempt, normalized from whatever the service
/// sent back (StatusInfo document, Exception document, junk, or nothing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionAck {
    pub status: AckOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl SubmissionAck {
    pub(crate) fn success(http_status_code: u16, job_id: String) -> Self {
        SubmissionAck {
            status: AckOutcome::Success,
            http_status_code: Some(http_status_code),
            job_id: Some(job_id),
            details: None,
        }
    }

    pub(crate) fn failed(http_status_code: Option<u16>, details: String) -> Self {
        SubmissionAck {
            status: AckOutcome::Failed,
            http_status_code,
            job_id: None,
            details: Some(details),
        }
    }
}

/// Client-side handle for a DPS job.
///
/// Plain value, no liveness: refresh methods on [`Client`](crate::Client)
/// re-fetch state from the service. `outputs` and `metrics` stay empty until
/// the job reaches a terminal status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Job {
    /// Service-assigned id; empty when submission never got far enough to
    /// receive one.
    pub id: String,
    pub status: JobStatus,
    /// Product URLs from the result document, in document order.
    pub outputs: Vec<String>,
    pub metrics: JobMetrics,
    /// HTTP status of the submission response, when one was received.
    pub response_code: Option<u16>,
    pub error_details: Option<String>,
}

impl Job {
    /// Handle for an already-submitted job known only by id. The status is
    /// a placeholder until the first refresh.
    pub fn with_id(id: impl Into<String>) -> Self {
        Job {
            id: id.into(),
            ..Job::default()
        }
    }

    pub fn from_ack(ack: &SubmissionAck) -> Self {
        match ack.status {
            AckOutcome::Success => Job {
                id: ack.job_id.clone().unwrap_or_default(),
                status: JobStatus::Accepted,
                response_code: ack.http_status_code,
                ..Job::default()
            },
            AckOutcome::Failed => Job {
                status: JobStatus::Failed,
                response_code: ack.http_status_code,
                error_details: ack.details.clone(),
                ..Job::default()
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    pub fn failed(&self) -> bool {
        self.status == JobStatus::Failed
    }
}

/// Describes a job to submit: which algorithm to run and its literal inputs.
///
/// Input order is preserved in the rendered request; setting a name twice
/// overwrites in place.
///
/// ```
/// use maap::JobSpec;
///
/// let spec = JobSpec::new("topo-mosaic", "v1.2")
///     .identifier("mosaic over svalbard")
///     .queue("maap-worker-8gb")
///     .input("bbox", "8.1,77.2,20.5,80.0");
/// ```
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub algorithm_id: String,
    pub version: String,
    inputs: Vec<(String, String)>,
}

impl JobSpec {
    pub fn new(algorithm_id: impl Into<String>, version: impl Into<String>) -> Self {
        JobSpec {
            algorithm_id: algorithm_id.into(),
            version: version.into(),
            inputs: Vec::new(),
        }
    }

    /// Human-readable label for the submission.
    pub fn identifier(self, value: impl Into<String>) -> Self {
        self.input("identifier", value)
    }

    /// Target resource queue.
    pub fn queue(self, value: impl Into<String>) -> Self {
        self.input("queue", value)
    }

    /// Submitting username. Defaults to `anonymous` when never set.
    pub fn username(self, value: impl Into<String>) -> Self {
        self.input("username", value)
    }

    pub fn input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.inputs.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.inputs.push((name, value));
        }
        self
    }

    pub fn inputs(&self) -> &[(String, String)] {
        &self.inputs
    }
}
