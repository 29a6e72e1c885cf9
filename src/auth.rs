use std::path::Path;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use crate::error::{Error, Result};

pub(crate) const JOB_SENTINEL: &str = "_job.json";
pub(crate) const TOKEN_SENTINEL: &str = "_maap_dps_token.txt";

/// How the client proves itself when a data URL answers 401.
///
/// Resolved once at client construction and immutable afterwards:
/// `JobRuntimeToken` inside a DPS worker (both sentinel files present in the
/// working directory), `ProxyDelegate` in an interactive workspace holding
/// platform credentials, `Unauthenticated` otherwise. An `Unauthenticated`
/// client turns 401 into a hard error instead of escalating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    Unauthenticated,
    JobRuntimeToken {
        machine_token: String,
        job_id: String,
        token_endpoint: String,
    },
    ProxyDelegate {
        token: String,
        proxy_ticket: Option<String>,
        relay_endpoint: String,
    },
}

pub(crate) fn detect(
    token: &str,
    proxy_ticket: Option<&str>,
    token_endpoint: &str,
    relay_endpoint: &str,
) -> Result<AuthContext> {
    detect_in(Path::new("."), token, proxy_ticket, token_endpoint, relay_endpoint)
}

/// Sentinel-file detection, rooted at `dir`. A DPS worker drops `_job.json`
/// and `_maap_dps_token.txt` into the job's working directory; both must be
/// present and well formed.
pub(crate) fn detect_in(
    dir: &Path,
    token: &str,
    proxy_ticket: Option<&str>,
    token_endpoint: &str,
    relay_endpoint: &str,
) -> Result<AuthContext> {
    let job_file = dir.join(JOB_SENTINEL);
    let token_file = dir.join(TOKEN_SENTINEL);

    if job_file.exists() && token_file.exists() {
        let machine_token = std::fs::read_to_string(&token_file)
            .map_err(|e| Error::Config(format!("unreadable {TOKEN_SENTINEL}: {e}")))?
            .replace('\n', "");
        let descriptor = std::fs::read_to_string(&job_file)
            .map_err(|e| Error::Config(format!("unreadable {JOB_SENTINEL}: {e}")))?;
        let payload: serde_json::Value = serde_json::from_str(&descriptor)
            .map_err(|e| Error::Config(format!("invalid {JOB_SENTINEL}: {e}")))?;
        let job_id = payload
            .pointer("/job_info/job_payload/payload_task_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Config(format!("{JOB_SENTINEL} carries no payload_task_id")))?
            .to_string();

        return Ok(AuthContext::JobRuntimeToken {
            machine_token,
            job_id,
            token_endpoint: token_endpoint.to_string(),
        });
    }

    if token.is_empty() {
        return Ok(AuthContext::Unauthenticated);
    }

    Ok(AuthContext::ProxyDelegate {
        token: token.to_string(),
        proxy_ticket: proxy_ticket.map(str::to_string),
        relay_endpoint: relay_endpoint.to_string(),
    })
}

/// Builds the per-request header set. Tokens that already carry a scheme
/// (`Basic`/`Bearer`) go into `Authorization`; opaque tokens go into the
/// platform's `token` header.
pub(crate) fn request_headers(
    accept: &str,
    token: &str,
    proxy_ticket: Option<&str>,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, header_value(accept)?);
    headers.insert(CONTENT_TYPE, header_value(accept)?);

    let lowered = token.to_ascii_lowercase();
    if lowered.starts_with("basic") || lowered.starts_with("bearer") {
        headers.insert(AUTHORIZATION, header_value(token)?);
    } else {
        headers.insert(HeaderName::from_static("token"), header_value(token)?);
    }

    if let Some(ticket) = proxy_ticket {
        headers.insert(HeaderName::from_static("proxy-ticket"), header_value(ticket)?);
    }

    Ok(headers)
}

pub(crate) fn header_value(v: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(v).map_err(|e| Error::Config(format!("invalid header value: {e}")))
}
