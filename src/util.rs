use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::time::Duration;

/// Wait before attempt `attempt` (counted from zero): `base * 2^attempt`,
/// capped at `max`.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(16);
    base.saturating_mul(factor).min(max)
}

/// Final path segment of a URL, ignoring query and fragment. `None` when the
/// URL has no path or the path ends in `/`.
pub(crate) fn basename_from_url(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let path = rest.split_once('/')?.1;
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let name = path.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Host (with port, if any) of a URL.
pub(crate) fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    if host.is_empty() { None } else { Some(host) }
}

pub(crate) fn urljoin(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

// Everything except unreserved characters, matching what the platform's
// relay endpoint expects for an embedded URL path segment.
const QUOTE_ALL: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode twice, so the result survives one decode by the routing
/// layer and still reaches the relay handler as a single path segment.
pub(crate) fn double_urlencode(s: &str) -> String {
    let once = utf8_percent_encode(s, QUOTE_ALL).to_string();
    utf8_percent_encode(&once, QUOTE_ALL).to_string()
}
