//! Codec for the WPS 2.0 documents the DPS endpoints speak: the Execute
//! request, the submission acknowledgment, and the status, result and
//! metrics payloads. Pure functions, no I/O.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};

use crate::error::{Error, Result};
use crate::job::{JobMetrics, JobSpec, JobStatus, SubmissionAck};

/// Renders the Execute request for a submission. The service identifies the
/// target process as `job-{algorithm}:{version}`; every input is a literal
/// value. A `username` input (default `anonymous`) and a `timestamp` input
/// are appended when the job spec does not carry them.
pub(crate) fn build_execute(spec: &JobSpec) -> String {
    build_execute_at(spec, Utc::now())
}

pub(crate) fn build_execute_at(spec: &JobSpec, timestamp: DateTime<Utc>) -> String {
    let mut inputs = String::new();
    for (name, value) in spec.inputs() {
        push_input(&mut inputs, name, value);
    }
    if !spec.inputs().iter().any(|(n, _)| n == "username") {
        push_input(&mut inputs, "username", "anonymous");
    }
    push_input(&mut inputs, "timestamp", &timestamp.to_rfc3339());

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<wps:Execute xmlns:wps="http://www.opengis.net/wps/2.0" xmlns:ows="http://www.opengis.net/ows/2.0" service="WPS" version="2.0.0" response="document" mode="async">
  <ows:Identifier>job-{algorithm}:{version}</ows:Identifier>
{inputs}  <wps:Output id="output" transmission="reference"/>
</wps:Execute>
"#,
        algorithm = xml_escape(&spec.algorithm_id),
        version = xml_escape(&spec.version),
        inputs = inputs,
    )
}

fn push_input(buf: &mut String, name: &str, value: &str) {
    buf.push_str(&format!(
        "  <wps:Input id=\"{}\">\n    <wps:Data>\n      <wps:LiteralValue>{}</wps:LiteralValue>\n    </wps:Data>\n  </wps:Input>\n",
        xml_escape(name),
        xml_escape(value),
    ));
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Normalizes whatever came back from a submission into a [`SubmissionAck`].
/// Total: every response shape maps to an ack, never an error.
///
/// The service reports request problems as an Exception document inside a
/// 200 reply; those are normalized to a failed ack with code 400.
pub(crate) fn parse_submission_ack(http_status: u16, body: &str) -> SubmissionAck {
    if !(200..300).contains(&http_status) {
        return SubmissionAck::failed(Some(http_status), body.to_string());
    }

    let doc = match Document::parse(body) {
        Ok(doc) => doc,
        Err(_) => {
            return SubmissionAck::failed(
                Some(http_status),
                format!("unparsable submission response: {body}"),
            );
        }
    };

    if let Some(exception) = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "Exception")
    {
        let code = exception.attribute("exceptionCode").unwrap_or("unknown");
        let text = exception
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "ExceptionText")
            .and_then(|n| n.text())
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let details = match text {
            Some(text) => format!("Exception: {code}: {text}"),
            None => format!("Exception: {code}"),
        };
        return SubmissionAck::failed(Some(400), details);
    }

    match child_text(doc.root_element(), "JobID") {
        Some(job_id) => SubmissionAck::success(http_status, job_id),
        None => SubmissionAck::failed(
            Some(http_status),
            format!("submission response carried no job id: {body}"),
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusInfo {
    pub job_id: Option<String>,
    pub status: JobStatus,
}

/// Parses a StatusInfo document. Children are matched by local name, so any
/// namespace prefix the service chooses is accepted.
pub(crate) fn parse_status(body: &str) -> Result<StatusInfo> {
    let doc = Document::parse(body).map_err(|e| malformed("status", e.to_string(), body))?;
    let root = doc.root_element();
    let status = child_text(root, "Status")
        .ok_or_else(|| malformed("status", "missing Status element".to_string(), body))?;
    Ok(StatusInfo {
        job_id: child_text(root, "JobID"),
        status: status.parse()?,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ResultDocument {
    /// Product URLs in document order.
    pub outputs: Vec<String>,
    /// Traceback lines from an `Error` element, if the job failed.
    pub errors: Vec<String>,
}

pub(crate) fn parse_results(body: &str) -> Result<ResultDocument> {
    let doc = Document::parse(body).map_err(|e| malformed("result", e.to_string(), body))?;
    let mut parsed = ResultDocument::default();
    for child in doc.root_element().children().filter(|n| n.is_element()) {
        match child.tag_name().name() {
            "Output" => {
                for data in element_children(child, "Data") {
                    if let Some(url) = non_empty_text(data) {
                        parsed.outputs.push(url);
                    }
                }
            }
            "Error" => {
                let mut lines = 0;
                for line in child.children().filter(|n| n.is_element()) {
                    if let Some(text) = non_empty_text(line) {
                        parsed.errors.push(text);
                        lines += 1;
                    }
                }
                if lines == 0 {
                    if let Some(text) = non_empty_text(child) {
                        parsed.errors.push(text);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(parsed)
}

/// Parses the flat metrics document. Every element lands in the raw map
/// verbatim; [`JobMetrics::from_raw`] decides which values are typed.
pub(crate) fn parse_metrics(body: &str) -> Result<JobMetrics> {
    let doc = Document::parse(body).map_err(|e| malformed("metrics", e.to_string(), body))?;
    let mut raw = BTreeMap::new();
    for child in doc.root_element().children().filter(|n| n.is_element()) {
        raw.insert(
            child.tag_name().name().to_string(),
            child.text().unwrap_or("").to_string(),
        );
    }
    Ok(JobMetrics::from_raw(raw))
}

fn child_text(node: Node<'_, '_>, local_name: &str) -> Option<String> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == local_name)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn element_children<'a, 'input>(
    node: Node<'a, 'input>,
    local_name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == local_name)
}

fn non_empty_text(node: Node<'_, '_>) -> Option<String> {
    node.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn malformed(kind: &'static str, detail: String, raw: &str) -> Error {
    Error::MalformedDocument {
        kind,
        detail,
        raw: raw.to_string(),
    }
}
