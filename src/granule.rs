use serde_json::Value;

use crate::util::basename_from_url;

/// Transfer protocol of a download candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    S3,
    Https,
    Ftp,
}

impl Scheme {
    pub fn of(url: &str) -> Scheme {
        if url.starts_with("s3://") {
            Scheme::S3
        } else if url.starts_with("ftp") {
            Scheme::Ftp
        } else {
            Scheme::Https
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadCandidate {
    pub scheme: Scheme,
    pub url: String,
}

/// Where to fetch a granule from, resolved once per granule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub primary: DownloadCandidate,
    /// HTTPS mirror sharing the primary's basename, used when a direct S3
    /// read is not possible. Equal to the primary when the primary itself
    /// is the matching HTTPS URL.
    pub fallback: Option<DownloadCandidate>,
    /// Local filename for downloads. Never empty.
    pub destination_name: String,
}

/// Picks the download location from the candidate URLs, in document order:
/// the first `s3://` URL wins, else the first candidate of any scheme. The
/// fallback is the first `https://` candidate whose full URL ends with the
/// primary's basename, which skips sidecar files (`.sha256`) and console
/// URLs carrying query strings.
pub fn resolve_location(candidates: &[String]) -> Option<Location> {
    let primary_url = candidates
        .iter()
        .find(|u| u.starts_with("s3://"))
        .or_else(|| candidates.first())?;

    let filename = basename_from_url(primary_url).unwrap_or_default();
    let fallback = candidates
        .iter()
        .find(|u| u.starts_with("https://") && u.ends_with(filename.as_str()))
        .map(|u| DownloadCandidate {
            scheme: Scheme::Https,
            url: u.clone(),
        });

    let destination_name = {
        let cleaned = filename.replace('/', "");
        if cleaned.is_empty() { "download".to_string() } else { cleaned }
    };

    Some(Location {
        primary: DownloadCandidate {
            scheme: Scheme::of(primary_url),
            url: primary_url.clone(),
        },
        fallback,
        destination_name,
    })
}

/// A granule (one data file) from a catalog search.
///
/// The commonly used fields are lifted out; `raw` keeps the full metadata
/// document for anything else.
#[derive(Debug, Clone, PartialEq)]
pub struct Granule {
    pub granule_ur: String,
    pub collection_concept_id: String,
    /// Access URLs in document order, after singleton normalization.
    pub related_urls: Vec<String>,
    pub location: Option<Location>,
    pub opendap_url: Option<String>,
    pub browse_url: Option<String>,
    pub raw: Value,
}

impl Granule {
    pub fn from_metadata(raw: Value) -> Granule {
        let related_urls: Vec<String> =
            singleton_or_list(raw.pointer("/Granule/OnlineAccessURLs/OnlineAccessURL"))
                .iter()
                .filter_map(|entry| entry.get("URL").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
        let location = resolve_location(&related_urls);

        let resources = singleton_or_list(raw.pointer("/Granule/OnlineResources/OnlineResource"));
        let resource_url = |kind: &str| {
            resources
                .iter()
                .find(|r| r.get("Type").and_then(Value::as_str) == Some(kind))
                .and_then(|r| r.get("URL").and_then(Value::as_str))
                .map(str::to_string)
        };
        let opendap_url = resource_url("OPeNDAP");
        let browse_url = resource_url("BROWSE");

        Granule {
            granule_ur: string_at(&raw, "/Granule/GranuleUR"),
            collection_concept_id: string_at(&raw, "/collection-concept-id"),
            related_urls,
            location,
            opendap_url,
            browse_url,
            raw,
        }
    }

    /// One-line summary: identifier, last update time, parent collection.
    pub fn description(&self) -> String {
        format!(
            "{:<70} Updated {} ({})",
            self.granule_ur,
            string_at(&self.raw, "/Granule/LastUpdate"),
            self.collection_concept_id,
        )
    }
}

/// A collection (dataset) from a catalog search.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub concept_id: String,
    pub short_name: String,
    /// Link to the UMM-JSON metadata record.
    pub metadata_url: String,
    pub raw: Value,
}

impl Collection {
    pub fn from_metadata(raw: Value, maap_host: &str) -> Collection {
        let concept_id = string_at(&raw, "/concept-id");
        Collection {
            metadata_url: format!("https://{maap_host}/search/concepts/{concept_id}.umm-json"),
            short_name: string_at(&raw, "/Collection/ShortName"),
            concept_id,
            raw,
        }
    }
}

/// The XML-derived metadata renders a single repeated element as an object
/// instead of a one-element list; accept both.
fn singleton_or_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(obj @ Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    }
}

fn string_at(raw: &Value, pointer: &str) -> String {
    raw.pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
