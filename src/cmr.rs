//! Helpers for the catalog (CMR) search endpoints: response envelope
//! unwrapping, echo10 XML to JSON metadata conversion, and query-parameter
//! expansion. The paging loop lives on [`Client`](crate::Client).

use roxmltree::{Document, Node};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Search terms for the catalog endpoints, applied in insertion order.
///
/// ```
/// use maap::SearchQuery;
///
/// let query = SearchQuery::new()
///     .param("short_name", "GEDI02_A")
///     .param("temporal", "2019-04-20T00:00:00Z,2019-05-20T00:00:00Z");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    terms: Vec<(String, String)>,
}

impl SearchQuery {
    pub fn new() -> Self {
        SearchQuery::default()
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.push((key.into(), value.into()));
        self
    }

    pub(crate) fn terms(&self) -> &[(String, String)] {
        &self.terms
    }
}

/// Expands user terms into the wire parameters the catalog expects:
/// `|`-delimited values become repeated `key[]` entries, and values with
/// `*` or `?` wildcards get the matching `options[key][pattern]` flag.
pub(crate) fn expand_query_params(terms: &[(String, String)]) -> Vec<(String, String)> {
    let mut params = Vec::new();
    for (key, value) in terms {
        if value.contains('|') {
            for piece in value.split('|') {
                params.push((format!("{key}[]"), piece.to_string()));
            }
        } else if value.contains('*') || value.contains('?') {
            params.push((format!("options[{key}][pattern]"), "true".to_string()));
            params.push((key.clone(), value.clone()));
        } else {
            params.push((key.clone(), value.clone()));
        }
    }
    params
}

/// The search endpoints return the catalog's XML wrapped in a JSON string:
/// a leading quote, a trailing quote plus newline, and backslash-escaped
/// quotes throughout. Some error replies additionally prepend `CMR Error `
/// before the document.
pub(crate) fn strip_envelope(text: &str) -> String {
    let mut inner: String = text.chars().skip(1).collect();
    inner.pop();
    inner.pop();
    let mut inner = inner.replace('\\', "");
    if let Some(rest) = inner.strip_prefix("CMR Error <") {
        inner = format!("<{rest}");
    }
    inner
}

/// Unwraps one response page and converts each `result` child to JSON
/// metadata. An `error` child fails the whole search.
pub(crate) fn parse_search_page(body: &str) -> Result<Vec<Value>> {
    let page = strip_envelope(body);
    let doc = Document::parse(&page)
        .map_err(|_| Error::Search(format!("unparsable search response: {page}")))?;

    let mut results = Vec::new();
    for child in doc.root_element().children().filter(|n| n.is_element()) {
        match child.tag_name().name() {
            "result" => results.push(xml_to_value(child)),
            "error" => return Err(Error::Search(format!("bad search response: {page}"))),
            _ => {}
        }
    }
    Ok(results)
}

/// echo10 XML to a JSON value. Attributes merge into the element's object.
/// Two or more children sharing a tag render as a list under that tag; a
/// single child renders as a plain object, which is why consumers must
/// accept both shapes for repeatable elements.
pub(crate) fn xml_to_value(node: Node<'_, '_>) -> Value {
    let children: Vec<Node<'_, '_>> = node.children().filter(|n| n.is_element()).collect();

    if children.is_empty() {
        if node.attributes().next().is_some() {
            return Value::Object(attribute_map(node));
        }
        return match node.text().map(str::trim).filter(|t| !t.is_empty()) {
            Some(text) => Value::String(text.to_string()),
            None => Value::Null,
        };
    }

    let mut map = attribute_map(node);

    if children.len() >= 2 && children[0].tag_name().name() == children[1].tag_name().name() {
        let items: Vec<Value> = children
            .iter()
            .map(|c| xml_to_value(*c))
            .filter(|v| !v.is_null())
            .collect();
        map.insert(children[0].tag_name().name().to_string(), Value::Array(items));
        return Value::Object(map);
    }

    for child in children {
        map.insert(child.tag_name().name().to_string(), xml_to_value(child));
    }
    Value::Object(map)
}

fn attribute_map(node: Node<'_, '_>) -> Map<String, Value> {
    let mut map = Map::new();
    for attr in node.attributes() {
        map.insert(attr.name().to_string(), Value::String(attr.value().to_string()));
    }
    map
}
