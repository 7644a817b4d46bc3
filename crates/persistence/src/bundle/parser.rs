//! Up-front structural validation of submitted Bundles.
//!
//! Nothing executes until the whole Bundle has been parsed into typed
//! entries. Any structural problem fails the Bundle with
//! [`TransactionError::MalformedBundle`] and an expression pointing at the
//! offending element.

use serde_json::Value;

use crate::error::TransactionError;
use crate::search::parse_query_string;
use crate::types::is_valid_id;

/// The `Bundle.type` values the processor accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    /// All-or-nothing execution.
    Transaction,
    /// Independent execution per entry.
    Batch,
    /// Bare resources; validated only.
    Collection,
    /// Search results; validated only.
    Searchset,
    /// History entries; validated only.
    History,
    /// A document led by a Composition; validated only.
    Document,
}

impl BundleKind {
    /// Parses a `Bundle.type` code.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transaction" => Some(BundleKind::Transaction),
            "batch" => Some(BundleKind::Batch),
            "collection" => Some(BundleKind::Collection),
            "searchset" => Some(BundleKind::Searchset),
            "history" => Some(BundleKind::History),
            "document" => Some(BundleKind::Document),
            _ => None,
        }
    }

    /// Returns the `Bundle.type` code.
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleKind::Transaction => "transaction",
            BundleKind::Batch => "batch",
            BundleKind::Collection => "collection",
            BundleKind::Searchset => "searchset",
            BundleKind::History => "history",
            BundleKind::Document => "document",
        }
    }

    /// Returns the type of the response Bundle.
    pub fn response_type(&self) -> &'static str {
        match self {
            BundleKind::Transaction => "transaction-response",
            BundleKind::Batch => "batch-response",
            other => other.as_str(),
        }
    }
}

/// HTTP method of an executable entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMethod {
    /// Read, vread or search.
    Get,
    /// Create or conditional create.
    Post,
    /// Update or conditional update.
    Put,
    /// JSON Patch.
    Patch,
    /// Delete.
    Delete,
}

impl EntryMethod {
    /// Parses `Bundle.entry.request.method`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(EntryMethod::Get),
            "POST" => Some(EntryMethod::Post),
            "PUT" => Some(EntryMethod::Put),
            "PATCH" => Some(EntryMethod::Patch),
            "DELETE" => Some(EntryMethod::Delete),
            _ => None,
        }
    }
}

/// What an entry's `request.url` addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryTarget {
    /// `Type`
    Type(String),
    /// `Type/id`
    Instance {
        /// Resource type.
        resource_type: String,
        /// Logical id.
        id: String,
    },
    /// `Type/id/_history/vid`
    Version {
        /// Resource type.
        resource_type: String,
        /// Logical id.
        id: String,
        /// Version id.
        version_id: String,
    },
    /// `Type?criteria`
    Search {
        /// Resource type.
        resource_type: String,
        /// Decoded query parameters.
        params: Vec<(String, String)>,
    },
}

impl EntryTarget {
    /// Parses a relative or absolute request URL.
    pub fn parse(url: &str) -> Option<Self> {
        let url = url.trim();
        let relative = match url.split_once("://") {
            Some((_, rest)) => rest.split_once('/').map(|(_, path)| path)?,
            None => url,
        };
        let relative = relative.trim_start_matches('/');

        let (path, query) = match relative.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (relative, None),
        };
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        if let Some(query) = query {
            let [resource_type] = segments[..] else {
                return None;
            };
            return Some(EntryTarget::Search {
                resource_type: resource_type.to_string(),
                params: parse_query_string(query),
            });
        }

        match segments[..] {
            [resource_type] => Some(EntryTarget::Type(resource_type.to_string())),
            [resource_type, id] if is_valid_id(id) => Some(EntryTarget::Instance {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            }),
            [resource_type, id, "_history", version_id] if is_valid_id(id) => {
                Some(EntryTarget::Version {
                    resource_type: resource_type.to_string(),
                    id: id.to_string(),
                    version_id: version_id.to_string(),
                })
            }
            _ => None,
        }
    }

    /// Returns the addressed resource type.
    pub fn resource_type(&self) -> &str {
        match self {
            EntryTarget::Type(t) => t,
            EntryTarget::Instance { resource_type, .. }
            | EntryTarget::Version { resource_type, .. }
            | EntryTarget::Search { resource_type, .. } => resource_type,
        }
    }
}

/// A structurally valid executable entry.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    /// Position in the submitted Bundle.
    pub index: usize,
    /// `entry.fullUrl`, used to resolve `urn:uuid:` references.
    pub full_url: Option<String>,
    /// `entry.resource`.
    pub resource: Option<Value>,
    /// `entry.request.method`.
    pub method: EntryMethod,
    /// `entry.request.url`, parsed.
    pub target: EntryTarget,
    /// `entry.request.ifMatch`.
    pub if_match: Option<String>,
    /// `entry.request.ifNoneExist`, decoded.
    pub if_none_exist: Option<Vec<(String, String)>>,
}

/// A Bundle that passed structural validation.
#[derive(Debug, Clone)]
pub struct ParsedBundle {
    /// `Bundle.type`.
    pub kind: BundleKind,
    /// Executable entries; empty for pass-through kinds.
    pub entries: Vec<ParsedEntry>,
    /// Number of entries in the submitted Bundle.
    pub entry_count: usize,
}

fn malformed(message: impl Into<String>, expression: impl Into<String>) -> TransactionError {
    TransactionError::MalformedBundle {
        message: message.into(),
        expression: Some(expression.into()),
    }
}

/// Validates a submitted Bundle and lifts its entries.
pub fn parse_bundle(bundle: &Value, max_entries: usize) -> Result<ParsedBundle, TransactionError> {
    let obj = bundle
        .as_object()
        .ok_or_else(|| malformed("Bundle must be a JSON object", "Bundle"))?;

    if obj.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return Err(malformed("resourceType must be Bundle", "Bundle.resourceType"));
    }

    let type_code = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("Bundle.type is required", "Bundle.type"))?;
    let kind = BundleKind::parse(type_code).ok_or_else(|| {
        malformed(format!("unsupported Bundle.type '{}'", type_code), "Bundle.type")
    })?;

    let raw_entries: &[Value] = match obj.get("entry") {
        None | Some(Value::Null) => &[],
        Some(Value::Array(entries)) => entries,
        Some(_) => return Err(malformed("Bundle.entry must be an array", "Bundle.entry")),
    };
    if raw_entries.len() > max_entries {
        return Err(malformed(
            format!(
                "Bundle has {} entries, the limit is {}",
                raw_entries.len(),
                max_entries
            ),
            "Bundle.entry",
        ));
    }

    let mut entries = Vec::new();
    for (index, raw) in raw_entries.iter().enumerate() {
        let path = format!("Bundle.entry[{}]", index);
        let entry = raw
            .as_object()
            .ok_or_else(|| malformed("entry must be an object", &path))?;

        if let Some(resource) = entry.get("resource") {
            if resource.get("resourceType").and_then(Value::as_str).is_none() {
                return Err(malformed(
                    "entry.resource must declare a resourceType",
                    format!("{}.resource.resourceType", path),
                ));
            }
        }

        match kind {
            BundleKind::Transaction | BundleKind::Batch => {
                entries.push(parse_entry(index, raw, &path)?);
            }
            BundleKind::Collection | BundleKind::Searchset | BundleKind::Document => {
                if entry.get("resource").is_none() {
                    return Err(malformed(
                        format!("{} entries must carry a resource", kind.as_str()),
                        format!("{}.resource", path),
                    ));
                }
            }
            BundleKind::History => {
                if entry.get("request").is_none() && entry.get("resource").is_none() {
                    return Err(malformed(
                        "history entries must carry a request or a resource",
                        path,
                    ));
                }
            }
        }
    }

    if kind == BundleKind::Document {
        let leads_with_composition = raw_entries
            .first()
            .and_then(|e| e.get("resource"))
            .and_then(|r| r.get("resourceType"))
            .and_then(Value::as_str)
            == Some("Composition");
        if !leads_with_composition {
            return Err(malformed(
                "a document Bundle must start with a Composition",
                "Bundle.entry[0].resource",
            ));
        }
    }

    Ok(ParsedBundle {
        kind,
        entries,
        entry_count: raw_entries.len(),
    })
}

fn parse_entry(index: usize, raw: &Value, path: &str) -> Result<ParsedEntry, TransactionError> {
    let request = raw
        .get("request")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("entry.request is required", format!("{}.request", path)))?;

    let method_code = request.get("method").and_then(Value::as_str).ok_or_else(|| {
        malformed(
            "entry.request.method is required",
            format!("{}.request.method", path),
        )
    })?;
    let method = EntryMethod::parse(method_code).ok_or_else(|| {
        malformed(
            format!("unsupported method '{}'", method_code),
            format!("{}.request.method", path),
        )
    })?;

    let url = request
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("entry.request.url is required", format!("{}.request.url", path)))?;
    let target = EntryTarget::parse(url).ok_or_else(|| {
        malformed(
            format!("cannot parse request url '{}'", url),
            format!("{}.request.url", path),
        )
    })?;

    let url_fits = match method {
        EntryMethod::Get => true,
        EntryMethod::Post => matches!(target, EntryTarget::Type(_)),
        EntryMethod::Put | EntryMethod::Delete => {
            matches!(target, EntryTarget::Instance { .. } | EntryTarget::Search { .. })
        }
        EntryMethod::Patch => matches!(target, EntryTarget::Instance { .. }),
    };
    if !url_fits {
        return Err(malformed(
            format!("{} cannot address '{}'", method_code, url),
            format!("{}.request.url", path),
        ));
    }

    let resource = raw.get("resource").cloned();
    let needs_resource = matches!(
        method,
        EntryMethod::Post | EntryMethod::Put | EntryMethod::Patch
    );
    if needs_resource && resource.is_none() {
        return Err(malformed(
            format!("{} entries must carry a resource", method_code),
            format!("{}.resource", path),
        ));
    }

    Ok(ParsedEntry {
        index,
        full_url: raw.get("fullUrl").and_then(Value::as_str).map(String::from),
        resource,
        method,
        target,
        if_match: request.get("ifMatch").and_then(Value::as_str).map(String::from),
        if_none_exist: request
            .get("ifNoneExist")
            .and_then(Value::as_str)
            .map(parse_query_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expression(err: TransactionError) -> Option<String> {
        match err {
            TransactionError::MalformedBundle { expression, .. } => expression,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_entry_target_forms() {
        assert_eq!(
            EntryTarget::parse("Patient"),
            Some(EntryTarget::Type("Patient".to_string()))
        );
        assert_eq!(
            EntryTarget::parse("http://example.org/fhir/Patient/123"),
            Some(EntryTarget::Instance {
                resource_type: "Patient".to_string(),
                id: "123".to_string()
            })
        );
        assert_eq!(
            EntryTarget::parse("Patient/123/_history/2"),
            Some(EntryTarget::Version {
                resource_type: "Patient".to_string(),
                id: "123".to_string(),
                version_id: "2".to_string()
            })
        );
        assert_eq!(
            EntryTarget::parse("Patient?identifier=http://a%7C1"),
            Some(EntryTarget::Search {
                resource_type: "Patient".to_string(),
                params: vec![("identifier".to_string(), "http://a|1".to_string())]
            })
        );
        assert_eq!(EntryTarget::parse("Patient/1/2/3/4"), None);
    }

    #[test]
    fn test_parse_transaction() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "fullUrl": "urn:uuid:61ebe359-bfdc-4613-8bf2-c5e300945f0a",
                    "resource": {"resourceType": "Patient"},
                    "request": {"method": "POST", "url": "Patient", "ifNoneExist": "identifier=x%7C1"}
                },
                {"request": {"method": "DELETE", "url": "Patient/old"}}
            ]
        });
        let parsed = parse_bundle(&bundle, 10).unwrap();
        assert_eq!(parsed.kind, BundleKind::Transaction);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].method, EntryMethod::Post);
        assert_eq!(
            parsed.entries[0].if_none_exist,
            Some(vec![("identifier".to_string(), "x|1".to_string())])
        );
        assert_eq!(parsed.entries[1].index, 1);
    }

    #[test]
    fn test_missing_type() {
        let err = parse_bundle(&json!({"resourceType": "Bundle"}), 10).unwrap_err();
        assert_eq!(expression(err).as_deref(), Some("Bundle.type"));

        let err = parse_bundle(&json!({"resourceType": "Bundle", "type": "message"}), 10).unwrap_err();
        assert_eq!(expression(err).as_deref(), Some("Bundle.type"));
    }

    #[test]
    fn test_missing_request_method() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                {"request": {"method": "GET", "url": "Patient/1"}},
                {"resource": {"resourceType": "Patient"}, "request": {"url": "Patient"}}
            ]
        });
        let err = parse_bundle(&bundle, 10).unwrap_err();
        assert_eq!(expression(err).as_deref(), Some("Bundle.entry[1].request.method"));
    }

    #[test]
    fn test_post_requires_resource() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [{"request": {"method": "POST", "url": "Patient"}}]
        });
        let err = parse_bundle(&bundle, 10).unwrap_err();
        assert_eq!(expression(err).as_deref(), Some("Bundle.entry[0].resource"));
    }

    #[test]
    fn test_collection_entries_need_resources() {
        let ok = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [{"resource": {"resourceType": "Patient"}}]
        });
        let parsed = parse_bundle(&ok, 10).unwrap();
        assert!(parsed.entries.is_empty());
        assert_eq!(parsed.entry_count, 1);

        let bad = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [{"fullUrl": "urn:uuid:1"}]
        });
        assert!(parse_bundle(&bad, 10).is_err());
    }

    #[test]
    fn test_document_needs_composition() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "document",
            "entry": [{"resource": {"resourceType": "Patient"}}]
        });
        let err = parse_bundle(&bundle, 10).unwrap_err();
        assert_eq!(expression(err).as_deref(), Some("Bundle.entry[0].resource"));
    }

    #[test]
    fn test_entry_limit() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                {"request": {"method": "GET", "url": "Patient/1"}},
                {"request": {"method": "GET", "url": "Patient/2"}}
            ]
        });
        assert!(parse_bundle(&bundle, 1).is_err());
        assert!(parse_bundle(&bundle, 2).is_ok());
    }

    #[test]
    fn test_method_url_mismatch() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [{
                "resource": {"resourceType": "Patient"},
                "request": {"method": "POST", "url": "Patient/123"}
            }]
        });
        assert!(parse_bundle(&bundle, 10).is_err());
    }
}
