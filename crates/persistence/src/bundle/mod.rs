//! Backend-independent Bundle handling.
//!
//! - [`parser`] - Structural validation and typed entries
//! - [`references`] - `urn:uuid:` placeholder resolution
//! - [`response`] - Response Bundle assembly
//!
//! Backends execute the parsed entries; see
//! [`BundleProvider`](crate::core::BundleProvider).

pub mod parser;
pub mod references;
pub mod response;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use crate::error::{StorageResult, ValidationError};

pub use parser::{
    BundleKind, EntryMethod, EntryTarget, ParsedBundle, ParsedEntry, parse_bundle,
};
pub use references::{ReferenceMap, has_placeholder_references};
pub use response::{build_pass_through, build_response, entry_failure, error_entry};

/// Extracts the JSON Patch document carried by a PATCH entry.
///
/// The patch travels as a `Binary` whose base64 `data` is an
/// `application/json-patch+json` document.
pub fn patch_document(resource: &Value) -> StorageResult<Value> {
    match resource.get("resourceType").and_then(Value::as_str) {
        Some("Binary") => {
            let data = resource.get("data").and_then(Value::as_str).ok_or_else(|| {
                ValidationError::MissingRequiredField {
                    field: "Binary.data".to_string(),
                }
            })?;
            let bytes = STANDARD
                .decode(data)
                .map_err(|e| ValidationError::InvalidResource {
                    message: format!("Binary.data is not base64: {}", e),
                    details: Vec::new(),
                })?;
            Ok(serde_json::from_slice(&bytes).map_err(|e| ValidationError::InvalidResource {
                message: format!("Binary.data is not a JSON Patch document: {}", e),
                details: Vec::new(),
            })?)
        }
        other => Err(ValidationError::InvalidResource {
            message: format!(
                "PATCH entries must carry a Binary resource, found {}",
                other.unwrap_or("none")
            ),
            details: Vec::new(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_document_from_binary() {
        let patch = json!([{"op": "replace", "path": "/active", "value": true}]);
        let binary = json!({
            "resourceType": "Binary",
            "contentType": "application/json-patch+json",
            "data": STANDARD.encode(patch.to_string())
        });
        assert_eq!(patch_document(&binary).unwrap(), patch);
    }

    #[test]
    fn test_patch_document_rejects_other_types() {
        let err = patch_document(&json!({"resourceType": "Patient"})).unwrap_err();
        assert_eq!(err.http_status(), 422);
        let err = patch_document(&json!({"resourceType": "Binary", "data": "%%%"})).unwrap_err();
        assert_eq!(err.http_status(), 422);
    }
}
