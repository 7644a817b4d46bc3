//! Response Bundle assembly.

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::core::BundleEntryResult;
use crate::error::{StorageError, TransactionError};
use crate::outcome;

use super::parser::BundleKind;

/// Builds the `transaction-response` or `batch-response` Bundle.
///
/// Entries keep request order. `full_urls` holds the response `fullUrl` for
/// each entry, when known.
pub fn build_response(
    kind: BundleKind,
    results: &[BundleEntryResult],
    full_urls: &[Option<String>],
) -> Value {
    let entries: Vec<Value> = results
        .iter()
        .enumerate()
        .map(|(i, result)| result.to_entry(full_urls.get(i).cloned().flatten()))
        .collect();

    json!({
        "resourceType": "Bundle",
        "id": Uuid::new_v4().to_string(),
        "meta": {"lastUpdated": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)},
        "type": kind.response_type(),
        "entry": entries
    })
}

/// Acknowledges a pass-through Bundle that passed structural validation.
pub fn build_pass_through(kind: BundleKind, entry_count: usize) -> Value {
    let diagnostics = format!(
        "{} Bundle with {} entries is structurally valid; nothing was persisted",
        kind.as_str(),
        entry_count
    );
    json!({
        "resourceType": "Bundle",
        "id": Uuid::new_v4().to_string(),
        "type": kind.response_type(),
        "total": entry_count,
        "entry": [{
            "response": {
                "status": "200 OK",
                "outcome": outcome::all_ok(diagnostics)
            }
        }]
    })
}

/// Renders a failed entry: its status and an OperationOutcome.
pub fn error_entry(err: &StorageError) -> BundleEntryResult {
    BundleEntryResult::error(err.http_status(), outcome::from_error(err))
}

/// Wraps the error that aborted a `transaction` at entry `index`.
pub fn entry_failure(index: usize, err: StorageError) -> StorageError {
    match err {
        StorageError::Transaction(TransactionError::Timeout { .. })
        | StorageError::Transaction(TransactionError::BundleError { .. }) => err,
        other => TransactionError::BundleError {
            index,
            message: other.to_string(),
            source: Some(Box::new(other)),
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceError;

    #[test]
    fn test_response_keeps_order() {
        let results = vec![
            BundleEntryResult::deleted(),
            BundleEntryResult::error(404, json!({"resourceType": "OperationOutcome"})),
        ];
        let bundle = build_response(
            BundleKind::Batch,
            &results,
            &[None, Some("Patient/x".to_string())],
        );
        assert_eq!(bundle["type"], "batch-response");
        assert_eq!(bundle["entry"][0]["response"]["status"], "204 No Content");
        assert_eq!(bundle["entry"][1]["response"]["status"], "404 Not Found");
        assert_eq!(bundle["entry"][1]["fullUrl"], "Patient/x");
    }

    #[test]
    fn test_error_entry_status() {
        let err: StorageError = ResourceError::Gone {
            resource_type: "Patient".to_string(),
            id: "1".to_string(),
            deleted_at: None,
        }
        .into();
        let entry = error_entry(&err);
        assert_eq!(entry.status, 410);
        assert_eq!(
            entry.outcome.as_ref().unwrap()["issue"][0]["code"],
            "deleted"
        );
    }

    #[test]
    fn test_entry_failure_wraps_once() {
        let inner: StorageError = ResourceError::NotFound {
            resource_type: "Patient".to_string(),
            id: "1".to_string(),
        }
        .into();
        let wrapped = entry_failure(3, inner);
        assert_eq!(wrapped.http_status(), 404);
        let rewrapped = entry_failure(5, wrapped);
        match rewrapped {
            StorageError::Transaction(TransactionError::BundleError { index, .. }) => {
                assert_eq!(index, 3)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_pass_through() {
        let bundle = build_pass_through(BundleKind::Collection, 2);
        assert_eq!(bundle["type"], "collection");
        assert_eq!(bundle["total"], 2);
    }
}
