//! BundleProvider implementation for SQLite.
//!
//! A `transaction` runs every entry on one connection inside a single
//! `BEGIN IMMEDIATE` transaction and commits only if all of them succeed.
//! A `batch` wraps each entry in its own savepoint, so a failed entry is
//! undone without touching its siblings.

use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::bundle::{
    BundleKind, EntryMethod, EntryTarget, ParsedEntry, ReferenceMap, build_pass_through,
    build_response, entry_failure, error_entry, has_placeholder_references, parse_bundle,
    patch_document,
};
use crate::core::{
    BundleEntryResult, BundleOptions, BundleProvider, ConditionalCreateResult,
    ConditionalUpdateResult, full_url, search_link_base,
};
use crate::error::{ConcurrencyError, ResourceError, StorageError, StorageResult, TransactionError};
use crate::types::StoredResource;

use super::SqliteBackend;
use super::backend::{StatementWatchdog, rollback};

const ENTRY_SAVEPOINT: &str = "bundle_entry";

fn timeout_error(budget: Duration) -> StorageError {
    TransactionError::Timeout {
        timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
    }
    .into()
}

/// Entry results in request order with the `fullUrl` of each response entry.
type EntryResults = (Vec<BundleEntryResult>, Vec<Option<String>>);

impl SqliteBackend {
    /// Runs a `transaction` Bundle. Any failure rolls everything back.
    fn transaction_in(
        &self,
        conn: &Connection,
        entries: &[ParsedEntry],
        base_url: &str,
        budget: Duration,
        watchdog: &StatementWatchdog,
    ) -> StorageResult<EntryResults> {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let mut references = ReferenceMap::new();
        let mut results = Vec::with_capacity(entries.len());
        let mut urls = Vec::with_capacity(entries.len());

        for entry in entries {
            if watchdog.overall_expired() {
                watchdog.hold(|| rollback(conn));
                warn!(index = entry.index, "Transaction deadline exceeded; rolled back");
                return Err(timeout_error(budget));
            }
            match self.execute_entry_in(conn, entry, &mut references, base_url) {
                Ok((result, url)) => {
                    results.push(result);
                    urls.push(url);
                }
                Err(e) => {
                    watchdog.hold(|| rollback(conn));
                    warn!(index = entry.index, error = %e, "Transaction entry failed; rolled back");
                    return Err(entry_failure(entry.index, e));
                }
            }
        }

        if watchdog.overall_expired() {
            watchdog.hold(|| rollback(conn));
            warn!("Transaction deadline exceeded before commit; rolled back");
            return Err(timeout_error(budget));
        }
        if let Err(e) = conn.execute_batch("COMMIT") {
            watchdog.hold(|| rollback(conn));
            if watchdog.overall_expired() {
                warn!("Commit interrupted by the deadline; rolled back");
                return Err(timeout_error(budget));
            }
            return Err(TransactionError::RolledBack {
                reason: format!("Commit failed: {}", e),
            }
            .into());
        }
        warn_unresolved(&results);

        debug!(
            entries = entries.len(),
            placeholders = references.len(),
            "Transaction committed"
        );
        Ok((results, urls))
    }

    /// Runs a `batch` Bundle. Each entry succeeds or fails on its own.
    ///
    /// Every entry runs under its own step limit. Once the overall budget is
    /// spent the remaining entries are answered with a timeout instead of
    /// running, and the entries already released stay committed.
    fn batch_in(
        &self,
        conn: &Connection,
        entries: &[ParsedEntry],
        base_url: &str,
        entry_timeout: Duration,
        budget: Duration,
        watchdog: &StatementWatchdog,
    ) -> StorageResult<EntryResults> {
        let mut references = ReferenceMap::new();
        let mut results = Vec::with_capacity(entries.len());
        let mut urls = Vec::with_capacity(entries.len());

        for entry in entries {
            if watchdog.overall_expired() {
                warn!(index = entry.index, "Batch budget spent; entry not run");
                results.push(error_entry(&timeout_error(budget)));
                urls.push(entry.full_url.clone());
                continue;
            }
            watchdog.hold(|| conn.execute_batch(&format!("SAVEPOINT {}", ENTRY_SAVEPOINT)))?;

            watchdog.begin_step(entry_timeout);
            let outcome = self.execute_entry_in(conn, entry, &mut references, base_url);
            let outcome = if watchdog.end_step() {
                Err(timeout_error(entry_timeout))
            } else {
                outcome
            };

            match outcome {
                Ok((result, url)) => {
                    watchdog.hold(|| {
                        conn.execute_batch(&format!("RELEASE SAVEPOINT {}", ENTRY_SAVEPOINT))
                    })?;
                    results.push(result);
                    urls.push(url);
                }
                Err(e) => {
                    watchdog.hold(|| {
                        conn.execute_batch(&format!(
                            "ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0}",
                            ENTRY_SAVEPOINT
                        ))
                    })?;
                    warn!(index = entry.index, error = %e, "Batch entry failed");
                    results.push(error_entry(&e));
                    urls.push(entry.full_url.clone());
                }
            }
        }
        warn_unresolved(&results);
        Ok((results, urls))
    }

    /// Executes one entry and returns its result and response `fullUrl`.
    fn execute_entry_in(
        &self,
        conn: &Connection,
        entry: &ParsedEntry,
        references: &mut ReferenceMap,
        base_url: &str,
    ) -> StorageResult<(BundleEntryResult, Option<String>)> {
        let mut body = entry.resource.clone();
        if let Some(body) = body.as_mut() {
            references.resolve(body);
        }

        match (&entry.method, &entry.target) {
            (EntryMethod::Get, EntryTarget::Type(resource_type)) => {
                let result = self.search_entry_in(conn, resource_type, &[], base_url)?;
                Ok((result, None))
            }
            (EntryMethod::Get, EntryTarget::Search { resource_type, params }) => {
                let mut params = params.clone();
                references.resolve_params(&mut params);
                let result = self.search_entry_in(conn, resource_type, &params, base_url)?;
                Ok((result, None))
            }
            (EntryMethod::Get, EntryTarget::Instance { resource_type, id }) => {
                let stored = self.read_in(conn, resource_type, id)?.ok_or_else(|| {
                    ResourceError::NotFound {
                        resource_type: resource_type.clone(),
                        id: id.clone(),
                    }
                })?;
                self.written(BundleEntryResult::ok, &stored, base_url)
            }
            (EntryMethod::Get, EntryTarget::Version { resource_type, id, version_id }) => {
                let stored = self
                    .vread_in(conn, resource_type, id, version_id)?
                    .ok_or_else(|| ResourceError::VersionNotFound {
                        resource_type: resource_type.clone(),
                        id: id.clone(),
                        version_id: version_id.clone(),
                    })?;
                self.written(BundleEntryResult::ok, &stored, base_url)
            }
            (EntryMethod::Post, EntryTarget::Type(resource_type)) => {
                let body = required_body(body)?;
                let (stored, created) = match &entry.if_none_exist {
                    Some(criteria) => {
                        let mut criteria = criteria.clone();
                        references.resolve_params(&mut criteria);
                        match self.conditional_create_in(conn, resource_type, body, &criteria)? {
                            ConditionalCreateResult::Created(s) => (s, true),
                            ConditionalCreateResult::Exists(s) => (s, false),
                        }
                    }
                    None => (self.create_in(conn, resource_type, body)?, true),
                };
                register(references, entry, &stored);
                if created {
                    self.written(BundleEntryResult::created, &stored, base_url)
                } else {
                    self.written(BundleEntryResult::ok, &stored, base_url)
                }
            }
            (EntryMethod::Put, EntryTarget::Instance { resource_type, id }) => {
                let body = required_body(body)?;
                let (stored, created) =
                    self.upsert_in(conn, resource_type, id, body, entry.if_match.as_deref())?;
                register(references, entry, &stored);
                if created {
                    self.written(BundleEntryResult::created, &stored, base_url)
                } else {
                    self.written(BundleEntryResult::ok, &stored, base_url)
                }
            }
            (EntryMethod::Put, EntryTarget::Search { resource_type, params }) => {
                let body = required_body(body)?;
                let mut params = params.clone();
                references.resolve_params(&mut params);
                match self.conditional_update_in(conn, resource_type, &params, body)? {
                    ConditionalUpdateResult::Created(stored) => {
                        register(references, entry, &stored);
                        self.written(BundleEntryResult::created, &stored, base_url)
                    }
                    ConditionalUpdateResult::Updated(stored) => {
                        register(references, entry, &stored);
                        self.written(BundleEntryResult::ok, &stored, base_url)
                    }
                }
            }
            (EntryMethod::Patch, EntryTarget::Instance { resource_type, id }) => {
                let patch = patch_document(&required_body(body)?)?;
                let stored =
                    self.patch_in(conn, resource_type, id, &patch, entry.if_match.as_deref())?;
                self.written(BundleEntryResult::ok, &stored, base_url)
            }
            (EntryMethod::Delete, EntryTarget::Instance { resource_type, id }) => {
                self.delete_in(conn, resource_type, id)?;
                Ok((BundleEntryResult::deleted(), None))
            }
            (EntryMethod::Delete, EntryTarget::Search { resource_type, params }) => {
                let mut params = params.clone();
                references.resolve_params(&mut params);
                self.conditional_delete_in(conn, resource_type, &params)?;
                Ok((BundleEntryResult::deleted(), None))
            }
            (method, target) => Err(TransactionError::MalformedBundle {
                message: format!(
                    "{:?} cannot address {}",
                    method,
                    target.resource_type()
                ),
                expression: Some(format!("Bundle.entry[{}].request", entry.index)),
            }
            .into()),
        }
    }

    /// Deletes the single live resource matching the criteria, if any.
    fn conditional_delete_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        criteria: &[(String, String)],
    ) -> StorageResult<()> {
        let mut query = self.parse_query(resource_type, criteria)?;
        query.count = Some(2);
        query.page = None;
        query.includes.clear();

        let result = self.search_in(conn, &query)?;
        match result.resources.items.as_slice() {
            [] => Ok(()),
            [single] if result.total() == 1 => {
                self.delete_in(conn, resource_type, single.id())?;
                Ok(())
            }
            _ => Err(ConcurrencyError::MultipleMatches {
                operation: "delete".to_string(),
                resource_type: resource_type.to_string(),
                count: usize::try_from(result.total()).unwrap_or(usize::MAX),
            }
            .into()),
        }
    }

    fn search_entry_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        params: &[(String, String)],
        base_url: &str,
    ) -> StorageResult<BundleEntryResult> {
        let query = self.parse_query(resource_type, params)?;
        let result = self.search_in(conn, &query)?;
        let bundle = result.to_bundle(base_url, &search_link_base(&query), |stored| {
            Ok(self.negotiator().present(stored, None)?)
        })?;
        Ok(BundleEntryResult::body(bundle.to_json()))
    }

    fn written(
        &self,
        make: fn(&StoredResource, Value) -> BundleEntryResult,
        stored: &StoredResource,
        base_url: &str,
    ) -> StorageResult<(BundleEntryResult, Option<String>)> {
        let body = self.negotiator().present(stored, None)?;
        Ok((make(stored, body), Some(full_url(base_url, stored))))
    }
}

fn required_body(body: Option<Value>) -> StorageResult<Value> {
    body.ok_or_else(|| {
        TransactionError::MalformedBundle {
            message: "entry must carry a resource".to_string(),
            expression: None,
        }
        .into()
    })
}

/// Indexes of results whose body still carries a `urn:uuid` reference.
fn unresolved_entries(results: &[BundleEntryResult]) -> Vec<usize> {
    results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.resource.as_ref().is_some_and(has_placeholder_references))
        .map(|(index, _)| index)
        .collect()
}

fn warn_unresolved(results: &[BundleEntryResult]) {
    let unresolved = unresolved_entries(results);
    if !unresolved.is_empty() {
        // forward references to later entries are left as written
        warn!(?unresolved, "Entries reference urn:uuid placeholders that were never resolved");
    }
}

fn register(references: &mut ReferenceMap, entry: &ParsedEntry, stored: &StoredResource) {
    if let Some(full_url) = entry.full_url.as_deref() {
        references.register(full_url, &stored.url());
    }
}

#[async_trait]
impl BundleProvider for SqliteBackend {
    #[instrument(skip(self, bundle, options))]
    async fn process_bundle(&self, bundle: Value, options: &BundleOptions) -> StorageResult<Value> {
        let parsed = parse_bundle(&bundle, options.max_entries)?;
        let kind = parsed.kind;
        let base_url = options.base_url.clone();

        let (results, urls) = match kind {
            BundleKind::Transaction => {
                let budget = options.transaction_timeout;
                self.run_with_deadline(
                    budget,
                    |_| timeout_error(budget),
                    move |backend, conn, watchdog| {
                        backend.transaction_in(conn, &parsed.entries, &base_url, budget, watchdog)
                    },
                )
                .await?
            }
            BundleKind::Batch => {
                let entry_timeout = options.entry_timeout;
                let entries = u32::try_from(parsed.entries.len().max(1)).unwrap_or(u32::MAX);
                // Per-entry deadlines do the isolating; the outer budget only
                // stops a runaway batch.
                let budget = entry_timeout
                    .saturating_mul(entries)
                    .max(options.transaction_timeout);
                self.run_with_deadline(
                    budget,
                    |_| timeout_error(budget),
                    move |backend, conn, watchdog| {
                        backend.batch_in(
                            conn,
                            &parsed.entries,
                            &base_url,
                            entry_timeout,
                            budget,
                            watchdog,
                        )
                    },
                )
                .await?
            }
            BundleKind::Collection
            | BundleKind::Searchset
            | BundleKind::History
            | BundleKind::Document => {
                debug!(kind = kind.as_str(), entries = parsed.entry_count, "Validated pass-through Bundle");
                return Ok(build_pass_through(kind, parsed.entry_count));
            }
        };

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            kind = kind.as_str(),
            entries = results.len(),
            failed,
            "Processed Bundle"
        );
        Ok(build_response(kind, &results, &urls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ResourceStorage;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::json;

    fn backend() -> SqliteBackend {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.init_schema().unwrap();
        backend
    }

    fn patient_entry(full_url: &str, family: &str) -> Value {
        json!({
            "fullUrl": full_url,
            "resource": {"resourceType": "Patient", "name": [{"family": family}]},
            "request": {"method": "POST", "url": "Patient"}
        })
    }

    #[tokio::test]
    async fn test_transaction_resolves_placeholders() {
        let backend = backend();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                patient_entry("urn:uuid:patient-1", "Smith"),
                {
                    "resource": {
                        "resourceType": "Observation",
                        "status": "final",
                        "code": {"text": "weight"},
                        "subject": {"reference": "urn:uuid:patient-1"}
                    },
                    "request": {"method": "POST", "url": "Observation"}
                }
            ]
        });

        let response = backend
            .process_bundle(bundle, &BundleOptions::default())
            .await
            .unwrap();
        assert_eq!(response["type"], "transaction-response");
        assert_eq!(response["entry"][0]["response"]["status"], "201 Created");

        let location = response["entry"][0]["response"]["location"].as_str().unwrap();
        let patient_ref = location.split("/_history").next().unwrap();
        assert_eq!(
            response["entry"][1]["resource"]["subject"]["reference"],
            patient_ref
        );
    }

    #[tokio::test]
    async fn test_transaction_is_atomic() {
        let backend = backend();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                patient_entry("urn:uuid:a", "Smith"),
                {
                    "resource": {"resourceType": "Observation", "status": "final"},
                    "request": {"method": "POST", "url": "Observation"}
                }
            ]
        });

        let err = backend
            .process_bundle(bundle, &BundleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Transaction(TransactionError::BundleError { index: 1, .. })
        ));
        assert_eq!(backend.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_partial_success() {
        let backend = backend();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                patient_entry("urn:uuid:a", "Smith"),
                {
                    "request": {"method": "GET", "url": "Patient/missing"}
                },
                patient_entry("urn:uuid:b", "Jones")
            ]
        });

        let response = backend
            .process_bundle(bundle, &BundleOptions::default())
            .await
            .unwrap();
        assert_eq!(response["type"], "batch-response");
        assert_eq!(response["entry"][0]["response"]["status"], "201 Created");
        assert_eq!(response["entry"][1]["response"]["status"], "404 Not Found");
        assert_eq!(
            response["entry"][1]["response"]["outcome"]["resourceType"],
            "OperationOutcome"
        );
        assert_eq!(response["entry"][2]["response"]["status"], "201 Created");
        assert_eq!(backend.count(Some("Patient")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_conditional_and_patch_entries() {
        let backend = backend();
        backend
            .create(
                "Patient",
                json!({
                    "resourceType": "Patient",
                    "id": "p1",
                    "identifier": [{"system": "urn:mrn", "value": "42"}]
                }),
            )
            .await
            .unwrap();

        let patch = json!([{"op": "add", "path": "/active", "value": true}]);
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "resource": {
                        "resourceType": "Patient",
                        "identifier": [{"system": "urn:mrn", "value": "42"}]
                    },
                    "request": {"method": "POST", "url": "Patient", "ifNoneExist": "identifier=urn:mrn|42"}
                },
                {
                    "resource": {
                        "resourceType": "Binary",
                        "contentType": "application/json-patch+json",
                        "data": STANDARD.encode(patch.to_string())
                    },
                    "request": {"method": "PATCH", "url": "Patient/p1"}
                },
                {
                    "request": {"method": "DELETE", "url": "Patient/p1"}
                }
            ]
        });

        let response = backend
            .process_bundle(bundle, &BundleOptions::default())
            .await
            .unwrap();
        assert_eq!(response["entry"][0]["response"]["status"], "200 OK");
        assert_eq!(response["entry"][1]["resource"]["active"], true);
        assert_eq!(response["entry"][2]["response"]["status"], "204 No Content");
        assert_eq!(backend.count(Some("Patient")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pass_through_and_limits() {
        let backend = backend();
        let collection = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [{"resource": {"resourceType": "Patient"}}]
        });
        let response = backend
            .process_bundle(collection, &BundleOptions::default())
            .await
            .unwrap();
        assert_eq!(response["entry"][0]["response"]["status"], "200 OK");
        assert_eq!(backend.count(None).await.unwrap(), 0);

        let options = BundleOptions {
            max_entries: 1,
            ..BundleOptions::default()
        };
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [patient_entry("urn:uuid:a", "A"), patient_entry("urn:uuid:b", "B")]
        });
        let err = backend.process_bundle(bundle, &options).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn test_forward_placeholder_is_left_as_written() {
        let backend = backend();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "resource": {
                        "resourceType": "Observation",
                        "status": "final",
                        "code": {"text": "weight"},
                        "subject": {"reference": "urn:uuid:later"}
                    },
                    "request": {"method": "POST", "url": "Observation"}
                },
                patient_entry("urn:uuid:later", "Smith")
            ]
        });

        let response = backend
            .process_bundle(bundle, &BundleOptions::default())
            .await
            .unwrap();
        assert_eq!(
            response["entry"][0]["resource"]["subject"]["reference"],
            "urn:uuid:later"
        );

        let results = vec![
            BundleEntryResult::body(response["entry"][0]["resource"].clone()),
            BundleEntryResult::body(response["entry"][1]["resource"].clone()),
            BundleEntryResult::deleted(),
        ];
        assert_eq!(unresolved_entries(&results), vec![0]);
    }

    #[test]
    fn test_spent_batch_budget_answers_remaining_entries() {
        let backend = backend();
        let parsed = parse_bundle(
            &json!({
                "resourceType": "Bundle",
                "type": "batch",
                "entry": [patient_entry("urn:uuid:a", "Smith"), patient_entry("urn:uuid:b", "Jones")]
            }),
            10,
        )
        .unwrap();
        let watchdog = StatementWatchdog::new(Duration::from_secs(60));
        watchdog.cancel();

        let conn = backend.get_connection().unwrap();
        let (results, urls) = backend
            .batch_in(
                &conn,
                &parsed.entries,
                "",
                Duration::from_secs(10),
                Duration::from_secs(60),
                &watchdog,
            )
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == 408));
        assert_eq!(urls[1].as_deref(), Some("urn:uuid:b"));
        let stored: i64 = conn
            .query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn test_zero_budget_transaction_times_out() {
        let backend = backend();
        let options = BundleOptions {
            transaction_timeout: Duration::ZERO,
            ..BundleOptions::default()
        };
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [patient_entry("urn:uuid:a", "Smith")]
        });

        let err = backend.process_bundle(bundle, &options).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Transaction(TransactionError::Timeout { .. })
        ));
        assert_eq!(backend.count(None).await.unwrap(), 0);
    }
}
