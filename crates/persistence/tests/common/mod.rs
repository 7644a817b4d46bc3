//! Shared helpers for the integration tests.
//!
//! Each test binary pulls this in with `mod common;` and uses a subset, so
//! unused helpers are expected.

#![allow(dead_code)]

use std::path::Path;

use serde_json::{Value, json};

use fhirvault_persistence::backends::sqlite::SqliteBackend;
use fhirvault_persistence::config::{EngineConfig, SqliteBackendConfig};
use fhirvault_persistence::core::{ResourceStorage, SearchProvider, SearchResult};
use fhirvault_persistence::engine::FhirEngine;
use fhirvault_persistence::types::StoredResource;
use fhirvault_persistence::version::StorageStrategy;

/// A fresh in-memory backend with its schema.
pub fn backend() -> SqliteBackend {
    let backend = SqliteBackend::in_memory().expect("Failed to create SQLite backend");
    backend.init_schema().expect("Failed to initialize schema");
    backend
}

/// A fresh in-memory backend persisting with `strategy`.
pub fn backend_with_strategy(strategy: StorageStrategy) -> SqliteBackend {
    let mut config = EngineConfig::for_testing();
    config.versioning.strategy = strategy;
    let backend = SqliteBackend::from_config(&config).expect("Failed to create SQLite backend");
    backend.init_schema().expect("Failed to initialize schema");
    backend
}

/// A file-backed backend under `dir`.
pub fn file_backend(dir: &Path) -> SqliteBackend {
    let backend = SqliteBackend::with_config(SqliteBackendConfig {
        path: dir.join("fhir.db").to_string_lossy().into_owned(),
        max_connections: 4,
        ..SqliteBackendConfig::default()
    })
    .expect("Failed to open SQLite file");
    backend.init_schema().expect("Failed to initialize schema");
    backend
}

/// A fresh in-memory engine.
pub fn engine() -> FhirEngine {
    FhirEngine::in_memory().expect("Failed to create engine")
}

pub fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Parses and runs a search, panicking on errors.
pub async fn search(backend: &SqliteBackend, resource_type: &str, items: &[(&str, &str)]) -> SearchResult {
    let query = backend
        .parse_query(resource_type, &pairs(items))
        .expect("query should parse");
    backend.search(&query).await.expect("search should succeed")
}

/// Sorted ids of a result set.
pub fn ids(resources: &[StoredResource]) -> Vec<String> {
    let mut ids: Vec<String> = resources.iter().map(|r| r.id().to_string()).collect();
    ids.sort();
    ids
}

/// Creates every body under its own `resourceType`.
pub async fn seed(backend: &SqliteBackend, resources: Vec<Value>) {
    for resource in resources {
        let resource_type = resource["resourceType"]
            .as_str()
            .expect("fixture has a resourceType")
            .to_string();
        backend
            .create(&resource_type, resource)
            .await
            .expect("fixture should be stored");
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn patient(id: &str, family: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "id": id,
        "name": [{"family": family, "given": ["Test"]}],
        "active": true
    })
}

pub fn patient_with_gp(id: &str, family: &str, practitioner: &str) -> Value {
    let mut patient = patient(id, family);
    patient["generalPractitioner"] = json!([{"reference": format!("Practitioner/{}", practitioner)}]);
    patient
}

pub fn practitioner(id: &str, family: &str) -> Value {
    json!({
        "resourceType": "Practitioner",
        "id": id,
        "name": [{"family": family}]
    })
}

pub fn organization(id: &str, name: &str) -> Value {
    json!({"resourceType": "Organization", "id": id, "name": name})
}

pub fn observation(id: &str, patient: &str, code: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "id": id,
        "status": "final",
        "code": {"coding": [{"system": "http://loinc.org", "code": code}]},
        "subject": {"reference": format!("Patient/{}", patient)}
    })
}

pub fn glucose(id: &str, patient: &str, value: f64) -> Value {
    let mut obs = observation(id, patient, "2339-0");
    obs["valueQuantity"] = json!({
        "value": value,
        "unit": "mg/dL",
        "system": "http://unitsofmeasure.org",
        "code": "mg/dL"
    });
    obs
}

/// An R4-shaped AllergyIntolerance: string `type`, singular `recorder`.
pub fn r4_allergy(id: &str, patient: &str) -> Value {
    json!({
        "resourceType": "AllergyIntolerance",
        "id": id,
        "type": "allergy",
        "patient": {"reference": format!("Patient/{}", patient)},
        "recorder": {"reference": "Practitioner/dr1"},
        "onsetDateTime": "2019-05-01"
    })
}

/// Drops the store-stamped fields so bodies can be compared.
pub fn without_meta(mut body: Value) -> Value {
    if let Some(obj) = body.as_object_mut() {
        obj.remove("meta");
    }
    body
}
