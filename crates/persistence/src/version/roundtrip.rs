//! Round-trip fidelity checks for the version converters.
//!
//! A conversion pair is lossless for a body when converting it to the other
//! release and back yields the same JSON, ignoring the paths a converter
//! declares as expected noise. Differences are reported as JSON Patch
//! operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::FhirVersion;
use super::converter::ConverterFactory;
use crate::error::VersionError;

/// One unexpected difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTripDifference {
    /// JSON Patch operation (`add`, `remove`, `replace`, ...).
    pub op: String,
    /// JSON pointer of the difference.
    pub path: String,
}

/// The outcome of a round-trip check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundTripReport {
    /// Differences not covered by an ignore prefix.
    pub differences: Vec<RoundTripDifference>,
}

impl RoundTripReport {
    /// Returns true if the round trip reproduced the input.
    pub fn is_lossless(&self) -> bool {
        self.differences.is_empty()
    }
}

/// Checks converters for round-trip losses.
#[derive(Debug, Clone, Default)]
pub struct RoundTripValidator {
    converters: ConverterFactory,
    ignore: Vec<String>,
}

impl RoundTripValidator {
    /// Creates a validator over the given converters.
    pub fn new(converters: ConverterFactory) -> Self {
        Self {
            converters,
            ignore: Vec::new(),
        }
    }

    /// Adds a JSON pointer prefix to ignore for every type. A `*` segment
    /// matches any single segment.
    pub fn ignore(mut self, prefix: impl Into<String>) -> Self {
        self.ignore.push(prefix.into());
        self
    }

    /// Converts an R4 body to R5 and back.
    pub fn check_r4(&self, resource: &Value) -> Result<RoundTripReport, VersionError> {
        self.check(resource, FhirVersion::R4, FhirVersion::R5)
    }

    /// Converts an R5 body to R4 and back.
    pub fn check_r5(&self, resource: &Value) -> Result<RoundTripReport, VersionError> {
        self.check(resource, FhirVersion::R5, FhirVersion::R4)
    }

    fn check(
        &self,
        resource: &Value,
        from: FhirVersion,
        via: FhirVersion,
    ) -> Result<RoundTripReport, VersionError> {
        let resource_type = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let there = self.converters.convert(resource_type, resource, from, via)?;
        let back = self.converters.convert(resource_type, &there, via, from)?;

        let converter = self.converters.get(resource_type);
        let converter_ignore: Vec<String> = converter
            .as_ref()
            .map(|c| c.round_trip_ignore().iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        let unordered = converter
            .as_ref()
            .map(|c| c.round_trip_unordered())
            .unwrap_or_default();

        let before = sorted_arrays(resource, unordered);
        let back = sorted_arrays(&back, unordered);

        let patch = serde_json::to_value(json_patch::diff(&before, &back))
            .map_err(|e| VersionError::ConversionFailed {
                resource_type: resource_type.to_string(),
                path: resource_type.to_string(),
                message: e.to_string(),
            })?;

        let differences = patch
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|op| {
                let path = op.get("path")?.as_str()?.to_string();
                let op = op.get("op")?.as_str()?.to_string();
                Some(RoundTripDifference { op, path })
            })
            .filter(|d| {
                !self
                    .ignore
                    .iter()
                    .chain(converter_ignore.iter())
                    .any(|prefix| pointer_has_prefix(&d.path, prefix))
            })
            .collect();

        Ok(RoundTripReport { differences })
    }
}

/// Sorts the named top-level arrays by their serialized items.
fn sorted_arrays(body: &Value, fields: &[&str]) -> Value {
    let mut body = body.clone();
    for field in fields {
        if let Some(Value::Array(items)) = body.get_mut(*field) {
            items.sort_by_cached_key(Value::to_string);
        }
    }
    body
}

fn pointer_has_prefix(path: &str, prefix: &str) -> bool {
    let mut path_segments = path.split('/').skip(1);
    for expected in prefix.split('/').skip(1) {
        match path_segments.next() {
            Some(actual) if expected == "*" || expected == actual => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pointer_prefix() {
        assert!(pointer_has_prefix("/class/1", "/class"));
        assert!(pointer_has_prefix("/a/3/b", "/a/*/b"));
        assert!(!pointer_has_prefix("/classy", "/class"));
        assert!(!pointer_has_prefix("/a", "/a/b"));
    }

    #[test]
    fn test_encounter_round_trip() {
        let validator = RoundTripValidator::default();
        let report = validator
            .check_r4(&json!({
                "resourceType": "Encounter",
                "id": "e1",
                "status": "finished",
                "class": {"system": "http://terminology.hl7.org/CodeSystem/v3-ActCode", "code": "AMB"},
                "period": {"start": "2024-01-01"},
                "participant": [{"individual": {"reference": "Practitioner/1"}}]
            }))
            .unwrap();
        assert!(report.is_lossless(), "{:?}", report.differences);
    }

    #[test]
    fn test_medication_request_round_trip() {
        let validator = RoundTripValidator::default();
        let report = validator
            .check_r4(&json!({
                "resourceType": "MedicationRequest",
                "status": "active",
                "intent": "order",
                "medicationReference": {"reference": "Medication/m1"},
                "subject": {"reference": "Patient/p1"}
            }))
            .unwrap();
        assert!(report.is_lossless(), "{:?}", report.differences);
    }

    #[test]
    fn test_allergy_r5_participant_order_is_not_a_loss() {
        let participant = |code: &str, actor: &str| {
            json!({
                "function": {"coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/provenance-participant-type",
                    "code": code
                }]},
                "actor": {"reference": actor}
            })
        };
        let report = RoundTripValidator::default()
            .check_r5(&json!({
                "resourceType": "AllergyIntolerance",
                "id": "a1",
                "type": {"coding": [{"system": "http://hl7.org/fhir/allergy-intolerance-type", "code": "allergy"}]},
                "patient": {"reference": "Patient/p1"},
                "participant": [
                    participant("author", "Patient/p1"),
                    participant("enterer", "Practitioner/dr1")
                ]
            }))
            .unwrap();
        assert!(report.is_lossless(), "{:?}", report.differences);
    }

    #[test]
    fn test_encounter_r5_round_trip() {
        let report = RoundTripValidator::default()
            .check_r5(&json!({
                "resourceType": "Encounter",
                "id": "e1",
                "status": "completed",
                "class": [{"coding": [{"system": "http://terminology.hl7.org/CodeSystem/v3-ActCode", "code": "AMB"}]}],
                "actualPeriod": {"start": "2024-01-01"},
                "participant": [{"actor": {"reference": "Practitioner/1"}}]
            }))
            .unwrap();
        assert!(report.is_lossless(), "{:?}", report.differences);
    }

    #[test]
    fn test_medication_request_r5_round_trip() {
        let report = RoundTripValidator::default()
            .check_r5(&json!({
                "resourceType": "MedicationRequest",
                "status": "active",
                "intent": "order",
                "medication": {"reference": {"reference": "Medication/m1"}},
                "subject": {"reference": "Patient/p1"}
            }))
            .unwrap();
        assert!(report.is_lossless(), "{:?}", report.differences);
    }

    #[test]
    fn test_sorted_arrays_only_touches_named_fields() {
        let body = json!({"a": [2, 1], "b": [2, 1]});
        assert_eq!(sorted_arrays(&body, &["a"]), json!({"a": [1, 2], "b": [2, 1]}));
    }

    #[test]
    fn test_unknown_type_is_lossless() {
        let report = RoundTripValidator::default()
            .check_r5(&json!({"resourceType": "Patient", "active": true}))
            .unwrap();
        assert!(report.is_lossless());
    }

    #[test]
    fn test_reports_loss() {
        let mut converters = ConverterFactory::empty();
        converters.register(std::sync::Arc::new(super::super::converter::RuleConverter {
            resource_type: "Encounter",
            rules: &[super::super::converter::MappingRule::Rename {
                r4: "period",
                r5: "actualPeriod",
            }],
            ignore: &[],
            unordered: &[],
        }));
        // actualPeriod present in an R4 body is moved back to period on reverse
        let report = RoundTripValidator::new(converters)
            .check_r4(&json!({"resourceType": "Encounter", "actualPeriod": {"start": "2024"}}))
            .unwrap();
        assert!(!report.is_lossless());
    }
}
