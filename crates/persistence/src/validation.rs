//! Structural resource validation.
//!
//! The same checks guard every write and back the `$validate` operation:
//! the resource type and id grammar, a small set of required elements per
//! type, and required status value sets. Elements are looked up under both
//! their R4 and R5 names so either release validates.

use serde_json::Value;

use crate::error::{StorageError, StorageResult, ValidationDetail, ValidationError};
use crate::outcome::{OperationOutcomeBuilder, all_ok};
use crate::types::{FhirResource, ResourceType};

/// An element that must be present. Any of the alternatives satisfies it.
struct Required {
    resource_type: ResourceType,
    element: &'static str,
    alternatives: &'static [&'static str],
}

const REQUIRED: &[Required] = &[
    Required {
        resource_type: ResourceType::Observation,
        element: "status",
        alternatives: &["status"],
    },
    Required {
        resource_type: ResourceType::Observation,
        element: "code",
        alternatives: &["code"],
    },
    Required {
        resource_type: ResourceType::Condition,
        element: "subject",
        alternatives: &["subject"],
    },
    Required {
        resource_type: ResourceType::Encounter,
        element: "status",
        alternatives: &["status"],
    },
    Required {
        resource_type: ResourceType::MedicationRequest,
        element: "status",
        alternatives: &["status"],
    },
    Required {
        resource_type: ResourceType::MedicationRequest,
        element: "intent",
        alternatives: &["intent"],
    },
    Required {
        resource_type: ResourceType::MedicationRequest,
        element: "subject",
        alternatives: &["subject"],
    },
    Required {
        resource_type: ResourceType::MedicationRequest,
        element: "medication",
        alternatives: &[
            "medication",
            "medicationCodeableConcept",
            "medicationReference",
        ],
    },
    Required {
        resource_type: ResourceType::AllergyIntolerance,
        element: "patient",
        alternatives: &["patient"],
    },
    Required {
        resource_type: ResourceType::Procedure,
        element: "status",
        alternatives: &["status"],
    },
    Required {
        resource_type: ResourceType::Procedure,
        element: "subject",
        alternatives: &["subject"],
    },
    Required {
        resource_type: ResourceType::DiagnosticReport,
        element: "status",
        alternatives: &["status"],
    },
    Required {
        resource_type: ResourceType::DiagnosticReport,
        element: "code",
        alternatives: &["code"],
    },
    Required {
        resource_type: ResourceType::Immunization,
        element: "status",
        alternatives: &["status"],
    },
    Required {
        resource_type: ResourceType::Immunization,
        element: "vaccineCode",
        alternatives: &["vaccineCode"],
    },
    Required {
        resource_type: ResourceType::Immunization,
        element: "patient",
        alternatives: &["patient"],
    },
];

/// A code element bound to a required value set (R4 and R5 codes combined).
struct CodeBinding {
    resource_type: ResourceType,
    element: &'static str,
    codes: &'static [&'static str],
}

const BINDINGS: &[CodeBinding] = &[
    CodeBinding {
        resource_type: ResourceType::Observation,
        element: "status",
        codes: &[
            "registered",
            "preliminary",
            "final",
            "amended",
            "corrected",
            "cancelled",
            "entered-in-error",
            "unknown",
            "specimen-in-process",
            "cannot-be-obtained",
        ],
    },
    CodeBinding {
        resource_type: ResourceType::Encounter,
        element: "status",
        codes: &[
            "planned",
            "arrived",
            "triaged",
            "in-progress",
            "onleave",
            "on-hold",
            "finished",
            "discharged",
            "completed",
            "cancelled",
            "discontinued",
            "entered-in-error",
            "unknown",
        ],
    },
    CodeBinding {
        resource_type: ResourceType::MedicationRequest,
        element: "status",
        codes: &[
            "active",
            "on-hold",
            "ended",
            "stopped",
            "completed",
            "cancelled",
            "entered-in-error",
            "draft",
            "unknown",
        ],
    },
    CodeBinding {
        resource_type: ResourceType::DiagnosticReport,
        element: "status",
        codes: &[
            "registered",
            "partial",
            "preliminary",
            "modified",
            "final",
            "amended",
            "corrected",
            "appended",
            "cancelled",
            "entered-in-error",
            "unknown",
        ],
    },
    CodeBinding {
        resource_type: ResourceType::Immunization,
        element: "status",
        codes: &["completed", "entered-in-error", "not-done"],
    },
    CodeBinding {
        resource_type: ResourceType::Patient,
        element: "gender",
        codes: &["male", "female", "other", "unknown"],
    },
    CodeBinding {
        resource_type: ResourceType::Practitioner,
        element: "gender",
        codes: &["male", "female", "other", "unknown"],
    },
];

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(_) => true,
    }
}

/// Collects the structural problems of a typed resource.
pub fn collect_issues(resource: &FhirResource) -> Vec<ValidationDetail> {
    let rt = resource.resource_type();
    let mut details = Vec::new();

    for rule in REQUIRED.iter().filter(|r| r.resource_type == rt) {
        if !rule.alternatives.iter().any(|a| is_present(resource.get(a))) {
            details.push(ValidationDetail::error(
                format!("{}.{}", rt, rule.element),
                format!("{}.{} is required", rt, rule.element),
            ));
        }
    }

    for binding in BINDINGS.iter().filter(|b| b.resource_type == rt) {
        match resource.get(binding.element) {
            None => {}
            Some(Value::String(code)) if binding.codes.contains(&code.as_str()) => {}
            Some(other) => {
                details.push(ValidationDetail::error(
                    format!("{}.{}", rt, binding.element),
                    format!(
                        "{} is not a valid code for {}.{}",
                        other, rt, binding.element
                    ),
                ));
            }
        }
    }

    details
}

/// Lifts and checks a body destined for `expected_type`.
///
/// Used on every write: a body that fails any check is rejected with the
/// collected details.
pub fn check_resource(expected_type: &str, body: Value) -> StorageResult<FhirResource> {
    let resource = FhirResource::parse_as(expected_type, body)?;
    let details = collect_issues(&resource);
    if details.is_empty() {
        Ok(resource)
    } else {
        Err(ValidationError::InvalidResource {
            message: format!("{} failed validation", expected_type),
            details,
        }
        .into())
    }
}

/// Runs `$validate`: returns an OperationOutcome and never persists.
///
/// Only an unsupported resource type is reported as an error; every other
/// problem is rendered into the outcome.
pub fn validate(expected_type: &str, body: Value) -> StorageResult<Value> {
    ResourceType::parse_storable(expected_type)?;
    match check_resource(expected_type, body) {
        Ok(_) => Ok(all_ok("Validation successful, no issues found")),
        Err(StorageError::Validation(ValidationError::UnsupportedResourceType { resource_type })) => {
            Err(ValidationError::UnsupportedResourceType { resource_type }.into())
        }
        Err(err) => Ok(OperationOutcomeBuilder::from(&err).build()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_observation() {
        let outcome = validate(
            "Observation",
            json!({
                "resourceType": "Observation",
                "status": "final",
                "code": {"coding": [{"system": "http://loinc.org", "code": "2339-0"}]}
            }),
        )
        .unwrap();
        let issues = outcome["issue"].as_array().unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0]["severity"], "information");
    }

    #[test]
    fn test_missing_required_elements() {
        let outcome = validate("Observation", json!({"resourceType": "Observation"})).unwrap();
        let issues = outcome["issue"].as_array().unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0]["expression"][0], "Observation.status");
        assert_eq!(issues[1]["expression"][0], "Observation.code");
    }

    #[test]
    fn test_invalid_status_code() {
        let err = check_resource(
            "Immunization",
            json!({
                "resourceType": "Immunization",
                "status": "done",
                "vaccineCode": {"text": "flu"},
                "patient": {"reference": "Patient/1"}
            }),
        )
        .unwrap_err();
        assert_eq!(err.http_status(), 422);
        assert_eq!(err.expressions(), vec!["Immunization.status".to_string()]);
    }

    #[test]
    fn test_medication_alternatives() {
        let r4 = json!({
            "resourceType": "MedicationRequest",
            "status": "active",
            "intent": "order",
            "subject": {"reference": "Patient/1"},
            "medicationCodeableConcept": {"text": "aspirin"}
        });
        let r5 = json!({
            "resourceType": "MedicationRequest",
            "status": "active",
            "intent": "order",
            "subject": {"reference": "Patient/1"},
            "medication": {"concept": {"text": "aspirin"}}
        });
        assert!(check_resource("MedicationRequest", r4).is_ok());
        assert!(check_resource("MedicationRequest", r5).is_ok());
    }

    #[test]
    fn test_both_release_status_codes() {
        for status in ["finished", "completed"] {
            let encounter = json!({"resourceType": "Encounter", "status": status});
            assert!(check_resource("Encounter", encounter).is_ok());
        }
    }

    #[test]
    fn test_structural_errors_rendered() {
        let outcome = validate("Patient", json!({"resourceType": "Patient", "id": "bad id!"}))
            .unwrap();
        assert_eq!(outcome["issue"][0]["severity"], "error");
        assert_eq!(outcome["issue"][0]["expression"][0], "id");

        let outcome = validate("Patient", json!({"resourceType": "Observation"})).unwrap();
        assert_eq!(outcome["issue"][0]["expression"][0], "resourceType");
    }

    #[test]
    fn test_unsupported_type_is_error() {
        let err = validate("Spaceship", json!({"resourceType": "Spaceship"})).unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}
