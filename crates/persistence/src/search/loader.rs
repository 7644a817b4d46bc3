//! SearchParameter Loader.
//!
//! Produces SearchParameter definitions from two sources:
//! - the embedded set compiled into the crate
//! - SearchParameter resources supplied at runtime
//!
//! Expressions use a small path language understood by the
//! [extractor](super::extractor): dotted element paths rooted at the
//! resource type (or `Resource`), `|` unions, `name[x]` choice elements,
//! `where(path='value')` filters and `extension('name')` steps that read a
//! reserved extension through its schema.

use serde_json::Value;

use crate::types::SearchParamType;

use super::errors::LoaderError;
use super::registry::{
    CompositeComponentDef, SearchParameterDefinition, SearchParameterRegistry,
    SearchParameterSource, SearchParameterStatus,
};

const BASE_URL: &str = "http://hl7.org/fhir/SearchParameter";

/// Loader for SearchParameter definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchParameterLoader;

fn sp(base: &str, code: &str, param_type: SearchParamType, expression: &str) -> SearchParameterDefinition {
    SearchParameterDefinition::new(
        format!("{}/{}-{}", BASE_URL, base, code),
        code,
        param_type,
        expression,
    )
    .with_base([base])
    .with_source(SearchParameterSource::Embedded)
}

fn reference(base: &str, code: &str, expression: &str, targets: &[&str]) -> SearchParameterDefinition {
    sp(base, code, SearchParamType::Reference, expression).with_targets(targets.iter().copied())
}

fn composite(
    base: &str,
    code: &str,
    context: &str,
    components: &[(&str, SearchParamType, &str)],
) -> SearchParameterDefinition {
    sp(base, code, SearchParamType::Composite, context).with_components(
        components
            .iter()
            .map(|(c, t, e)| CompositeComponentDef::new(*c, *t, *e))
            .collect(),
    )
}

const SUBJECT_TARGETS: &[&str] = &["Patient", "Group", "Device", "Location"];
const ACTOR_TARGETS: &[&str] = &["Practitioner", "PractitionerRole", "Organization", "Patient"];

impl SearchParameterLoader {
    /// Creates a new loader.
    pub fn new() -> Self {
        Self
    }

    /// Returns the embedded parameter set.
    pub fn load_embedded(&self) -> Vec<SearchParameterDefinition> {
        use SearchParamType::{Date, Quantity, String as Str, Token, Uri};

        let mut params = vec![
            // Common parameters for all resource types
            sp("Resource", "_id", Token, "Resource.id"),
            sp("Resource", "_lastUpdated", Date, "Resource.meta.lastUpdated"),
            sp("Resource", "_profile", Uri, "Resource.meta.profile"),
            sp("Resource", "_tag", Token, "Resource.meta.tag"),
            sp("Resource", "_security", Token, "Resource.meta.security"),
            sp(
                "Resource",
                "original-version",
                Token,
                "Resource.extension('original-payload').version",
            ),
        ];

        // Patient
        params.extend([
            sp("Patient", "name", Str, "Patient.name"),
            sp("Patient", "family", Str, "Patient.name.family"),
            sp("Patient", "given", Str, "Patient.name.given"),
            sp("Patient", "identifier", Token, "Patient.identifier"),
            sp("Patient", "birthdate", Date, "Patient.birthDate"),
            sp("Patient", "gender", Token, "Patient.gender"),
            sp("Patient", "active", Token, "Patient.active"),
            sp("Patient", "address", Str, "Patient.address"),
            sp("Patient", "address-city", Str, "Patient.address.city"),
            sp("Patient", "telecom", Token, "Patient.telecom"),
            sp("Patient", "phone", Token, "Patient.telecom.where(system='phone')"),
            sp("Patient", "email", Token, "Patient.telecom.where(system='email')"),
            reference(
                "Patient",
                "general-practitioner",
                "Patient.generalPractitioner",
                &["Practitioner", "Organization", "PractitionerRole"],
            ),
            reference(
                "Patient",
                "organization",
                "Patient.managingOrganization",
                &["Organization"],
            ),
            reference("Patient", "link", "Patient.link.other", &["Patient"]),
        ]);

        // Practitioner, PractitionerRole, Organization
        params.extend([
            sp("Practitioner", "name", Str, "Practitioner.name"),
            sp("Practitioner", "family", Str, "Practitioner.name.family"),
            sp("Practitioner", "given", Str, "Practitioner.name.given"),
            sp("Practitioner", "identifier", Token, "Practitioner.identifier"),
            sp("Practitioner", "active", Token, "Practitioner.active"),
            sp("Practitioner", "gender", Token, "Practitioner.gender"),
            sp("Practitioner", "telecom", Token, "Practitioner.telecom"),
            reference(
                "PractitionerRole",
                "practitioner",
                "PractitionerRole.practitioner",
                &["Practitioner"],
            ),
            reference(
                "PractitionerRole",
                "organization",
                "PractitionerRole.organization",
                &["Organization"],
            ),
            sp("PractitionerRole", "role", Token, "PractitionerRole.code"),
            sp("Organization", "name", Str, "Organization.name | Organization.alias"),
            sp("Organization", "identifier", Token, "Organization.identifier"),
            sp("Organization", "type", Token, "Organization.type"),
            sp("Organization", "active", Token, "Organization.active"),
            sp("Organization", "address", Str, "Organization.address"),
            reference("Organization", "partof", "Organization.partOf", &["Organization"]),
            sp("Location", "name", Str, "Location.name"),
            sp("Location", "address", Str, "Location.address"),
            sp("Medication", "code", Token, "Medication.code"),
            reference("Group", "member", "Group.member.entity", &["Patient", "Practitioner", "Device"]),
        ]);

        // Observation
        params.extend([
            sp("Observation", "code", Token, "Observation.code"),
            sp("Observation", "category", Token, "Observation.category"),
            sp("Observation", "status", Token, "Observation.status"),
            sp("Observation", "date", Date, "Observation.effective[x]"),
            sp("Observation", "value-quantity", Quantity, "Observation.valueQuantity"),
            sp("Observation", "value-string", Str, "Observation.valueString"),
            sp("Observation", "value-concept", Token, "Observation.valueCodeableConcept"),
            sp(
                "Observation",
                "value-date",
                Date,
                "Observation.valueDateTime | Observation.valuePeriod",
            ),
            sp("Observation", "component-code", Token, "Observation.component.code"),
            sp(
                "Observation",
                "component-value-quantity",
                Quantity,
                "Observation.component.valueQuantity",
            ),
            reference("Observation", "subject", "Observation.subject", SUBJECT_TARGETS),
            reference("Observation", "patient", "Observation.subject", &["Patient"]),
            reference("Observation", "encounter", "Observation.encounter", &["Encounter"]),
            reference("Observation", "performer", "Observation.performer", ACTOR_TARGETS),
            reference(
                "Observation",
                "has-member",
                "Observation.hasMember",
                &["Observation"],
            ),
            reference(
                "Observation",
                "derived-from",
                "Observation.derivedFrom",
                &["Observation", "DocumentReference"],
            ),
            reference("Observation", "specimen", "Observation.specimen", &["Specimen"]),
            composite(
                "Observation",
                "code-value-quantity",
                "Observation",
                &[("code", Token, "code"), ("value-quantity", Quantity, "valueQuantity")],
            ),
            composite(
                "Observation",
                "code-value-concept",
                "Observation",
                &[("code", Token, "code"), ("value-concept", Token, "valueCodeableConcept")],
            ),
            composite(
                "Observation",
                "component-code-value-quantity",
                "Observation.component",
                &[
                    ("component-code", Token, "code"),
                    ("component-value-quantity", Quantity, "valueQuantity"),
                ],
            ),
        ]);

        // Condition
        params.extend([
            sp("Condition", "code", Token, "Condition.code"),
            sp("Condition", "clinical-status", Token, "Condition.clinicalStatus"),
            sp(
                "Condition",
                "verification-status",
                Token,
                "Condition.verificationStatus",
            ),
            sp("Condition", "category", Token, "Condition.category"),
            sp("Condition", "onset-date", Date, "Condition.onset[x]"),
            sp("Condition", "recorded-date", Date, "Condition.recordedDate"),
            reference("Condition", "subject", "Condition.subject", &["Patient", "Group"]),
            reference("Condition", "patient", "Condition.subject", &["Patient"]),
            reference("Condition", "encounter", "Condition.encounter", &["Encounter"]),
            reference("Condition", "asserter", "Condition.asserter", ACTOR_TARGETS),
        ]);

        // Encounter
        params.extend([
            sp("Encounter", "status", Token, "Encounter.status"),
            sp("Encounter", "class", Token, "Encounter.class"),
            sp("Encounter", "type", Token, "Encounter.type"),
            sp("Encounter", "date", Date, "Encounter.actualPeriod | Encounter.period"),
            reference("Encounter", "subject", "Encounter.subject", &["Patient", "Group"]),
            reference("Encounter", "patient", "Encounter.subject", &["Patient"]),
            reference(
                "Encounter",
                "participant",
                "Encounter.participant.actor | Encounter.participant.individual",
                &["Practitioner", "PractitionerRole", "Patient", "Device"],
            ),
            reference(
                "Encounter",
                "practitioner",
                "Encounter.participant.actor | Encounter.participant.individual",
                &["Practitioner"],
            ),
            reference(
                "Encounter",
                "service-provider",
                "Encounter.serviceProvider",
                &["Organization"],
            ),
            reference(
                "Encounter",
                "location",
                "Encounter.location.location",
                &["Location"],
            ),
        ]);

        // MedicationRequest
        params.extend([
            sp("MedicationRequest", "status", Token, "MedicationRequest.status"),
            sp("MedicationRequest", "intent", Token, "MedicationRequest.intent"),
            sp(
                "MedicationRequest",
                "code",
                Token,
                "MedicationRequest.medication.concept | MedicationRequest.medicationCodeableConcept",
            ),
            sp("MedicationRequest", "authoredon", Date, "MedicationRequest.authoredOn"),
            reference(
                "MedicationRequest",
                "medication",
                "MedicationRequest.medication.reference | MedicationRequest.medicationReference",
                &["Medication"],
            ),
            reference(
                "MedicationRequest",
                "subject",
                "MedicationRequest.subject",
                &["Patient", "Group"],
            ),
            reference(
                "MedicationRequest",
                "patient",
                "MedicationRequest.subject",
                &["Patient"],
            ),
            reference(
                "MedicationRequest",
                "encounter",
                "MedicationRequest.encounter",
                &["Encounter"],
            ),
            reference(
                "MedicationRequest",
                "requester",
                "MedicationRequest.requester",
                ACTOR_TARGETS,
            ),
        ]);

        // AllergyIntolerance
        params.extend([
            sp(
                "AllergyIntolerance",
                "clinical-status",
                Token,
                "AllergyIntolerance.clinicalStatus",
            ),
            sp(
                "AllergyIntolerance",
                "verification-status",
                Token,
                "AllergyIntolerance.verificationStatus",
            ),
            sp("AllergyIntolerance", "type", Token, "AllergyIntolerance.type"),
            sp("AllergyIntolerance", "category", Token, "AllergyIntolerance.category"),
            sp("AllergyIntolerance", "criticality", Token, "AllergyIntolerance.criticality"),
            sp("AllergyIntolerance", "code", Token, "AllergyIntolerance.code"),
            sp("AllergyIntolerance", "onset", Date, "AllergyIntolerance.onset[x]"),
            sp("AllergyIntolerance", "date", Date, "AllergyIntolerance.recordedDate"),
            reference(
                "AllergyIntolerance",
                "patient",
                "AllergyIntolerance.patient",
                &["Patient"],
            ),
            reference(
                "AllergyIntolerance",
                "recorder",
                "AllergyIntolerance.recorder | AllergyIntolerance.participant.where(function.coding.code='enterer').actor",
                ACTOR_TARGETS,
            ),
            reference(
                "AllergyIntolerance",
                "asserter",
                "AllergyIntolerance.asserter | AllergyIntolerance.participant.where(function.coding.code='author').actor",
                ACTOR_TARGETS,
            ),
        ]);

        // Procedure, DiagnosticReport, Immunization
        params.extend([
            sp("Procedure", "code", Token, "Procedure.code"),
            sp("Procedure", "status", Token, "Procedure.status"),
            sp(
                "Procedure",
                "date",
                Date,
                "Procedure.performed[x] | Procedure.occurrence[x]",
            ),
            reference("Procedure", "subject", "Procedure.subject", &["Patient", "Group"]),
            reference("Procedure", "patient", "Procedure.subject", &["Patient"]),
            reference("Procedure", "encounter", "Procedure.encounter", &["Encounter"]),
            reference("Procedure", "performer", "Procedure.performer.actor", ACTOR_TARGETS),
            sp("DiagnosticReport", "code", Token, "DiagnosticReport.code"),
            sp("DiagnosticReport", "status", Token, "DiagnosticReport.status"),
            sp("DiagnosticReport", "category", Token, "DiagnosticReport.category"),
            sp("DiagnosticReport", "date", Date, "DiagnosticReport.effective[x]"),
            sp("DiagnosticReport", "issued", Date, "DiagnosticReport.issued"),
            reference(
                "DiagnosticReport",
                "subject",
                "DiagnosticReport.subject",
                SUBJECT_TARGETS,
            ),
            reference(
                "DiagnosticReport",
                "patient",
                "DiagnosticReport.subject",
                &["Patient"],
            ),
            reference(
                "DiagnosticReport",
                "encounter",
                "DiagnosticReport.encounter",
                &["Encounter"],
            ),
            reference(
                "DiagnosticReport",
                "result",
                "DiagnosticReport.result",
                &["Observation"],
            ),
            reference(
                "DiagnosticReport",
                "performer",
                "DiagnosticReport.performer",
                ACTOR_TARGETS,
            ),
            sp("Immunization", "vaccine-code", Token, "Immunization.vaccineCode"),
            sp("Immunization", "status", Token, "Immunization.status"),
            sp("Immunization", "date", Date, "Immunization.occurrence[x]"),
            sp("Immunization", "lot-number", Str, "Immunization.lotNumber"),
            reference("Immunization", "patient", "Immunization.patient", &["Patient"]),
            reference(
                "Immunization",
                "performer",
                "Immunization.performer.actor",
                ACTOR_TARGETS,
            ),
        ]);

        params
    }

    /// Parses a SearchParameter resource into a definition.
    ///
    /// Composite components are resolved against the registry by their
    /// `definition` URL.
    pub fn parse_resource(
        &self,
        resource: &Value,
        registry: &SearchParameterRegistry,
    ) -> Result<SearchParameterDefinition, LoaderError> {
        let url = resource
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LoaderError::MissingField {
                field: "url".to_string(),
                url: None,
            })?
            .to_string();

        let required = |field: &str| -> Result<String, LoaderError> {
            resource
                .get(field)
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| LoaderError::MissingField {
                    field: field.to_string(),
                    url: Some(url.clone()),
                })
        };

        let code = required("code")?;
        let type_str = required("type")?;
        let param_type = type_str.parse::<SearchParamType>().map_err(|_| {
            LoaderError::InvalidResource {
                message: format!("Unknown search parameter type: {}", type_str),
                url: Some(url.clone()),
            }
        })?;
        let expression = required("expression")?;

        let strings = |field: &str| -> Vec<String> {
            resource
                .get(field)
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default()
        };

        let base = strings("base");
        if base.is_empty() {
            return Err(LoaderError::MissingField {
                field: "base".to_string(),
                url: Some(url),
            });
        }

        let status = resource
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(SearchParameterStatus::from_fhir_status)
            .unwrap_or(SearchParameterStatus::Active);

        let component = self.parse_components(resource, &url, registry)?;

        Ok(SearchParameterDefinition::new(url, code, param_type, expression)
            .with_base(base)
            .with_targets(strings("target"))
            .with_components(component)
            .with_status(status)
            .with_source(SearchParameterSource::Stored))
    }

    fn parse_components(
        &self,
        resource: &Value,
        url: &str,
        registry: &SearchParameterRegistry,
    ) -> Result<Vec<CompositeComponentDef>, LoaderError> {
        let Some(components) = resource.get("component").and_then(|v| v.as_array()) else {
            return Ok(Vec::new());
        };

        let invalid = |message: String| LoaderError::InvalidResource {
            message,
            url: Some(url.to_string()),
        };

        let mut result = Vec::new();
        for comp in components {
            let definition = comp
                .get("definition")
                .and_then(|v| v.as_str())
                .ok_or_else(|| invalid("Composite component missing definition".to_string()))?;
            let referenced = registry
                .get_by_url(definition)
                .ok_or_else(|| invalid(format!("Unknown component definition {}", definition)))?;
            let expression = comp
                .get("expression")
                .and_then(|v| v.as_str())
                .ok_or_else(|| invalid("Composite component missing expression".to_string()))?;

            result.push(CompositeComponentDef::new(
                referenced.code.clone(),
                referenced.param_type,
                expression,
            ));
        }
        Ok(result)
    }
}
