//! Compartment definitions.
//!
//! A compartment groups the resources that relate to one owner resource. A
//! member type belongs to the compartment through any of its listed
//! reference parameters.

use crate::search::{ExtractedValue, IndexValue};

/// One compartment type and its membership rules.
#[derive(Debug, Clone, Copy)]
pub struct CompartmentDefinition {
    /// The owner type, e.g. `Patient`.
    pub compartment_type: &'static str,
    /// Member resource types and the reference parameters that place them.
    pub members: &'static [(&'static str, &'static [&'static str])],
}

impl CompartmentDefinition {
    /// Returns the membership parameters for a resource type.
    pub fn params_for(&self, resource_type: &str) -> Option<&'static [&'static str]> {
        self.members
            .iter()
            .find(|(member, _)| *member == resource_type)
            .map(|(_, params)| *params)
    }
}

/// The Patient compartment.
pub const PATIENT_COMPARTMENT: CompartmentDefinition = CompartmentDefinition {
    compartment_type: "Patient",
    members: &[
        ("AllergyIntolerance", &["patient", "recorder", "asserter"]),
        ("CarePlan", &["subject"]),
        ("Condition", &["subject", "asserter"]),
        ("DiagnosticReport", &["subject"]),
        ("DocumentReference", &["subject"]),
        ("Encounter", &["subject"]),
        ("Group", &["member"]),
        ("Immunization", &["patient"]),
        ("MedicationRequest", &["subject"]),
        ("MedicationStatement", &["subject"]),
        ("Observation", &["subject", "performer"]),
        ("Patient", &["link"]),
        ("Procedure", &["subject", "performer"]),
        ("ServiceRequest", &["subject"]),
        ("Specimen", &["subject"]),
    ],
};

/// Every compartment the engine maintains.
pub const COMPARTMENTS: &[CompartmentDefinition] = &[PATIENT_COMPARTMENT];

/// Looks up a compartment by owner type.
pub fn definition(compartment_type: &str) -> Option<&'static CompartmentDefinition> {
    COMPARTMENTS
        .iter()
        .find(|c| c.compartment_type == compartment_type)
}

/// A compartment a resource belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Membership {
    /// Owner type.
    pub compartment_type: String,
    /// Owner id.
    pub compartment_id: String,
}

/// Computes compartment memberships from a resource's extracted index values.
///
/// An owner resource is always a member of its own compartment.
pub fn memberships(
    resource_type: &str,
    id: &str,
    values: &[ExtractedValue],
) -> Vec<Membership> {
    let mut found = Vec::new();
    for compartment in COMPARTMENTS {
        if compartment.compartment_type == resource_type {
            found.push(Membership {
                compartment_type: resource_type.to_string(),
                compartment_id: id.to_string(),
            });
        }
        let Some(params) = compartment.params_for(resource_type) else {
            continue;
        };
        for value in values {
            if !params.contains(&value.param_name.as_str()) {
                continue;
            }
            if let IndexValue::Reference(reference) = &value.value {
                if reference.target_type.as_deref() == Some(compartment.compartment_type) {
                    found.push(Membership {
                        compartment_type: compartment.compartment_type.to_string(),
                        compartment_id: reference.target_id.clone(),
                    });
                }
            }
        }
    }
    found.sort();
    found.dedup();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::ParsedReference;

    fn reference(param: &str, target: &str) -> ExtractedValue {
        ExtractedValue::new(
            param,
            IndexValue::Reference(ParsedReference::parse(target).unwrap()),
        )
    }

    #[test]
    fn test_patient_is_own_member() {
        let found = memberships("Patient", "p1", &[]);
        assert_eq!(
            found,
            vec![Membership {
                compartment_type: "Patient".to_string(),
                compartment_id: "p1".to_string()
            }]
        );
    }

    #[test]
    fn test_observation_membership() {
        let values = vec![
            reference("subject", "Patient/p1"),
            reference("patient", "Patient/p1"),
            reference("performer", "Practitioner/dr"),
            reference("performer", "Patient/p2"),
            reference("encounter", "Encounter/e1"),
        ];
        let found = memberships("Observation", "o1", &values);
        let ids: Vec<&str> = found.iter().map(|m| m.compartment_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
    }

    #[test]
    fn test_allergy_recorder_membership() {
        let values = vec![reference("recorder", "Patient/p9")];
        let found = memberships("AllergyIntolerance", "a1", &values);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].compartment_id, "p9");
    }

    #[test]
    fn test_non_members() {
        assert!(memberships("Practitioner", "dr", &[]).is_empty());
        assert!(definition("Patient").is_some());
        assert!(definition("Device").is_none());
        assert_eq!(PATIENT_COMPARTMENT.params_for("Encounter"), Some(&["subject"][..]));
    }
}
