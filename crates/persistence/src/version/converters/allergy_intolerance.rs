//! AllergyIntolerance R4 ↔ R5.
//!
//! - `type`: code (R4) ↔ CodeableConcept (R5)
//! - `recorder` / `asserter` ↔ `participant` with function `enterer` / `author`
//! - `onset[x]` carries a single variant in both releases

use crate::version::converter::{MappingRule, RuleConverter};

const TYPE_SYSTEM: &str = "http://hl7.org/fhir/allergy-intolerance-type";

const RULES: &[MappingRule] = &[
    MappingRule::StringToConcept {
        field: "type",
        system: TYPE_SYSTEM,
    },
    MappingRule::SingleToParticipant {
        r4_field: "recorder",
        function_code: "enterer",
    },
    MappingRule::SingleToParticipant {
        r4_field: "asserter",
        function_code: "author",
    },
    MappingRule::ChoiceNormalize {
        base: "onset",
        allowed: &["DateTime", "Age", "Period", "Range", "String"],
    },
];

/// The AllergyIntolerance converter.
pub const ALLERGY_INTOLERANCE: RuleConverter = RuleConverter {
    resource_type: "AllergyIntolerance",
    rules: RULES,
    // R5 type codings may carry display text
    ignore: &["/type/coding/0/display", "/type/text"],
    // R4 has no participant order; entries come back in rule order
    unordered: &["participant"],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::converter::ResourceConverter;
    use serde_json::json;

    #[test]
    fn test_r4_to_r5() {
        let r4 = json!({
            "resourceType": "AllergyIntolerance",
            "id": "a1",
            "type": "allergy",
            "patient": {"reference": "Patient/p1"},
            "recorder": {"reference": "Practitioner/dr1"},
            "asserter": {"reference": "Patient/p1"},
            "onsetDateTime": "2019-05-01"
        });

        let r5 = ALLERGY_INTOLERANCE.r4_to_r5(&r4).unwrap();

        assert_eq!(r5["type"]["coding"][0]["code"], "allergy");
        assert_eq!(r5["type"]["coding"][0]["system"], TYPE_SYSTEM);
        assert_eq!(r5["participant"][0]["function"]["coding"][0]["code"], "enterer");
        assert_eq!(r5["participant"][0]["actor"]["reference"], "Practitioner/dr1");
        assert_eq!(r5["participant"][1]["function"]["coding"][0]["code"], "author");
        assert!(r5.get("recorder").is_none());
        assert_eq!(r5["onsetDateTime"], "2019-05-01");
    }

    #[test]
    fn test_r5_to_r4_restores_singular_references() {
        let r5 = json!({
            "resourceType": "AllergyIntolerance",
            "type": {"coding": [{"system": TYPE_SYSTEM, "code": "intolerance"}]},
            "participant": [{
                "function": {"coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/provenance-participant-type",
                    "code": "author"
                }]},
                "actor": {"reference": "Practitioner/x"}
            }]
        });

        let r4 = ALLERGY_INTOLERANCE.r5_to_r4(&r5).unwrap();

        assert_eq!(r4["type"], "intolerance");
        assert_eq!(r4["asserter"]["reference"], "Practitioner/x");
        assert!(r4.get("recorder").is_none());
        assert!(r4.get("participant").is_none());
    }
}
