//! Encounter R4 ↔ R5.

use crate::version::converter::{MappingRule, RuleConverter};

const RULES: &[MappingRule] = &[
    MappingRule::CodingToConceptList { field: "class" },
    MappingRule::Rename {
        r4: "period",
        r5: "actualPeriod",
    },
    MappingRule::Rename {
        r4: "hospitalization",
        r5: "admission",
    },
    MappingRule::CodeMap {
        field: "status",
        pairs: &[("finished", "completed"), ("onleave", "on-hold")],
    },
    MappingRule::ConceptToCodeableReferenceList {
        field: "serviceType",
    },
    MappingRule::RenameInArray {
        array: "participant",
        r4: "individual",
        r5: "actor",
    },
];

/// The Encounter converter.
pub const ENCOUNTER: RuleConverter = RuleConverter {
    resource_type: "Encounter",
    rules: RULES,
    // R5 allows several classes and service types; R4 keeps the first
    ignore: &["/class/1", "/serviceType/1"],
    unordered: &[],
};
