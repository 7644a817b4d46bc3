//! Built-in converters.

mod allergy_intolerance;
mod encounter;
mod medication_request;

pub use allergy_intolerance::ALLERGY_INTOLERANCE;
pub use encounter::ENCOUNTER;
pub use medication_request::MEDICATION_REQUEST;

use super::converter::RuleConverter;

/// Observation's indexed elements are structurally identical in R4 and R5.
pub const OBSERVATION: RuleConverter = RuleConverter::identity("Observation");

/// Patient is structurally identical in R4 and R5.
pub const PATIENT: RuleConverter = RuleConverter::identity("Patient");

/// Returns every built-in converter.
pub fn builtin() -> Vec<RuleConverter> {
    vec![
        ALLERGY_INTOLERANCE,
        ENCOUNTER,
        MEDICATION_REQUEST,
        OBSERVATION,
        PATIENT,
    ]
}
