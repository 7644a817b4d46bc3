//! MedicationRequest R4 ↔ R5.
//!
//! - `medication[x]` ↔ `medication` CodeableReference
//! - `reportedBoolean` / `reportedReference` ↔ `reported` / `informationSource`

use serde_json::{Map, Value, json};

use crate::version::choice;
use crate::version::converter::{MappingRule, RuleConverter};

fn reported_forward(obj: &mut Map<String, Value>) -> Result<(), String> {
    let Some(found) = choice::take(obj, "reported") else {
        return Ok(());
    };
    match found.type_suffix.as_str() {
        "Boolean" => {
            obj.insert("reported".to_string(), found.value);
        }
        "Reference" => {
            obj.insert("reported".to_string(), Value::Bool(true));
            obj.insert("informationSource".to_string(), json!([found.value]));
        }
        other => return Err(format!("unexpected reported{}", other)),
    }
    Ok(())
}

fn reported_reverse(obj: &mut Map<String, Value>) -> Result<(), String> {
    let source = obj.remove("informationSource");
    let reported = obj.remove("reported");

    let first_source = source
        .as_ref()
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .cloned();

    match (reported, first_source) {
        (Some(Value::Bool(false)), _) => {
            obj.insert("reportedBoolean".to_string(), Value::Bool(false));
        }
        (_, Some(reference)) => {
            obj.insert("reportedReference".to_string(), reference);
        }
        (Some(Value::Bool(b)), None) => {
            obj.insert("reportedBoolean".to_string(), Value::Bool(b));
        }
        (Some(_), None) => return Err("reported must be a boolean".to_string()),
        (None, None) => {}
    }
    Ok(())
}

const RULES: &[MappingRule] = &[
    MappingRule::ChoiceToCodeableReference { base: "medication" },
    MappingRule::Custom {
        name: "reported",
        forward: reported_forward,
        reverse: reported_reverse,
    },
];

/// The MedicationRequest converter.
pub const MEDICATION_REQUEST: RuleConverter = RuleConverter {
    resource_type: "MedicationRequest",
    rules: RULES,
    // R5 may list several information sources, or one without `reported`
    ignore: &["/informationSource/1", "/reported"],
    unordered: &[],
};
