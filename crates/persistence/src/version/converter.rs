//! Bidirectional R4 ↔ R5 resource converters.
//!
//! Each resource type's conversion is a table of [`MappingRule`]s. Rules are
//! applied in order for R4 → R5 and in reverse order, each inverted, for
//! R5 → R4, so a single table documents both directions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;

use super::FhirVersion;
use super::choice;
use crate::error::VersionError;

/// Signature of a custom rule step.
pub type RuleFn = fn(&mut Map<String, Value>) -> Result<(), String>;

/// A single declarative structural mapping between R4 and R5.
#[derive(Clone, Copy)]
pub enum MappingRule {
    /// Top-level element renamed.
    Rename {
        /// R4 element name.
        r4: &'static str,
        /// R5 element name.
        r5: &'static str,
    },
    /// `code` string (R4) ↔ CodeableConcept with one coding (R5).
    StringToConcept {
        /// Element name.
        field: &'static str,
        /// Code system used for the R5 coding.
        system: &'static str,
    },
    /// Coding (R4) ↔ list of CodeableConcept (R5).
    CodingToConceptList {
        /// Element name.
        field: &'static str,
    },
    /// CodeableConcept (R4) ↔ list of CodeableReference (R5).
    ConceptToCodeableReferenceList {
        /// Element name.
        field: &'static str,
    },
    /// `base[x]` CodeableConcept/Reference choice (R4) ↔ CodeableReference (R5).
    ChoiceToCodeableReference {
        /// Choice base name.
        base: &'static str,
    },
    /// Singular Reference (R4) ↔ entry in a `participant[]` tagged with a function code (R5).
    SingleToParticipant {
        /// R4 element name.
        r4_field: &'static str,
        /// Participant function code.
        function_code: &'static str,
    },
    /// Code values renamed between releases.
    CodeMap {
        /// Element name.
        field: &'static str,
        /// `(r4, r5)` code pairs.
        pairs: &'static [(&'static str, &'static str)],
    },
    /// Element renamed inside every item of an array.
    RenameInArray {
        /// Array element name.
        array: &'static str,
        /// R4 element name inside each item.
        r4: &'static str,
        /// R5 element name inside each item.
        r5: &'static str,
    },
    /// A choice element that must carry at most one variant of an allowed type.
    ChoiceNormalize {
        /// Choice base name.
        base: &'static str,
        /// Datatype suffixes allowed in both releases.
        allowed: &'static [&'static str],
    },
    /// A mapping that needs code rather than a table entry.
    Custom {
        /// Name used in error paths.
        name: &'static str,
        /// R4 → R5 step.
        forward: RuleFn,
        /// R5 → R4 step.
        reverse: RuleFn,
    },
}

impl fmt::Debug for MappingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappingRule({})", self.path())
    }
}

/// Code system for participant function codes.
pub const PARTICIPANT_FUNCTION_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/provenance-participant-type";

impl MappingRule {
    /// Returns the element path the rule operates on.
    pub fn path(&self) -> &'static str {
        match self {
            MappingRule::Rename { r4, .. } => r4,
            MappingRule::StringToConcept { field, .. }
            | MappingRule::CodingToConceptList { field }
            | MappingRule::ConceptToCodeableReferenceList { field }
            | MappingRule::CodeMap { field, .. } => field,
            MappingRule::ChoiceToCodeableReference { base }
            | MappingRule::ChoiceNormalize { base, .. } => base,
            MappingRule::SingleToParticipant { r4_field, .. } => r4_field,
            MappingRule::RenameInArray { array, .. } => array,
            MappingRule::Custom { name, .. } => name,
        }
    }

    /// Applies the R4 → R5 direction.
    pub fn forward(&self, obj: &mut Map<String, Value>) -> Result<(), String> {
        match *self {
            MappingRule::Rename { r4, r5 } => {
                rename(obj, r4, r5);
                Ok(())
            }
            MappingRule::StringToConcept { field, system } => {
                if let Some(value) = obj.remove(field) {
                    let code = value
                        .as_str()
                        .ok_or_else(|| "expected a code string".to_string())?;
                    obj.insert(
                        field.to_string(),
                        json!({"coding": [{"system": system, "code": code}]}),
                    );
                }
                Ok(())
            }
            MappingRule::CodingToConceptList { field } => {
                if let Some(value) = obj.remove(field) {
                    if !value.is_object() {
                        return Err("expected a Coding".to_string());
                    }
                    obj.insert(field.to_string(), json!([{"coding": [value]}]));
                }
                Ok(())
            }
            MappingRule::ConceptToCodeableReferenceList { field } => {
                if let Some(value) = obj.remove(field) {
                    if !value.is_object() {
                        return Err("expected a CodeableConcept".to_string());
                    }
                    obj.insert(field.to_string(), json!([{"concept": value}]));
                }
                Ok(())
            }
            MappingRule::ChoiceToCodeableReference { base } => {
                if let Some(found) = choice::take(obj, base) {
                    let wrapped = match found.type_suffix.as_str() {
                        "CodeableConcept" => json!({"concept": found.value}),
                        "Reference" => json!({"reference": found.value}),
                        other => return Err(format!("unexpected choice type {}", other)),
                    };
                    obj.insert(base.to_string(), wrapped);
                }
                Ok(())
            }
            MappingRule::SingleToParticipant {
                r4_field,
                function_code,
            } => {
                if let Some(actor) = obj.remove(r4_field) {
                    if !actor.is_object() {
                        return Err("expected a Reference".to_string());
                    }
                    let entry = json!({
                        "function": {"coding": [{
                            "system": PARTICIPANT_FUNCTION_SYSTEM,
                            "code": function_code
                        }]},
                        "actor": actor
                    });
                    match obj
                        .entry("participant")
                        .or_insert_with(|| Value::Array(Vec::new()))
                    {
                        Value::Array(arr) => arr.push(entry),
                        _ => return Err("participant is not an array".to_string()),
                    }
                }
                Ok(())
            }
            MappingRule::CodeMap { field, pairs } => {
                map_code(obj, field, pairs.iter().map(|(a, b)| (*a, *b)));
                Ok(())
            }
            MappingRule::RenameInArray { array, r4, r5 } => {
                rename_in_array(obj, array, r4, r5);
                Ok(())
            }
            MappingRule::ChoiceNormalize { base, allowed } => normalize_choice(obj, base, allowed),
            MappingRule::Custom { forward, .. } => forward(obj),
        }
    }

    /// Applies the R5 → R4 direction.
    pub fn reverse(&self, obj: &mut Map<String, Value>) -> Result<(), String> {
        match *self {
            MappingRule::Rename { r4, r5 } => {
                rename(obj, r5, r4);
                Ok(())
            }
            MappingRule::StringToConcept { field, system } => {
                if let Some(value) = obj.remove(field) {
                    let codings = value
                        .get("coding")
                        .and_then(Value::as_array)
                        .ok_or_else(|| "expected a CodeableConcept with coding".to_string())?;
                    let code = codings
                        .iter()
                        .find(|c| c.get("system").and_then(Value::as_str) == Some(system))
                        .or_else(|| codings.first())
                        .and_then(|c| c.get("code"))
                        .cloned()
                        .ok_or_else(|| "coding has no code".to_string())?;
                    obj.insert(field.to_string(), code);
                }
                Ok(())
            }
            MappingRule::CodingToConceptList { field } => {
                if let Some(value) = obj.remove(field) {
                    let coding = value
                        .get(0)
                        .and_then(|cc| cc.get("coding"))
                        .and_then(|c| c.get(0))
                        .cloned()
                        .ok_or_else(|| "expected a CodeableConcept list with coding".to_string())?;
                    obj.insert(field.to_string(), coding);
                }
                Ok(())
            }
            MappingRule::ConceptToCodeableReferenceList { field } => {
                if let Some(value) = obj.remove(field) {
                    if let Some(concept) = value
                        .as_array()
                        .and_then(|arr| arr.iter().find_map(|item| item.get("concept")))
                    {
                        obj.insert(field.to_string(), concept.clone());
                    }
                }
                Ok(())
            }
            MappingRule::ChoiceToCodeableReference { base } => {
                if let Some(value) = obj.remove(base) {
                    if let Some(concept) = value.get("concept") {
                        obj.insert(format!("{}CodeableConcept", base), concept.clone());
                    } else if let Some(reference) = value.get("reference") {
                        obj.insert(format!("{}Reference", base), reference.clone());
                    } else {
                        return Err("CodeableReference has neither concept nor reference".into());
                    }
                }
                Ok(())
            }
            MappingRule::SingleToParticipant {
                r4_field,
                function_code,
            } => {
                let Some(Value::Array(participants)) = obj.get_mut("participant") else {
                    return Ok(());
                };
                let pos = participants.iter().position(|p| {
                    p.get("function")
                        .and_then(|f| f.get("coding"))
                        .and_then(Value::as_array)
                        .is_some_and(|codings| {
                            codings.iter().any(|c| {
                                c.get("code").and_then(Value::as_str) == Some(function_code)
                            })
                        })
                });
                if let Some(pos) = pos {
                    let entry = participants.remove(pos);
                    let empty = participants.is_empty();
                    if empty {
                        obj.remove("participant");
                    }
                    if let Some(actor) = entry.get("actor") {
                        obj.insert(r4_field.to_string(), actor.clone());
                    }
                }
                Ok(())
            }
            MappingRule::CodeMap { field, pairs } => {
                map_code(obj, field, pairs.iter().map(|(a, b)| (*b, *a)));
                Ok(())
            }
            MappingRule::RenameInArray { array, r4, r5 } => {
                rename_in_array(obj, array, r5, r4);
                Ok(())
            }
            MappingRule::ChoiceNormalize { base, allowed } => normalize_choice(obj, base, allowed),
            MappingRule::Custom { reverse, .. } => reverse(obj),
        }
    }
}

fn rename(obj: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = obj.remove(from) {
        obj.insert(to.to_string(), value);
    }
}

fn map_code<'a>(
    obj: &mut Map<String, Value>,
    field: &str,
    mut pairs: impl Iterator<Item = (&'a str, &'a str)>,
) {
    if let Some(Value::String(code)) = obj.get_mut(field) {
        if let Some((_, to)) = pairs.find(|(from, _)| *from == code.as_str()) {
            *code = to.to_string();
        }
    }
}

fn rename_in_array(obj: &mut Map<String, Value>, array: &str, from: &str, to: &str) {
    if let Some(Value::Array(items)) = obj.get_mut(array) {
        for item in items.iter_mut() {
            if let Some(item) = item.as_object_mut() {
                rename(item, from, to);
            }
        }
    }
}

fn normalize_choice(
    obj: &mut Map<String, Value>,
    base: &str,
    allowed: &[&str],
) -> Result<(), String> {
    let Some(found) = choice::take(obj, base) else {
        return Ok(());
    };
    if choice::find(obj, base).is_some() {
        return Err(format!("more than one {}[x] variant present", base));
    }
    if !allowed.contains(&found.type_suffix.as_str()) {
        return Err(format!(
            "{}{} is not allowed",
            base, found.type_suffix
        ));
    }
    choice::put(obj, base, found);
    Ok(())
}

/// A per-type bidirectional converter.
pub trait ResourceConverter: Send + Sync {
    /// The resource type handled.
    fn resource_type(&self) -> &str;

    /// Converts an R4 body to R5.
    fn r4_to_r5(&self, resource: &Value) -> Result<Value, VersionError>;

    /// Converts an R5 body to R4.
    fn r5_to_r4(&self, resource: &Value) -> Result<Value, VersionError>;

    /// JSON pointer prefixes the round-trip validator ignores for this type.
    fn round_trip_ignore(&self) -> &[&'static str] {
        &[]
    }

    /// Top-level arrays whose item order the round-trip validator ignores.
    fn round_trip_unordered(&self) -> &[&'static str] {
        &[]
    }

    /// Converts between any two releases.
    fn convert(
        &self,
        resource: &Value,
        from: FhirVersion,
        to: FhirVersion,
    ) -> Result<Value, VersionError> {
        if from.same_family(to) {
            return Ok(resource.clone());
        }
        match from.family() {
            FhirVersion::R5 => self.r5_to_r4(resource),
            _ => self.r4_to_r5(resource),
        }
    }
}

/// A converter driven by a rule table.
#[derive(Debug, Clone, Copy)]
pub struct RuleConverter {
    /// The resource type handled.
    pub resource_type: &'static str,
    /// The rule table, in R4 → R5 order.
    pub rules: &'static [MappingRule],
    /// Round-trip ignore prefixes.
    pub ignore: &'static [&'static str],
    /// Arrays compared as multisets on a round trip.
    pub unordered: &'static [&'static str],
}

impl RuleConverter {
    /// Creates a converter that changes nothing.
    pub const fn identity(resource_type: &'static str) -> Self {
        Self {
            resource_type,
            rules: &[],
            ignore: &[],
            unordered: &[],
        }
    }

    fn apply(
        &self,
        resource: &Value,
        rules: impl Iterator<Item = &'static MappingRule>,
        forward: bool,
    ) -> Result<Value, VersionError> {
        let mut converted = resource.clone();
        let obj = converted
            .as_object_mut()
            .ok_or_else(|| VersionError::ConversionFailed {
                resource_type: self.resource_type.to_string(),
                path: self.resource_type.to_string(),
                message: "resource is not a JSON object".to_string(),
            })?;
        for rule in rules {
            let outcome = if forward {
                rule.forward(obj)
            } else {
                rule.reverse(obj)
            };
            outcome.map_err(|message| VersionError::ConversionFailed {
                resource_type: self.resource_type.to_string(),
                path: format!("{}.{}", self.resource_type, rule.path()),
                message,
            })?;
        }
        Ok(converted)
    }
}

impl ResourceConverter for RuleConverter {
    fn resource_type(&self) -> &str {
        self.resource_type
    }

    fn r4_to_r5(&self, resource: &Value) -> Result<Value, VersionError> {
        self.apply(resource, self.rules.iter(), true)
    }

    fn r5_to_r4(&self, resource: &Value) -> Result<Value, VersionError> {
        self.apply(resource, self.rules.iter().rev(), false)
    }

    fn round_trip_ignore(&self) -> &[&'static str] {
        self.ignore
    }

    fn round_trip_unordered(&self) -> &[&'static str] {
        self.unordered
    }
}

/// Registry of converters keyed by resource type.
#[derive(Clone)]
pub struct ConverterFactory {
    converters: HashMap<String, Arc<dyn ResourceConverter>>,
}

impl fmt::Debug for ConverterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.converters.keys().collect();
        types.sort();
        f.debug_struct("ConverterFactory")
            .field("types", &types)
            .finish()
    }
}

impl ConverterFactory {
    /// Creates an empty factory. Every type passes through unchanged.
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Creates a factory with every built-in converter registered.
    pub fn with_defaults() -> Self {
        let mut factory = Self::empty();
        for converter in super::converters::builtin() {
            factory.register(Arc::new(converter));
        }
        factory
    }

    /// Registers a converter, replacing any existing one for the type.
    pub fn register(&mut self, converter: Arc<dyn ResourceConverter>) {
        self.converters
            .insert(converter.resource_type().to_string(), converter);
    }

    /// Returns the converter for a type, if registered.
    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn ResourceConverter>> {
        self.converters.get(resource_type).cloned()
    }

    /// Converts a body between releases.
    ///
    /// Types without a registered converter pass through unchanged.
    pub fn convert(
        &self,
        resource_type: &str,
        resource: &Value,
        from: FhirVersion,
        to: FhirVersion,
    ) -> Result<Value, VersionError> {
        match self.converters.get(resource_type) {
            Some(converter) => converter.convert(resource, from, to),
            None => {
                if !from.same_family(to) {
                    debug!(
                        resource_type,
                        from = %from,
                        to = %to,
                        "No converter registered, passing resource through"
                    );
                }
                Ok(resource.clone())
            }
        }
    }
}

impl Default for ConverterFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &[MappingRule] = &[
        MappingRule::Rename {
            r4: "period",
            r5: "actualPeriod",
        },
        MappingRule::CodeMap {
            field: "status",
            pairs: &[("finished", "completed")],
        },
    ];

    fn converter() -> RuleConverter {
        RuleConverter {
            resource_type: "Encounter",
            rules: RULES,
            ignore: &[],
            unordered: &[],
        }
    }

    #[test]
    fn test_forward_and_reverse() {
        let r4 = json!({"resourceType": "Encounter", "status": "finished", "period": {"start": "2020"}});
        let r5 = converter().r4_to_r5(&r4).unwrap();
        assert_eq!(r5["status"], "completed");
        assert_eq!(r5["actualPeriod"]["start"], "2020");
        assert!(r5.get("period").is_none());

        assert_eq!(converter().r5_to_r4(&r5).unwrap(), r4);
    }

    #[test]
    fn test_same_family_is_identity() {
        let body = json!({"resourceType": "Encounter", "status": "finished"});
        let out = converter()
            .convert(&body, FhirVersion::R4, FhirVersion::R4B)
            .unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn test_conversion_error_carries_path() {
        let rules: &'static [MappingRule] = &[MappingRule::StringToConcept {
            field: "type",
            system: "http://example.org",
        }];
        let conv = RuleConverter {
            resource_type: "AllergyIntolerance",
            rules,
            ignore: &[],
            unordered: &[],
        };
        let err = conv
            .r4_to_r5(&json!({"resourceType": "AllergyIntolerance", "type": 5}))
            .unwrap_err();
        match err {
            VersionError::ConversionFailed { path, .. } => {
                assert_eq!(path, "AllergyIntolerance.type")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_factory_passthrough_for_unknown_type() {
        let factory = ConverterFactory::empty();
        let body = json!({"resourceType": "Specimen", "status": "available"});
        let out = factory
            .convert("Specimen", &body, FhirVersion::R4, FhirVersion::R5)
            .unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn test_choice_normalize_rejects_two_variants() {
        let rule = MappingRule::ChoiceNormalize {
            base: "onset",
            allowed: &["DateTime", "String"],
        };
        let mut obj = json!({"onsetDateTime": "2020", "onsetString": "childhood"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(rule.forward(&mut obj).is_err());
    }
}
