//! SearchParameter Value Extractor.
//!
//! Walks each active parameter's path expression over a resource body and
//! converts what it reaches into [`IndexValue`]s. A field that cannot be
//! converted is logged and skipped; extraction never fails a write because
//! of one bad element.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::types::SearchParamType;
use crate::version::choice;
use crate::version::extension::{ExtensionSchema, schema_for};

use super::converters::{IndexValue, ValueConverter};
use super::errors::ExtractionError;
use super::registry::{SearchParameterDefinition, SearchParameterRegistry};

/// A value extracted from a resource for indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedValue {
    /// The parameter name (e.g., "name", "identifier").
    pub param_name: String,

    /// The type of the stored value. For composites this is the component's type.
    pub param_type: SearchParamType,

    /// The extracted and converted value.
    pub value: IndexValue,

    /// Composite group ID. Rows with the same group come from one composite instance.
    pub composite_group: Option<u32>,

    /// Position of the component within its composite.
    pub component_index: Option<u32>,
}

impl ExtractedValue {
    /// Creates a new extracted value.
    pub fn new(param_name: impl Into<String>, value: IndexValue) -> Self {
        Self {
            param_name: param_name.into(),
            param_type: value.param_type(),
            value,
            composite_group: None,
            component_index: None,
        }
    }

    /// Marks the value as a composite component.
    pub fn with_component(mut self, group: u32, index: u32) -> Self {
        self.composite_group = Some(group);
        self.component_index = Some(index);
        self
    }
}

/// Extracts searchable values from FHIR resources.
pub struct SearchParameterExtractor {
    registry: Arc<RwLock<SearchParameterRegistry>>,
}

impl SearchParameterExtractor {
    /// Creates a new extractor with the given registry.
    pub fn new(registry: Arc<RwLock<SearchParameterRegistry>>) -> Self {
        Self { registry }
    }

    /// Returns the registry the extractor reads.
    pub fn registry(&self) -> &Arc<RwLock<SearchParameterRegistry>> {
        &self.registry
    }

    /// Extracts all searchable values from a resource.
    ///
    /// Returns values for all active search parameters that apply to this
    /// resource type, including the ones declared on `Resource`.
    pub fn extract(
        &self,
        resource: &Value,
        resource_type: &str,
    ) -> Result<Vec<ExtractedValue>, ExtractionError> {
        let obj = resource
            .as_object()
            .ok_or_else(|| ExtractionError::InvalidResource {
                message: "Resource must be a JSON object".to_string(),
            })?;

        if let Some(rt) = obj.get("resourceType").and_then(|v| v.as_str()) {
            if rt != resource_type {
                return Err(ExtractionError::InvalidResource {
                    message: format!(
                        "Resource type mismatch: expected {}, got {}",
                        resource_type, rt
                    ),
                });
            }
        }

        let params = self.registry.read().get_active_params(resource_type);

        let mut results = Vec::new();
        let mut next_group = 0u32;
        for param in &params {
            match self.extract_for_param(resource, param, &mut next_group) {
                Ok(values) => results.extend(values),
                Err(e) => {
                    warn!(
                        resource_type,
                        param = %param.code,
                        error = %e,
                        "Failed to extract search parameter"
                    );
                }
            }
        }

        Ok(results)
    }

    /// Extracts values for a specific parameter from a resource.
    ///
    /// Composite instances are numbered from `next_group`, which is advanced
    /// past every group used.
    pub fn extract_for_param(
        &self,
        resource: &Value,
        param: &SearchParameterDefinition,
        next_group: &mut u32,
    ) -> Result<Vec<ExtractedValue>, ExtractionError> {
        if param.expression.is_empty() {
            return Ok(Vec::new());
        }
        let paths = parse_expression(&param.expression, true)?;

        if param.is_composite() {
            return self.extract_composite(resource, param, &paths, next_group);
        }

        let mut results = Vec::new();
        for element in evaluate_all(resource, &paths) {
            for value in convert_logged(&element, param.param_type, &param.code) {
                if accepts_target(param, &value) {
                    results.push(ExtractedValue::new(&param.code, value));
                }
            }
        }
        Ok(results)
    }

    fn extract_composite(
        &self,
        resource: &Value,
        param: &SearchParameterDefinition,
        context_paths: &[Vec<Step>],
        next_group: &mut u32,
    ) -> Result<Vec<ExtractedValue>, ExtractionError> {
        let component_paths = param
            .component
            .iter()
            .map(|c| parse_expression(&c.expression, false))
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = Vec::new();
        for context in evaluate_all(resource, context_paths) {
            let per_component: Vec<Vec<IndexValue>> = param
                .component
                .iter()
                .zip(&component_paths)
                .map(|(component, paths)| {
                    evaluate_all(&context, paths)
                        .iter()
                        .flat_map(|v| convert_logged(v, component.param_type, &param.code))
                        .collect()
                })
                .collect();

            // Every component must be present on the same instance
            if per_component.iter().any(Vec::is_empty) {
                continue;
            }

            let group = *next_group;
            *next_group += 1;
            for (index, values) in per_component.into_iter().enumerate() {
                for value in values {
                    results.push(
                        ExtractedValue::new(&param.code, value).with_component(group, index as u32),
                    );
                }
            }
        }
        Ok(results)
    }
}

impl std::fmt::Debug for SearchParameterExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchParameterExtractor").finish()
    }
}

fn convert_logged(value: &Value, param_type: SearchParamType, param_name: &str) -> Vec<IndexValue> {
    ValueConverter::convert(value, param_type, param_name).unwrap_or_else(|e| {
        warn!(param = param_name, error = %e, "Skipping unindexable field");
        Vec::new()
    })
}

fn accepts_target(param: &SearchParameterDefinition, value: &IndexValue) -> bool {
    match value {
        IndexValue::Reference(r) => match &r.target_type {
            Some(t) if !param.target.is_empty() => param.target.iter().any(|x| x == t),
            _ => true,
        },
        _ => true,
    }
}

/// One step of a parsed path.
#[derive(Debug, Clone)]
enum Step {
    /// Child element.
    Field(String),
    /// Choice element `name[x]`.
    Choice(String),
    /// Keep items where `path` reaches `literal`.
    Where { path: Vec<Step>, literal: String },
    /// Reserved extension read through its schema; yields an object of slot values.
    Extension(&'static ExtensionSchema),
}

/// Splits `s` on `sep` outside quotes and parentheses.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            c if c == sep && !quoted && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_expression(expression: &str, rooted: bool) -> Result<Vec<Vec<Step>>, ExtractionError> {
    split_top_level(expression, '|')
        .into_iter()
        .map(|alt| parse_path(alt.trim(), rooted, expression))
        .collect()
}

fn parse_path(path: &str, rooted: bool, expression: &str) -> Result<Vec<Step>, ExtractionError> {
    let invalid = |message: String| ExtractionError::InvalidExpression {
        expression: expression.to_string(),
        message,
    };

    let mut segments = split_top_level(path, '.').into_iter();
    if rooted {
        let root = segments.next().unwrap_or_default();
        if !root.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
            return Err(invalid(format!("path must start with a type, found '{}'", root)));
        }
    }

    let mut steps = Vec::new();
    for segment in segments {
        let segment = segment.trim();
        if let Some(base) = segment.strip_suffix("[x]") {
            steps.push(Step::Choice(base.to_string()));
        } else if let Some(inner) = segment
            .strip_prefix("where(")
            .and_then(|s| s.strip_suffix(')'))
        {
            let (lhs, rhs) = inner
                .split_once('=')
                .ok_or_else(|| invalid(format!("unsupported filter '{}'", inner)))?;
            let literal = rhs
                .trim()
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .ok_or_else(|| invalid(format!("filter value must be quoted: {}", rhs)))?;
            steps.push(Step::Where {
                path: parse_path(lhs.trim(), false, expression)?,
                literal: literal.to_string(),
            });
        } else if let Some(arg) = segment
            .strip_prefix("extension('")
            .and_then(|s| s.strip_suffix("')"))
        {
            let schema =
                schema_for(arg).ok_or_else(|| invalid(format!("unknown extension '{}'", arg)))?;
            steps.push(Step::Extension(schema));
        } else if !segment.is_empty()
            && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            steps.push(Step::Field(segment.to_string()));
        } else {
            return Err(invalid(format!("unsupported segment '{}'", segment)));
        }
    }
    Ok(steps)
}

fn push_flat(out: &mut Vec<Value>, value: &Value) {
    match value {
        Value::Array(items) => out.extend(items.iter().cloned()),
        other => out.push(other.clone()),
    }
}

fn evaluate(root: &Value, steps: &[Step]) -> Vec<Value> {
    let mut current = Vec::new();
    push_flat(&mut current, root);

    for step in steps {
        let mut next = Vec::new();
        for item in &current {
            match step {
                Step::Field(name) => {
                    if let Some(child) = item.get(name) {
                        push_flat(&mut next, child);
                    }
                }
                Step::Choice(base) => {
                    if let Some(found) = item.as_object().and_then(|o| choice::find(o, base)) {
                        push_flat(&mut next, &found.value);
                    }
                }
                Step::Where { path, literal } => {
                    let matched = evaluate(item, path).iter().any(|v| match v {
                        Value::String(s) => s == literal,
                        Value::Bool(_) | Value::Number(_) => v.to_string() == *literal,
                        _ => false,
                    });
                    if matched {
                        next.push(item.clone());
                    }
                }
                Step::Extension(schema) => {
                    let extensions = item.get("extension").and_then(Value::as_array);
                    for ext in extensions.into_iter().flatten().filter(|e| schema.matches(e)) {
                        match schema.parse(ext) {
                            Ok(values) => next.push(values.to_object()),
                            Err(e) => {
                                warn!(url = schema.url, error = %e, "Skipping malformed extension")
                            }
                        }
                    }
                }
            }
        }
        current = next;
    }
    current
}

fn evaluate_all(root: &Value, paths: &[Vec<Step>]) -> Vec<Value> {
    paths.iter().flat_map(|p| evaluate(root, p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::FhirVersion;
    use crate::version::extension::OriginalPayload;
    use serde_json::json;

    fn create_test_extractor() -> SearchParameterExtractor {
        let registry = SearchParameterRegistry::with_embedded();
        SearchParameterExtractor::new(Arc::new(RwLock::new(registry)))
    }

    fn values_for<'a>(values: &'a [ExtractedValue], name: &str) -> Vec<&'a ExtractedValue> {
        values.iter().filter(|v| v.param_name == name).collect()
    }

    #[test]
    fn test_extract_patient_name() {
        let extractor = create_test_extractor();
        let patient = json!({
            "resourceType": "Patient",
            "id": "123",
            "name": [{"family": "Smith", "given": ["John", "James"]}]
        });

        let values = extractor.extract(&patient, "Patient").unwrap();

        assert_eq!(values_for(&values, "name").len(), 3);
        assert_eq!(values_for(&values, "family").len(), 1);
        assert_eq!(values_for(&values, "given").len(), 2);
        assert_eq!(
            values_for(&values, "_id")[0].value,
            IndexValue::token(None, "123")
        );
    }

    #[test]
    fn test_extract_patient_identifier() {
        let extractor = create_test_extractor();
        let patient = json!({
            "resourceType": "Patient",
            "identifier": [{"system": "http://hospital.org/mrn", "value": "12345"}]
        });

        let values = extractor.extract(&patient, "Patient").unwrap();
        let ids = values_for(&values, "identifier");
        assert_eq!(
            ids[0].value,
            IndexValue::token(Some("http://hospital.org/mrn"), "12345")
        );
    }

    #[test]
    fn test_where_filter() {
        let extractor = create_test_extractor();
        let patient = json!({
            "resourceType": "Patient",
            "telecom": [
                {"system": "phone", "value": "555-1234"},
                {"system": "email", "value": "a@example.org"}
            ]
        });

        let values = extractor.extract(&patient, "Patient").unwrap();
        let phones = values_for(&values, "phone");
        assert_eq!(phones.len(), 1);
        assert_eq!(phones[0].value, IndexValue::token(Some("phone"), "555-1234"));
        assert_eq!(values_for(&values, "telecom").len(), 2);
    }

    #[test]
    fn test_choice_element() {
        let extractor = create_test_extractor();
        let observation = json!({
            "resourceType": "Observation",
            "status": "final",
            "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4"}]},
            "effectiveDateTime": "2024-01-15",
            "subject": {"reference": "Patient/123"}
        });

        let values = extractor.extract(&observation, "Observation").unwrap();
        assert_eq!(values_for(&values, "date").len(), 1);
        assert_eq!(values_for(&values, "subject").len(), 1);
        assert_eq!(values_for(&values, "patient").len(), 1);
    }

    #[test]
    fn test_reference_targets_filter() {
        let extractor = create_test_extractor();
        let observation = json!({
            "resourceType": "Observation",
            "subject": {"reference": "Group/g1"}
        });

        let values = extractor.extract(&observation, "Observation").unwrap();
        assert_eq!(values_for(&values, "subject").len(), 1);
        assert!(values_for(&values, "patient").is_empty());
    }

    #[test]
    fn test_composite_groups() {
        let extractor = create_test_extractor();
        let observation = json!({
            "resourceType": "Observation",
            "code": {"coding": [{"system": "http://loinc.org", "code": "85354-9"}]},
            "component": [
                {
                    "code": {"coding": [{"system": "http://loinc.org", "code": "8480-6"}]},
                    "valueQuantity": {"value": 120, "unit": "mmHg"}
                },
                {
                    "code": {"coding": [{"system": "http://loinc.org", "code": "8462-4"}]},
                    "valueQuantity": {"value": 80, "unit": "mmHg"}
                }
            ]
        });

        let values = extractor.extract(&observation, "Observation").unwrap();
        let rows = values_for(&values, "component-code-value-quantity");
        assert_eq!(rows.len(), 4);

        let systolic_group = rows
            .iter()
            .find(|r| r.value == IndexValue::token(Some("http://loinc.org"), "8480-6"))
            .and_then(|r| r.composite_group)
            .unwrap();
        let in_group: Vec<_> = rows
            .iter()
            .filter(|r| r.composite_group == Some(systolic_group))
            .collect();
        assert_eq!(in_group.len(), 2);
        assert!(in_group.iter().any(|r| r.component_index == Some(1)
            && matches!(&r.value, IndexValue::Quantity { value, .. } if *value == 120.into())));

        // No top-level valueQuantity, so no code-value-quantity instance
        assert!(values_for(&values, "code-value-quantity").is_empty());
    }

    #[test]
    fn test_bad_field_is_skipped() {
        let extractor = create_test_extractor();
        let patient = json!({
            "resourceType": "Patient",
            "birthDate": "not a date",
            "gender": "female"
        });

        let values = extractor.extract(&patient, "Patient").unwrap();
        assert!(values_for(&values, "birthdate").is_empty());
        assert_eq!(values_for(&values, "gender").len(), 1);
    }

    #[test]
    fn test_original_version_from_extension() {
        let extractor = create_test_extractor();
        let mut allergy = json!({"resourceType": "AllergyIntolerance", "id": "a1"});
        OriginalPayload::new(FhirVersion::R4, json!({"resourceType": "AllergyIntolerance"}))
            .embed_into(&mut allergy)
            .unwrap();

        let values = extractor.extract(&allergy, "AllergyIntolerance").unwrap();
        let versions = values_for(&values, "original-version");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].value, IndexValue::token(None, "4.0.1"));
    }

    #[test]
    fn test_r5_participant_recorder() {
        let extractor = create_test_extractor();
        let allergy = json!({
            "resourceType": "AllergyIntolerance",
            "participant": [
                {
                    "function": {"coding": [{"code": "enterer"}]},
                    "actor": {"reference": "Practitioner/d1"}
                },
                {
                    "function": {"coding": [{"code": "author"}]},
                    "actor": {"reference": "Patient/p1"}
                }
            ]
        });

        let values = extractor.extract(&allergy, "AllergyIntolerance").unwrap();
        let recorder = values_for(&values, "recorder");
        assert_eq!(recorder.len(), 1);
        let IndexValue::Reference(r) = &recorder[0].value else {
            panic!("expected reference");
        };
        assert_eq!(r.local_reference(), "Practitioner/d1");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_expression("Patient.name.where(use)", true).is_err());
        assert!(parse_expression("name", true).is_err());
        assert!(parse_expression("Resource.extension('nope').x", true).is_err());
        assert_eq!(
            parse_expression("Patient.a | Patient.b.c", true).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_invalid_resource() {
        let extractor = create_test_extractor();
        assert!(extractor.extract(&json!("string"), "Patient").is_err());
        assert!(
            extractor
                .extract(&json!({"resourceType": "Patient"}), "Observation")
                .is_err()
        );
    }
}
