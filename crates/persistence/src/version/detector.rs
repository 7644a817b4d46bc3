//! Structural FHIR version detection.
//!
//! Detection scores a body against a table of [`IndicatorRule`]s. Each rule
//! recognises one release-specific shape (for example `medication.concept`
//! only exists in R5) and contributes its weight to that release. An explicit
//! `meta.tag` in the `http://hl7.org/fhir/FHIR-version` system outweighs any
//! structural hint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::FhirVersion;
use crate::types::FhirResource;

/// Tag system carrying an explicit FHIR version.
pub const FHIR_VERSION_TAG_SYSTEM: &str = "http://hl7.org/fhir/FHIR-version";

/// Shape an element must have for a rule to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// The element exists.
    Present,
    /// The element is a JSON object.
    Object,
    /// The element is a JSON array.
    Array,
    /// The element is a JSON string.
    String,
    /// The element is the given string.
    Equals(&'static str),
}

impl Shape {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Shape::Present => true,
            Shape::Object => value.is_object(),
            Shape::Array => value.is_array(),
            Shape::String => value.is_string(),
            Shape::Equals(expected) => value.as_str() == Some(*expected),
        }
    }
}

/// One structural hint.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorRule {
    /// Resource type the rule applies to.
    pub resource_type: &'static str,
    /// Dotted element path.
    pub path: &'static str,
    /// Required shape at the path.
    pub shape: Shape,
    /// The release the shape indicates.
    pub version: FhirVersion,
    /// Contribution to the release's score.
    pub weight: f64,
}

macro_rules! rule {
    ($rt:literal, $path:literal, $shape:expr, $v:ident, $w:literal) => {
        IndicatorRule {
            resource_type: $rt,
            path: $path,
            shape: $shape,
            version: FhirVersion::$v,
            weight: $w,
        }
    };
}

/// Built-in indicator table.
pub const DEFAULT_RULES: &[IndicatorRule] = &[
    rule!("MedicationRequest", "medicationCodeableConcept", Shape::Present, R4, 0.9),
    rule!("MedicationRequest", "medicationReference", Shape::Present, R4, 0.9),
    rule!("MedicationRequest", "medication", Shape::Object, R5, 0.9),
    rule!("MedicationRequest", "reportedBoolean", Shape::Present, R4, 0.6),
    rule!("MedicationRequest", "reportedReference", Shape::Present, R4, 0.6),
    rule!("MedicationRequest", "informationSource", Shape::Present, R5, 0.6),
    rule!("AllergyIntolerance", "type", Shape::String, R4, 0.8),
    rule!("AllergyIntolerance", "type", Shape::Object, R5, 0.8),
    rule!("AllergyIntolerance", "recorder", Shape::Present, R4, 0.6),
    rule!("AllergyIntolerance", "asserter", Shape::Present, R4, 0.6),
    rule!("AllergyIntolerance", "participant", Shape::Array, R5, 0.7),
    rule!("Encounter", "class", Shape::Object, R4, 0.8),
    rule!("Encounter", "class", Shape::Array, R5, 0.8),
    rule!("Encounter", "period", Shape::Present, R4, 0.5),
    rule!("Encounter", "actualPeriod", Shape::Present, R5, 0.7),
    rule!("Encounter", "hospitalization", Shape::Present, R4, 0.6),
    rule!("Encounter", "admission", Shape::Present, R5, 0.6),
    rule!("Encounter", "status", Shape::Equals("finished"), R4, 0.5),
    rule!("Encounter", "status", Shape::Equals("completed"), R5, 0.5),
    rule!("Observation", "triggeredBy", Shape::Present, R5, 0.7),
    rule!("Observation", "bodyStructure", Shape::Present, R5, 0.5),
];

/// A hint that fired during detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionIndicator {
    /// The element path that matched.
    pub path: String,
    /// The release it indicates.
    pub version: FhirVersion,
    /// Its weight.
    pub weight: f64,
}

/// The outcome of version detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// The detected release.
    pub version: FhirVersion,
    /// Confidence in `[0, 1]`. Zero when nothing indicated a release.
    pub confidence: f64,
    /// Every indicator that fired.
    pub indicators: Vec<VersionIndicator>,
}

/// Detects the FHIR release of a resource body.
#[derive(Debug, Clone)]
pub struct VersionDetector {
    rules: Vec<IndicatorRule>,
    default_version: FhirVersion,
}

impl VersionDetector {
    /// Creates a detector with the built-in rule table.
    pub fn new(default_version: FhirVersion) -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
            default_version,
        }
    }

    /// Adds a rule.
    pub fn with_rule(mut self, rule: IndicatorRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Returns the version assumed when nothing indicates one.
    pub fn default_version(&self) -> FhirVersion {
        self.default_version
    }

    /// Detects the release of a resource.
    pub fn detect(&self, resource: &FhirResource) -> DetectionResult {
        let resource_type = resource.resource_type().as_str();
        let mut indicators = Vec::new();

        if let Some(tagged) = tagged_version(resource) {
            indicators.push(VersionIndicator {
                path: "meta.tag".to_string(),
                version: tagged,
                weight: 1.0,
            });
        }

        for rule in self.rules.iter().filter(|r| r.resource_type == resource_type) {
            let matched = lookup(resource, rule.path).is_some_and(|v| rule.shape.matches(v));
            if matched {
                indicators.push(VersionIndicator {
                    path: rule.path.to_string(),
                    version: rule.version,
                    weight: rule.weight,
                });
            }
        }

        let score = |family: FhirVersion| -> f64 {
            indicators
                .iter()
                .filter(|i| i.version.family() == family)
                .map(|i| i.weight)
                .sum()
        };
        let r4 = score(FhirVersion::R4);
        let r5 = score(FhirVersion::R5);

        if r4 == 0.0 && r5 == 0.0 {
            return DetectionResult {
                version: self.default_version,
                confidence: 0.0,
                indicators,
            };
        }

        let (winner, winning, losing) = if r5 > r4 {
            (FhirVersion::R5, r5, r4)
        } else if r4 > r5 {
            (FhirVersion::R4, r4, r5)
        } else {
            (self.default_version, r4, r5)
        };

        // A tag names the exact release (R4B vs R4); structure only knows the family
        let version = indicators
            .iter()
            .find(|i| i.path == "meta.tag" && i.version.family() == winner.family())
            .map(|i| i.version)
            .unwrap_or(winner);

        DetectionResult {
            version,
            confidence: winning / (winning + losing) * winning.min(1.0),
            indicators,
        }
    }
}

impl Default for VersionDetector {
    fn default() -> Self {
        Self::new(FhirVersion::R4)
    }
}

fn tagged_version(resource: &FhirResource) -> Option<FhirVersion> {
    resource
        .get("meta")?
        .get("tag")?
        .as_array()?
        .iter()
        .filter(|t| t.get("system").and_then(Value::as_str) == Some(FHIR_VERSION_TAG_SYSTEM))
        .find_map(|t| t.get("code").and_then(Value::as_str)?.parse().ok())
}

fn lookup<'a>(resource: &'a FhirResource, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = resource.get(parts.next()?)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detect(value: Value) -> DetectionResult {
        VersionDetector::default().detect(&FhirResource::parse(value).unwrap())
    }

    #[test]
    fn test_r4_medication_request() {
        let result = detect(json!({
            "resourceType": "MedicationRequest",
            "medicationCodeableConcept": {"text": "aspirin"}
        }));
        assert_eq!(result.version, FhirVersion::R4);
        assert!(result.confidence > 0.8);
        assert_eq!(result.indicators.len(), 1);
        assert_eq!(result.indicators[0].path, "medicationCodeableConcept");
    }

    #[test]
    fn test_r5_medication_request() {
        let result = detect(json!({
            "resourceType": "MedicationRequest",
            "medication": {"concept": {"text": "aspirin"}},
            "informationSource": [{"reference": "Patient/1"}]
        }));
        assert_eq!(result.version, FhirVersion::R5);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_no_indicators_uses_default() {
        let result = detect(json!({"resourceType": "Patient", "name": [{"family": "X"}]}));
        assert_eq!(result.version, FhirVersion::R4);
        assert_eq!(result.confidence, 0.0);
        assert!(result.indicators.is_empty());
    }

    #[test]
    fn test_meta_tag_wins() {
        let result = detect(json!({
            "resourceType": "Patient",
            "meta": {"tag": [{"system": FHIR_VERSION_TAG_SYSTEM, "code": "5.0.0"}]}
        }));
        assert_eq!(result.version, FhirVersion::R5);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_meta_tag_keeps_r4b() {
        let result = detect(json!({
            "resourceType": "Encounter",
            "class": {"code": "AMB"},
            "meta": {"tag": [{"system": FHIR_VERSION_TAG_SYSTEM, "code": "4.3.0"}]}
        }));
        assert_eq!(result.version, FhirVersion::R4B);
    }

    #[test]
    fn test_mixed_indicators_lower_confidence() {
        let result = detect(json!({
            "resourceType": "Encounter",
            "class": [{"coding": [{"code": "AMB"}]}],
            "period": {"start": "2020"}
        }));
        assert_eq!(result.version, FhirVersion::R5);
        assert!(result.confidence < 0.7);
        assert!(result.confidence > 0.0);
    }

    #[test]
    fn test_extra_rule() {
        let detector = VersionDetector::new(FhirVersion::R4).with_rule(IndicatorRule {
            resource_type: "Observation",
            path: "instantiatesReference",
            shape: Shape::Present,
            version: FhirVersion::R5,
            weight: 0.7,
        });
        let resource = FhirResource::parse(json!({
            "resourceType": "Observation",
            "instantiatesReference": {"reference": "ObservationDefinition/x"}
        }))
        .unwrap();

        let result = detector.detect(&resource);
        assert_eq!(result.version, FhirVersion::R5);
        assert_eq!(result.indicators[0].path, "instantiatesReference");
    }
}
