//! Storage strategy selection and output negotiation.
//!
//! On the write path [`VersionNegotiator::prepare_for_storage`] detects the
//! incoming release, converts the body according to the configured
//! [`StorageStrategy`], and returns the body to persist together with its
//! [`VersionMetadata`]. On the read path [`VersionNegotiator::present`]
//! turns a stored body back into the release the caller asked for.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::converter::ConverterFactory;
use super::detector::{FHIR_VERSION_TAG_SYSTEM, VersionDetector, VersionIndicator};
use super::extension::{ORIGINAL_PAYLOAD, OriginalPayload};
use super::FhirVersion;
use crate::error::VersionError;
use crate::types::{FhirResource, StoredResource};

/// How resource bodies are persisted across releases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageStrategy {
    /// Store exactly as received.
    Native,
    /// Convert to the canonical release before storing.
    Canonical,
    /// Store the canonical body and retain the original in a reserved extension.
    #[default]
    Hybrid,
    /// Store the canonical body plus a copy in the original release.
    MultiVersion,
}

impl StorageStrategy {
    /// Returns the configuration name of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageStrategy::Native => "NATIVE",
            StorageStrategy::Canonical => "CANONICAL",
            StorageStrategy::Hybrid => "HYBRID",
            StorageStrategy::MultiVersion => "MULTI_VERSION",
        }
    }

    /// Parses a configuration name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NATIVE" => Some(StorageStrategy::Native),
            "CANONICAL" => Some(StorageStrategy::Canonical),
            "HYBRID" => Some(StorageStrategy::Hybrid),
            "MULTI_VERSION" | "MULTIVERSION" => Some(StorageStrategy::MultiVersion),
            _ => None,
        }
    }
}

/// Version bookkeeping kept for every stored resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    /// The release detection settled on.
    pub detected_version: FhirVersion,
    /// The release of the persisted body.
    pub stored_version: FhirVersion,
    /// The release the client sent.
    pub original_version: FhirVersion,
    /// Whether the persisted body differs from what was received.
    pub transformation_applied: bool,
    /// Detection confidence.
    pub confidence: f64,
    /// Indicators that fired during detection.
    pub indicators: Vec<VersionIndicator>,
    /// Strategy used for this write.
    pub storage_strategy: StorageStrategy,
    /// Top-level extension URLs on the received body.
    pub extensions: Vec<String>,
    /// Declared profiles on the received body.
    pub profiles: Vec<String>,
}

/// A body copy in another release (MULTI_VERSION).
#[derive(Debug, Clone, PartialEq)]
pub struct VersionCopy {
    /// The copy's release.
    pub fhir_version: FhirVersion,
    /// The copy's body.
    pub content: Value,
}

/// The result of negotiating a write.
#[derive(Debug, Clone)]
pub struct PreparedResource {
    /// The body to persist and index.
    pub content: Value,
    /// Version bookkeeping.
    pub metadata: VersionMetadata,
    /// Extra copy written under MULTI_VERSION.
    pub version_copy: Option<VersionCopy>,
}

/// Detects, converts and presents resources across releases.
#[derive(Debug, Clone)]
pub struct VersionNegotiator {
    detector: VersionDetector,
    converters: ConverterFactory,
    strategy: StorageStrategy,
    canonical: FhirVersion,
}

impl VersionNegotiator {
    /// Creates a negotiator.
    pub fn new(
        strategy: StorageStrategy,
        canonical: FhirVersion,
        default_version: FhirVersion,
    ) -> Self {
        Self {
            detector: VersionDetector::new(default_version),
            converters: ConverterFactory::with_defaults(),
            strategy,
            canonical,
        }
    }

    /// Replaces the converter registry.
    pub fn with_converters(mut self, converters: ConverterFactory) -> Self {
        self.converters = converters;
        self
    }

    /// Returns the configured strategy.
    pub fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    /// Returns the canonical release.
    pub fn canonical_version(&self) -> FhirVersion {
        self.canonical
    }

    /// Returns the detector.
    pub fn detector(&self) -> &VersionDetector {
        &self.detector
    }

    /// Returns the converter registry.
    pub fn converters(&self) -> &ConverterFactory {
        &self.converters
    }

    /// Negotiates how a received body is persisted.
    pub fn prepare_for_storage(
        &self,
        resource: &FhirResource,
    ) -> Result<PreparedResource, VersionError> {
        let detection = self.detector.detect(resource);
        let resource_type = resource.resource_type().as_str();

        let mut original = resource.clone().into_value();
        ORIGINAL_PAYLOAD.remove_from(&mut original);

        let detected = detection.version;
        let crosses = !detected.same_family(self.canonical);

        let (content, stored_version, version_copy) = match self.strategy {
            StorageStrategy::Native => (original.clone(), detected, None),
            StorageStrategy::Canonical | StorageStrategy::Hybrid | StorageStrategy::MultiVersion
                if !crosses =>
            {
                (original.clone(), detected, None)
            }
            StorageStrategy::Canonical => {
                let converted = self.convert(resource_type, &original, detected, self.canonical)?;
                (converted, self.canonical, None)
            }
            StorageStrategy::Hybrid => {
                let mut converted =
                    self.convert(resource_type, &original, detected, self.canonical)?;
                if converted != original {
                    OriginalPayload::new(detected, original.clone())
                        .embed_into(&mut converted)
                        .map_err(|e| VersionError::ConversionFailed {
                            resource_type: resource_type.to_string(),
                            path: format!("{}.extension", resource_type),
                            message: e.to_string(),
                        })?;
                }
                (converted, self.canonical, None)
            }
            StorageStrategy::MultiVersion => {
                let converted = self.convert(resource_type, &original, detected, self.canonical)?;
                let copy = VersionCopy {
                    fhir_version: detected,
                    content: original.clone(),
                };
                (converted, self.canonical, Some(copy))
            }
        };

        let mut transformation_applied = content != original;
        if transformation_applied {
            debug!(
                resource_type,
                from = %detected,
                to = %stored_version,
                strategy = self.strategy.as_str(),
                "Converted resource for storage"
            );
        }
        if version_copy.is_some() {
            transformation_applied = true;
        }

        Ok(PreparedResource {
            content,
            metadata: VersionMetadata {
                detected_version: detected,
                stored_version,
                original_version: detected,
                transformation_applied,
                confidence: detection.confidence,
                indicators: detection.indicators,
                storage_strategy: self.strategy,
                extensions: resource.extension_urls(),
                profiles: resource.profiles(),
            },
            version_copy,
        })
    }

    fn convert(
        &self,
        resource_type: &str,
        body: &Value,
        from: FhirVersion,
        to: FhirVersion,
    ) -> Result<Value, VersionError> {
        let mut converted = self.converters.convert(resource_type, body, from, to)?;
        if !from.same_family(to) {
            retag(&mut converted, to);
        }
        Ok(converted)
    }

    /// Renders a stored resource in the requested release.
    ///
    /// With no request, a HYBRID resource is returned as originally received.
    /// The stored `id`, `meta.versionId` and `meta.lastUpdated` are always
    /// overlaid onto the result.
    pub fn present(
        &self,
        stored: &StoredResource,
        requested: Option<FhirVersion>,
    ) -> Result<Value, VersionError> {
        let body = stored.content();

        if let Some(decoded) = OriginalPayload::from_resource(body) {
            let original = decoded.map_err(|e| VersionError::CorruptPayload {
                resource_type: stored.resource_type().to_string(),
                id: stored.id().to_string(),
                message: e.to_string(),
            })?;
            let target = requested.unwrap_or(original.version);
            if target.same_family(original.version) {
                return Ok(overlay(original.payload, stored));
            }
        }

        let mut canonical = body.clone();
        ORIGINAL_PAYLOAD.remove_from(&mut canonical);

        let output = match requested {
            Some(target) => self.convert(
                stored.resource_type(),
                &canonical,
                stored.fhir_version(),
                target,
            )?,
            None => canonical,
        };
        Ok(overlay(output, stored))
    }
}

impl Default for VersionNegotiator {
    fn default() -> Self {
        Self::new(StorageStrategy::Hybrid, FhirVersion::R5, FhirVersion::R4)
    }
}

fn retag(body: &mut Value, version: FhirVersion) {
    let Some(tags) = body
        .get_mut("meta")
        .and_then(|m| m.get_mut("tag"))
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    for tag in tags.iter_mut() {
        if tag.get("system").and_then(Value::as_str) == Some(FHIR_VERSION_TAG_SYSTEM) {
            tag["code"] = json!(version.full_version());
        }
    }
}

fn overlay(mut body: Value, stored: &StoredResource) -> Value {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("id".to_string(), json!(stored.id()));
        let meta = obj
            .entry("meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("versionId".to_string(), json!(stored.version_id()));
            meta.insert(
                "lastUpdated".to_string(),
                json!(
                    stored
                        .last_modified()
                        .to_rfc3339_opts(SecondsFormat::Millis, true)
                ),
            );
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn r4_allergy() -> Value {
        json!({
            "resourceType": "AllergyIntolerance",
            "id": "a1",
            "type": "allergy",
            "patient": {"reference": "Patient/p1"},
            "recorder": {"reference": "Practitioner/d1"}
        })
    }

    fn stored(prepared: &PreparedResource) -> StoredResource {
        StoredResource::from_storage(
            "AllergyIntolerance",
            "a1",
            "1",
            prepared.metadata.stored_version,
            prepared.content.clone(),
            Utc::now(),
            None,
            None,
        )
    }

    #[test]
    fn test_hybrid_embeds_original() {
        let negotiator = VersionNegotiator::default();
        let resource = FhirResource::parse(r4_allergy()).unwrap();

        let prepared = negotiator.prepare_for_storage(&resource).unwrap();

        assert!(prepared.metadata.transformation_applied);
        assert_eq!(prepared.metadata.detected_version, FhirVersion::R4);
        assert_eq!(prepared.metadata.stored_version, FhirVersion::R5);
        assert_eq!(prepared.content["type"]["coding"][0]["code"], "allergy");
        assert!(ORIGINAL_PAYLOAD.find_in(&prepared.content).is_some());
    }

    #[test]
    fn test_hybrid_present_returns_original() {
        let negotiator = VersionNegotiator::default();
        let prepared = negotiator
            .prepare_for_storage(&FhirResource::parse(r4_allergy()).unwrap())
            .unwrap();
        let stored = stored(&prepared);

        let presented = negotiator.present(&stored, None).unwrap();
        assert_eq!(presented["type"], "allergy");
        assert_eq!(presented["recorder"]["reference"], "Practitioner/d1");
        assert_eq!(presented["meta"]["versionId"], "1");

        let as_r5 = negotiator.present(&stored, Some(FhirVersion::R5)).unwrap();
        assert_eq!(as_r5["type"]["coding"][0]["code"], "allergy");
        assert!(as_r5.get("extension").is_none());
    }

    #[test]
    fn test_hybrid_skips_payload_when_unchanged() {
        let negotiator = VersionNegotiator::default();
        let patient = FhirResource::parse(json!({"resourceType": "Patient", "id": "p1"})).unwrap();

        let prepared = negotiator.prepare_for_storage(&patient).unwrap();

        assert!(!prepared.metadata.transformation_applied);
        assert!(prepared.content.get("extension").is_none());
    }

    #[test]
    fn test_native_stores_as_received() {
        let negotiator =
            VersionNegotiator::new(StorageStrategy::Native, FhirVersion::R5, FhirVersion::R4);
        let prepared = negotiator
            .prepare_for_storage(&FhirResource::parse(r4_allergy()).unwrap())
            .unwrap();
        assert_eq!(prepared.content["type"], "allergy");
        assert_eq!(prepared.metadata.stored_version, FhirVersion::R4);
    }

    #[test]
    fn test_multi_version_keeps_copy() {
        let negotiator = VersionNegotiator::new(
            StorageStrategy::MultiVersion,
            FhirVersion::R5,
            FhirVersion::R4,
        );
        let prepared = negotiator
            .prepare_for_storage(&FhirResource::parse(r4_allergy()).unwrap())
            .unwrap();
        let copy = prepared.version_copy.unwrap();
        assert_eq!(copy.fhir_version, FhirVersion::R4);
        assert_eq!(copy.content["type"], "allergy");
        assert!(prepared.content.get("extension").is_none());
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(
            StorageStrategy::parse("multi_version"),
            Some(StorageStrategy::MultiVersion)
        );
        assert_eq!(StorageStrategy::default(), StorageStrategy::Hybrid);
        assert_eq!(
            serde_json::to_value(StorageStrategy::MultiVersion).unwrap(),
            json!("MULTI_VERSION")
        );
    }

    #[test]
    fn test_empty_converter_registry_passes_bodies_through() {
        let negotiator =
            VersionNegotiator::new(StorageStrategy::Canonical, FhirVersion::R5, FhirVersion::R4)
                .with_converters(ConverterFactory::empty());
        let resource = FhirResource::parse(r4_allergy()).unwrap();

        let prepared = negotiator.prepare_for_storage(&resource).unwrap();

        assert_eq!(prepared.content["type"], "allergy");
        assert_eq!(prepared.metadata.stored_version, FhirVersion::R5);
        assert!(!prepared.metadata.transformation_applied);
    }
}
