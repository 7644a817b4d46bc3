//! Typed resource wrapper.
//!
//! FHIR resources travel through the engine as JSON, but every entry point
//! first lifts the raw document into a [`FhirResource`]: a JSON object that is
//! known to carry a supported [`ResourceType`] tag. Extraction, conversion and
//! validation then match on the tag instead of re-reading `resourceType`
//! strings.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-\.]{1,64}$").expect("static id pattern"));

macro_rules! resource_types {
    ($($variant:ident),+ $(,)?) => {
        /// The resource types the engine can store and search.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ResourceType {
            $(
                #[allow(missing_docs)]
                $variant,
            )+
        }

        impl ResourceType {
            /// All supported resource types.
            pub const ALL: &'static [ResourceType] = &[$(ResourceType::$variant),+];

            /// Returns the FHIR name of the type.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ResourceType::$variant => stringify!($variant),)+
                }
            }
        }

        impl FromStr for ResourceType {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($variant) => Ok(ResourceType::$variant),)+
                    _ => Err(ValidationError::UnsupportedResourceType {
                        resource_type: s.to_string(),
                    }),
                }
            }
        }
    };
}

resource_types!(
    AllergyIntolerance,
    Binary,
    CarePlan,
    Composition,
    Condition,
    Device,
    DiagnosticReport,
    DocumentReference,
    Encounter,
    Group,
    Immunization,
    Location,
    Medication,
    MedicationRequest,
    MedicationStatement,
    Observation,
    OperationOutcome,
    Organization,
    Patient,
    Practitioner,
    PractitionerRole,
    Procedure,
    Provenance,
    ServiceRequest,
    Specimen,
);

impl ResourceType {
    /// Returns true if resources of this type are persisted by the store.
    ///
    /// `Binary` only carries PATCH bodies inside bundles and `OperationOutcome`
    /// is a response-only type.
    pub fn is_storable(&self) -> bool {
        !matches!(self, ResourceType::Binary | ResourceType::OperationOutcome)
    }

    /// Parses a storable resource type, rejecting everything else as unsupported.
    pub fn parse_storable(s: &str) -> Result<Self, ValidationError> {
        let rt: ResourceType = s.parse()?;
        if rt.is_storable() {
            Ok(rt)
        } else {
            Err(ValidationError::UnsupportedResourceType {
                resource_type: s.to_string(),
            })
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if `id` matches the FHIR logical id grammar.
pub fn is_valid_id(id: &str) -> bool {
    ID_PATTERN.is_match(id)
}

/// A JSON resource body tagged with its resource type.
#[derive(Debug, Clone, PartialEq)]
pub struct FhirResource {
    resource_type: ResourceType,
    body: Map<String, Value>,
}

impl FhirResource {
    /// Lifts a raw JSON document into a typed resource.
    ///
    /// Fails if the document is not an object, has no `resourceType`, names an
    /// unsupported type, or carries a malformed `id`.
    pub fn parse(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(body) = value else {
            return Err(ValidationError::InvalidResource {
                message: "resource must be a JSON object".to_string(),
                details: Vec::new(),
            });
        };

        let resource_type = body
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::MissingRequiredField {
                field: "resourceType".to_string(),
            })?
            .parse::<ResourceType>()?;

        if let Some(id) = body.get("id") {
            match id.as_str() {
                Some(id) if is_valid_id(id) => {}
                _ => {
                    return Err(ValidationError::InvalidId { id: id.to_string() });
                }
            }
        }

        Ok(Self {
            resource_type,
            body,
        })
    }

    /// Lifts a raw document and checks it against the expected type.
    pub fn parse_as(expected: &str, value: Value) -> Result<Self, ValidationError> {
        let expected_type = ResourceType::parse_storable(expected)?;
        let resource = Self::parse(value)?;
        if resource.resource_type != expected_type {
            return Err(ValidationError::ResourceTypeMismatch {
                expected: expected.to_string(),
                actual: resource.resource_type.to_string(),
            });
        }
        Ok(resource)
    }

    /// Returns the resource type tag.
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Returns the logical id, if present.
    pub fn id(&self) -> Option<&str> {
        self.body.get("id").and_then(Value::as_str)
    }

    /// Sets the logical id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.body.insert("id".to_string(), Value::String(id.into()));
    }

    /// Returns a top-level element.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    /// Returns a top-level string element.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.body.get(field).and_then(Value::as_str)
    }

    /// Returns the declared profiles (`meta.profile`).
    pub fn profiles(&self) -> Vec<String> {
        self.body
            .get("meta")
            .and_then(|m| m.get("profile"))
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the URLs of the top-level extensions.
    pub fn extension_urls(&self) -> Vec<String> {
        self.body
            .get("extension")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|e| e.get("url").and_then(Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stamps `meta.versionId` and `meta.lastUpdated`, keeping other meta elements.
    pub fn stamp_meta(&mut self, version_id: &str, last_updated: DateTime<Utc>) {
        let meta = self
            .body
            .entry("meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if !meta.is_object() {
            *meta = Value::Object(Map::new());
        }
        if let Value::Object(meta) = meta {
            meta.insert(
                "versionId".to_string(),
                Value::String(version_id.to_string()),
            );
            meta.insert(
                "lastUpdated".to_string(),
                Value::String(last_updated.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
    }

    /// Consumes the wrapper and returns the JSON document.
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}
