//! Declarative schemas for the engine's reserved extensions.
//!
//! A reserved extension is described once, as an [`ExtensionSchema`] naming
//! its URL and its sub-extension slots. The same schema builds the extension
//! when a body is written, parses it when the body is read back, and lets the
//! search extractor address a slot by name (`extension(original-payload).version`).

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};

use super::FhirVersion;

/// The FHIR datatype carried by a sub-extension slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `valueCode`
    Code,
    /// `valueString`
    String,
    /// `valueUri`
    Uri,
    /// `valueBase64Binary`
    Base64Binary,
    /// `valueBoolean`
    Boolean,
}

impl ValueKind {
    /// Returns the `value[x]` element name for this kind.
    pub fn element(&self) -> &'static str {
        match self {
            ValueKind::Code => "valueCode",
            ValueKind::String => "valueString",
            ValueKind::Uri => "valueUri",
            ValueKind::Base64Binary => "valueBase64Binary",
            ValueKind::Boolean => "valueBoolean",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueKind::Boolean => value.is_boolean(),
            _ => value.is_string(),
        }
    }
}

/// One named sub-extension of a complex extension.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionSlot {
    /// The sub-extension url (relative name).
    pub name: &'static str,
    /// The value type stored in the slot.
    pub kind: ValueKind,
    /// Whether parsing fails when the slot is absent.
    pub required: bool,
}

/// Schema of a complex extension.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionSchema {
    /// Short name used in extraction expressions.
    pub name: &'static str,
    /// The canonical extension URL.
    pub url: &'static str,
    /// The sub-extension slots.
    pub slots: &'static [ExtensionSlot],
}

/// Errors raised while reading or writing a schema-described extension.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionError {
    /// A required slot is absent.
    MissingSlot {
        /// Extension url.
        url: String,
        /// Slot name.
        slot: String,
    },
    /// A slot carries a value of the wrong type.
    WrongKind {
        /// Slot name.
        slot: String,
        /// Expected value element.
        expected: &'static str,
    },
    /// The slot is not declared by the schema.
    UnknownSlot {
        /// Slot name.
        slot: String,
    },
    /// The payload could not be decoded.
    Decode {
        /// Decoder message.
        message: String,
    },
}

impl fmt::Display for ExtensionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionError::MissingSlot { url, slot } => {
                write!(f, "extension {} is missing required slot '{}'", url, slot)
            }
            ExtensionError::WrongKind { slot, expected } => {
                write!(f, "slot '{}' must carry {}", slot, expected)
            }
            ExtensionError::UnknownSlot { slot } => write!(f, "unknown slot '{}'", slot),
            ExtensionError::Decode { message } => write!(f, "cannot decode payload: {}", message),
        }
    }
}

impl std::error::Error for ExtensionError {}

/// Slot values read from an extension instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionValues(BTreeMap<&'static str, Value>);

impl ExtensionValues {
    /// Returns the raw value of a slot.
    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.0.get(slot)
    }

    /// Returns the string value of a slot.
    pub fn get_str(&self, slot: &str) -> Option<&str> {
        self.get(slot).and_then(Value::as_str)
    }

    /// Returns the slots as a JSON object keyed by slot name.
    pub fn to_object(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }
}

impl ExtensionSchema {
    fn slot(&self, name: &str) -> Option<&ExtensionSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Returns true if `extension` is an instance of this schema.
    pub fn matches(&self, extension: &Value) -> bool {
        extension.get("url").and_then(Value::as_str) == Some(self.url)
    }

    /// Builds an extension instance from `(slot, value)` pairs.
    pub fn build(&self, values: &[(&str, Value)]) -> Result<Value, ExtensionError> {
        let mut children = Vec::with_capacity(values.len());
        for slot in self.slots {
            match values.iter().find(|(name, _)| *name == slot.name) {
                Some((_, value)) => {
                    if !slot.kind.accepts(value) {
                        return Err(ExtensionError::WrongKind {
                            slot: slot.name.to_string(),
                            expected: slot.kind.element(),
                        });
                    }
                    let mut child = Map::new();
                    child.insert("url".to_string(), json!(slot.name));
                    child.insert(slot.kind.element().to_string(), value.clone());
                    children.push(Value::Object(child));
                }
                None if slot.required => {
                    return Err(ExtensionError::MissingSlot {
                        url: self.url.to_string(),
                        slot: slot.name.to_string(),
                    });
                }
                None => {}
            }
        }
        if let Some((name, _)) = values.iter().find(|(name, _)| self.slot(name).is_none()) {
            return Err(ExtensionError::UnknownSlot {
                slot: name.to_string(),
            });
        }

        Ok(json!({ "url": self.url, "extension": children }))
    }

    /// Parses an extension instance into its slot values.
    pub fn parse(&self, extension: &Value) -> Result<ExtensionValues, ExtensionError> {
        let mut values = BTreeMap::new();
        let children = extension
            .get("extension")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for slot in self.slots {
            let child = children
                .iter()
                .find(|c| c.get("url").and_then(Value::as_str) == Some(slot.name));
            match child.and_then(|c| c.get(slot.kind.element())) {
                Some(value) if slot.kind.accepts(value) => {
                    values.insert(slot.name, value.clone());
                }
                Some(_) => {
                    return Err(ExtensionError::WrongKind {
                        slot: slot.name.to_string(),
                        expected: slot.kind.element(),
                    });
                }
                None if slot.required => {
                    return Err(ExtensionError::MissingSlot {
                        url: self.url.to_string(),
                        slot: slot.name.to_string(),
                    });
                }
                None => {}
            }
        }

        Ok(ExtensionValues(values))
    }

    /// Finds this extension among a resource's top-level extensions.
    pub fn find_in<'a>(&self, resource: &'a Value) -> Option<&'a Value> {
        resource
            .get("extension")
            .and_then(Value::as_array)
            .and_then(|exts| exts.iter().find(|e| self.matches(e)))
    }

    /// Removes this extension from a resource, returning it.
    ///
    /// Drops the `extension` array entirely when it becomes empty.
    pub fn remove_from(&self, resource: &mut Value) -> Option<Value> {
        let obj = resource.as_object_mut()?;
        let exts = obj.get_mut("extension")?.as_array_mut()?;
        let pos = exts.iter().position(|e| self.matches(e))?;
        let removed = exts.remove(pos);
        if exts.is_empty() {
            obj.remove("extension");
        }
        Some(removed)
    }

    /// Inserts this extension into a resource, replacing an existing instance.
    pub fn upsert(&self, resource: &mut Value, extension: Value) {
        self.remove_from(resource);
        if let Some(obj) = resource.as_object_mut() {
            let exts = obj
                .entry("extension")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(arr) = exts {
                arr.push(extension);
            }
        }
    }
}

/// The HYBRID original-payload extension.
pub const ORIGINAL_PAYLOAD: ExtensionSchema = ExtensionSchema {
    name: "original-payload",
    url: "http://fhirvault.dev/fhir/StructureDefinition/original-payload",
    slots: &[
        ExtensionSlot {
            name: "version",
            kind: ValueKind::Code,
            required: true,
        },
        ExtensionSlot {
            name: "payload",
            kind: ValueKind::Base64Binary,
            required: true,
        },
    ],
};

/// Every reserved extension known to the engine.
pub const RESERVED_EXTENSIONS: &[ExtensionSchema] = &[ORIGINAL_PAYLOAD];

/// Looks up a reserved extension by short name or URL.
pub fn schema_for(name_or_url: &str) -> Option<&'static ExtensionSchema> {
    RESERVED_EXTENSIONS
        .iter()
        .find(|s| s.name == name_or_url || s.url == name_or_url)
}

/// Typed view of the original-payload extension.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginalPayload {
    /// The release the payload was received in.
    pub version: FhirVersion,
    /// The body exactly as received.
    pub payload: Value,
}

impl OriginalPayload {
    /// Creates a payload record.
    pub fn new(version: FhirVersion, payload: Value) -> Self {
        Self { version, payload }
    }

    /// Encodes the record as an extension instance.
    pub fn to_extension(&self) -> Result<Value, ExtensionError> {
        let bytes = serde_json::to_vec(&self.payload).map_err(|e| ExtensionError::Decode {
            message: e.to_string(),
        })?;
        ORIGINAL_PAYLOAD.build(&[
            ("version", json!(self.version.full_version())),
            ("payload", json!(STANDARD.encode(bytes))),
        ])
    }

    /// Decodes a record from an extension instance.
    pub fn from_extension(extension: &Value) -> Result<Self, ExtensionError> {
        let values = ORIGINAL_PAYLOAD.parse(extension)?;
        let version = values
            .get_str("version")
            .unwrap_or_default()
            .parse::<FhirVersion>()
            .map_err(|e| ExtensionError::Decode {
                message: e.to_string(),
            })?;
        let bytes = STANDARD
            .decode(values.get_str("payload").unwrap_or_default())
            .map_err(|e| ExtensionError::Decode {
                message: e.to_string(),
            })?;
        let payload = serde_json::from_slice(&bytes).map_err(|e| ExtensionError::Decode {
            message: e.to_string(),
        })?;
        Ok(Self { version, payload })
    }

    /// Reads the record from a resource, if it carries one.
    pub fn from_resource(resource: &Value) -> Option<Result<Self, ExtensionError>> {
        ORIGINAL_PAYLOAD.find_in(resource).map(Self::from_extension)
    }

    /// Embeds the record into a resource.
    pub fn embed_into(&self, resource: &mut Value) -> Result<(), ExtensionError> {
        let ext = self.to_extension()?;
        ORIGINAL_PAYLOAD.upsert(resource, ext);
        Ok(())
    }
}
