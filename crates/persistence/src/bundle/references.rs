//! Resolution of Bundle-internal placeholder references.
//!
//! A `transaction` entry created with `fullUrl: urn:uuid:...` can be
//! referenced by later entries through that URN. Once the entry is created
//! its real `Type/id` is registered here, and every later body has matching
//! `reference` values rewritten before it is persisted.

use std::collections::HashMap;

use serde_json::Value;

/// Maps entry `fullUrl` placeholders to the references assigned on create.
#[derive(Debug, Default, Clone)]
pub struct ReferenceMap {
    resolved: HashMap<String, String>,
}

impl ReferenceMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the reference assigned to an entry.
    ///
    /// `location` may be versioned (`Type/id/_history/n`); the version part
    /// is dropped.
    pub fn register(&mut self, full_url: &str, location: &str) {
        let reference = location.split("/_history").next().unwrap_or(location);
        self.resolved
            .insert(full_url.to_string(), reference.to_string());
    }

    /// Returns the reference registered for a placeholder.
    pub fn get(&self, full_url: &str) -> Option<&str> {
        self.resolved.get(full_url).map(String::as_str)
    }

    /// Returns the number of registered placeholders.
    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    /// Returns true if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    /// Rewrites every registered `urn:uuid:`/`urn:oid:` reference in `value`.
    ///
    /// Returns the number of references rewritten.
    pub fn resolve(&self, value: &mut Value) -> usize {
        if self.resolved.is_empty() {
            return 0;
        }
        match value {
            Value::Object(map) => {
                let mut rewritten = 0;
                if let Some(Value::String(reference)) = map.get_mut("reference") {
                    if reference.starts_with("urn:") {
                        if let Some(resolved) = self.resolved.get(reference.as_str()) {
                            *reference = resolved.clone();
                            rewritten += 1;
                        }
                    }
                }
                for v in map.values_mut() {
                    rewritten += self.resolve(v);
                }
                rewritten
            }
            Value::Array(items) => items.iter_mut().map(|item| self.resolve(item)).sum(),
            _ => 0,
        }
    }

    /// Rewrites registered placeholders inside search criteria values.
    pub fn resolve_params(&self, params: &mut [(String, String)]) {
        for (_, value) in params.iter_mut() {
            if let Some(resolved) = self.resolved.get(value.as_str()) {
                *value = resolved.clone();
            }
        }
    }
}

/// Returns true if any `reference` in `value` is an unresolved `urn:uuid:`.
pub fn has_placeholder_references(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            let own = map
                .get("reference")
                .and_then(Value::as_str)
                .is_some_and(|r| r.starts_with("urn:uuid:"));
            own || map.values().any(has_placeholder_references)
        }
        Value::Array(items) => items.iter().any(has_placeholder_references),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_nested_references() {
        let mut map = ReferenceMap::new();
        map.register("urn:uuid:patient-1", "Patient/abc/_history/1");
        assert_eq!(map.get("urn:uuid:patient-1"), Some("Patient/abc"));

        let mut observation = json!({
            "resourceType": "Observation",
            "subject": {"reference": "urn:uuid:patient-1"},
            "performer": [
                {"reference": "urn:uuid:patient-1"},
                {"reference": "urn:uuid:unknown"},
                {"reference": "Practitioner/1"}
            ]
        });
        assert_eq!(map.resolve(&mut observation), 2);
        assert_eq!(observation["subject"]["reference"], "Patient/abc");
        assert_eq!(observation["performer"][0]["reference"], "Patient/abc");
        assert_eq!(observation["performer"][1]["reference"], "urn:uuid:unknown");
        assert!(has_placeholder_references(&observation));
    }

    #[test]
    fn test_resolve_params() {
        let mut map = ReferenceMap::new();
        map.register("urn:uuid:p", "Patient/42");
        let mut params = vec![("subject".to_string(), "urn:uuid:p".to_string())];
        map.resolve_params(&mut params);
        assert_eq!(params[0].1, "Patient/42");
    }

    #[test]
    fn test_empty_map_is_noop() {
        let map = ReferenceMap::new();
        let mut body = json!({"subject": {"reference": "urn:uuid:x"}});
        assert_eq!(map.resolve(&mut body), 0);
        assert!(map.is_empty());
    }
}
