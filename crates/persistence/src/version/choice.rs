//! Helpers for polymorphic `[x]` elements.
//!
//! A choice element such as `onset[x]` appears in JSON as exactly one of
//! `onsetDateTime`, `onsetAge`, `onsetString`, ... These helpers find, move
//! and rename such elements without listing every datatype.

use serde_json::{Map, Value};

/// A located choice element.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceValue {
    /// The datatype suffix (`DateTime`, `Age`, ...).
    pub type_suffix: String,
    /// The element value.
    pub value: Value,
}

impl ChoiceValue {
    /// Returns the full element name for the given base (`onset` + `DateTime`).
    pub fn element_name(&self, base: &str) -> String {
        format!("{}{}", base, self.type_suffix)
    }
}

fn is_choice_of(key: &str, base: &str) -> bool {
    key.len() > base.len()
        && key.starts_with(base)
        && key[base.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase())
}

/// Returns the choice element for `base` in `obj`, if present.
pub fn find(obj: &Map<String, Value>, base: &str) -> Option<ChoiceValue> {
    obj.iter()
        .find(|(k, _)| is_choice_of(k, base))
        .map(|(k, v)| ChoiceValue {
            type_suffix: k[base.len()..].to_string(),
            value: v.clone(),
        })
}

/// Removes the choice element for `base` from `obj`, returning it.
pub fn take(obj: &mut Map<String, Value>, base: &str) -> Option<ChoiceValue> {
    let key = obj.keys().find(|k| is_choice_of(k, base))?.clone();
    let value = obj.remove(&key)?;
    Some(ChoiceValue {
        type_suffix: key[base.len()..].to_string(),
        value,
    })
}

/// Writes a choice element under `base`.
pub fn put(obj: &mut Map<String, Value>, base: &str, choice: ChoiceValue) {
    let name = choice.element_name(base);
    obj.insert(name, choice.value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_find_and_take() {
        let mut m = obj(json!({"onsetDateTime": "2020-01-01", "onset": "x", "onsetfoo": 1}));

        let found = find(&m, "onset").unwrap();
        assert_eq!(found.type_suffix, "DateTime");

        let taken = take(&mut m, "onset").unwrap();
        assert_eq!(taken.value, json!("2020-01-01"));
        assert!(!m.contains_key("onsetDateTime"));
        assert!(take(&mut m, "onset").is_none());
    }

    #[test]
    fn test_put() {
        let mut m = Map::new();
        put(
            &mut m,
            "medication",
            ChoiceValue {
                type_suffix: "Reference".to_string(),
                value: json!({"reference": "Medication/1"}),
            },
        );
        assert!(m.contains_key("medicationReference"));
    }
}
