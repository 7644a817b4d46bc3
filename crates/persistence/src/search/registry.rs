//! SearchParameter Registry.
//!
//! The registry maintains an in-memory map of SearchParameter definitions,
//! indexed by both (resource_type, param_code) and canonical URL. Parameters
//! declared on `Resource` apply to every type.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::SearchParamType;

use super::errors::RegistryError;
use super::loader::SearchParameterLoader;

/// Status of a SearchParameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterStatus {
    /// Active - can be used in searches.
    #[default]
    Active,
    /// Draft - informational, not yet active.
    Draft,
    /// Retired - disabled, not usable.
    Retired,
}

impl SearchParameterStatus {
    /// Parse from FHIR status string.
    pub fn from_fhir_status(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(SearchParameterStatus::Active),
            "draft" => Some(SearchParameterStatus::Draft),
            "retired" => Some(SearchParameterStatus::Retired),
            _ => None,
        }
    }

    /// Returns true if this status allows the parameter to be used in searches.
    pub fn is_usable(&self) -> bool {
        *self == SearchParameterStatus::Active
    }
}

/// Source of a SearchParameter definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterSource {
    /// Built-in parameters.
    #[default]
    Embedded,
    /// SearchParameter resources registered at runtime.
    Stored,
}

/// Component of a composite search parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeComponentDef {
    /// Code of the component parameter (`code`, `value-quantity`).
    pub code: String,
    /// Type of the component.
    pub param_type: SearchParamType,
    /// Path relative to the composite's context element.
    pub expression: String,
}

impl CompositeComponentDef {
    /// Creates a component.
    pub fn new(
        code: impl Into<String>,
        param_type: SearchParamType,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            param_type,
            expression: expression.into(),
        }
    }
}

/// Complete definition of a SearchParameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParameterDefinition {
    /// Canonical URL (unique identifier).
    pub url: String,

    /// Parameter code (the URL param name, e.g., "name", "identifier").
    pub code: String,

    /// The parameter type.
    pub param_type: SearchParamType,

    /// Path expression for extracting values.
    pub expression: String,

    /// Resource types this parameter applies to.
    pub base: Vec<String>,

    /// Target resource types (for reference parameters).
    pub target: Vec<String>,

    /// Components (for composite parameters).
    pub component: Vec<CompositeComponentDef>,

    /// Current status.
    pub status: SearchParameterStatus,

    /// Source of this definition.
    pub source: SearchParameterSource,
}

impl SearchParameterDefinition {
    /// Creates a new SearchParameter definition.
    pub fn new(
        url: impl Into<String>,
        code: impl Into<String>,
        param_type: SearchParamType,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            code: code.into(),
            param_type,
            expression: expression.into(),
            base: Vec::new(),
            target: Vec::new(),
            component: Vec::new(),
            status: SearchParameterStatus::Active,
            source: SearchParameterSource::Embedded,
        }
    }

    /// Sets the base resource types.
    pub fn with_base<I, S>(mut self, base: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = base.into_iter().map(Into::into).collect();
        self
    }

    /// Sets target types for reference parameters.
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets composite components.
    pub fn with_components(mut self, components: Vec<CompositeComponentDef>) -> Self {
        self.component = components;
        self
    }

    /// Sets the source.
    pub fn with_source(mut self, source: SearchParameterSource) -> Self {
        self.source = source;
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: SearchParameterStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns whether this is a composite parameter.
    pub fn is_composite(&self) -> bool {
        self.param_type == SearchParamType::Composite && !self.component.is_empty()
    }
}

/// In-memory registry of SearchParameter definitions.
pub struct SearchParameterRegistry {
    /// Parameters indexed by (resource_type, param_code).
    params_by_type: HashMap<String, HashMap<String, Arc<SearchParameterDefinition>>>,

    /// Parameters indexed by canonical URL.
    params_by_url: HashMap<String, Arc<SearchParameterDefinition>>,
}

impl SearchParameterRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            params_by_type: HashMap::new(),
            params_by_url: HashMap::new(),
        }
    }

    /// Creates a registry holding every embedded parameter.
    pub fn with_embedded() -> Self {
        let mut registry = Self::new();
        registry.load_all(&SearchParameterLoader::new());
        registry
    }

    /// Returns the number of registered parameters.
    pub fn len(&self) -> usize {
        self.params_by_url.len()
    }

    /// Returns true if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.params_by_url.is_empty()
    }

    /// Loads all embedded parameters from a loader, returning how many were added.
    pub fn load_all(&mut self, loader: &SearchParameterLoader) -> usize {
        let mut added = 0;
        for param in loader.load_embedded() {
            // Skip duplicates silently during bulk load
            if !self.params_by_url.contains_key(&param.url) {
                self.register_internal(param);
                added += 1;
            }
        }
        added
    }

    /// Gets all active parameters for a resource type, including the ones
    /// declared on `Resource`. A type-specific code shadows a `Resource` one.
    pub fn get_active_params(&self, resource_type: &str) -> Vec<Arc<SearchParameterDefinition>> {
        let mut merged: HashMap<&str, Arc<SearchParameterDefinition>> = HashMap::new();
        for base in ["Resource", "DomainResource", resource_type] {
            if let Some(params) = self.params_by_type.get(base) {
                for (code, param) in params {
                    if param.status.is_usable() {
                        merged.insert(code.as_str(), Arc::clone(param));
                    }
                }
            }
        }
        let mut params: Vec<_> = merged.into_values().collect();
        params.sort_by(|a, b| a.code.cmp(&b.code));
        params
    }

    /// Gets a usable parameter by resource type and code.
    pub fn get_param(
        &self,
        resource_type: &str,
        code: &str,
    ) -> Option<Arc<SearchParameterDefinition>> {
        [resource_type, "DomainResource", "Resource"]
            .iter()
            .filter_map(|base| self.params_by_type.get(*base)?.get(code))
            .find(|p| p.status.is_usable())
            .cloned()
    }

    /// Gets a parameter by its canonical URL.
    pub fn get_by_url(&self, url: &str) -> Option<Arc<SearchParameterDefinition>> {
        self.params_by_url.get(url).cloned()
    }

    /// Registers a new parameter.
    pub fn register(&mut self, param: SearchParameterDefinition) -> Result<(), RegistryError> {
        if self.params_by_url.contains_key(&param.url) {
            return Err(RegistryError::DuplicateUrl { url: param.url });
        }
        if param.base.is_empty() {
            return Err(RegistryError::InvalidDefinition {
                message: format!("parameter '{}' declares no base type", param.code),
            });
        }
        if param.param_type == SearchParamType::Composite && param.component.len() < 2 {
            return Err(RegistryError::InvalidDefinition {
                message: format!("composite '{}' needs at least two components", param.code),
            });
        }
        self.register_internal(param);
        Ok(())
    }

    fn register_internal(&mut self, param: SearchParameterDefinition) {
        let param = Arc::new(param);

        self.params_by_url
            .insert(param.url.clone(), Arc::clone(&param));

        for base in &param.base {
            self.params_by_type
                .entry(base.clone())
                .or_default()
                .insert(param.code.clone(), Arc::clone(&param));
        }
    }
}

impl Default for SearchParameterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SearchParameterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchParameterRegistry")
            .field("params_count", &self.params_by_url.len())
            .field(
                "resource_types",
                &self.params_by_type.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_param() -> SearchParameterDefinition {
        SearchParameterDefinition::new(
            "http://example.org/sp/test",
            "test",
            SearchParamType::String,
            "Patient.test",
        )
        .with_base(vec!["Patient"])
    }

    #[test]
    fn test_search_parameter_status() {
        assert!(SearchParameterStatus::Active.is_usable());
        assert!(!SearchParameterStatus::Draft.is_usable());
        assert!(!SearchParameterStatus::Retired.is_usable());
        assert_eq!(
            SearchParameterStatus::from_fhir_status("active"),
            Some(SearchParameterStatus::Active)
        );
    }

    #[test]
    fn test_registry_operations() {
        let mut registry = SearchParameterRegistry::new();
        registry.register(test_param()).unwrap();
        assert_eq!(registry.len(), 1);

        assert!(registry.get_by_url("http://example.org/sp/test").is_some());
        assert_eq!(registry.get_param("Patient", "test").unwrap().code, "test");
        assert_eq!(registry.get_active_params("Patient").len(), 1);

        let retired = SearchParameterDefinition::new(
            "http://example.org/sp/old",
            "old",
            SearchParamType::String,
            "Patient.old",
        )
        .with_base(vec!["Patient"])
        .with_status(SearchParameterStatus::Retired);
        registry.register(retired).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_active_params("Patient").len(), 1);
        assert!(registry.get_param("Patient", "old").is_none());
    }

    #[test]
    fn test_duplicate_url_error() {
        let mut registry = SearchParameterRegistry::new();
        registry.register(test_param()).unwrap();
        let result = registry.register(test_param());
        assert!(matches!(result, Err(RegistryError::DuplicateUrl { .. })));
    }

    #[test]
    fn test_composite_needs_components() {
        let mut registry = SearchParameterRegistry::new();
        let def = SearchParameterDefinition::new(
            "http://example.org/sp/combo",
            "combo",
            SearchParamType::Composite,
            "Observation",
        )
        .with_base(vec!["Observation"]);
        assert!(matches!(
            registry.register(def),
            Err(RegistryError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_resource_params_apply_everywhere() {
        let registry = SearchParameterRegistry::with_embedded();
        assert!(registry.get_param("Observation", "_id").is_some());
        assert!(registry.get_param("Patient", "_lastUpdated").is_some());
        assert!(
            registry
                .get_active_params("Patient")
                .iter()
                .any(|p| p.code == "_tag")
        );
    }
}
