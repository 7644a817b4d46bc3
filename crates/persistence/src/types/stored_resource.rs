//! Stored resource types.
//!
//! This module defines the [`StoredResource`] type, which wraps FHIR resources
//! with persistence metadata such as version, FHIR release and timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::version::FhirVersion;

/// A FHIR resource with persistence metadata.
///
/// `StoredResource` wraps a FHIR resource (stored as JSON) along with
/// metadata required for persistence operations:
///
/// - **Identity**: Resource type and ID
/// - **Versioning**: Version ID for optimistic locking
/// - **Release**: The FHIR version the stored body is expressed in
/// - **Timestamps**: Last modification and deletion times
/// - **ETag**: For HTTP caching and conditional updates
///
/// # Examples
///
/// ```
/// use fhirvault_persistence::types::StoredResource;
/// use fhirvault_persistence::version::FhirVersion;
/// use serde_json::json;
///
/// let resource = StoredResource::new(
///     "Patient",
///     "123",
///     FhirVersion::R4,
///     json!({
///         "resourceType": "Patient",
///         "id": "123",
///         "name": [{"family": "Smith"}]
///     }),
/// );
///
/// assert_eq!(resource.resource_type(), "Patient");
/// assert_eq!(resource.id(), "123");
/// assert_eq!(resource.version_id(), "1");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    /// The FHIR resource type (e.g., "Patient", "Observation").
    resource_type: String,

    /// The resource's logical ID.
    id: String,

    /// The version ID (monotonically increasing).
    version_id: String,

    /// The FHIR release the stored body is expressed in.
    fhir_version: FhirVersion,

    /// The resource content as JSON.
    content: Value,

    /// When this version was written.
    last_modified: DateTime<Utc>,

    /// If the resource has been deleted, when it was deleted.
    deleted_at: Option<DateTime<Utc>>,

    /// ETag for HTTP caching (derived from version_id).
    etag: String,

    /// HTTP method that created this version.
    method: Option<ResourceMethod>,
}

/// HTTP method that created a resource version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceMethod {
    /// Resource was created via POST.
    Post,
    /// Resource was created/updated via PUT.
    Put,
    /// Resource was updated via PATCH.
    Patch,
    /// Resource was deleted via DELETE.
    Delete,
}

impl ResourceMethod {
    /// Returns the HTTP verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceMethod::Post => "POST",
            ResourceMethod::Put => "PUT",
            ResourceMethod::Patch => "PATCH",
            ResourceMethod::Delete => "DELETE",
        }
    }

    /// Parses an HTTP verb as stored in the history table.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "POST" => Some(ResourceMethod::Post),
            "PUT" => Some(ResourceMethod::Put),
            "PATCH" => Some(ResourceMethod::Patch),
            "DELETE" => Some(ResourceMethod::Delete),
            _ => None,
        }
    }
}

fn etag_for(version_id: &str) -> String {
    format!("W/\"{}\"", version_id)
}

impl StoredResource {
    /// Creates a new stored resource at version 1.
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        fhir_version: FhirVersion,
        content: Value,
    ) -> Self {
        let version_id = "1".to_string();
        let etag = etag_for(&version_id);

        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id,
            fhir_version,
            content,
            last_modified: Utc::now(),
            deleted_at: None,
            etag,
            method: Some(ResourceMethod::Post),
        }
    }

    /// Creates a stored resource from existing data (e.g., loaded from database).
    #[allow(clippy::too_many_arguments)]
    pub fn from_storage(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        version_id: impl Into<String>,
        fhir_version: FhirVersion,
        content: Value,
        last_modified: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
        method: Option<ResourceMethod>,
    ) -> Self {
        let version_id = version_id.into();
        let etag = etag_for(&version_id);

        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id,
            fhir_version,
            content,
            last_modified,
            deleted_at,
            etag,
            method,
        }
    }

    /// Returns the FHIR resource type.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the resource's logical ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the version ID.
    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    /// Returns the FHIR release the stored body is expressed in.
    pub fn fhir_version(&self) -> FhirVersion {
        self.fhir_version
    }

    /// Returns the resource content as JSON.
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Returns when this version was written.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Returns when the resource was deleted, if applicable.
    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    /// Returns `true` if the resource has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns the ETag for HTTP caching.
    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// Returns the HTTP method that created this version.
    pub fn method(&self) -> Option<ResourceMethod> {
        self.method
    }

    /// Returns the full URL path for this resource (e.g., "Patient/123").
    pub fn url(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// Returns the versioned URL path (e.g., "Patient/123/_history/1").
    pub fn versioned_url(&self) -> String {
        format!("{}/{}/_history/{}", self.resource_type, self.id, self.version_id)
    }
}

/// Strips the weak prefix and quotes from an ETag, leaving the version id.
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_start_matches("W/").trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_stored_resource() {
        let resource = StoredResource::new(
            "Patient",
            "123",
            FhirVersion::R4,
            json!({"resourceType": "Patient", "id": "123"}),
        );

        assert_eq!(resource.resource_type(), "Patient");
        assert_eq!(resource.id(), "123");
        assert_eq!(resource.version_id(), "1");
        assert_eq!(resource.fhir_version(), FhirVersion::R4);
        assert!(!resource.is_deleted());
    }

    #[test]
    fn test_url_generation() {
        let resource = StoredResource::new("Patient", "123", FhirVersion::R5, json!({}));

        assert_eq!(resource.url(), "Patient/123");
        assert_eq!(resource.versioned_url(), "Patient/123/_history/1");
    }

    #[test]
    fn test_deleted_marker() {
        let deleted_at = Utc::now();
        let marker = StoredResource::from_storage(
            "Patient",
            "123",
            "4",
            FhirVersion::R4,
            json!({}),
            deleted_at,
            Some(deleted_at),
            Some(ResourceMethod::Delete),
        );

        assert_eq!(marker.etag(), "W/\"4\"");
        assert!(marker.is_deleted());
        assert_eq!(marker.method(), Some(ResourceMethod::Delete));
        assert_eq!(normalize_etag(marker.etag()), "4");
        assert_eq!(normalize_etag("\"4\""), "4");
    }

    #[test]
    fn test_method_verbs() {
        for method in [
            ResourceMethod::Post,
            ResourceMethod::Put,
            ResourceMethod::Patch,
            ResourceMethod::Delete,
        ] {
            assert_eq!(ResourceMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(ResourceMethod::parse("GET"), None);
    }
}
