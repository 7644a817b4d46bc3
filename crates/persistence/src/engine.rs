//! The engine service.
//!
//! [`FhirEngine`] is the explicitly constructed entry point a REST layer
//! talks to. It owns the SQLite backend (and through it the version
//! negotiator), the configuration and a TTL cache of rendered output, and
//! maps every route onto one method:
//!
//! | Route | Method |
//! |-------|--------|
//! | `POST /{type}` | [`FhirEngine::create`] |
//! | `GET /{type}/{id}` | [`FhirEngine::read`] |
//! | `PUT /{type}/{id}` | [`FhirEngine::update`] |
//! | `PUT /{type}?criteria` | [`FhirEngine::conditional_update`] |
//! | `PATCH /{type}/{id}` | [`FhirEngine::patch`] |
//! | `DELETE /{type}/{id}` | [`FhirEngine::delete`] |
//! | `GET /{type}/{id}/_history/{vid}` | [`FhirEngine::vread`] |
//! | `GET /{type}/{id}/_history` | [`FhirEngine::history`] |
//! | `GET /{type}/_history` | [`FhirEngine::type_history`] |
//! | `GET /{type}?params` | [`FhirEngine::search`] |
//! | `GET /{type}/{id}/$everything` | [`FhirEngine::everything`] |
//! | `POST /{type}/$validate` | [`FhirEngine::validate`] |
//! | `POST /` | [`FhirEngine::process_bundle`] |
//!
//! Every method returns an [`EngineResponse`] carrying the status, body and
//! the `Location`/`ETag`/`Last-Modified` headers. Errors are returned as
//! [`StorageError`]; [`EngineResponse::from_error`] renders one as an
//! OperationOutcome response.
//!
//! # Example
//!
//! ```
//! use fhirvault_persistence::engine::FhirEngine;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let engine = FhirEngine::in_memory().unwrap();
//!
//! let created = engine
//!     .create("Patient", json!({"resourceType": "Patient", "id": "p1"}), None)
//!     .await
//!     .unwrap();
//! assert_eq!(created.status, 201);
//! assert_eq!(created.headers.etag.as_deref(), Some("W/\"1\""));
//!
//! let read = engine.read("Patient", "p1", None).await.unwrap();
//! assert_eq!(read.body.unwrap()["id"], "p1");
//! # });
//! ```

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::backends::sqlite::SqliteBackend;
use crate::cache::TtlCache;
use crate::config::EngineConfig;
use crate::core::{
    BundleOptions, BundleProvider, CompartmentProvider, ConditionalCreateResult,
    ConditionalStorage, ConditionalUpdateResult, HistoryPage, HistoryParams,
    InstanceHistoryProvider, ResourceStorage, SearchProvider, TypeHistoryProvider,
    VersionedStorage, full_url, search_link_base, status_line,
};
use crate::error::{BackendError, ResourceError, StorageError, StorageResult};
use crate::outcome::from_error;
use crate::search::parse_query_string;
use crate::types::{BundleEntry, SearchBundle, StoredResource};
use crate::validation;
use crate::version::FhirVersion;

/// `(type, id, versionId, targetVersion)`.
type CacheKey = (String, String, String, Option<FhirVersion>);

/// Headers computed for a response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseHeaders {
    /// URL of the written version.
    pub location: Option<String>,
    /// `W/"<versionId>"`.
    pub etag: Option<String>,
    /// RFC 7231 date of the version.
    pub last_modified: Option<String>,
}

impl ResponseHeaders {
    fn for_resource(base_url: &str, resource: &StoredResource, with_location: bool) -> Self {
        Self {
            location: with_location.then(|| join_base(base_url, &resource.versioned_url())),
            etag: Some(resource.etag().to_string()),
            last_modified: Some(http_date(resource.last_modified())),
        }
    }
}

/// A response for the REST layer to send.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body, absent for `204`.
    pub body: Option<Value>,
    /// Computed headers.
    pub headers: ResponseHeaders,
}

impl EngineResponse {
    fn new(status: u16, body: Option<Value>) -> Self {
        Self {
            status,
            body,
            headers: ResponseHeaders::default(),
        }
    }

    fn with_headers(mut self, headers: ResponseHeaders) -> Self {
        self.headers = headers;
        self
    }

    /// Renders an error as an OperationOutcome response.
    pub fn from_error(err: &StorageError) -> Self {
        Self::new(err.http_status(), Some(from_error(err)))
    }

    /// Returns the HTTP status line, e.g. `201 Created`.
    pub fn status_line(&self) -> String {
        status_line(self.status)
    }
}

/// Formats a timestamp as an RFC 7231 HTTP date.
pub fn http_date(dt: DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn join_base(base_url: &str, path: &str) -> String {
    if base_url.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    }
}

/// The storage and search engine service.
pub struct FhirEngine {
    backend: SqliteBackend,
    config: EngineConfig,
    cache: TtlCache<CacheKey, Value>,
    base_url: String,
}

impl std::fmt::Debug for FhirEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhirEngine")
            .field("backend", &self.backend)
            .field("cache", &self.cache)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl FhirEngine {
    /// Validates the configuration, opens the store and initializes its schema.
    pub fn new(config: EngineConfig) -> StorageResult<Self> {
        config.validate().map_err(|errors| {
            StorageError::Backend(BackendError::Unavailable {
                backend_name: "engine".to_string(),
                message: format!("invalid configuration: {}", errors.join("; ")),
            })
        })?;

        let backend = SqliteBackend::from_config(&config)?;
        backend.init_schema()?;
        Ok(Self::with_backend(backend, config))
    }

    /// An engine over a fresh in-memory database with test settings.
    pub fn in_memory() -> StorageResult<Self> {
        Self::new(EngineConfig::for_testing())
    }

    /// Wraps an already initialized backend.
    pub fn with_backend(backend: SqliteBackend, config: EngineConfig) -> Self {
        let cache = TtlCache::new(config.cache.ttl, config.cache.max_entries);
        Self {
            backend,
            config,
            cache,
            base_url: String::new(),
        }
    }

    /// Sets the base URL used for `Location`, `fullUrl` and paging links.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Returns the backend.
    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the number of cached renderings.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// `POST /{type}`, conditional when `if_none_exist` carries criteria.
    #[instrument(skip(self, body), fields(resource_type = %resource_type))]
    pub async fn create(
        &self,
        resource_type: &str,
        body: Value,
        if_none_exist: Option<&str>,
    ) -> StorageResult<EngineResponse> {
        let (stored, status) = match if_none_exist {
            Some(criteria) => {
                let criteria = parse_query_string(criteria);
                match self
                    .backend
                    .conditional_create(resource_type, body, &criteria)
                    .await?
                {
                    ConditionalCreateResult::Created(stored) => (stored, 201),
                    ConditionalCreateResult::Exists(stored) => {
                        debug!(id = %stored.id(), "Conditional create matched an existing resource");
                        (stored, 200)
                    }
                }
            }
            None => (self.backend.create(resource_type, body).await?, 201),
        };
        self.written(status, &stored).await
    }

    /// `GET /{type}/{id}`.
    #[instrument(skip(self), fields(resource_type = %resource_type, id = %id))]
    pub async fn read(
        &self,
        resource_type: &str,
        id: &str,
        target: Option<FhirVersion>,
    ) -> StorageResult<EngineResponse> {
        let stored = self
            .backend
            .read(resource_type, id)
            .await?
            .ok_or_else(|| not_found(resource_type, id))?;
        self.rendered(200, &stored, target, false).await
    }

    /// `GET /{type}/{id}/_history/{vid}`.
    ///
    /// A deleted version is reported as Gone.
    #[instrument(skip(self), fields(resource_type = %resource_type, id = %id))]
    pub async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
        target: Option<FhirVersion>,
    ) -> StorageResult<EngineResponse> {
        let Some(stored) = self.backend.vread(resource_type, id, version_id).await? else {
            if self.backend.list_versions(resource_type, id).await?.is_empty() {
                return Err(not_found(resource_type, id));
            }
            return Err(ResourceError::VersionNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: version_id.to_string(),
            }
            .into());
        };
        if stored.is_deleted() {
            return Err(ResourceError::Gone {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                deleted_at: stored.deleted_at(),
            }
            .into());
        }
        self.rendered(200, &stored, target, false).await
    }

    /// `PUT /{type}/{id}` with an optional `If-Match`.
    #[instrument(skip(self, body), fields(resource_type = %resource_type, id = %id))]
    pub async fn update(
        &self,
        resource_type: &str,
        id: &str,
        body: Value,
        if_match: Option<&str>,
    ) -> StorageResult<EngineResponse> {
        let stored = self
            .backend
            .update(resource_type, id, body, if_match)
            .await?;
        self.forget(resource_type, id);
        self.written(200, &stored).await
    }

    /// `PUT /{type}?criteria`.
    #[instrument(skip(self, body), fields(resource_type = %resource_type))]
    pub async fn conditional_update(
        &self,
        resource_type: &str,
        criteria: &str,
        body: Value,
    ) -> StorageResult<EngineResponse> {
        let criteria = parse_query_string(criteria);
        match self
            .backend
            .conditional_update(resource_type, &criteria, body)
            .await?
        {
            ConditionalUpdateResult::Created(stored) => self.written(201, &stored).await,
            ConditionalUpdateResult::Updated(stored) => {
                self.forget(resource_type, stored.id());
                self.written(200, &stored).await
            }
        }
    }

    /// `PATCH /{type}/{id}` with a JSON Patch document.
    #[instrument(skip(self, patch), fields(resource_type = %resource_type, id = %id))]
    pub async fn patch(
        &self,
        resource_type: &str,
        id: &str,
        patch: &Value,
        if_match: Option<&str>,
    ) -> StorageResult<EngineResponse> {
        let stored = self.backend.patch(resource_type, id, patch, if_match).await?;
        self.forget(resource_type, id);
        self.written(200, &stored).await
    }

    /// `DELETE /{type}/{id}`. Deleting a missing or deleted resource succeeds.
    #[instrument(skip(self), fields(resource_type = %resource_type, id = %id))]
    pub async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<EngineResponse> {
        self.backend.delete(resource_type, id).await?;
        self.forget(resource_type, id);
        Ok(EngineResponse::new(204, None))
    }

    /// `GET /{type}/{id}/_history`.
    #[instrument(skip(self, params), fields(resource_type = %resource_type, id = %id))]
    pub async fn history(
        &self,
        resource_type: &str,
        id: &str,
        params: &HistoryParams,
    ) -> StorageResult<EngineResponse> {
        let page = self
            .backend
            .history_instance(resource_type, id, params)
            .await?;
        Ok(EngineResponse::new(200, Some(self.history_bundle(&page)?)))
    }

    /// `GET /{type}/_history`.
    #[instrument(skip(self, params), fields(resource_type = %resource_type))]
    pub async fn type_history(
        &self,
        resource_type: &str,
        params: &HistoryParams,
    ) -> StorageResult<EngineResponse> {
        let page = self.backend.history_type(resource_type, params).await?;
        Ok(EngineResponse::new(200, Some(self.history_bundle(&page)?)))
    }

    /// `GET /{type}?params`, bounded by the configured search timeout.
    #[instrument(skip(self, params), fields(resource_type = %resource_type))]
    pub async fn search(
        &self,
        resource_type: &str,
        params: &[(String, String)],
        target: Option<FhirVersion>,
    ) -> StorageResult<EngineResponse> {
        let query = self.backend.parse_query(resource_type, params)?;
        let result = self.backend.search(&query).await?;
        let link_base = join_base(&self.base_url, &search_link_base(&query));
        let bundle = result.to_bundle(&self.base_url, &link_base, |stored| {
            self.render_now(stored, target)
        })?;
        Ok(EngineResponse::new(200, Some(bundle.to_json())))
    }

    /// `GET /{type}/{id}/$everything`, rendered as a searchset.
    #[instrument(skip(self), fields(resource_type = %resource_type, id = %id))]
    pub async fn everything(
        &self,
        resource_type: &str,
        id: &str,
        target: Option<FhirVersion>,
    ) -> StorageResult<EngineResponse> {
        let max_depth = self.config.everything.max_depth as usize;
        let resources = self.backend.everything(resource_type, id, max_depth).await?;

        let mut bundle = SearchBundle::new().with_total(resources.len() as u64);
        for stored in &resources {
            bundle = bundle.with_entry(BundleEntry::match_entry(
                full_url(&self.base_url, stored),
                self.render_now(stored, target)?,
            ));
        }
        Ok(EngineResponse::new(200, Some(bundle.to_json())))
    }

    /// `POST /{type}/$validate`. Nothing is persisted.
    pub fn validate(&self, resource_type: &str, body: Value) -> StorageResult<EngineResponse> {
        let outcome = validation::validate(resource_type, body)?;
        Ok(EngineResponse::new(200, Some(outcome)))
    }

    /// `POST /` with a Bundle, bounded by the configured bundle limits.
    #[instrument(skip(self, bundle))]
    pub async fn process_bundle(&self, bundle: Value) -> StorageResult<EngineResponse> {
        let response = self
            .backend
            .process_bundle(bundle, &self.bundle_options())
            .await?;
        Ok(EngineResponse::new(200, Some(response)))
    }

    fn bundle_options(&self) -> BundleOptions {
        BundleOptions {
            transaction_timeout: self.config.bundle.transaction_timeout,
            entry_timeout: self.config.bundle.entry_timeout,
            max_entries: self.config.bundle.max_entries,
            base_url: self.base_url.clone(),
        }
    }

    async fn written(&self, status: u16, stored: &StoredResource) -> StorageResult<EngineResponse> {
        self.rendered(status, stored, None, true).await
    }

    async fn rendered(
        &self,
        status: u16,
        stored: &StoredResource,
        target: Option<FhirVersion>,
        with_location: bool,
    ) -> StorageResult<EngineResponse> {
        let body = self.render(stored, target).await?;
        Ok(EngineResponse::new(status, Some(body)).with_headers(ResponseHeaders::for_resource(
            &self.base_url,
            stored,
            with_location,
        )))
    }

    /// Renders a version, filling the cache under its population lock.
    async fn render(
        &self,
        stored: &StoredResource,
        target: Option<FhirVersion>,
    ) -> StorageResult<Value> {
        let negotiator = self.backend.negotiator().clone();
        self.cache
            .get_or_try_insert_with(cache_key(stored, target), || async move {
                negotiator.present(stored, target).map_err(StorageError::from)
            })
            .await
    }

    /// Renders a version without waiting on the population lock.
    fn render_now(&self, stored: &StoredResource, target: Option<FhirVersion>) -> StorageResult<Value> {
        let key = cache_key(stored, target);
        if let Some(value) = self.cache.get(&key) {
            return Ok(value);
        }
        let value = self.backend.negotiator().present(stored, target)?;
        self.cache.insert(key, value.clone());
        Ok(value)
    }

    fn forget(&self, resource_type: &str, id: &str) {
        self.cache
            .invalidate_where(|(t, i, _, _)| t == resource_type && i == id);
    }

    fn history_bundle(&self, page: &HistoryPage) -> StorageResult<Value> {
        let mut entries = Vec::with_capacity(page.entries.len());
        for entry in &page.entries {
            let stored = &entry.resource;
            let method = entry.method.as_str();
            let (url, status) = match method {
                "POST" => (stored.resource_type().to_string(), 201),
                "DELETE" => (stored.url(), 204),
                _ => (stored.url(), 200),
            };

            let mut value = json!({
                "fullUrl": full_url(&self.base_url, stored),
                "request": {"method": method, "url": url},
                "response": {
                    "status": status_line(status),
                    "etag": stored.etag(),
                    "lastModified": stored.last_modified().to_rfc3339(),
                }
            });
            if !stored.is_deleted() {
                value["resource"] = self.render_now(stored, None)?;
            }
            entries.push(value);
        }

        Ok(json!({
            "resourceType": "Bundle",
            "type": "history",
            "total": page.total,
            "entry": entries,
        }))
    }
}

fn cache_key(stored: &StoredResource, target: Option<FhirVersion>) -> CacheKey {
    (
        stored.resource_type().to_string(),
        stored.id().to_string(),
        stored.version_id().to_string(),
        target,
    )
}

fn not_found(resource_type: &str, id: &str) -> StorageError {
    ResourceError::NotFound {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
    }
    .into()
}
