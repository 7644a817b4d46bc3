//! ResourceStorage and related trait implementations for SQLite.
//!
//! The trait methods check out one connection and delegate to synchronous
//! `*_in` helpers that take it explicitly. Bundle processing and explicit
//! transactions reuse the same helpers on their own connection.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::compartment;
use crate::core::{
    ConditionalCreateResult, ConditionalStorage, ConditionalUpdateResult, HistoryEntry,
    HistoryPage, HistoryParams, InstanceHistoryProvider, ResourceStorage, TypeHistoryProvider,
    VersionedStorage, apply_patch, check_version_match, next_version,
};
use crate::error::{
    ConcurrencyError, ResourceError, StorageResult, ValidationError,
};
use crate::types::{FhirResource, ResourceMethod, StoredResource};
use crate::validation::check_resource;
use crate::version::{FhirVersion, StorageStrategy, VersionCopy, VersionMetadata};

use super::backend::{BACKEND_NAME, internal_error, serialization_error};
use super::search::SqliteSearchIndexWriter;
use super::SqliteBackend;

/// Formats a timestamp so that text order is chronological order.
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| internal_error(format!("Invalid timestamp '{}': {}", s, e)))
}

pub(crate) fn parse_fhir_version(s: &str) -> StorageResult<FhirVersion> {
    s.parse::<FhirVersion>()
        .map_err(|_| internal_error(format!("Invalid stored FHIR version '{}'", s)))
}

/// Returns a write timestamp strictly after the previous version's.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

/// State of the current row of a resource.
#[derive(Debug, Clone)]
pub(crate) struct CurrentRow {
    pub version_id: String,
    pub is_deleted: bool,
    pub last_updated: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Reads a resource row selected as
/// `id, version_id, data, last_updated, fhir_version`.
pub(crate) fn resource_from_row(resource_type: &str, row: &Row<'_>) -> StorageResult<StoredResource> {
    let id: String = row.get(0)?;
    let version_id: String = row.get(1)?;
    let data: String = row.get(2)?;
    let last_updated: String = row.get(3)?;
    let fhir_version: String = row.get(4)?;

    let content: Value = serde_json::from_str(&data)
        .map_err(|e| serialization_error(format!("Failed to deserialize resource: {}", e)))?;

    Ok(StoredResource::from_storage(
        resource_type,
        id,
        version_id,
        parse_fhir_version(&fhir_version)?,
        content,
        parse_timestamp(&last_updated)?,
        None,
        None,
    ))
}

impl SqliteBackend {
    pub(crate) fn current_row_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<CurrentRow>> {
        let row = conn
            .query_row(
                "SELECT version_id, is_deleted, last_updated, deleted_at
                 FROM resources WHERE resource_type = ?1 AND id = ?2",
                params![resource_type, id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((version_id, is_deleted, last_updated, deleted_at)) = row else {
            return Ok(None);
        };
        Ok(Some(CurrentRow {
            version_id,
            is_deleted: is_deleted != 0,
            last_updated: parse_timestamp(&last_updated)?,
            deleted_at: deleted_at.as_deref().map(parse_timestamp).transpose()?,
        }))
    }

    /// Reads the live current version. Deleted resources fail with `Gone`.
    pub(crate) fn read_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        let Some(current) = self.current_row_in(conn, resource_type, id)? else {
            return Ok(None);
        };
        if current.is_deleted {
            return Err(ResourceError::Gone {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                deleted_at: current.deleted_at,
            }
            .into());
        }
        self.load_live_in(conn, resource_type, id)
    }

    /// Reads a live resource, returning `None` for missing and deleted ones.
    pub(crate) fn load_live_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, version_id, data, last_updated, fhir_version FROM resources
             WHERE resource_type = ?1 AND id = ?2 AND is_deleted = 0",
        )?;
        let mut rows = stmt.query(params![resource_type, id])?;
        match rows.next()? {
            Some(row) => Ok(Some(resource_from_row(resource_type, row)?)),
            None => Ok(None),
        }
    }

    /// Creates a resource. A body id is kept; otherwise one is assigned.
    pub(crate) fn create_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        resource: Value,
    ) -> StorageResult<StoredResource> {
        let resource = check_resource(resource_type, resource)?;
        let id = resource
            .id()
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let current = self.current_row_in(conn, resource_type, &id)?;
        if let Some(current) = &current {
            if !current.is_deleted {
                return Err(ResourceError::AlreadyExists {
                    resource_type: resource_type.to_string(),
                    id,
                }
                .into());
            }
        }

        let version = current
            .as_ref()
            .map(|c| next_version(&c.version_id))
            .unwrap_or_else(|| "1".to_string());
        let stored = self.write_version_in(
            conn,
            resource,
            &id,
            &version,
            ResourceMethod::Post,
            current.as_ref(),
        )?;
        debug!(resource_type, id = %id, version = %version, "Created resource");
        Ok(stored)
    }

    /// Writes a new version of a live resource.
    pub(crate) fn update_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
        resource: Value,
        if_match: Option<&str>,
        method: ResourceMethod,
    ) -> StorageResult<StoredResource> {
        let resource = Self::checked_for_id(resource_type, id, resource)?;

        let current = self
            .current_row_in(conn, resource_type, id)?
            .ok_or_else(|| ResourceError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            })?;
        if current.is_deleted {
            return Err(ResourceError::Gone {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                deleted_at: current.deleted_at,
            }
            .into());
        }
        if let Some(expected) = if_match {
            check_version_match(resource_type, id, expected, &current.version_id)?;
        }

        let version = next_version(&current.version_id);
        let stored = self.write_version_in(conn, resource, id, &version, method, Some(&current))?;
        debug!(resource_type, id, version = %version, "Updated resource");
        Ok(stored)
    }

    /// Update-or-create at a client-chosen id. Returns the written version
    /// and whether it was created.
    pub(crate) fn upsert_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
        resource: Value,
        if_match: Option<&str>,
    ) -> StorageResult<(StoredResource, bool)> {
        match self.current_row_in(conn, resource_type, id)? {
            Some(current) if !current.is_deleted => {
                let stored =
                    self.update_in(conn, resource_type, id, resource, if_match, ResourceMethod::Put)?;
                Ok((stored, false))
            }
            current => {
                if let Some(expected) = if_match {
                    return Err(ConcurrencyError::VersionConflict {
                        resource_type: resource_type.to_string(),
                        id: id.to_string(),
                        expected_version: expected.to_string(),
                        actual_version: current
                            .map(|c| c.version_id)
                            .unwrap_or_default(),
                    }
                    .into());
                }
                let resource = Self::checked_for_id(resource_type, id, resource)?;
                let version = current
                    .as_ref()
                    .map(|c| next_version(&c.version_id))
                    .unwrap_or_else(|| "1".to_string());
                let stored = self.write_version_in(
                    conn,
                    resource,
                    id,
                    &version,
                    ResourceMethod::Put,
                    current.as_ref(),
                )?;
                debug!(resource_type, id, version = %version, "Created resource by update");
                Ok((stored, true))
            }
        }
    }

    /// Applies a JSON Patch to the live resource and writes the result.
    ///
    /// The patch targets the body a plain read returns, so under HYBRID it
    /// applies to the originally received release and the result is
    /// negotiated again like any update.
    pub(crate) fn patch_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
        patch: &Value,
        if_match: Option<&str>,
    ) -> StorageResult<StoredResource> {
        let current = self
            .read_in(conn, resource_type, id)?
            .ok_or_else(|| ResourceError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            })?;
        let visible = self.negotiator().present(&current, None)?;
        let patched = apply_patch(&visible, patch)?;
        self.update_in(
            conn,
            resource_type,
            id,
            patched,
            if_match,
            ResourceMethod::Patch,
        )
    }

    /// Soft-deletes a live resource. Returns the deletion marker, or `None`
    /// when there was nothing to delete.
    pub(crate) fn delete_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        let current = match self.current_row_in(conn, resource_type, id)? {
            Some(current) if !current.is_deleted => current,
            _ => return Ok(None),
        };

        let (data, fhir_version): (String, String) = conn.query_row(
            "SELECT data, fhir_version FROM resources WHERE resource_type = ?1 AND id = ?2",
            params![resource_type, id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let now = next_timestamp(Some(current.last_updated));
        let version = next_version(&current.version_id);
        let now_str = format_timestamp(&now);

        conn.execute(
            "UPDATE resources SET version_id = ?1, last_updated = ?2, is_deleted = 1, deleted_at = ?2
             WHERE resource_type = ?3 AND id = ?4",
            params![version, now_str, resource_type, id],
        )?;
        conn.execute(
            "INSERT INTO resource_history
                (resource_type, id, version_id, data, last_updated, fhir_version, method, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            params![
                resource_type,
                id,
                version,
                data,
                now_str,
                fhir_version,
                ResourceMethod::Delete.as_str()
            ],
        )?;
        SqliteSearchIndexWriter::clear(conn, resource_type, id)?;

        debug!(resource_type, id, version = %version, "Deleted resource");

        let content: Value = serde_json::from_str(&data)
            .map_err(|e| serialization_error(format!("Failed to deserialize resource: {}", e)))?;
        Ok(Some(StoredResource::from_storage(
            resource_type,
            id,
            version,
            parse_fhir_version(&fhir_version)?,
            content,
            now,
            Some(now),
            Some(ResourceMethod::Delete),
        )))
    }

    pub(crate) fn vread_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
        version_id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, version_id, data, last_updated, fhir_version, method, is_deleted
             FROM resource_history WHERE resource_type = ?1 AND id = ?2 AND version_id = ?3",
        )?;
        let mut rows = stmt.query(params![resource_type, id, version_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(history_from_row(resource_type, row)?.resource)),
            None => Ok(None),
        }
    }

    pub(crate) fn list_versions_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Vec<String>> {
        let mut stmt = conn.prepare_cached(
            "SELECT version_id FROM resource_history WHERE resource_type = ?1 AND id = ?2
             ORDER BY CAST(version_id AS INTEGER) ASC",
        )?;
        let versions = stmt
            .query_map(params![resource_type, id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    /// History rows newest first, for one instance or a whole type.
    pub(crate) fn history_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: Option<&str>,
        history: &HistoryParams,
    ) -> StorageResult<HistoryPage> {
        let since = history.since.as_ref().map(format_timestamp);
        let limit = history.count.map(i64::from).unwrap_or(-1);

        let mut filter = "resource_type = ?".to_string();
        let mut args: Vec<&dyn ToSql> = vec![&resource_type];
        if let Some(id) = &id {
            filter.push_str(" AND id = ?");
            args.push(id);
        }
        if let Some(since) = &since {
            filter.push_str(" AND last_updated >= ?");
            args.push(since);
        }

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM resource_history WHERE {}", filter),
            args.as_slice(),
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT id, version_id, data, last_updated, fhir_version, method, is_deleted
             FROM resource_history WHERE {}
             ORDER BY last_updated DESC, id ASC, CAST(version_id AS INTEGER) DESC
             LIMIT ?",
            filter
        ))?;
        args.push(&limit);
        let mut rows = stmt.query(args.as_slice())?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(history_from_row(resource_type, row)?);
        }

        Ok(HistoryPage {
            entries,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    pub(crate) fn count_in(
        &self,
        conn: &Connection,
        resource_type: Option<&str>,
    ) -> StorageResult<u64> {
        let count: i64 = match resource_type {
            Some(rt) => conn.query_row(
                "SELECT COUNT(*) FROM resources WHERE resource_type = ?1 AND is_deleted = 0",
                params![rt],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM resources WHERE is_deleted = 0",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Finds the live resources matching conditional criteria, at most two.
    fn conditional_matches_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        criteria: &[(String, String)],
        operation: &str,
    ) -> StorageResult<Vec<StoredResource>> {
        let mut query = self.parse_query(resource_type, criteria)?;
        if query.parameters.is_empty() && query.reverse_chains.is_empty() {
            return Err(ValidationError::InvalidSearchParameter {
                parameter: operation.to_string(),
                message: "conditional criteria must contain a known search parameter"
                    .to_string(),
            }
            .into());
        }
        query.count = Some(2);
        query.page = None;
        query.sort.clear();
        query.includes.clear();

        let result = self.search_in(conn, &query)?;
        if result.total() > 1 {
            return Err(ConcurrencyError::MultipleMatches {
                operation: operation.to_string(),
                resource_type: resource_type.to_string(),
                count: usize::try_from(result.total()).unwrap_or(usize::MAX),
            }
            .into());
        }
        Ok(result.resources.items)
    }

    pub(crate) fn conditional_create_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        resource: Value,
        criteria: &[(String, String)],
    ) -> StorageResult<ConditionalCreateResult> {
        let mut matches = self.conditional_matches_in(conn, resource_type, criteria, "create")?;
        match matches.pop() {
            Some(existing) => {
                debug!(resource_type, id = %existing.id(), "Conditional create matched existing resource");
                Ok(ConditionalCreateResult::Exists(existing))
            }
            None => Ok(ConditionalCreateResult::Created(self.create_in(
                conn,
                resource_type,
                resource,
            )?)),
        }
    }

    pub(crate) fn conditional_update_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        criteria: &[(String, String)],
        resource: Value,
    ) -> StorageResult<ConditionalUpdateResult> {
        let mut matches = self.conditional_matches_in(conn, resource_type, criteria, "update")?;
        match matches.pop() {
            Some(existing) => {
                let body_id = resource.get("id").and_then(Value::as_str);
                if body_id.is_some_and(|b| b != existing.id()) {
                    return Err(ValidationError::InvalidId {
                        id: body_id.unwrap_or_default().to_string(),
                    }
                    .into());
                }
                let stored = self.update_in(
                    conn,
                    resource_type,
                    existing.id(),
                    resource,
                    None,
                    ResourceMethod::Put,
                )?;
                Ok(ConditionalUpdateResult::Updated(stored))
            }
            None => {
                let stored = match resource.get("id").and_then(Value::as_str) {
                    Some(id) => {
                        let id = id.to_string();
                        self.upsert_in(conn, resource_type, &id, resource, None)?.0
                    }
                    None => self.create_in(conn, resource_type, resource)?,
                };
                Ok(ConditionalUpdateResult::Created(stored))
            }
        }
    }

    /// Returns the version bookkeeping of a resource's current version.
    pub(crate) fn version_metadata_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<VersionMetadata>> {
        let row = conn
            .query_row(
                "SELECT detected_version, stored_version, original_version, transformation_applied,
                        confidence, storage_strategy, indicators, extensions, profiles
                 FROM version_metadata WHERE resource_type = ?1 AND id = ?2",
                params![resource_type, id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((detected, stored, original, transformed, confidence, strategy, indicators, extensions, profiles)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(VersionMetadata {
            detected_version: parse_fhir_version(&detected)?,
            stored_version: parse_fhir_version(&stored)?,
            original_version: parse_fhir_version(&original)?,
            transformation_applied: transformed != 0,
            confidence,
            indicators: serde_json::from_str(&indicators)?,
            storage_strategy: StorageStrategy::parse(&strategy)
                .ok_or_else(|| internal_error(format!("Invalid storage strategy '{}'", strategy)))?,
            extensions: serde_json::from_str(&extensions)?,
            profiles: serde_json::from_str(&profiles)?,
        }))
    }

    /// Returns a MULTI_VERSION copy of one version in another release.
    pub(crate) fn version_copy_in(
        &self,
        conn: &Connection,
        resource_type: &str,
        id: &str,
        version_id: &str,
        fhir_version: FhirVersion,
    ) -> StorageResult<Option<Value>> {
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM resource_version_copies
                 WHERE resource_type = ?1 AND id = ?2 AND version_id = ?3 AND fhir_version = ?4",
                params![resource_type, id, version_id, fhir_version.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(Into::into))
            .transpose()
    }

    /// Returns the version bookkeeping of a resource.
    pub async fn version_metadata(
        &self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<VersionMetadata>> {
        let conn = self.get_connection()?;
        self.version_metadata_in(&conn, resource_type, id)
    }

    /// Returns the stored copy of a version in another release, if one was
    /// kept under the MULTI_VERSION strategy.
    pub async fn version_copy(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
        fhir_version: FhirVersion,
    ) -> StorageResult<Option<Value>> {
        let conn = self.get_connection()?;
        self.version_copy_in(&conn, resource_type, id, version_id, fhir_version)
    }

    /// Applies a JSON Patch document to a live resource.
    pub async fn patch(
        &self,
        resource_type: &str,
        id: &str,
        patch: &Value,
        if_match: Option<&str>,
    ) -> StorageResult<StoredResource> {
        let conn = self.get_connection()?;
        self.write_transaction(&conn, |c| {
            self.patch_in(c, resource_type, id, patch, if_match)
        })
    }

    /// Checks a body addressed to `Type/id`; a body id must agree with it.
    fn checked_for_id(
        resource_type: &str,
        id: &str,
        resource: Value,
    ) -> StorageResult<FhirResource> {
        let resource = check_resource(resource_type, resource)?;
        match resource.id() {
            Some(body_id) if body_id != id => Err(ValidationError::InvalidId {
                id: body_id.to_string(),
            }
            .into()),
            _ => Ok(resource),
        }
    }

    /// Stamps, negotiates and persists one version.
    fn write_version_in(
        &self,
        conn: &Connection,
        mut resource: FhirResource,
        id: &str,
        version_id: &str,
        method: ResourceMethod,
        previous: Option<&CurrentRow>,
    ) -> StorageResult<StoredResource> {
        let resource_type = resource.resource_type().as_str();
        let last_updated = next_timestamp(previous.map(|p| p.last_updated));
        resource.set_id(id);
        resource.stamp_meta(version_id, last_updated);

        let prepared = self.negotiator().prepare_for_storage(&resource)?;
        let stored = StoredResource::from_storage(
            resource_type,
            id,
            version_id,
            prepared.metadata.stored_version,
            prepared.content,
            last_updated,
            None,
            Some(method),
        );

        self.persist_in(conn, &stored, &prepared.metadata, prepared.version_copy.as_ref())?;
        Ok(stored)
    }

    /// Writes the current row, the history row, the derived search rows and
    /// the version bookkeeping of one version.
    fn persist_in(
        &self,
        conn: &Connection,
        stored: &StoredResource,
        metadata: &VersionMetadata,
        copy: Option<&VersionCopy>,
    ) -> StorageResult<()> {
        let resource_type = stored.resource_type();
        let id = stored.id();
        let version_id = stored.version_id();
        let data = serde_json::to_string(stored.content())
            .map_err(|e| serialization_error(format!("Failed to serialize resource: {}", e)))?;
        let last_updated = format_timestamp(&stored.last_modified());
        let fhir_version = stored.fhir_version().as_str();

        conn.execute(
            "INSERT INTO resources
                (resource_type, id, version_id, data, last_updated, fhir_version, is_deleted, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL)
             ON CONFLICT(resource_type, id) DO UPDATE SET
                version_id = excluded.version_id,
                data = excluded.data,
                last_updated = excluded.last_updated,
                fhir_version = excluded.fhir_version,
                is_deleted = 0,
                deleted_at = NULL",
            params![resource_type, id, version_id, data, last_updated, fhir_version],
        )?;

        let method = stored.method().unwrap_or(ResourceMethod::Put);
        conn.execute(
            "INSERT INTO resource_history
                (resource_type, id, version_id, data, last_updated, fhir_version, method, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                resource_type,
                id,
                version_id,
                data,
                last_updated,
                fhir_version,
                method.as_str()
            ],
        )?;

        let values = match self.search_extractor().extract(stored.content(), resource_type) {
            Ok(values) => values,
            Err(e) => {
                warn!(resource_type, id, error = %e, "Search extraction failed; resource stored without index rows");
                Vec::new()
            }
        };
        let memberships = compartment::memberships(resource_type, id, &values);
        SqliteSearchIndexWriter::rewrite(conn, resource_type, id, &values, &memberships)?;

        self.write_metadata_in(conn, stored, metadata)?;

        if let Some(copy) = copy {
            let copy_data = serde_json::to_string(&copy.content)
                .map_err(|e| serialization_error(format!("Failed to serialize copy: {}", e)))?;
            conn.execute(
                "INSERT OR REPLACE INTO resource_version_copies
                    (resource_type, id, version_id, fhir_version, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![resource_type, id, version_id, copy.fhir_version.as_str(), copy_data],
            )?;
        }
        Ok(())
    }

    fn write_metadata_in(
        &self,
        conn: &Connection,
        stored: &StoredResource,
        metadata: &VersionMetadata,
    ) -> StorageResult<()> {
        let now = format_timestamp(&stored.last_modified());
        conn.execute(
            "INSERT INTO version_metadata
                (resource_type, id, version_id, detected_version, stored_version, original_version,
                 transformation_applied, confidence, storage_strategy, indicators, extensions,
                 profiles, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(resource_type, id) DO UPDATE SET
                version_id = excluded.version_id,
                detected_version = excluded.detected_version,
                stored_version = excluded.stored_version,
                original_version = excluded.original_version,
                transformation_applied = excluded.transformation_applied,
                confidence = excluded.confidence,
                storage_strategy = excluded.storage_strategy,
                indicators = excluded.indicators,
                extensions = excluded.extensions,
                profiles = excluded.profiles,
                updated_at = excluded.updated_at",
            params![
                stored.resource_type(),
                stored.id(),
                stored.version_id(),
                metadata.detected_version.as_str(),
                metadata.stored_version.as_str(),
                metadata.original_version.as_str(),
                metadata.transformation_applied,
                metadata.confidence,
                metadata.storage_strategy.as_str(),
                serde_json::to_string(&metadata.indicators)?,
                serde_json::to_string(&metadata.extensions)?,
                serde_json::to_string(&metadata.profiles)?,
                now,
            ],
        )?;

        if metadata.transformation_applied {
            conn.execute(
                "INSERT INTO version_metadata_history
                    (resource_type, id, version_id, from_version, to_version, storage_strategy, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    stored.resource_type(),
                    stored.id(),
                    stored.version_id(),
                    metadata.original_version.as_str(),
                    metadata.stored_version.as_str(),
                    metadata.storage_strategy.as_str(),
                    now,
                ],
            )?;
        }
        Ok(())
    }
}

/// Reads a history row selected as
/// `id, version_id, data, last_updated, fhir_version, method, is_deleted`.
fn history_from_row(resource_type: &str, row: &Row<'_>) -> StorageResult<HistoryEntry> {
    let id: String = row.get(0)?;
    let version_id: String = row.get(1)?;
    let data: String = row.get(2)?;
    let last_updated: String = row.get(3)?;
    let fhir_version: String = row.get(4)?;
    let method: String = row.get(5)?;
    let is_deleted: i64 = row.get(6)?;

    let method = ResourceMethod::parse(&method)
        .ok_or_else(|| internal_error(format!("Invalid history method '{}'", method)))?;
    let last_updated = parse_timestamp(&last_updated)?;
    let content: Value = serde_json::from_str(&data)
        .map_err(|e| serialization_error(format!("Failed to deserialize resource: {}", e)))?;

    let resource = StoredResource::from_storage(
        resource_type,
        id,
        version_id,
        parse_fhir_version(&fhir_version)?,
        content,
        last_updated,
        (is_deleted != 0).then_some(last_updated),
        Some(method),
    );
    Ok(HistoryEntry { resource, method })
}

#[async_trait]
impl ResourceStorage for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    #[instrument(skip(self, resource), fields(resource_type = %resource_type))]
    async fn create(&self, resource_type: &str, resource: Value) -> StorageResult<StoredResource> {
        let conn = self.get_connection()?;
        self.write_transaction(&conn, |c| self.create_in(c, resource_type, resource))
    }

    async fn read(&self, resource_type: &str, id: &str) -> StorageResult<Option<StoredResource>> {
        let conn = self.get_connection()?;
        self.read_in(&conn, resource_type, id)
    }

    #[instrument(skip(self, resource), fields(resource_type = %resource_type, id = %id))]
    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        resource: Value,
        if_match: Option<&str>,
    ) -> StorageResult<StoredResource> {
        let conn = self.get_connection()?;
        self.write_transaction(&conn, |c| {
            self.update_in(c, resource_type, id, resource, if_match, ResourceMethod::Put)
        })
    }

    #[instrument(skip(self), fields(resource_type = %resource_type, id = %id))]
    async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<()> {
        let conn = self.get_connection()?;
        self.write_transaction(&conn, |c| self.delete_in(c, resource_type, id))?;
        Ok(())
    }

    async fn count(&self, resource_type: Option<&str>) -> StorageResult<u64> {
        let conn = self.get_connection()?;
        self.count_in(&conn, resource_type)
    }
}

#[async_trait]
impl VersionedStorage for SqliteBackend {
    async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version_id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        let conn = self.get_connection()?;
        self.vread_in(&conn, resource_type, id, version_id)
    }

    async fn list_versions(&self, resource_type: &str, id: &str) -> StorageResult<Vec<String>> {
        let conn = self.get_connection()?;
        self.list_versions_in(&conn, resource_type, id)
    }
}

#[async_trait]
impl InstanceHistoryProvider for SqliteBackend {
    async fn history_instance(
        &self,
        resource_type: &str,
        id: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage> {
        let conn = self.get_connection()?;
        if self.current_row_in(&conn, resource_type, id)?.is_none() {
            return Err(ResourceError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            }
            .into());
        }
        self.history_in(&conn, resource_type, Some(id), params)
    }
}

#[async_trait]
impl TypeHistoryProvider for SqliteBackend {
    async fn history_type(
        &self,
        resource_type: &str,
        params: &HistoryParams,
    ) -> StorageResult<HistoryPage> {
        let conn = self.get_connection()?;
        self.history_in(&conn, resource_type, None, params)
    }
}

#[async_trait]
impl ConditionalStorage for SqliteBackend {
    #[instrument(skip(self, resource, criteria), fields(resource_type = %resource_type))]
    async fn conditional_create(
        &self,
        resource_type: &str,
        resource: Value,
        criteria: &[(String, String)],
    ) -> StorageResult<ConditionalCreateResult> {
        let conn = self.get_connection()?;
        self.write_transaction(&conn, |c| {
            self.conditional_create_in(c, resource_type, resource, criteria)
        })
    }

    #[instrument(skip(self, resource, criteria), fields(resource_type = %resource_type))]
    async fn conditional_update(
        &self,
        resource_type: &str,
        criteria: &[(String, String)],
        resource: Value,
    ) -> StorageResult<ConditionalUpdateResult> {
        let conn = self.get_connection()?;
        self.write_transaction(&conn, |c| {
            self.conditional_update_in(c, resource_type, criteria, resource)
        })
    }
}
