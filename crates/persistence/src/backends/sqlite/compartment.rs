//! CompartmentProvider implementation for SQLite.

use async_trait::async_trait;
use rusqlite::{Connection, params};
use tracing::debug;

use crate::compartment::{self, collect};
use crate::core::CompartmentProvider;
use crate::error::{ResourceError, StorageResult, ValidationError};
use crate::types::StoredResource;

use super::SqliteBackend;

impl SqliteBackend {
    fn compartment_members_in(
        &self,
        conn: &Connection,
        compartment_type: &str,
        id: &str,
    ) -> StorageResult<Vec<StoredResource>> {
        let mut stmt = conn.prepare_cached(
            "SELECT resource_type, resource_id FROM compartments
             WHERE compartment_type = ?1 AND compartment_id = ?2
               AND NOT (resource_type = ?1 AND resource_id = ?2)
             ORDER BY resource_type, resource_id",
        )?;
        let keys = stmt
            .query_map(params![compartment_type, id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut members = Vec::with_capacity(keys.len());
        for (resource_type, resource_id) in keys {
            if let Some(member) = self.load_live_in(conn, &resource_type, &resource_id)? {
                members.push(member);
            }
        }
        Ok(members)
    }

    /// Live resources referenced by `resource`.
    fn referenced_resources_in(
        &self,
        conn: &Connection,
        resource: &StoredResource,
    ) -> StorageResult<Vec<StoredResource>> {
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT target_type, target_id FROM resource_references
             WHERE source_type = ?1 AND source_id = ?2 AND target_type IS NOT NULL
             ORDER BY target_type, target_id",
        )?;
        let keys = stmt
            .query_map(params![resource.resource_type(), resource.id()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut found = Vec::with_capacity(keys.len());
        for (resource_type, id) in keys {
            if let Some(target) = self.load_live_in(conn, &resource_type, &id)? {
                found.push(target);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl CompartmentProvider for SqliteBackend {
    async fn everything(
        &self,
        compartment_type: &str,
        id: &str,
        max_depth: usize,
    ) -> StorageResult<Vec<StoredResource>> {
        if compartment::definition(compartment_type).is_none() {
            return Err(ValidationError::UnsupportedResourceType {
                resource_type: compartment_type.to_string(),
            }
            .into());
        }

        let conn = self.get_connection()?;
        let owner = self
            .read_in(&conn, compartment_type, id)?
            .ok_or_else(|| ResourceError::NotFound {
                resource_type: compartment_type.to_string(),
                id: id.to_string(),
            })?;
        let members = self.compartment_members_in(&conn, compartment_type, id)?;
        debug!(compartment_type, id, members = members.len(), "Collecting compartment");

        collect(owner, members, max_depth, |resource| {
            self.referenced_resources_in(&conn, resource)
        })
    }
}
