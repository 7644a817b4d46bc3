//! SQLite schema definitions.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{BackendError, StorageResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Safe to call repeatedly; every statement is idempotent.
pub fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(BackendError::MigrationError {
            message: format!(
                "database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            ),
        }
        .into());
    }

    if current_version < SCHEMA_VERSION {
        create_tables(conn)?;
        create_indexes(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        info!(version = SCHEMA_VERSION, "Initialized SQLite schema");
    } else {
        debug!(version = current_version, "SQLite schema up to date");
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> StorageResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| BackendError::MigrationError {
        message: format!("Failed to create schema_version table: {}", e),
    })?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> StorageResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

fn create_tables(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        -- Current version of every resource, deleted markers included
        CREATE TABLE IF NOT EXISTS resources (
            resource_type TEXT NOT NULL,
            id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            data TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            fhir_version TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            deleted_at TEXT,
            PRIMARY KEY (resource_type, id)
        );

        -- Every version ever written
        CREATE TABLE IF NOT EXISTS resource_history (
            resource_type TEXT NOT NULL,
            id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            data TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            fhir_version TEXT NOT NULL,
            method TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (resource_type, id, version_id)
        );

        -- One row per extracted search value
        CREATE TABLE IF NOT EXISTS search_index (
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            param_name TEXT NOT NULL,
            param_type TEXT NOT NULL,
            value_string TEXT,
            value_string_exact TEXT,
            value_token_system TEXT,
            value_token_code TEXT,
            value_date_low TEXT,
            value_date_high TEXT,
            value_number REAL,
            value_quantity_value REAL,
            value_quantity_unit TEXT,
            value_quantity_system TEXT,
            value_quantity_code TEXT,
            value_reference TEXT,
            value_uri TEXT,
            composite_group INTEGER,
            component_index INTEGER
        );

        -- Outgoing references, split for chaining and includes
        CREATE TABLE IF NOT EXISTS resource_references (
            source_type TEXT NOT NULL,
            source_id TEXT NOT NULL,
            param_name TEXT NOT NULL,
            target_type TEXT,
            target_id TEXT NOT NULL,
            reference TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS compartments (
            compartment_type TEXT NOT NULL,
            compartment_id TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            PRIMARY KEY (compartment_type, compartment_id, resource_type, resource_id)
        );

        CREATE TABLE IF NOT EXISTS version_metadata (
            resource_type TEXT NOT NULL,
            id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            detected_version TEXT NOT NULL,
            stored_version TEXT NOT NULL,
            original_version TEXT NOT NULL,
            transformation_applied INTEGER NOT NULL,
            confidence REAL NOT NULL,
            storage_strategy TEXT NOT NULL,
            indicators TEXT NOT NULL,
            extensions TEXT NOT NULL,
            profiles TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (resource_type, id)
        );

        -- One row per write that transformed the received body
        CREATE TABLE IF NOT EXISTS version_metadata_history (
            resource_type TEXT NOT NULL,
            id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            from_version TEXT NOT NULL,
            to_version TEXT NOT NULL,
            storage_strategy TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS resource_version_copies (
            resource_type TEXT NOT NULL,
            id TEXT NOT NULL,
            version_id TEXT NOT NULL,
            fhir_version TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (resource_type, id, version_id, fhir_version)
        );
        "#,
    )?;
    Ok(())
}

fn create_indexes(conn: &Connection) -> StorageResult<()> {
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_resources_type_updated ON resources(resource_type, is_deleted, last_updated)",
        "CREATE INDEX IF NOT EXISTS idx_history_updated ON resource_history(resource_type, last_updated)",
        "CREATE INDEX IF NOT EXISTS idx_search_resource ON search_index(resource_type, resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_search_string ON search_index(resource_type, param_name, value_string)",
        "CREATE INDEX IF NOT EXISTS idx_search_token ON search_index(resource_type, param_name, value_token_code, value_token_system)",
        "CREATE INDEX IF NOT EXISTS idx_search_date ON search_index(resource_type, param_name, value_date_low, value_date_high)",
        "CREATE INDEX IF NOT EXISTS idx_search_number ON search_index(resource_type, param_name, value_number)",
        "CREATE INDEX IF NOT EXISTS idx_search_quantity ON search_index(resource_type, param_name, value_quantity_value)",
        "CREATE INDEX IF NOT EXISTS idx_search_reference ON search_index(resource_type, param_name, value_reference)",
        "CREATE INDEX IF NOT EXISTS idx_search_uri ON search_index(resource_type, param_name, value_uri)",
        "CREATE INDEX IF NOT EXISTS idx_search_composite ON search_index(resource_type, resource_id, param_name, composite_group)",
        "CREATE INDEX IF NOT EXISTS idx_references_source ON resource_references(source_type, source_id)",
        "CREATE INDEX IF NOT EXISTS idx_references_target ON resource_references(target_type, target_id)",
        "CREATE INDEX IF NOT EXISTS idx_compartments_member ON compartments(resource_type, resource_id)",
        "CREATE INDEX IF NOT EXISTS idx_metadata_history ON version_metadata_history(resource_type, id)",
    ];

    for sql in indexes {
        conn.execute(sql, [])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_initialize_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        let tables = table_names(&conn);
        for expected in [
            "compartments",
            "resource_history",
            "resource_references",
            "resource_version_copies",
            "resources",
            "schema_version",
            "search_index",
            "version_metadata",
            "version_metadata_history",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {}", expected);
        }
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();
        assert!(initialize_schema(&conn).is_err());
    }
}
