//! Search index, reference and compartment row maintenance.
//!
//! All three tables are derived from the extracted values of a resource's
//! current version. They are cleared and rewritten on every write, and
//! cleared on delete.

use rusqlite::{Connection, params};
use rust_decimal::prelude::ToPrimitive;

use crate::compartment::Membership;
use crate::error::StorageResult;
use crate::search::{ExtractedValue, IndexValue};

/// Writes derived search rows for SQLite.
pub struct SqliteSearchIndexWriter;

impl SqliteSearchIndexWriter {
    /// The INSERT for a single index entry.
    pub fn insert_sql() -> &'static str {
        r#"
        INSERT INTO search_index (
            resource_type, resource_id, param_name, param_type,
            value_string, value_string_exact, value_token_system, value_token_code,
            value_date_low, value_date_high,
            value_number, value_quantity_value, value_quantity_unit,
            value_quantity_system, value_quantity_code,
            value_reference, value_uri, composite_group, component_index
        ) VALUES (
            ?1, ?2, ?3, ?4,
            ?5, ?6, ?7, ?8,
            ?9, ?10,
            ?11, ?12, ?13,
            ?14, ?15,
            ?16, ?17, ?18, ?19
        )
        "#
    }

    /// Replaces every derived row of a resource.
    pub fn rewrite(
        conn: &Connection,
        resource_type: &str,
        resource_id: &str,
        values: &[ExtractedValue],
        memberships: &[Membership],
    ) -> StorageResult<()> {
        Self::clear(conn, resource_type, resource_id)?;
        Self::insert_values(conn, resource_type, resource_id, values)?;
        Self::insert_references(conn, resource_type, resource_id, values)?;
        Self::insert_memberships(conn, resource_type, resource_id, memberships)?;
        Ok(())
    }

    /// Removes every derived row of a resource.
    pub fn clear(conn: &Connection, resource_type: &str, resource_id: &str) -> StorageResult<()> {
        conn.execute(
            "DELETE FROM search_index WHERE resource_type = ?1 AND resource_id = ?2",
            params![resource_type, resource_id],
        )?;
        conn.execute(
            "DELETE FROM resource_references WHERE source_type = ?1 AND source_id = ?2",
            params![resource_type, resource_id],
        )?;
        conn.execute(
            "DELETE FROM compartments WHERE resource_type = ?1 AND resource_id = ?2",
            params![resource_type, resource_id],
        )?;
        Ok(())
    }

    fn insert_values(
        conn: &Connection,
        resource_type: &str,
        resource_id: &str,
        values: &[ExtractedValue],
    ) -> StorageResult<()> {
        let mut stmt = conn.prepare_cached(Self::insert_sql())?;
        for value in values {
            let row = IndexRow::from_value(&value.value);
            stmt.execute(params![
                resource_type,
                resource_id,
                value.param_name,
                value.param_type.as_str(),
                row.string,
                row.string_exact,
                row.token_system,
                row.token_code,
                row.date_low,
                row.date_high,
                row.number,
                row.quantity_value,
                row.quantity_unit,
                row.quantity_system,
                row.quantity_code,
                row.reference,
                row.uri,
                value.composite_group,
                value.component_index,
            ])?;
        }
        Ok(())
    }

    fn insert_references(
        conn: &Connection,
        resource_type: &str,
        resource_id: &str,
        values: &[ExtractedValue],
    ) -> StorageResult<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO resource_references
                (source_type, source_id, param_name, target_type, target_id, reference)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for value in values.iter().filter(|v| v.composite_group.is_none()) {
            if let IndexValue::Reference(reference) = &value.value {
                stmt.execute(params![
                    resource_type,
                    resource_id,
                    value.param_name,
                    reference.target_type,
                    reference.target_id,
                    reference.reference,
                ])?;
            }
        }
        Ok(())
    }

    fn insert_memberships(
        conn: &Connection,
        resource_type: &str,
        resource_id: &str,
        memberships: &[Membership],
    ) -> StorageResult<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO compartments
                (compartment_type, compartment_id, resource_type, resource_id)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for membership in memberships {
            stmt.execute(params![
                membership.compartment_type,
                membership.compartment_id,
                resource_type,
                resource_id,
            ])?;
        }
        Ok(())
    }
}

/// Column values for one `search_index` row.
#[derive(Debug, Default, PartialEq)]
struct IndexRow {
    string: Option<String>,
    string_exact: Option<String>,
    token_system: Option<String>,
    token_code: Option<String>,
    date_low: Option<String>,
    date_high: Option<String>,
    number: Option<f64>,
    quantity_value: Option<f64>,
    quantity_unit: Option<String>,
    quantity_system: Option<String>,
    quantity_code: Option<String>,
    reference: Option<String>,
    uri: Option<String>,
}

impl IndexRow {
    fn from_value(value: &IndexValue) -> Self {
        match value {
            IndexValue::String { normalized, exact } => Self {
                string: Some(normalized.clone()),
                string_exact: Some(exact.clone()),
                ..Self::default()
            },
            IndexValue::Token { system, code } => Self {
                token_system: system.clone(),
                token_code: Some(code.clone()),
                ..Self::default()
            },
            IndexValue::Date(range) => Self {
                date_low: Some(range.low_key()),
                date_high: Some(range.high_key()),
                ..Self::default()
            },
            IndexValue::Number(n) => Self {
                number: n.to_f64(),
                ..Self::default()
            },
            IndexValue::Quantity {
                value,
                unit,
                system,
                code,
            } => Self {
                quantity_value: value.to_f64(),
                quantity_unit: unit.clone(),
                quantity_system: system.clone(),
                quantity_code: code.clone(),
                ..Self::default()
            },
            IndexValue::Reference(reference) => Self {
                reference: Some(reference.local_reference()),
                ..Self::default()
            },
            IndexValue::Uri(uri) => Self {
                uri: Some(uri.clone()),
                ..Self::default()
            },
        }
    }
}
