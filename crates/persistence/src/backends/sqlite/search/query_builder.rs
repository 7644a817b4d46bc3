//! SQL Query Builder for FHIR Search.
//!
//! Translates a parsed [`SearchQuery`] into SQL over the `resources` table
//! (alias `r`). Every parameter becomes a set of `(resource_type, id)` pairs
//! drawn from `search_index` and `resource_references`; the resource must
//! belong to each set. Placeholders are anonymous, so fragment parameters
//! are always kept in textual order.

use rusqlite::ToSql;
use rusqlite::types::ToSqlOutput;

use crate::error::SearchError;
use crate::types::{
    SearchModifier, SearchParamType, SearchParameter, SearchQuery, SortDirection, SortDirective,
};

use super::chain_builder::ChainBuilder;
use super::parameter_handlers::{CompositeHandler, value_condition};

/// A fragment of SQL with bound parameters.
#[derive(Debug, Clone)]
pub struct SqlFragment {
    /// The SQL clause.
    pub sql: String,
    /// Bound parameter values.
    pub params: Vec<SqlParam>,
}

/// A bound SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// String parameter.
    String(String),
    /// Integer parameter.
    Integer(i64),
    /// Float parameter.
    Float(f64),
    /// Null parameter.
    Null,
}

impl SqlParam {
    /// Creates a string parameter.
    pub fn string(s: impl Into<String>) -> Self {
        SqlParam::String(s.into())
    }

    /// Creates an integer parameter.
    pub fn integer(i: i64) -> Self {
        SqlParam::Integer(i)
    }

    /// Creates a float parameter.
    pub fn float(f: f64) -> Self {
        SqlParam::Float(f)
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::String(s) => s.to_sql(),
            SqlParam::Integer(i) => i.to_sql(),
            SqlParam::Float(f) => f.to_sql(),
            SqlParam::Null => rusqlite::types::Null.to_sql(),
        }
    }
}

impl SqlFragment {
    /// Creates a new SQL fragment.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Creates a fragment with parameters.
    pub fn with_params(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Combines with another fragment using AND.
    pub fn and(mut self, other: SqlFragment) -> Self {
        if !self.sql.is_empty() && !other.sql.is_empty() {
            self.sql = format!("({}) AND ({})", self.sql, other.sql);
        } else if !other.sql.is_empty() {
            self.sql = other.sql;
        }
        self.params.extend(other.params);
        self
    }

    /// Combines with another fragment using OR.
    pub fn or(mut self, other: SqlFragment) -> Self {
        if !self.sql.is_empty() && !other.sql.is_empty() {
            self.sql = format!("({}) OR ({})", self.sql, other.sql);
        } else if !other.sql.is_empty() {
            self.sql = other.sql;
        }
        self.params.extend(other.params);
        self
    }

    /// Returns true if this fragment is empty.
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Returns `?, ?, ?` for `n` placeholders.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Builds string parameters from a list of names.
pub fn string_params<S: AsRef<str>>(values: &[S]) -> Vec<SqlParam> {
    values.iter().map(|v| SqlParam::string(v.as_ref())).collect()
}

/// Columns selected for every matched resource.
pub const RESOURCE_COLUMNS: &str =
    "r.id, r.version_id, r.data, r.last_updated, r.fhir_version";

/// Builds SQL queries from FHIR search parameters.
pub struct QueryBuilder<'a> {
    query: &'a SearchQuery,
}

impl<'a> QueryBuilder<'a> {
    /// Creates a new query builder.
    pub fn new(query: &'a SearchQuery) -> Self {
        Self { query }
    }

    /// Builds the WHERE condition over `resources r`.
    ///
    /// Deleted resources never match. Parameters are ANDed; the values of
    /// one parameter are ORed.
    pub fn build_where(&self) -> Result<SqlFragment, SearchError> {
        let mut fragment = SqlFragment::with_params(
            "r.resource_type = ? AND r.is_deleted = 0",
            vec![SqlParam::string(&self.query.resource_type)],
        );

        for param in &self.query.parameters {
            let set = parameter_set(&self.query.resource_type, param)?;
            fragment = fragment.and(member_of(set));
        }

        for has in &self.query.reverse_chains {
            let sources = parameter_set(&has.source_type, &has.parameter)?;
            let set = ChainBuilder::reverse(&self.query.resource_type, has, sources);
            fragment = fragment.and(member_of(set));
        }

        Ok(fragment)
    }

    /// Builds the paged SELECT.
    pub fn build_select(&self, limit: u32, offset: u64) -> Result<SqlFragment, SearchError> {
        let filter = self.build_where()?;
        let order = self.build_order_by();

        let mut params = filter.params;
        params.extend(order.params);
        params.push(SqlParam::integer(i64::from(limit)));
        params.push(SqlParam::integer(i64::try_from(offset).unwrap_or(i64::MAX)));

        Ok(SqlFragment::with_params(
            format!(
                "SELECT {} FROM resources r WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
                RESOURCE_COLUMNS, filter.sql, order.sql
            ),
            params,
        ))
    }

    /// Builds the COUNT query.
    pub fn build_count(&self) -> Result<SqlFragment, SearchError> {
        let filter = self.build_where()?;
        Ok(SqlFragment::with_params(
            format!("SELECT COUNT(*) FROM resources r WHERE {}", filter.sql),
            filter.params,
        ))
    }

    /// Builds the ORDER BY clause.
    ///
    /// Without `_sort` results are newest first. `id` always breaks ties so
    /// pages never overlap.
    pub fn build_order_by(&self) -> SqlFragment {
        if self.query.sort.is_empty() {
            return SqlFragment::new("r.last_updated DESC, r.id ASC");
        }

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let mut sorted_by_id = false;

        for directive in &self.query.sort {
            let direction = match directive.direction {
                SortDirection::Ascending => "ASC",
                SortDirection::Descending => "DESC",
            };
            match directive.parameter.as_str() {
                "_id" => {
                    sorted_by_id = true;
                    clauses.push(format!("r.id {}", direction));
                }
                "_lastUpdated" => clauses.push(format!("r.last_updated {}", direction)),
                _ => {
                    clauses.push(format!(
                        "(SELECT {} FROM search_index s \
                         WHERE s.resource_type = r.resource_type AND s.resource_id = r.id \
                         AND s.param_name = ? AND s.component_index IS NULL) {} NULLS LAST",
                        sort_expression(directive),
                        direction
                    ));
                    params.push(SqlParam::string(&directive.parameter));
                }
            }
        }
        if !sorted_by_id {
            clauses.push("r.id ASC".to_string());
        }

        SqlFragment::with_params(clauses.join(", "), params)
    }
}

/// Restricts `r` to a set of `(resource_type, id)` pairs.
fn member_of(set: SqlFragment) -> SqlFragment {
    SqlFragment::with_params(
        format!("(r.resource_type, r.id) IN ({})", set.sql),
        set.params,
    )
}

/// The aggregate a sort key is read through; a resource may carry several
/// values for one parameter.
fn sort_expression(directive: &SortDirective) -> String {
    let descending = directive.direction == SortDirection::Descending;
    let aggregate = if descending { "MAX" } else { "MIN" };
    let column = match directive.param_type {
        SearchParamType::Token => "s.value_token_code",
        SearchParamType::Date if descending => "s.value_date_high",
        SearchParamType::Date => "s.value_date_low",
        SearchParamType::Number => "s.value_number",
        SearchParamType::Quantity => "s.value_quantity_value",
        SearchParamType::Reference => "s.value_reference",
        SearchParamType::Uri => "s.value_uri",
        SearchParamType::String | SearchParamType::Composite | SearchParamType::Special => {
            "s.value_string"
        }
    };
    format!("{}({})", aggregate, column)
}

/// Builds the set of `(resource_type, id)` pairs of `base_type` matching a
/// possibly chained parameter.
pub fn parameter_set(base_type: &str, param: &SearchParameter) -> Result<SqlFragment, SearchError> {
    let terminal_types: Vec<String> = param
        .terminal_types(base_type)
        .into_iter()
        .map(String::from)
        .collect();
    let terminal = terminal_set(&terminal_types, param)?;
    if param.chain.is_empty() {
        Ok(terminal)
    } else {
        Ok(ChainBuilder::forward(base_type, &param.chain, terminal))
    }
}

/// Builds the set of resources of `types` matching the terminal parameter,
/// applying `:missing` and `:not`.
fn terminal_set(types: &[String], param: &SearchParameter) -> Result<SqlFragment, SearchError> {
    match &param.modifier {
        Some(SearchModifier::Missing) => Ok(missing_set(types, param)),
        Some(SearchModifier::Not) => {
            let matching = value_set(types, param, None)?;
            Ok(live_except(types, matching))
        }
        modifier => value_set(types, param, modifier.as_ref()),
    }
}

fn value_set(
    types: &[String],
    param: &SearchParameter,
    modifier: Option<&SearchModifier>,
) -> Result<SqlFragment, SearchError> {
    let mut condition = SqlFragment::new("");
    for value in &param.values {
        let next = if param.param_type == SearchParamType::Composite {
            CompositeHandler::build_sql(&param.components, value)?
        } else {
            value_condition(param.param_type, value, modifier)?
        };
        condition = condition.or(next);
    }

    let mut params = string_params(types);
    params.push(SqlParam::string(&param.name));
    params.extend(condition.params);
    Ok(SqlFragment::with_params(
        format!(
            "SELECT si.resource_type, si.resource_id FROM search_index si \
             WHERE si.resource_type IN ({}) AND si.param_name = ? AND ({})",
            placeholders(types.len()),
            condition.sql
        ),
        params,
    ))
}

fn missing_set(types: &[String], param: &SearchParameter) -> SqlFragment {
    let wants_missing = param.values.iter().any(|v| v.value == "true");
    let wants_present = param.values.iter().any(|v| v.value == "false");

    let mut params = string_params(types);
    params.push(SqlParam::string(&param.name));
    let present = SqlFragment::with_params(
        format!(
            "SELECT si.resource_type, si.resource_id FROM search_index si \
             WHERE si.resource_type IN ({}) AND si.param_name = ?",
            placeholders(types.len())
        ),
        params,
    );

    match (wants_missing, wants_present) {
        (true, true) => live_except(types, SqlFragment::new("SELECT NULL, NULL WHERE 0")),
        (true, false) => live_except(types, present),
        _ => present,
    }
}

/// Live resources of `types` outside the given set.
fn live_except(types: &[String], excluded: SqlFragment) -> SqlFragment {
    let mut params = string_params(types);
    params.extend(excluded.params);
    SqlFragment::with_params(
        format!(
            "SELECT lr.resource_type, lr.id FROM resources lr \
             WHERE lr.resource_type IN ({}) AND lr.is_deleted = 0 \
             AND (lr.resource_type, lr.id) NOT IN ({})",
            placeholders(types.len()),
            excluded.sql
        ),
        params,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{SearchParameterRegistry, SearchQueryParser};

    fn parse(resource_type: &str, pairs: &[(&str, &str)]) -> SearchQuery {
        let registry = SearchParameterRegistry::with_embedded();
        let params: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SearchQueryParser::new(&registry)
            .parse(resource_type, &params)
            .unwrap()
    }

    fn placeholder_count(sql: &str) -> usize {
        sql.matches('?').count()
    }

    #[test]
    fn test_placeholders_match_params() {
        let query = parse(
            "Observation",
            &[
                ("code", "http://loinc.org|2339-0,1234-5"),
                ("date", "ge2024-01-01"),
                ("subject.name", "Smith"),
                ("_sort", "-date"),
            ],
        );
        let select = QueryBuilder::new(&query).build_select(10, 0).unwrap();
        assert_eq!(placeholder_count(&select.sql), select.params.len());

        let count = QueryBuilder::new(&query).build_count().unwrap();
        assert_eq!(placeholder_count(&count.sql), count.params.len());
    }

    #[test]
    fn test_default_order() {
        let query = parse("Patient", &[]);
        let order = QueryBuilder::new(&query).build_order_by();
        assert_eq!(order.sql, "r.last_updated DESC, r.id ASC");
    }

    #[test]
    fn test_sort_adds_tie_breaker() {
        let query = parse("Patient", &[("_sort", "family,-_lastUpdated")]);
        let order = QueryBuilder::new(&query).build_order_by();
        assert!(order.sql.starts_with("(SELECT MIN(s.value_string)"));
        assert!(order.sql.contains("r.last_updated DESC"));
        assert!(order.sql.ends_with("r.id ASC"));
        assert_eq!(order.params, vec![SqlParam::string("family")]);

        let by_id = parse("Patient", &[("_sort", "-_id")]);
        assert_eq!(QueryBuilder::new(&by_id).build_order_by().sql, "r.id DESC");
    }

    #[test]
    fn test_not_and_missing_use_live_resources() {
        let query = parse("Observation", &[("status:not", "final")]);
        let filter = QueryBuilder::new(&query).build_where().unwrap();
        assert!(filter.sql.contains("NOT IN"));
        assert_eq!(placeholder_count(&filter.sql), filter.params.len());

        let query = parse("Patient", &[("birthdate:missing", "true")]);
        let filter = QueryBuilder::new(&query).build_where().unwrap();
        assert!(filter.sql.contains("lr.is_deleted = 0"));
        assert_eq!(placeholder_count(&filter.sql), filter.params.len());
    }

    #[test]
    fn test_has_and_composite() {
        let query = parse(
            "Patient",
            &[
                ("_has:Observation:subject:code", "1234-5"),
            ],
        );
        let filter = QueryBuilder::new(&query).build_where().unwrap();
        assert!(filter.sql.contains("rr.source_type = ?"));
        assert_eq!(placeholder_count(&filter.sql), filter.params.len());

        let query = parse(
            "Observation",
            &[("code-value-quantity", "http://loinc.org|2339-0$gt100")],
        );
        let filter = QueryBuilder::new(&query).build_where().unwrap();
        assert!(filter.sql.contains("composite_group"));
        assert_eq!(placeholder_count(&filter.sql), filter.params.len());
    }

    #[test]
    fn test_sql_param_binding() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let params = vec![
            SqlParam::string("a"),
            SqlParam::integer(2),
            SqlParam::float(1.5),
            SqlParam::Null,
        ];
        let row: (String, i64, f64, Option<String>) = conn
            .query_row(
                "SELECT ?, ?, ?, ?",
                rusqlite::params_from_iter(params.iter()),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(row, ("a".to_string(), 2, 1.5, None));
    }
}
