//! SearchProvider implementation for SQLite.

use std::collections::HashSet;

use async_trait::async_trait;
use rusqlite::{Connection, ToSql, params_from_iter};
use tracing::{debug, instrument, trace};

use crate::core::{SearchProvider, SearchResult};
use crate::error::{SearchError, StorageResult};
use crate::search::SearchQueryParser;
use crate::types::{IncludeDirective, IncludeType, Page, PageInfo, SearchQuery, StoredResource};

use super::SqliteBackend;
use super::search::QueryBuilder;
use super::storage::resource_from_row;

type ResourceKey = (String, String);

fn key(resource: &StoredResource) -> ResourceKey {
    (resource.resource_type().to_string(), resource.id().to_string())
}

impl SqliteBackend {
    /// Parses query parameters against the registry and paging limits.
    pub fn parse_query(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> StorageResult<SearchQuery> {
        let registry = self.search_registry().read();
        SearchQueryParser::new(&registry)
            .with_count_limits(self.search_config().default_count, self.search_config().max_count)
            .parse(resource_type, params)
    }

    /// Runs a search on the given connection.
    pub(crate) fn search_in(
        &self,
        conn: &Connection,
        query: &SearchQuery,
    ) -> StorageResult<SearchResult> {
        let builder = QueryBuilder::new(query);
        let total = self.search_count_in(conn, query)?;

        let count = query.count.unwrap_or(self.search_config().default_count);
        let page = query.page_number();
        let page_info = PageInfo::new(page, count, total);

        if query.is_count_only() || page_info.offset() >= total {
            return Ok(SearchResult::new(Page::new(Vec::new(), page_info)));
        }

        let select = builder.build_select(count, page_info.offset())?;
        trace!(sql = %select.sql, "Executing search");

        let mut stmt = conn.prepare(&select.sql)?;
        let mut rows = stmt.query(params_from_iter(select.params.iter()))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(resource_from_row(&query.resource_type, row)?);
        }

        let included = if query.includes.is_empty() {
            Vec::new()
        } else {
            self.resolve_includes_in(conn, &query.includes, &items)?
        };

        debug!(
            resource_type = %query.resource_type,
            total,
            returned = items.len(),
            included = included.len(),
            "Search complete"
        );
        Ok(SearchResult::new(Page::new(items, page_info)).with_included(included))
    }

    pub(crate) fn search_count_in(
        &self,
        conn: &Connection,
        query: &SearchQuery,
    ) -> StorageResult<u64> {
        let count = QueryBuilder::new(query).build_count()?;
        let total: i64 = conn.query_row(
            &count.sql,
            params_from_iter(count.params.iter()),
            |row| row.get(0),
        )?;
        Ok(u64::try_from(total).unwrap_or_default())
    }

    /// Resolves `_include` and `_revinclude` directives as a worklist.
    ///
    /// Every directive runs against the matches. Directives marked
    /// `:iterate` then run again against each newly included resource until
    /// nothing new turns up. Matches are never repeated as includes.
    fn resolve_includes_in(
        &self,
        conn: &Connection,
        directives: &[IncludeDirective],
        matches: &[StoredResource],
    ) -> StorageResult<Vec<StoredResource>> {
        let mut visited: HashSet<ResourceKey> = matches.iter().map(key).collect();
        let mut included = Vec::new();

        let mut frontier = self.include_round_in(conn, directives, matches, &mut visited)?;
        let iterating: Vec<IncludeDirective> =
            directives.iter().filter(|d| d.iterate).cloned().collect();

        while !frontier.is_empty() {
            let next = if iterating.is_empty() {
                Vec::new()
            } else {
                self.include_round_in(conn, &iterating, &frontier, &mut visited)?
            };
            included.append(&mut frontier);
            frontier = next;
        }
        Ok(included)
    }

    fn include_round_in(
        &self,
        conn: &Connection,
        directives: &[IncludeDirective],
        from: &[StoredResource],
        visited: &mut HashSet<ResourceKey>,
    ) -> StorageResult<Vec<StoredResource>> {
        let mut found = Vec::new();
        for directive in directives {
            for resource in from {
                let keys = match directive.include_type {
                    IncludeType::Include => self.referenced_keys_in(conn, directive, resource)?,
                    IncludeType::Revinclude => self.referencing_keys_in(conn, directive, resource)?,
                };
                for (resource_type, id) in keys {
                    if visited.contains(&(resource_type.clone(), id.clone())) {
                        continue;
                    }
                    if let Some(target) = self.load_live_in(conn, &resource_type, &id)? {
                        visited.insert((resource_type, id));
                        found.push(target);
                    }
                }
            }
        }
        Ok(found)
    }

    /// Targets of the references `resource` holds through the directive's parameter.
    fn referenced_keys_in(
        &self,
        conn: &Connection,
        directive: &IncludeDirective,
        resource: &StoredResource,
    ) -> StorageResult<Vec<ResourceKey>> {
        if directive.source_type != "*" && directive.source_type != resource.resource_type() {
            return Ok(Vec::new());
        }

        let resource_type = resource.resource_type();
        let id = resource.id();
        let mut sql = String::from(
            "SELECT target_type, target_id FROM resource_references \
             WHERE source_type = ? AND source_id = ? AND target_type IS NOT NULL",
        );
        let mut args: Vec<&dyn ToSql> = vec![&resource_type, &id];
        if !directive.is_wildcard() {
            sql.push_str(" AND param_name = ?");
            args.push(&directive.search_param);
        }
        if let Some(target) = &directive.target_type {
            sql.push_str(" AND target_type = ?");
            args.push(target);
        }
        sql.push_str(" ORDER BY target_type, target_id");

        query_keys(conn, &sql, &args)
    }

    /// Sources whose references point at `resource` through the directive's parameter.
    fn referencing_keys_in(
        &self,
        conn: &Connection,
        directive: &IncludeDirective,
        resource: &StoredResource,
    ) -> StorageResult<Vec<ResourceKey>> {
        if directive
            .target_type
            .as_deref()
            .is_some_and(|t| t != resource.resource_type())
        {
            return Ok(Vec::new());
        }

        let resource_type = resource.resource_type();
        let id = resource.id();
        let mut sql = String::from(
            "SELECT source_type, source_id FROM resource_references \
             WHERE target_type = ? AND target_id = ?",
        );
        let mut args: Vec<&dyn ToSql> = vec![&resource_type, &id];
        if directive.source_type != "*" {
            sql.push_str(" AND source_type = ?");
            args.push(&directive.source_type);
        }
        if !directive.is_wildcard() {
            sql.push_str(" AND param_name = ?");
            args.push(&directive.search_param);
        }
        sql.push_str(" ORDER BY source_type, source_id");

        query_keys(conn, &sql, &args)
    }
}

fn query_keys(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> StorageResult<Vec<ResourceKey>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let keys = stmt
        .query_map(args, |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
}

fn search_timeout(timeout_ms: u64) -> crate::error::StorageError {
    SearchError::Timeout { timeout_ms }.into()
}

#[async_trait]
impl SearchProvider for SqliteBackend {
    #[instrument(skip(self, query), fields(resource_type = %query.resource_type))]
    async fn search(&self, query: &SearchQuery) -> StorageResult<SearchResult> {
        let query = query.clone();
        self.run_with_deadline(self.search_config().timeout, search_timeout, move |backend, conn, _| {
            backend.search_in(conn, &query)
        })
        .await
    }

    async fn search_count(&self, query: &SearchQuery) -> StorageResult<u64> {
        let query = query.clone();
        self.run_with_deadline(self.search_config().timeout, search_timeout, move |backend, conn, _| {
            backend.search_count_in(conn, &query)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ResourceStorage;
    use serde_json::{Value, json};

    fn backend() -> SqliteBackend {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.init_schema().unwrap();
        backend
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn search(backend: &SqliteBackend, rt: &str, items: &[(&str, &str)]) -> SearchResult {
        let query = backend.parse_query(rt, &pairs(items)).unwrap();
        backend.search(&query).await.unwrap()
    }

    fn ids(resources: &[StoredResource]) -> Vec<String> {
        let mut ids: Vec<String> = resources.iter().map(|r| r.id().to_string()).collect();
        ids.sort();
        ids
    }

    fn observation(id: &str, patient: &str, code: &str) -> Value {
        json!({
            "resourceType": "Observation",
            "id": id,
            "status": "final",
            "code": {"coding": [{"system": "http://loinc.org", "code": code}]},
            "subject": {"reference": format!("Patient/{}", patient)}
        })
    }

    #[tokio::test]
    async fn test_search_by_string_and_token() {
        let backend = backend();
        backend
            .create(
                "Patient",
                json!({"resourceType": "Patient", "id": "a", "name": [{"family": "Smith"}], "gender": "male"}),
            )
            .await
            .unwrap();
        backend
            .create(
                "Patient",
                json!({"resourceType": "Patient", "id": "b", "name": [{"family": "Smithers"}], "gender": "female"}),
            )
            .await
            .unwrap();
        backend
            .create(
                "Patient",
                json!({"resourceType": "Patient", "id": "c", "name": [{"family": "Jones"}]}),
            )
            .await
            .unwrap();

        let result = search(&backend, "Patient", &[("name", "smi")]).await;
        assert_eq!(ids(&result.resources.items), vec!["a", "b"]);
        assert_eq!(result.total(), 2);

        let result = search(&backend, "Patient", &[("name:exact", "Smith")]).await;
        assert_eq!(ids(&result.resources.items), vec!["a"]);

        let result = search(&backend, "Patient", &[("gender", "female")]).await;
        assert_eq!(ids(&result.resources.items), vec!["b"]);

        let result = search(&backend, "Patient", &[("gender:missing", "true")]).await;
        assert_eq!(ids(&result.resources.items), vec!["c"]);
    }

    #[tokio::test]
    async fn test_deleted_resources_never_match() {
        let backend = backend();
        backend
            .create("Patient", json!({"resourceType": "Patient", "id": "a", "name": [{"family": "Smith"}]}))
            .await
            .unwrap();
        backend.delete("Patient", "a").await.unwrap();

        let result = search(&backend, "Patient", &[("name", "Smith")]).await;
        assert!(result.resources.items.is_empty());
        let result = search(&backend, "Patient", &[("gender:not", "male")]).await;
        assert!(result.resources.items.is_empty());
    }

    #[tokio::test]
    async fn test_count_only() {
        let backend = backend();
        for i in 0..3 {
            backend
                .create("Patient", json!({"resourceType": "Patient", "id": format!("p{}", i)}))
                .await
                .unwrap();
        }
        let result = search(&backend, "Patient", &[("_count", "0")]).await;
        assert_eq!(result.total(), 3);
        assert!(result.resources.items.is_empty());
    }

    #[tokio::test]
    async fn test_include_and_revinclude() {
        let backend = backend();
        backend
            .create("Patient", json!({"resourceType": "Patient", "id": "p1"}))
            .await
            .unwrap();
        backend.create("Observation", observation("o1", "p1", "1234-5")).await.unwrap();
        backend.create("Observation", observation("o2", "p1", "2339-0")).await.unwrap();

        let result = search(
            &backend,
            "Observation",
            &[("code", "1234-5"), ("_include", "Observation:subject")],
        )
        .await;
        assert_eq!(ids(&result.resources.items), vec!["o1"]);
        assert_eq!(ids(&result.included), vec!["p1"]);
        assert_eq!(result.total(), 1);

        let result = search(
            &backend,
            "Patient",
            &[("_id", "p1"), ("_revinclude", "Observation:subject")],
        )
        .await;
        assert_eq!(ids(&result.included), vec!["o1", "o2"]);

        let result = search(&backend, "Patient", &[("_id", "p1"), ("_revinclude", "*")]).await;
        assert_eq!(ids(&result.included), vec!["o1", "o2"]);
    }

    #[tokio::test]
    async fn test_include_iterate() {
        let backend = backend();
        backend
            .create("Organization", json!({"resourceType": "Organization", "id": "org1"}))
            .await
            .unwrap();
        backend
            .create(
                "Patient",
                json!({
                    "resourceType": "Patient",
                    "id": "p1",
                    "managingOrganization": {"reference": "Organization/org1"}
                }),
            )
            .await
            .unwrap();
        backend.create("Observation", observation("o1", "p1", "1234-5")).await.unwrap();

        let once = search(
            &backend,
            "Observation",
            &[("_include", "Observation:subject"), ("_include", "Patient:organization")],
        )
        .await;
        assert_eq!(ids(&once.included), vec!["p1"]);

        let iterated = search(
            &backend,
            "Observation",
            &[
                ("_include", "Observation:subject"),
                ("_include:iterate", "Patient:organization"),
            ],
        )
        .await;
        assert_eq!(ids(&iterated.included), vec!["org1", "p1"]);
    }

    #[tokio::test]
    async fn test_paging_has_no_overlap() {
        let backend = backend();
        for i in 0..5 {
            backend
                .create("Patient", json!({"resourceType": "Patient", "id": format!("p{}", i)}))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for page in ["1", "2", "3"] {
            let result = search(&backend, "Patient", &[("_count", "2"), ("_page", page)]).await;
            assert_eq!(result.total(), 5);
            seen.extend(result.resources.items.iter().map(|r| r.id().to_string()));
        }
        seen.sort();
        assert_eq!(seen, vec!["p0", "p1", "p2", "p3", "p4"]);

        let beyond = search(&backend, "Patient", &[("_count", "2"), ("_page", "4")]).await;
        assert!(beyond.resources.items.is_empty());
    }

    #[tokio::test]
    async fn test_sort_by_id_descending() {
        let backend = backend();
        for id in ["b", "a", "c"] {
            backend
                .create("Patient", json!({"resourceType": "Patient", "id": id}))
                .await
                .unwrap();
        }
        let result = search(&backend, "Patient", &[("_sort", "-_id")]).await;
        let order: Vec<&str> = result.resources.items.iter().map(|r| r.id()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_search_count_matches_total() {
        let backend = backend();
        backend.create("Observation", observation("o1", "p1", "1234-5")).await.unwrap();
        let query = backend
            .parse_query("Observation", &pairs(&[("subject", "Patient/p1")]))
            .unwrap();
        assert_eq!(backend.search_count(&query).await.unwrap(), 1);
    }
}
