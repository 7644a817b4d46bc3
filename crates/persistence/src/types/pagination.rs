//! Pagination types for search results.
//!
//! Searches page by number: `_page` is 1-based and the offset of a page is
//! `(page - 1) * count`. Links are rebuilt from the query's own parameters so
//! that following `next` repeatedly never revisits a resource.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Information about a page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    /// The 1-based page number.
    pub page: u32,

    /// The page size the query asked for.
    pub count: u32,

    /// Total count of matching resources.
    pub total: u64,
}

impl PageInfo {
    /// Creates page info for the given page.
    pub fn new(page: u32, count: u32, total: u64) -> Self {
        Self { page, count, total }
    }

    /// Returns the row offset of this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.count)
    }

    /// Whether there are more results after this page.
    pub fn has_next(&self) -> bool {
        self.count > 0 && u64::from(self.page) * u64::from(self.count) < self.total
    }

    /// Whether there are results before this page.
    pub fn has_previous(&self) -> bool {
        self.page > 1 && self.total > 0
    }
}

/// A page of search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    /// The items in this page.
    pub items: Vec<T>,

    /// Pagination information.
    pub page_info: PageInfo,
}

impl<T> Page<T> {
    /// Creates a new page with the given items and page info.
    pub fn new(items: Vec<T>, page_info: PageInfo) -> Self {
        Self { items, page_info }
    }

    /// Returns true if this page has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the number of items in this page.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Maps the items to a different type.
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page_info: self.page_info,
        }
    }
}

/// A FHIR Bundle for search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchBundle {
    /// The bundle type (always "searchset").
    #[serde(rename = "type")]
    pub bundle_type: String,

    /// Total count of matching resources.
    pub total: Option<u64>,

    /// Links for pagination.
    pub link: Vec<BundleLink>,

    /// The bundle entries.
    pub entry: Vec<BundleEntry>,
}

/// A link in a FHIR Bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleLink {
    /// The relation type (self, next, previous).
    pub relation: String,

    /// The URL.
    pub url: String,
}

/// An entry in a FHIR Bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntry {
    /// The full URL of the resource.
    #[serde(rename = "fullUrl", skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,

    /// The resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,

    /// Search information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<BundleEntrySearch>,
}

/// Search information for a bundle entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleEntrySearch {
    /// How this entry matched the search (match, include, outcome).
    pub mode: SearchEntryMode,
}

/// How a bundle entry matched the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchEntryMode {
    /// This is a match to the search parameters.
    Match,
    /// This is included because of _include/_revinclude.
    Include,
    /// This is an OperationOutcome about the search.
    Outcome,
}

impl SearchBundle {
    /// Creates a new search bundle.
    pub fn new() -> Self {
        Self {
            bundle_type: "searchset".to_string(),
            total: None,
            link: Vec::new(),
            entry: Vec::new(),
        }
    }

    /// Sets the total count.
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    /// Adds a link.
    pub fn with_link(mut self, relation: impl Into<String>, url: impl Into<String>) -> Self {
        self.link.push(BundleLink {
            relation: relation.into(),
            url: url.into(),
        });
        self
    }

    /// Adds an entry.
    pub fn with_entry(mut self, entry: BundleEntry) -> Self {
        self.entry.push(entry);
        self
    }

    /// Adds `self`, and where applicable `next` and `previous`, links.
    ///
    /// `base` is the search URL without paging parameters, e.g.
    /// `Patient?name=Smith`.
    pub fn with_paging_links(mut self, base: &str, info: &PageInfo) -> Self {
        self = self.with_link("self", page_url(base, info.page, info.count));
        if info.has_next() {
            self = self.with_link("next", page_url(base, info.page + 1, info.count));
        }
        if info.has_previous() {
            self = self.with_link("previous", page_url(base, info.page - 1, info.count));
        }
        self
    }

    /// Returns the URL of the link with the given relation.
    pub fn link_url(&self, relation: &str) -> Option<&str> {
        self.link
            .iter()
            .find(|l| l.relation == relation)
            .map(|l| l.url.as_str())
    }

    /// Returns the number of `match` entries.
    pub fn match_count(&self) -> usize {
        self.entry
            .iter()
            .filter(|e| {
                e.search
                    .as_ref()
                    .is_some_and(|s| s.mode == SearchEntryMode::Match)
            })
            .count()
    }

    /// Renders the bundle as a FHIR `Bundle` resource.
    pub fn to_json(&self) -> Value {
        let mut bundle = Map::new();
        bundle.insert("resourceType".to_string(), json!("Bundle"));
        bundle.insert("type".to_string(), json!(self.bundle_type));
        if let Some(total) = self.total {
            bundle.insert("total".to_string(), json!(total));
        }
        if !self.link.is_empty() {
            bundle.insert(
                "link".to_string(),
                Value::Array(self.link.iter().map(|l| json!(l)).collect()),
            );
        }
        if !self.entry.is_empty() {
            bundle.insert(
                "entry".to_string(),
                Value::Array(self.entry.iter().map(|e| json!(e)).collect()),
            );
        }
        Value::Object(bundle)
    }
}

impl Default for SearchBundle {
    fn default() -> Self {
        Self::new()
    }
}

fn page_url(base: &str, page: u32, count: u32) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}_count={}&_page={}", base, separator, count, page)
}

impl BundleEntry {
    /// Creates a new match entry.
    pub fn match_entry(full_url: impl Into<String>, resource: Value) -> Self {
        Self::with_mode(full_url, resource, SearchEntryMode::Match)
    }

    /// Creates a new include entry.
    pub fn include_entry(full_url: impl Into<String>, resource: Value) -> Self {
        Self::with_mode(full_url, resource, SearchEntryMode::Include)
    }

    /// Creates an entry with the given search mode.
    pub fn with_mode(full_url: impl Into<String>, resource: Value, mode: SearchEntryMode) -> Self {
        Self {
            full_url: Some(full_url.into()),
            resource: Some(resource),
            search: Some(BundleEntrySearch { mode }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_info_navigation() {
        let first = PageInfo::new(1, 10, 25);
        assert!(first.has_next());
        assert!(!first.has_previous());
        assert_eq!(first.offset(), 0);

        let last = PageInfo::new(3, 10, 25);
        assert!(!last.has_next());
        assert!(last.has_previous());
        assert_eq!(last.offset(), 20);

        let single = PageInfo::new(1, 10, 1);
        assert!(!single.has_next());
        assert!(!single.has_previous());
    }

    #[test]
    fn test_count_only_has_no_next() {
        let info = PageInfo::new(1, 0, 42);
        assert!(!info.has_next());
    }

    #[test]
    fn test_paging_links() {
        let bundle =
            SearchBundle::new().with_paging_links("Patient?name=Smith", &PageInfo::new(2, 10, 35));

        assert_eq!(
            bundle.link_url("self"),
            Some("Patient?name=Smith&_count=10&_page=2")
        );
        assert_eq!(
            bundle.link_url("next"),
            Some("Patient?name=Smith&_count=10&_page=3")
        );
        assert_eq!(
            bundle.link_url("previous"),
            Some("Patient?name=Smith&_count=10&_page=1")
        );
    }

    #[test]
    fn test_empty_result_links() {
        let bundle = SearchBundle::new()
            .with_total(0)
            .with_paging_links("Patient", &PageInfo::new(1, 10, 0));

        assert_eq!(bundle.link.len(), 1);
        assert_eq!(bundle.link_url("self"), Some("Patient?_count=10&_page=1"));
        let json = bundle.to_json();
        assert_eq!(json["total"], 0);
        assert!(json.get("entry").is_none());
    }

    #[test]
    fn test_page_map() {
        let page = Page::new(vec![1, 2, 3], PageInfo::new(1, 10, 3));

        let mapped = page.map(|x| x * 2);
        assert_eq!(mapped.items, vec![2, 4, 6]);
    }

    #[test]
    fn test_bundle_entry_modes() {
        let bundle = SearchBundle::new()
            .with_entry(BundleEntry::match_entry(
                "Patient/1",
                serde_json::json!({"resourceType": "Patient"}),
            ))
            .with_entry(BundleEntry::include_entry(
                "Organization/1",
                serde_json::json!({"resourceType": "Organization"}),
            ));

        assert_eq!(bundle.match_count(), 1);
        let json = bundle.to_json();
        assert_eq!(json["entry"][1]["search"]["mode"], "include");
    }
}
