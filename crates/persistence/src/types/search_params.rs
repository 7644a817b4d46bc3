//! FHIR search parameter types.
//!
//! This module defines types for representing FHIR search parameters,
//! including parameter types, modifiers, and prefixes. A [`SearchQuery`] is
//! the planner's input: every parameter in it is already resolved against the
//! registry, so backends never see unknown names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// FHIR search parameter types.
///
/// See: https://build.fhir.org/search.html#ptypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParamType {
    /// A simple string, like a name or description.
    String,
    /// A search against a URI.
    Uri,
    /// A search for a number.
    Number,
    /// A search for a date, dateTime, or period.
    Date,
    /// A quantity, with a number and units.
    Quantity,
    /// A code from a code system or value set.
    Token,
    /// A reference to another resource.
    Reference,
    /// A composite search parameter that combines others.
    Composite,
    /// Special search parameters (_id, _lastUpdated).
    Special,
}

impl SearchParamType {
    /// Returns the lowercase FHIR name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchParamType::String => "string",
            SearchParamType::Uri => "uri",
            SearchParamType::Number => "number",
            SearchParamType::Date => "date",
            SearchParamType::Quantity => "quantity",
            SearchParamType::Token => "token",
            SearchParamType::Reference => "reference",
            SearchParamType::Composite => "composite",
            SearchParamType::Special => "special",
        }
    }
}

impl fmt::Display for SearchParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchParamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" => Ok(SearchParamType::String),
            "uri" => Ok(SearchParamType::Uri),
            "number" => Ok(SearchParamType::Number),
            "date" => Ok(SearchParamType::Date),
            "quantity" => Ok(SearchParamType::Quantity),
            "token" => Ok(SearchParamType::Token),
            "reference" => Ok(SearchParamType::Reference),
            "composite" => Ok(SearchParamType::Composite),
            "special" => Ok(SearchParamType::Special),
            _ => Err(format!("unknown search parameter type: {}", s)),
        }
    }
}

/// Search modifiers that can be applied to search parameters.
///
/// See: https://build.fhir.org/search.html#modifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchModifier {
    /// Exact string match (string parameters).
    Exact,
    /// Contains substring (string parameters).
    Contains,
    /// Negation - exclude matches (token parameters).
    Not,
    /// Match if value is missing.
    Missing,
    /// Specify reference type (reference parameters).
    Type(String),
    /// Iterate through results (_include modifier).
    Iterate,
}

impl fmt::Display for SearchModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchModifier::Exact => write!(f, "exact"),
            SearchModifier::Contains => write!(f, "contains"),
            SearchModifier::Not => write!(f, "not"),
            SearchModifier::Missing => write!(f, "missing"),
            SearchModifier::Type(t) => write!(f, "{}", t),
            SearchModifier::Iterate => write!(f, "iterate"),
        }
    }
}

impl SearchModifier {
    /// Parses a modifier string, returning None for unknown modifiers.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(SearchModifier::Exact),
            "contains" => Some(SearchModifier::Contains),
            "not" => Some(SearchModifier::Not),
            "missing" => Some(SearchModifier::Missing),
            "iterate" => Some(SearchModifier::Iterate),
            _ => {
                // Resource type modifiers are capitalized
                if s.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) {
                    Some(SearchModifier::Type(s.to_string()))
                } else {
                    None
                }
            }
        }
    }

    /// Returns true if this modifier is valid for the given parameter type.
    pub fn is_valid_for(&self, param_type: SearchParamType) -> bool {
        match self {
            SearchModifier::Exact | SearchModifier::Contains => {
                param_type == SearchParamType::String
            }
            SearchModifier::Not => param_type == SearchParamType::Token,
            SearchModifier::Missing => param_type != SearchParamType::Special,
            SearchModifier::Type(_) => param_type == SearchParamType::Reference,
            SearchModifier::Iterate => false,
        }
    }
}

/// Comparison prefixes for search parameters.
///
/// See: https://build.fhir.org/search.html#prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchPrefix {
    /// Equal (default).
    #[default]
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Less than.
    Lt,
    /// Greater than or equal.
    Ge,
    /// Less than or equal.
    Le,
    /// Starts after.
    Sa,
    /// Ends before.
    Eb,
    /// Approximately equal.
    Ap,
}

impl fmt::Display for SearchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchPrefix::Eq => write!(f, "eq"),
            SearchPrefix::Ne => write!(f, "ne"),
            SearchPrefix::Gt => write!(f, "gt"),
            SearchPrefix::Lt => write!(f, "lt"),
            SearchPrefix::Ge => write!(f, "ge"),
            SearchPrefix::Le => write!(f, "le"),
            SearchPrefix::Sa => write!(f, "sa"),
            SearchPrefix::Eb => write!(f, "eb"),
            SearchPrefix::Ap => write!(f, "ap"),
        }
    }
}

impl FromStr for SearchPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(SearchPrefix::Eq),
            "ne" => Ok(SearchPrefix::Ne),
            "gt" => Ok(SearchPrefix::Gt),
            "lt" => Ok(SearchPrefix::Lt),
            "ge" => Ok(SearchPrefix::Ge),
            "le" => Ok(SearchPrefix::Le),
            "sa" => Ok(SearchPrefix::Sa),
            "eb" => Ok(SearchPrefix::Eb),
            "ap" => Ok(SearchPrefix::Ap),
            _ => Err(format!("unknown search prefix: {}", s)),
        }
    }
}

impl SearchPrefix {
    /// Extracts a prefix from the beginning of a value string.
    ///
    /// Returns the prefix and the remaining value. Only ordered types carry
    /// prefixes, so callers pass the parameter type to avoid eating the first
    /// two letters of a token such as `ge-123`.
    pub fn extract(value: &str, param_type: SearchParamType) -> (Self, &str) {
        if value.len() > 2 && value.is_char_boundary(2) {
            if let Ok(p) = value[..2].parse::<SearchPrefix>() {
                if p.is_valid_for(param_type) {
                    return (p, &value[2..]);
                }
            }
        }
        (SearchPrefix::Eq, value)
    }

    /// Returns true if this prefix is valid for the given parameter type.
    pub fn is_valid_for(&self, param_type: SearchParamType) -> bool {
        match self {
            SearchPrefix::Eq => true,
            SearchPrefix::Ne
            | SearchPrefix::Gt
            | SearchPrefix::Lt
            | SearchPrefix::Ge
            | SearchPrefix::Le
            | SearchPrefix::Ap => {
                matches!(
                    param_type,
                    SearchParamType::Number | SearchParamType::Date | SearchParamType::Quantity
                )
            }
            SearchPrefix::Sa | SearchPrefix::Eb => param_type == SearchParamType::Date,
        }
    }
}

/// A single search value with optional prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchValue {
    /// The comparison prefix.
    pub prefix: SearchPrefix,

    /// The value to search for.
    pub value: String,
}

impl SearchValue {
    /// Creates a new search value with the given prefix and value.
    pub fn new(prefix: SearchPrefix, value: impl Into<String>) -> Self {
        Self {
            prefix,
            value: value.into(),
        }
    }

    /// Creates a search value with the default (eq) prefix.
    pub fn eq(value: impl Into<String>) -> Self {
        Self::new(SearchPrefix::Eq, value)
    }

    /// Parses a value string, extracting any prefix valid for the type.
    pub fn parse(s: &str, param_type: SearchParamType) -> Self {
        let (prefix, value) = SearchPrefix::extract(s, param_type);
        Self::new(prefix, value)
    }
}

/// One component of a composite search parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSearchComponent {
    /// The component's type (token, quantity, date, ...).
    pub param_type: SearchParamType,
    /// The code of the component's underlying search parameter.
    pub param_code: String,
}

/// A single link in a forward chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLink {
    /// The reference parameter being chained through.
    pub reference_param: String,
    /// The resource types the reference may resolve to.
    ///
    /// Holds exactly the `:Type` modifier when one was given, otherwise every
    /// registered target that defines the next step in the chain.
    pub target_types: Vec<String>,
}

/// A parsed search parameter with its value.
///
/// For chained parameters (`general-practitioner.name=Smith`) the `name`,
/// `param_type` and `values` describe the terminal parameter, and `chain`
/// lists the references walked from the searched type to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParameter {
    /// The parameter name (e.g., "name", "identifier").
    pub name: String,

    /// The parameter type.
    pub param_type: SearchParamType,

    /// Modifier, if any.
    pub modifier: Option<SearchModifier>,

    /// The search value(s). Multiple values are ORed.
    pub values: Vec<SearchValue>,

    /// Chain links from the searched type to the terminal parameter.
    pub chain: Vec<ChainLink>,

    /// Components for composite parameters.
    pub components: Vec<CompositeSearchComponent>,
}

impl SearchParameter {
    /// Creates a simple parameter with no modifier, chain or components.
    pub fn new(
        name: impl Into<String>,
        param_type: SearchParamType,
        values: Vec<SearchValue>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            modifier: None,
            values,
            chain: Vec::new(),
            components: Vec::new(),
        }
    }

    /// Returns the resource types the terminal parameter is evaluated on.
    pub fn terminal_types<'a>(&'a self, base_type: &'a str) -> Vec<&'a str> {
        match self.chain.last() {
            Some(link) => link.target_types.iter().map(String::as_str).collect(),
            None => vec![base_type],
        }
    }
}

/// A reverse chained parameter (_has).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseChainedParameter {
    /// The resource type that references this resource.
    pub source_type: String,

    /// The reference parameter on the source type.
    pub reference_param: String,

    /// The criterion the source resource must meet.
    pub parameter: SearchParameter,
}

/// Include directive for _include and _revinclude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncludeDirective {
    /// The type of include.
    pub include_type: IncludeType,

    /// The source resource type (the type holding the reference).
    pub source_type: String,

    /// The search parameter (reference) to follow, or `*` for all.
    pub search_param: String,

    /// Optional target resource type filter.
    pub target_type: Option<String>,

    /// Whether to iterate (follow includes of included resources).
    pub iterate: bool,
}

impl IncludeDirective {
    /// Returns true for the `*` wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.search_param == "*"
    }
}

/// Type of include operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncludeType {
    /// Forward include (_include).
    Include,
    /// Reverse include (_revinclude).
    Revinclude,
}

/// Sort direction for _sort parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SortDirection {
    /// Ascending order.
    #[default]
    Ascending,
    /// Descending order.
    Descending,
}

/// A sort directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortDirective {
    /// The parameter to sort by.
    pub parameter: String,
    /// The parameter's type, used to pick the index column.
    pub param_type: SearchParamType,
    /// The sort direction.
    pub direction: SortDirection,
}

impl SortDirective {
    /// Parses a sort parameter value (e.g., "-date" for descending).
    ///
    /// The type defaults to [`SearchParamType::Special`] and is filled in by
    /// the query parser once the parameter is resolved.
    pub fn parse(s: &str) -> Self {
        let (parameter, direction) = match s.strip_prefix('-') {
            Some(stripped) => (stripped, SortDirection::Descending),
            None => (s, SortDirection::Ascending),
        };
        Self {
            parameter: parameter.to_string(),
            param_type: SearchParamType::Special,
            direction,
        }
    }
}

/// A complete search query with all parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// The resource type being searched.
    pub resource_type: String,

    /// Standard search parameters. Repeated parameters are ANDed.
    pub parameters: Vec<SearchParameter>,

    /// Reverse chain parameters (_has).
    pub reverse_chains: Vec<ReverseChainedParameter>,

    /// Include directives.
    pub includes: Vec<IncludeDirective>,

    /// Sort directives.
    pub sort: Vec<SortDirective>,

    /// Page size (_count). `Some(0)` requests the total only.
    pub count: Option<u32>,

    /// 1-based page number (_page).
    pub page: Option<u32>,

    /// Raw parameters echoed into paging links, without `_count` and `_page`.
    pub link_params: Vec<(String, String)>,
}

impl SearchQuery {
    /// Creates a new search query for the given resource type.
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    /// Adds a search parameter.
    pub fn with_parameter(mut self, param: SearchParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Adds a sort directive.
    pub fn with_sort(mut self, sort: SortDirective) -> Self {
        self.sort.push(sort);
        self
    }

    /// Sets the count limit.
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Returns true when only the total is requested (`_count=0`).
    pub fn is_count_only(&self) -> bool {
        self.count == Some(0)
    }

    /// Returns the 1-based page number.
    pub fn page_number(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_param_type_display() {
        assert_eq!(SearchParamType::String.to_string(), "string");
        assert_eq!(SearchParamType::Token.to_string(), "token");
        assert_eq!(SearchParamType::Reference.to_string(), "reference");
    }

    #[test]
    fn test_search_param_type_parse() {
        assert_eq!(
            "string".parse::<SearchParamType>().unwrap(),
            SearchParamType::String
        );
        assert_eq!(
            "TOKEN".parse::<SearchParamType>().unwrap(),
            SearchParamType::Token
        );
    }

    #[test]
    fn test_search_modifier_parse() {
        assert_eq!(SearchModifier::parse("exact"), Some(SearchModifier::Exact));
        assert_eq!(
            SearchModifier::parse("contains"),
            Some(SearchModifier::Contains)
        );
        assert_eq!(
            SearchModifier::parse("Patient"),
            Some(SearchModifier::Type("Patient".to_string()))
        );
        assert_eq!(SearchModifier::parse("below"), None);
    }

    #[test]
    fn test_search_modifier_validity() {
        assert!(SearchModifier::Exact.is_valid_for(SearchParamType::String));
        assert!(!SearchModifier::Exact.is_valid_for(SearchParamType::Token));
        assert!(!SearchModifier::Contains.is_valid_for(SearchParamType::Token));
        assert!(SearchModifier::Missing.is_valid_for(SearchParamType::Token));
        assert!(SearchModifier::Not.is_valid_for(SearchParamType::Token));
        assert!(SearchModifier::Missing.is_valid_for(SearchParamType::Date));
        assert!(!SearchModifier::Type("Patient".into()).is_valid_for(SearchParamType::String));
    }

    #[test]
    fn test_search_prefix_extract() {
        assert_eq!(
            SearchPrefix::extract("gt2020-01-01", SearchParamType::Date),
            (SearchPrefix::Gt, "2020-01-01")
        );
        assert_eq!(
            SearchPrefix::extract("2020-01-01", SearchParamType::Date),
            (SearchPrefix::Eq, "2020-01-01")
        );
        assert_eq!(
            SearchPrefix::extract("le100", SearchParamType::Number),
            (SearchPrefix::Le, "100")
        );
        // Tokens never carry prefixes
        assert_eq!(
            SearchPrefix::extract("ge-123", SearchParamType::Token),
            (SearchPrefix::Eq, "ge-123")
        );
    }

    #[test]
    fn test_search_prefix_validity() {
        assert!(SearchPrefix::Gt.is_valid_for(SearchParamType::Number));
        assert!(SearchPrefix::Gt.is_valid_for(SearchParamType::Date));
        assert!(!SearchPrefix::Gt.is_valid_for(SearchParamType::String));
        assert!(SearchPrefix::Sa.is_valid_for(SearchParamType::Date));
        assert!(!SearchPrefix::Sa.is_valid_for(SearchParamType::Number));
    }

    #[test]
    fn test_sort_directive_parse() {
        let asc = SortDirective::parse("date");
        assert_eq!(asc.parameter, "date");
        assert_eq!(asc.direction, SortDirection::Ascending);

        let desc = SortDirective::parse("-date");
        assert_eq!(desc.parameter, "date");
        assert_eq!(desc.direction, SortDirection::Descending);
    }

    #[test]
    fn test_search_query_builder() {
        let query = SearchQuery::new("Patient")
            .with_count(0)
            .with_sort(SortDirective::parse("-_lastUpdated"));

        assert_eq!(query.resource_type, "Patient");
        assert!(query.is_count_only());
        assert_eq!(query.page_number(), 1);
        assert_eq!(query.sort.len(), 1);
    }

    #[test]
    fn test_terminal_types() {
        let mut param = SearchParameter::new(
            "name",
            SearchParamType::String,
            vec![SearchValue::eq("Smith")],
        );
        assert_eq!(param.terminal_types("Patient"), vec!["Patient"]);

        param.chain.push(ChainLink {
            reference_param: "general-practitioner".to_string(),
            target_types: vec!["Practitioner".to_string(), "Organization".to_string()],
        });
        assert_eq!(
            param.terminal_types("Patient"),
            vec!["Practitioner", "Organization"]
        );
    }
}
