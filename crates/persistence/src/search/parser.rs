//! Search query parsing.
//!
//! Turns raw `(name, value)` query parameters into a [`SearchQuery`] whose
//! parameters are all resolved against the registry. Control parameters
//! (`_count`, `_page`, `_sort`, `_include`, `_revinclude`, `_has`) are
//! validated here so the backend only ever sees well-formed queries.
//!
//! Unknown parameter names are ignored. Known parameters with malformed
//! values are rejected.

use tracing::debug;

use crate::error::{SearchError, StorageError, StorageResult, ValidationError};
use crate::types::{
    ChainLink, CompositeSearchComponent, IncludeDirective, IncludeType, ResourceType,
    ReverseChainedParameter, SearchModifier, SearchParamType, SearchParameter, SearchQuery,
    SearchValue, SortDirective,
};

use super::converters::{DateRange, parse_decimal};
use super::registry::{SearchParameterDefinition, SearchParameterRegistry};

/// Default page size.
pub const DEFAULT_COUNT: u32 = 10;

/// Largest page size honoured; larger requests are capped.
pub const MAX_COUNT: u32 = 1000;

/// Parameters accepted but without effect on the query.
const IGNORED_CONTROL: &[&str] = &["_format", "_pretty", "_summary", "_elements", "_total"];

/// Splits a URL query string into decoded `(name, value)` pairs.
pub fn parse_query_string(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn invalid(parameter: &str, message: impl Into<String>) -> StorageError {
    ValidationError::InvalidSearchParameter {
        parameter: parameter.to_string(),
        message: message.into(),
    }
    .into()
}

/// Splits a value on unescaped commas, unescaping `\,`.
fn split_or_values(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek().is_some_and(|n| matches!(n, ',' | '$' | '|' | '\\')) => {
                if let Some(next) = chars.next() {
                    if next != ',' {
                        current.push('\\');
                    }
                    current.push(next);
                }
            }
            ',' => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

/// Parses raw search parameters into a [`SearchQuery`].
#[derive(Debug)]
pub struct SearchQueryParser<'a> {
    registry: &'a SearchParameterRegistry,
    default_count: u32,
    max_count: u32,
}

impl<'a> SearchQueryParser<'a> {
    /// Creates a parser over the given registry.
    pub fn new(registry: &'a SearchParameterRegistry) -> Self {
        Self {
            registry,
            default_count: DEFAULT_COUNT,
            max_count: MAX_COUNT,
        }
    }

    /// Overrides the page size rules.
    pub fn with_count_limits(mut self, default_count: u32, max_count: u32) -> Self {
        self.default_count = default_count;
        self.max_count = max_count;
        self
    }

    /// Parses the parameters of a search on `resource_type`.
    pub fn parse(
        &self,
        resource_type: &str,
        params: &[(String, String)],
    ) -> StorageResult<SearchQuery> {
        ResourceType::parse_storable(resource_type)?;

        let mut query = SearchQuery::new(resource_type);

        for (key, value) in params {
            let key = key.trim();
            match key {
                "_count" => {
                    query.count = Some(self.parse_count(value)?);
                    continue;
                }
                "_page" => {
                    let page = value
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|p| *p >= 1)
                        .ok_or_else(|| invalid("_page", "must be a positive integer"))?;
                    query.page = Some(page);
                    continue;
                }
                "_sort" => {
                    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        query.sort.push(self.parse_sort(resource_type, item)?);
                    }
                }
                "_include" | "_include:iterate" | "_revinclude" | "_revinclude:iterate" => {
                    query.includes.push(self.parse_include(key, value)?);
                }
                k if k.starts_with("_has:") => {
                    query
                        .reverse_chains
                        .push(self.parse_has(resource_type, key, value)?);
                }
                k if IGNORED_CONTROL.contains(&k) => {
                    debug!(parameter = k, "Ignoring control parameter");
                    continue;
                }
                _ => match self.parse_parameter(resource_type, key, value)? {
                    Some(param) => query.parameters.push(param),
                    None => continue,
                },
            }
            query.link_params.push((key.to_string(), value.clone()));
        }

        if query.count.is_none() {
            query.count = Some(self.default_count);
        }
        Ok(query)
    }

    fn parse_count(&self, value: &str) -> StorageResult<u32> {
        let count = value
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid("_count", format!("'{}' is not an integer", value)))?;
        if count < 0 {
            return Err(invalid("_count", "must not be negative"));
        }
        Ok(u32::try_from(count).unwrap_or(u32::MAX).min(self.max_count))
    }

    fn parse_sort(&self, resource_type: &str, item: &str) -> StorageResult<SortDirective> {
        let mut directive = SortDirective::parse(item);
        directive.param_type = match directive.parameter.as_str() {
            "_id" => SearchParamType::Token,
            "_lastUpdated" => SearchParamType::Date,
            name => {
                let def = self
                    .registry
                    .get_param(resource_type, name)
                    .ok_or_else(|| invalid("_sort", format!("unknown parameter '{}'", name)))?;
                match def.param_type {
                    SearchParamType::Composite | SearchParamType::Special => {
                        return Err(invalid(
                            "_sort",
                            format!("cannot sort by {} parameter '{}'", def.param_type, name),
                        ));
                    }
                    t => t,
                }
            }
        };
        Ok(directive)
    }

    fn parse_include(&self, key: &str, value: &str) -> StorageResult<IncludeDirective> {
        let include_type = if key.starts_with("_revinclude") {
            IncludeType::Revinclude
        } else {
            IncludeType::Include
        };
        let iterate = key.ends_with(":iterate");

        let value = value.trim();
        // A bare `*` follows every reference parameter of every source type.
        if value == "*" {
            return Ok(IncludeDirective {
                include_type,
                source_type: "*".to_string(),
                search_param: "*".to_string(),
                target_type: None,
                iterate,
            });
        }

        let mut parts = value.split(':');
        let source_type = parts.next().unwrap_or_default();
        let search_param = parts
            .next()
            .ok_or_else(|| invalid(key, format!("'{}' must be Type:parameter", value)))?;
        let target_type = parts.next().map(String::from);

        ResourceType::parse_storable(source_type).map_err(|_| {
            invalid(key, format!("unknown resource type '{}'", source_type))
        })?;

        if search_param != "*" {
            let def = self
                .registry
                .get_param(source_type, search_param)
                .filter(|d| d.param_type == SearchParamType::Reference)
                .ok_or_else(|| {
                    invalid(
                        key,
                        format!("'{}' is not a reference parameter of {}", search_param, source_type),
                    )
                })?;
            if let Some(target) = &target_type {
                if !def.target.is_empty() && !def.target.contains(target) {
                    return Err(invalid(
                        key,
                        format!("{} cannot target {}", search_param, target),
                    ));
                }
            }
        }

        Ok(IncludeDirective {
            include_type,
            source_type: source_type.to_string(),
            search_param: search_param.to_string(),
            target_type,
            iterate,
        })
    }

    fn parse_has(
        &self,
        resource_type: &str,
        key: &str,
        value: &str,
    ) -> StorageResult<ReverseChainedParameter> {
        let parts: Vec<&str> = key.splitn(4, ':').collect();
        let [_, source_type, reference_param, rest] = parts[..] else {
            return Err(SearchError::InvalidChain {
                chain: key.to_string(),
                message: "expected _has:Type:reference:parameter".to_string(),
            }
            .into());
        };

        ResourceType::parse_storable(source_type)?;
        let reference = self
            .registry
            .get_param(source_type, reference_param)
            .filter(|d| d.param_type == SearchParamType::Reference)
            .ok_or_else(|| SearchError::InvalidChain {
                chain: key.to_string(),
                message: format!(
                    "'{}' is not a reference parameter of {}",
                    reference_param, source_type
                ),
            })?;
        if !reference.target.is_empty() && !reference.target.iter().any(|t| t == resource_type) {
            return Err(SearchError::InvalidChain {
                chain: key.to_string(),
                message: format!("{}.{} never targets {}", source_type, reference_param, resource_type),
            }
            .into());
        }

        let parameter = self
            .parse_parameter(source_type, rest, value)?
            .ok_or_else(|| SearchError::InvalidChain {
                chain: key.to_string(),
                message: format!("unknown parameter '{}' on {}", rest, source_type),
            })?;

        Ok(ReverseChainedParameter {
            source_type: source_type.to_string(),
            reference_param: reference_param.to_string(),
            parameter,
        })
    }

    /// Parses one ordinary (possibly chained) parameter. Returns `None` for
    /// unknown names.
    fn parse_parameter(
        &self,
        resource_type: &str,
        key: &str,
        value: &str,
    ) -> StorageResult<Option<SearchParameter>> {
        let segments: Vec<&str> = key.split('.').collect();
        let (terminal, links) = match segments.split_last() {
            Some((terminal, links)) => (*terminal, links),
            None => return Ok(None),
        };

        let (chain, terminal_types) = if links.is_empty() {
            (Vec::new(), vec![resource_type.to_string()])
        } else {
            self.resolve_chain(resource_type, key, links, terminal)?
        };

        let (name, modifier) = match terminal.split_once(':') {
            Some((name, modifier)) => (name, Some(modifier)),
            None => (terminal, None),
        };

        let Some(def) = terminal_types
            .iter()
            .find_map(|t| self.registry.get_param(t, name))
        else {
            debug!(resource_type, parameter = key, "Ignoring unknown search parameter");
            return Ok(None);
        };

        let modifier = match modifier {
            Some(m) => {
                let parsed = SearchModifier::parse(m).ok_or_else(|| SearchError::UnsupportedModifier {
                    modifier: m.to_string(),
                    param_type: def.param_type.to_string(),
                })?;
                if !parsed.is_valid_for(def.param_type) {
                    return Err(SearchError::UnsupportedModifier {
                        modifier: m.to_string(),
                        param_type: def.param_type.to_string(),
                    }
                    .into());
                }
                Some(parsed)
            }
            None => None,
        };

        let raw_values = split_or_values(value);
        if raw_values.is_empty() {
            return Ok(None);
        }

        let values = if modifier == Some(SearchModifier::Missing) {
            for v in &raw_values {
                if v != "true" && v != "false" {
                    return Err(invalid(key, ":missing takes true or false"));
                }
            }
            raw_values.into_iter().map(SearchValue::eq).collect()
        } else {
            raw_values
                .iter()
                .map(|v| self.parse_value(key, &def, v))
                .collect::<StorageResult<Vec<_>>>()?
        };

        let mut param = SearchParameter::new(name, def.param_type, values);
        param.modifier = modifier;
        param.chain = chain;
        param.components = def
            .component
            .iter()
            .map(|c| CompositeSearchComponent {
                param_type: c.param_type,
                param_code: c.code.clone(),
            })
            .collect();
        Ok(Some(param))
    }

    /// Resolves the reference hops of a chained parameter, returning the
    /// links and the types the terminal parameter is evaluated on.
    fn resolve_chain(
        &self,
        resource_type: &str,
        key: &str,
        links: &[&str],
        terminal: &str,
    ) -> StorageResult<(Vec<ChainLink>, Vec<String>)> {
        let chain_error = |message: String| -> StorageError {
            SearchError::InvalidChain {
                chain: key.to_string(),
                message,
            }
            .into()
        };

        let mut current = vec![resource_type.to_string()];
        let mut chain = Vec::new();

        for (i, link) in links.iter().enumerate() {
            let (reference_param, type_modifier) = match link.split_once(':') {
                Some((p, t)) => (p, Some(t)),
                None => (*link, None),
            };

            let mut targets: Vec<String> = Vec::new();
            let mut found = false;
            for source in &current {
                if let Some(def) = self
                    .registry
                    .get_param(source, reference_param)
                    .filter(|d| d.param_type == SearchParamType::Reference)
                {
                    found = true;
                    for t in &def.target {
                        if !targets.contains(t) {
                            targets.push(t.clone());
                        }
                    }
                }
            }
            if !found {
                return Err(chain_error(format!(
                    "'{}' is not a reference parameter",
                    reference_param
                )));
            }

            if let Some(t) = type_modifier {
                if !targets.is_empty() && !targets.iter().any(|x| x == t) {
                    return Err(chain_error(format!("{} cannot target {}", reference_param, t)));
                }
                targets = vec![t.to_string()];
            }

            // Keep only targets on which the next hop is defined
            let next = links.get(i + 1).copied().unwrap_or(terminal);
            let next_name = next.split(':').next().unwrap_or(next);
            let is_last_hop = i + 1 == links.len();
            targets.retain(|t| {
                self.registry.get_param(t, next_name).is_some_and(|d| {
                    is_last_hop || d.param_type == SearchParamType::Reference
                })
            });
            if targets.is_empty() {
                return Err(chain_error(format!(
                    "no target of '{}' defines '{}'",
                    reference_param, next_name
                )));
            }

            chain.push(ChainLink {
                reference_param: reference_param.to_string(),
                target_types: targets.clone(),
            });
            current = targets;
        }

        Ok((chain, current))
    }

    fn parse_value(
        &self,
        key: &str,
        def: &SearchParameterDefinition,
        raw: &str,
    ) -> StorageResult<SearchValue> {
        let value = SearchValue::parse(raw, def.param_type);
        match def.param_type {
            SearchParamType::Date => {
                DateRange::parse(&value.value)
                    .ok_or_else(|| invalid(key, format!("'{}' is not a valid date", value.value)))?;
            }
            SearchParamType::Number => {
                parse_decimal(&value.value)
                    .ok_or_else(|| invalid(key, format!("'{}' is not a number", value.value)))?;
            }
            SearchParamType::Quantity => {
                let number = value.value.split('|').next().unwrap_or_default();
                parse_decimal(number)
                    .ok_or_else(|| invalid(key, format!("'{}' is not a quantity", value.value)))?;
            }
            SearchParamType::Composite => {
                let parts = value.value.split('$').count();
                if parts != def.component.len() {
                    return Err(SearchError::InvalidComposite {
                        message: format!(
                            "{} expects {} components, got {}",
                            def.code,
                            def.component.len(),
                            parts
                        ),
                    }
                    .into());
                }
            }
            _ => {}
        }
        Ok(value)
    }
}
