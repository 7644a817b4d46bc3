//! Chained and reverse-chained (`_has`) search.
//!
//! Both walk `resource_references`, which holds one row per outgoing
//! reference of every live resource. Unresolved `urn:` references carry no
//! target type and never take part in a chain.

use crate::types::{ChainLink, ReverseChainedParameter};

use super::query_builder::{SqlFragment, SqlParam, placeholders, string_params};

/// Builds reference hops around a matching set.
pub struct ChainBuilder;

impl ChainBuilder {
    /// Wraps the set of resources matching a chain's terminal parameter in
    /// one hop per link, innermost first.
    ///
    /// For `Patient?general-practitioner.name=Smith` the terminal set holds
    /// the practitioners named Smith and the result holds the patients
    /// referencing one of them through `general-practitioner`.
    pub fn forward(base_type: &str, chain: &[ChainLink], terminal: SqlFragment) -> SqlFragment {
        let mut set = terminal;
        for (i, link) in chain.iter().enumerate().rev() {
            let sources: Vec<&str> = match i.checked_sub(1) {
                Some(prev) => chain[prev].target_types.iter().map(String::as_str).collect(),
                None => vec![base_type],
            };

            let mut params = string_params(&sources);
            params.push(SqlParam::string(&link.reference_param));
            params.extend(string_params(&link.target_types));
            params.extend(set.params);

            set = SqlFragment::with_params(
                format!(
                    "SELECT rr.source_type, rr.source_id FROM resource_references rr \
                     WHERE rr.source_type IN ({}) AND rr.param_name = ? \
                     AND rr.target_type IN ({}) \
                     AND (rr.target_type, rr.target_id) IN ({})",
                    placeholders(sources.len()),
                    placeholders(link.target_types.len()),
                    set.sql
                ),
                params,
            );
        }
        set
    }

    /// Builds the set of `target_type` resources referenced, through the
    /// `_has` reference parameter, by a source in `sources`.
    pub fn reverse(
        target_type: &str,
        has: &ReverseChainedParameter,
        sources: SqlFragment,
    ) -> SqlFragment {
        let mut params = vec![
            SqlParam::string(&has.source_type),
            SqlParam::string(&has.reference_param),
            SqlParam::string(target_type),
        ];
        params.extend(sources.params);

        SqlFragment::with_params(
            format!(
                "SELECT rr.target_type, rr.target_id FROM resource_references rr \
                 WHERE rr.source_type = ? AND rr.param_name = ? AND rr.target_type = ? \
                 AND (rr.source_type, rr.source_id) IN ({})",
                sources.sql
            ),
            params,
        )
    }
}
