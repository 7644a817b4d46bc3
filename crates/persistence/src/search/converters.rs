//! Value Converters for Search Index.
//!
//! Converts JSON elements reached by a parameter's path into index-friendly
//! values. Each FHIR datatype is mapped onto the typed columns of the
//! `search_index` table:
//!
//! - strings are normalized for default matching and kept raw for `:exact`
//! - codes, Codings, CodeableConcepts, Identifiers and ContactPoints become
//!   `system|code` tokens
//! - dates, dateTimes, instants and Periods become a `[low, high)` UTC range
//! - numbers and quantities keep their decimal value
//! - references are split into target type and id

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::types::{ResourceType, SearchParamType, is_valid_id};

use super::errors::ExtractionError;

/// Lower bound used for open-ended ranges.
pub const DATE_MIN: &str = "0001-01-01T00:00:00.000Z";

/// Upper bound used for open-ended ranges.
pub const DATE_MAX: &str = "9999-12-31T23:59:59.999Z";

/// Precision of a FHIR date value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DatePrecision {
    /// `YYYY`
    Year,
    /// `YYYY-MM`
    Month,
    /// `YYYY-MM-DD`
    Day,
    /// `YYYY-MM-DDThh:mm`
    Minute,
    /// `YYYY-MM-DDThh:mm:ss`
    Second,
    /// Fractional seconds.
    Millisecond,
}

/// The half-open interval `[low, high)` a date value covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    /// Inclusive start.
    pub low: DateTime<Utc>,
    /// Exclusive end.
    pub high: DateTime<Utc>,
    /// Precision of the source value.
    pub precision: DatePrecision,
}

impl DateRange {
    /// Parses a FHIR date, dateTime or instant.
    ///
    /// ```
    /// use fhirvault_persistence::search::converters::{DatePrecision, DateRange};
    ///
    /// let range = DateRange::parse("2024-02").unwrap();
    /// assert_eq!(range.precision, DatePrecision::Month);
    /// assert_eq!(range.low_key(), "2024-02-01T00:00:00.000Z");
    /// assert_eq!(range.high_key(), "2024-03-01T00:00:00.000Z");
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some((date, time)) = s.split_once('T') {
            return Self::parse_date_time(date, time);
        }
        let mut parts = s.split('-');
        let year: i32 = parts.next()?.parse().ok()?;
        let month: Option<u32> = parts.next().map(str::parse).transpose().ok()?;
        let day: Option<u32> = parts.next().map(str::parse).transpose().ok()?;
        if parts.next().is_some() {
            return None;
        }
        match (month, day) {
            (None, _) => {
                let low = midnight(year, 1, 1)?;
                let high = midnight(year + 1, 1, 1)?;
                Some(Self::new(low, high, DatePrecision::Year))
            }
            (Some(m), None) => {
                let low = midnight(year, m, 1)?;
                let (ny, nm) = if m == 12 { (year + 1, 1) } else { (year, m + 1) };
                let high = midnight(ny, nm, 1)?;
                Some(Self::new(low, high, DatePrecision::Month))
            }
            (Some(m), Some(d)) => {
                let low = midnight(year, m, d)?;
                Some(Self::new(low, low + Duration::days(1), DatePrecision::Day))
            }
        }
    }

    fn parse_date_time(date: &str, time: &str) -> Option<Self> {
        let tz_start = time
            .find(['Z', '+'])
            .or_else(|| time.rfind('-'))
            .unwrap_or(time.len());
        let (clock, tz) = time.split_at(tz_start);
        let tz = if tz.is_empty() { "Z" } else { tz };

        let (precision, clock) = match clock.matches(':').count() {
            1 => (DatePrecision::Minute, format!("{}:00", clock)),
            2 if clock.contains('.') => (DatePrecision::Millisecond, clock.to_string()),
            2 => (DatePrecision::Second, clock.to_string()),
            _ => return None,
        };

        let low = DateTime::parse_from_rfc3339(&format!("{}T{}{}", date, clock, tz))
            .ok()?
            .with_timezone(&Utc);
        let width = match precision {
            DatePrecision::Minute => Duration::minutes(1),
            DatePrecision::Second => Duration::seconds(1),
            _ => Duration::milliseconds(1),
        };
        Some(Self::new(low, low + width, precision))
    }

    /// Creates a range.
    pub fn new(low: DateTime<Utc>, high: DateTime<Utc>, precision: DatePrecision) -> Self {
        Self {
            low,
            high,
            precision,
        }
    }

    /// Returns the sortable text form of the low bound.
    pub fn low_key(&self) -> String {
        date_key(&self.low)
    }

    /// Returns the sortable text form of the high bound.
    pub fn high_key(&self) -> String {
        date_key(&self.high)
    }
}

fn midnight(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
    Some(
        NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_opt(0, 0, 0)?
            .and_utc(),
    )
}

/// Formats an instant as fixed-width text that sorts chronologically.
pub fn date_key(dt: &DateTime<Utc>) -> String {
    if dt.year() < 1 {
        return DATE_MIN.to_string();
    }
    if dt.year() > 9999 {
        return DATE_MAX.to_string();
    }
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parses a decimal, accepting scientific notation.
pub fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

/// Returns the interval implied by a decimal's precision.
///
/// `100` covers `[99.5, 100.5)` and `1.50` covers `[1.495, 1.505)`.
pub fn implied_range(value: Decimal) -> (Decimal, Decimal) {
    let half = Decimal::new(5, (value.scale() + 1).min(28));
    (value - half, value + half)
}

/// A reference split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReference {
    /// The reference exactly as written.
    pub reference: String,
    /// Target type. `None` for unresolved `urn:uuid:` references.
    pub target_type: Option<String>,
    /// Target id, or the full URN when unresolved.
    pub target_id: String,
}

impl ParsedReference {
    /// Parses `Type/id`, `Type/id/_history/v`, absolute URLs ending in
    /// `Type/id` and `urn:uuid:` forms. Contained (`#x`) references yield `None`.
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        if reference.is_empty() || reference.starts_with('#') {
            return None;
        }
        if reference.starts_with("urn:") {
            return Some(Self {
                reference: reference.to_string(),
                target_type: None,
                target_id: reference.to_string(),
            });
        }

        let path = reference.split(['?', '#']).next().unwrap_or(reference);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let segments = match segments.iter().rposition(|s| *s == "_history") {
            Some(pos) => &segments[..pos],
            None => &segments[..],
        };
        let [.., type_name, id] = segments else {
            return None;
        };
        if type_name.parse::<ResourceType>().is_err() || !is_valid_id(id) {
            return None;
        }
        Some(Self {
            reference: reference.to_string(),
            target_type: Some(type_name.to_string()),
            target_id: id.to_string(),
        })
    }

    /// Returns `Type/id`, or the URN when unresolved.
    pub fn local_reference(&self) -> String {
        match &self.target_type {
            Some(t) => format!("{}/{}", t, self.target_id),
            None => self.target_id.clone(),
        }
    }
}

/// A value extracted and converted for the search index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    /// String value.
    String {
        /// Lowercased, whitespace-collapsed form.
        normalized: String,
        /// The raw value.
        exact: String,
    },

    /// Token value (code with optional system).
    Token {
        /// Code system URI.
        system: Option<String>,
        /// Code value.
        code: String,
    },

    /// Date range.
    Date(DateRange),

    /// Numeric value.
    Number(Decimal),

    /// Quantity value.
    Quantity {
        /// Numeric value.
        value: Decimal,
        /// Human readable unit.
        unit: Option<String>,
        /// Unit system URI.
        system: Option<String>,
        /// Coded unit.
        code: Option<String>,
    },

    /// Reference to another resource.
    Reference(ParsedReference),

    /// URI value.
    Uri(String),
}

impl IndexValue {
    /// Creates a string index value.
    pub fn string(s: &str) -> Self {
        IndexValue::String {
            normalized: normalize_string(s),
            exact: s.to_string(),
        }
    }

    /// Creates a token index value.
    pub fn token(system: Option<&str>, code: impl Into<String>) -> Self {
        IndexValue::Token {
            system: system.map(String::from),
            code: code.into(),
        }
    }

    /// Returns the parameter type this value is stored under.
    pub fn param_type(&self) -> SearchParamType {
        match self {
            IndexValue::String { .. } => SearchParamType::String,
            IndexValue::Token { .. } => SearchParamType::Token,
            IndexValue::Date(_) => SearchParamType::Date,
            IndexValue::Number(_) => SearchParamType::Number,
            IndexValue::Quantity { .. } => SearchParamType::Quantity,
            IndexValue::Reference(_) => SearchParamType::Reference,
            IndexValue::Uri(_) => SearchParamType::Uri,
        }
    }
}

/// Normalizes a string for default and `:contains` matching.
pub fn normalize_string(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Converter for transforming JSON values to index values.
pub struct ValueConverter;

impl ValueConverter {
    /// Converts a JSON value to index values based on the target parameter type.
    ///
    /// Arrays are flattened. Elements of an unexpected shape produce no values.
    pub fn convert(
        value: &Value,
        target_type: SearchParamType,
        param_name: &str,
    ) -> Result<Vec<IndexValue>, ExtractionError> {
        match value {
            Value::Array(arr) => {
                let mut results = Vec::new();
                for item in arr {
                    results.extend(Self::convert_single(item, target_type, param_name)?);
                }
                Ok(results)
            }
            _ => Self::convert_single(value, target_type, param_name),
        }
    }

    fn convert_single(
        value: &Value,
        target_type: SearchParamType,
        param_name: &str,
    ) -> Result<Vec<IndexValue>, ExtractionError> {
        match target_type {
            SearchParamType::String => Ok(Self::convert_to_string(value)),
            SearchParamType::Token => Ok(Self::convert_to_token(value)),
            SearchParamType::Date => Self::convert_to_date(value, param_name),
            SearchParamType::Number => Self::convert_to_number(value, param_name),
            SearchParamType::Quantity => Self::convert_to_quantity(value, param_name),
            SearchParamType::Reference => Ok(Self::convert_to_reference(value)),
            SearchParamType::Uri => Ok(Self::convert_to_uri(value)),
            SearchParamType::Composite | SearchParamType::Special => Ok(Vec::new()),
        }
    }

    fn convert_to_string(value: &Value) -> Vec<IndexValue> {
        let mut results = Vec::new();
        match value {
            Value::String(s) => results.push(IndexValue::string(s)),
            Value::Object(obj) => {
                // HumanName and Address parts
                for key in ["family", "text", "city", "district", "state", "postalCode", "country"]
                {
                    if let Some(s) = obj.get(key).and_then(Value::as_str) {
                        results.push(IndexValue::string(s));
                    }
                }
                for key in ["given", "prefix", "suffix", "line"] {
                    if let Some(parts) = obj.get(key).and_then(Value::as_array) {
                        results.extend(parts.iter().filter_map(Value::as_str).map(IndexValue::string));
                    }
                }
            }
            _ => {}
        }
        results
    }

    fn convert_to_token(value: &Value) -> Vec<IndexValue> {
        let mut results = Vec::new();
        match value {
            Value::String(s) => results.push(IndexValue::token(None, s.clone())),
            Value::Bool(b) => results.push(IndexValue::token(None, b.to_string())),
            Value::Object(obj) => {
                let system = obj.get("system").and_then(Value::as_str);

                // CodeableReference
                if let Some(concept) = obj.get("concept") {
                    results.extend(Self::convert_to_token(concept));
                }

                // CodeableConcept
                if let Some(codings) = obj.get("coding").and_then(Value::as_array) {
                    for coding in codings {
                        if let Some(code) = coding.get("code").and_then(Value::as_str) {
                            let system = coding.get("system").and_then(Value::as_str);
                            results.push(IndexValue::token(system, code));
                        }
                    }
                }

                // Coding
                if let Some(code) = obj.get("code").and_then(Value::as_str) {
                    results.push(IndexValue::token(system, code));
                }

                // Identifier and ContactPoint
                if !obj.contains_key("code") {
                    if let Some(v) = obj.get("value").and_then(Value::as_str) {
                        results.push(IndexValue::token(system, v));
                    }
                }
            }
            _ => {}
        }
        results
    }

    fn convert_to_date(
        value: &Value,
        param_name: &str,
    ) -> Result<Vec<IndexValue>, ExtractionError> {
        let failed = |actual: &str| ExtractionError::ConversionFailed {
            param_name: param_name.to_string(),
            expected_type: "date".to_string(),
            actual_value: actual.to_string(),
        };
        match value {
            Value::String(s) => {
                let range = DateRange::parse(s).ok_or_else(|| failed(s))?;
                Ok(vec![IndexValue::Date(range)])
            }
            Value::Object(obj) if obj.contains_key("start") || obj.contains_key("end") => {
                // Period
                let bound = |key: &str| -> Result<Option<DateRange>, ExtractionError> {
                    match obj.get(key).and_then(Value::as_str) {
                        Some(s) => DateRange::parse(s).map(Some).ok_or_else(|| failed(s)),
                        None => Ok(None),
                    }
                };
                let start = bound("start")?;
                let end = bound("end")?;
                let low = start.map(|r| r.low).unwrap_or(DateTime::<Utc>::MIN_UTC);
                let high = end.map(|r| r.high).unwrap_or(DateTime::<Utc>::MAX_UTC);
                let precision = start
                    .or(end)
                    .map(|r| r.precision)
                    .unwrap_or(DatePrecision::Millisecond);
                Ok(vec![IndexValue::Date(DateRange::new(low, high, precision))])
            }
            _ => Ok(Vec::new()),
        }
    }

    fn convert_to_number(
        value: &Value,
        param_name: &str,
    ) -> Result<Vec<IndexValue>, ExtractionError> {
        let text = match value {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => return Ok(Vec::new()),
        };
        let number = parse_decimal(&text).ok_or_else(|| ExtractionError::ConversionFailed {
            param_name: param_name.to_string(),
            expected_type: "number".to_string(),
            actual_value: text.clone(),
        })?;
        Ok(vec![IndexValue::Number(number)])
    }

    fn convert_to_quantity(
        value: &Value,
        param_name: &str,
    ) -> Result<Vec<IndexValue>, ExtractionError> {
        let Value::Object(obj) = value else {
            return Ok(Vec::new());
        };
        let Some(raw) = obj.get("value") else {
            return Ok(Vec::new());
        };
        let number = match Self::convert_to_number(raw, param_name)?.pop() {
            Some(IndexValue::Number(n)) => n,
            _ => return Ok(Vec::new()),
        };
        let field = |key: &str| obj.get(key).and_then(Value::as_str).map(String::from);
        Ok(vec![IndexValue::Quantity {
            value: number,
            unit: field("unit"),
            system: field("system"),
            code: field("code"),
        }])
    }

    fn convert_to_reference(value: &Value) -> Vec<IndexValue> {
        match value {
            Value::String(s) => ParsedReference::parse(s)
                .map(IndexValue::Reference)
                .into_iter()
                .collect(),
            Value::Object(obj) => match obj.get("reference") {
                Some(Value::String(s)) => ParsedReference::parse(s)
                    .map(IndexValue::Reference)
                    .into_iter()
                    .collect(),
                // CodeableReference
                Some(inner @ Value::Object(_)) => Self::convert_to_reference(inner),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn convert_to_uri(value: &Value) -> Vec<IndexValue> {
        match value {
            Value::String(s) => vec![IndexValue::Uri(s.clone())],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_date_range_precisions() {
        let year = DateRange::parse("2024").unwrap();
        assert_eq!(year.precision, DatePrecision::Year);
        assert_eq!(year.high_key(), "2025-01-01T00:00:00.000Z");

        let december = DateRange::parse("2023-12").unwrap();
        assert_eq!(december.high_key(), "2024-01-01T00:00:00.000Z");

        let day = DateRange::parse("2024-01-15").unwrap();
        assert_eq!(day.low_key(), "2024-01-15T00:00:00.000Z");
        assert_eq!(day.high_key(), "2024-01-16T00:00:00.000Z");
    }

    #[test]
    fn test_date_time_normalized_to_utc() {
        let range = DateRange::parse("2024-01-15T10:30:00+02:00").unwrap();
        assert_eq!(range.precision, DatePrecision::Second);
        assert_eq!(range.low_key(), "2024-01-15T08:30:00.000Z");
        assert_eq!(range.high_key(), "2024-01-15T08:30:01.000Z");

        let minute = DateRange::parse("2024-01-15T10:30Z").unwrap();
        assert_eq!(minute.precision, DatePrecision::Minute);

        let millis = DateRange::parse("2024-01-15T10:30:00.123Z").unwrap();
        assert_eq!(millis.precision, DatePrecision::Millisecond);
        assert_eq!(millis.low_key(), "2024-01-15T10:30:00.123Z");
    }

    #[test]
    fn test_invalid_dates() {
        assert!(DateRange::parse("2024-13").is_none());
        assert!(DateRange::parse("not-a-date").is_none());
        assert!(DateRange::parse("2024-02-30").is_none());
    }

    #[test]
    fn test_implied_range() {
        let (low, high) = implied_range(Decimal::from(100));
        assert_eq!(low, Decimal::from_str("99.5").unwrap());
        assert_eq!(high, Decimal::from_str("100.5").unwrap());

        let (low, high) = implied_range(Decimal::from_str("1.50").unwrap());
        assert_eq!(low, Decimal::from_str("1.495").unwrap());
        assert_eq!(high, Decimal::from_str("1.505").unwrap());
    }

    #[test]
    fn test_parse_reference() {
        let r = ParsedReference::parse("Patient/123").unwrap();
        assert_eq!(r.target_type.as_deref(), Some("Patient"));
        assert_eq!(r.target_id, "123");

        let r = ParsedReference::parse("http://example.org/fhir/Practitioner/abc/_history/2").unwrap();
        assert_eq!(r.local_reference(), "Practitioner/abc");

        let r = ParsedReference::parse("urn:uuid:61ebe359-bfdc-4613-8bf2-c5e300945f0a").unwrap();
        assert!(r.target_type.is_none());

        assert!(ParsedReference::parse("#contained").is_none());
        assert!(ParsedReference::parse("NotAType/1").is_none());
    }

    #[test]
    fn test_convert_human_name() {
        let values = ValueConverter::convert(
            &json!({"family": "Smith", "given": ["John", "Q"]}),
            SearchParamType::String,
            "name",
        )
        .unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(
            values[0],
            IndexValue::String {
                normalized: "smith".to_string(),
                exact: "Smith".to_string()
            }
        );
    }

    #[test]
    fn test_convert_codeable_concept() {
        let values = ValueConverter::convert(
            &json!({"coding": [{"system": "http://loinc.org", "code": "2339-0"}], "text": "Glucose"}),
            SearchParamType::Token,
            "code",
        )
        .unwrap();
        assert_eq!(
            values,
            vec![IndexValue::token(Some("http://loinc.org"), "2339-0")]
        );
    }

    #[test]
    fn test_convert_identifier_and_boolean() {
        let values = ValueConverter::convert(
            &json!([{"system": "http://hospital.org/mrn", "value": "12345"}, true]),
            SearchParamType::Token,
            "identifier",
        )
        .unwrap();
        assert_eq!(
            values,
            vec![
                IndexValue::token(Some("http://hospital.org/mrn"), "12345"),
                IndexValue::token(None, "true"),
            ]
        );
    }

    #[test]
    fn test_convert_codeable_reference() {
        let value = json!({"concept": {"coding": [{"code": "aspirin"}]}});
        let tokens = ValueConverter::convert(&value, SearchParamType::Token, "code").unwrap();
        assert_eq!(tokens, vec![IndexValue::token(None, "aspirin")]);

        let value = json!({"reference": {"reference": "Medication/m1"}});
        let refs = ValueConverter::convert(&value, SearchParamType::Reference, "medication").unwrap();
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_convert_period() {
        let values = ValueConverter::convert(
            &json!({"start": "2024-01-01"}),
            SearchParamType::Date,
            "date",
        )
        .unwrap();
        let IndexValue::Date(range) = &values[0] else {
            panic!("expected date");
        };
        assert_eq!(range.low_key(), "2024-01-01T00:00:00.000Z");
        assert_eq!(range.high_key(), DATE_MAX);
    }

    #[test]
    fn test_convert_quantity() {
        let values = ValueConverter::convert(
            &json!({"value": 110, "unit": "mg/dL", "system": "http://unitsofmeasure.org", "code": "mg/dL"}),
            SearchParamType::Quantity,
            "value-quantity",
        )
        .unwrap();
        assert_eq!(
            values,
            vec![IndexValue::Quantity {
                value: Decimal::from(110),
                unit: Some("mg/dL".to_string()),
                system: Some("http://unitsofmeasure.org".to_string()),
                code: Some("mg/dL".to_string()),
            }]
        );
    }

    #[test]
    fn test_bad_date_is_an_error() {
        let result = ValueConverter::convert(&json!("yesterday"), SearchParamType::Date, "date");
        assert!(result.is_err());
    }
}
