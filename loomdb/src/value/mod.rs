use crate::schema::DataType;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};

/// A record payload: field slug -> value, ordered by slug.
pub type Payload = BTreeMap<String, FieldValue>;

/// A single payload value. The variant is chosen by the field's DataType
/// when decoding, never guessed from the JSON shape alone (except for Json
/// fields, which hold arbitrary structures).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Number(serde_json::Number),
    /// Canonical decimal string; kept as text so no precision is lost.
    Decimal(String),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Decode a JSON value for a field of the given type. The error is a
    /// human-readable violation message.
    pub fn decode(data_type: DataType, json: &serde_json::Value) -> Result<FieldValue, String> {
        use serde_json::Value as J;

        if json.is_null() {
            return Ok(FieldValue::Null);
        }

        match data_type {
            DataType::Text
            | DataType::Note
            | DataType::File
            | DataType::Enum
            | DataType::Lookup => match json {
                J::String(s) => Ok(FieldValue::Text(s.clone())),
                other => Err(format!("expected a string, got {}", kind_of(other))),
            },
            DataType::Number => match json {
                J::Number(n) => Ok(FieldValue::Number(n.clone())),
                other => Err(format!("expected a number, got {}", kind_of(other))),
            },
            DataType::Decimal => match json {
                J::Number(n) => Ok(FieldValue::Decimal(n.to_string())),
                J::String(s) => parse_decimal(s)
                    .map(FieldValue::Decimal)
                    .ok_or_else(|| format!("'{s}' is not a decimal number")),
                other => Err(format!("expected a decimal, got {}", kind_of(other))),
            },
            DataType::Boolean => match json {
                J::Bool(b) => Ok(FieldValue::Boolean(*b)),
                other => Err(format!("expected a boolean, got {}", kind_of(other))),
            },
            DataType::Date => match json {
                J::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map(FieldValue::Date)
                    .map_err(|_| format!("'{s}' is not a date (YYYY-MM-DD)")),
                other => Err(format!("expected a date string, got {}", kind_of(other))),
            },
            DataType::DateTime => match json {
                J::String(s) => DateTime::parse_from_rfc3339(s)
                    .map(|dt| FieldValue::DateTime(dt.with_timezone(&Utc)))
                    .map_err(|_| format!("'{s}' is not an RFC 3339 datetime")),
                other => Err(format!("expected a datetime string, got {}", kind_of(other))),
            },
            DataType::Json => Ok(FieldValue::from_json(json)),
            DataType::Tags => {
                let raw: Vec<String> = match json {
                    J::String(s) => s.split(',').map(str::to_string).collect(),
                    J::Array(items) => {
                        let mut tags = Vec::with_capacity(items.len());
                        for item in items {
                            match item {
                                J::String(s) => tags.push(s.clone()),
                                other => {
                                    return Err(format!(
                                        "tags must be strings, got {}",
                                        kind_of(other)
                                    ))
                                }
                            }
                        }
                        tags
                    }
                    other => return Err(format!("expected a list of tags, got {}", kind_of(other))),
                };
                Ok(FieldValue::List(
                    normalize_tags(raw).into_iter().map(FieldValue::Text).collect(),
                ))
            }
        }
    }

    /// Untyped conversion, used for Json fields.
    pub fn from_json(json: &serde_json::Value) -> FieldValue {
        use serde_json::Value as J;
        match json {
            J::Null => FieldValue::Null,
            J::Bool(b) => FieldValue::Boolean(*b),
            J::Number(n) => FieldValue::Number(n.clone()),
            J::String(s) => FieldValue::Text(s.clone()),
            J::Array(items) => FieldValue::List(items.iter().map(FieldValue::from_json).collect()),
            J::Object(map) => FieldValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            FieldValue::Null => J::Null,
            FieldValue::Text(s) | FieldValue::Decimal(s) => J::String(s.clone()),
            FieldValue::Number(n) => J::Number(n.clone()),
            FieldValue::Boolean(b) => J::Bool(*b),
            FieldValue::Date(d) => J::String(d.format("%Y-%m-%d").to_string()),
            // Fixed-width so stored datetimes sort correctly as text.
            FieldValue::DateTime(dt) => J::String(dt.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            FieldValue::List(items) => J::Array(items.iter().map(FieldValue::to_json).collect()),
            FieldValue::Map(map) => J::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Key under which value-equal entries compare equal: `1` and `1.0`
    /// share a key, as do `"10.5"` and `"10.50"`. Numbers compare by their
    /// digits, so integers beyond f64 precision stay distinct.
    pub fn unique_key(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            FieldValue::Number(n) => canonical_decimal(&n.to_string())
                .map(J::String)
                .unwrap_or_else(|| J::Number(n.clone())),
            FieldValue::Decimal(s) => J::String(canonical_decimal(s).unwrap_or_else(|| s.clone())),
            other => other.to_json(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => n.as_f64(),
            FieldValue::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Plain text used for the full-text index.
    pub fn search_text(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Text(s) | FieldValue::Decimal(s) => s.clone(),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::Date(_) | FieldValue::DateTime(_) => match self.to_json() {
                serde_json::Value::String(s) => s,
                _ => String::new(),
            },
            FieldValue::List(items) => join_nonempty(items.iter().map(FieldValue::search_text)),
            FieldValue::Map(map) => join_nonempty(map.values().map(FieldValue::search_text)),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Render a payload as a JSON object.
pub fn payload_to_json(payload: &Payload) -> serde_json::Value {
    serde_json::Value::Object(
        payload
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Trim, lower-case, drop empties, de-duplicate and sort.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = tags
        .into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    set.into_iter().collect()
}

/// Exponents beyond this are rejected rather than expanded.
const MAX_DECIMAL_EXPONENT: u64 = 1024;

/// Validate decimal text. Exponent notation (`1e-7`, `2.5E+3`) is expanded
/// into plain digits; plain input is kept as written, trailing zeros included.
fn parse_decimal(s: &str) -> Option<String> {
    let trimmed = s.trim();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(pos) => (&unsigned[..pos], Some(&unsigned[pos + 1..])),
        None => (unsigned, None),
    };
    let (whole, frac) = match mantissa.split_once('.') {
        Some((whole, frac)) => (whole, Some(frac)),
        None => (mantissa, None),
    };
    let all_digits = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
    if !all_digits(whole) || frac.is_some_and(|f| !all_digits(f)) {
        return None;
    }

    let Some(exponent) = exponent else {
        return Some(trimmed.to_string());
    };
    let exponent: i64 = exponent.parse().ok()?;
    if exponent.unsigned_abs() > MAX_DECIMAL_EXPONENT {
        return None;
    }

    let digits = format!("{whole}{}", frac.unwrap_or_default());
    let point = whole.len() as i64 + exponent;
    let (int_part, frac_part) = if point <= 0 {
        ("0".to_string(), format!("{}{digits}", "0".repeat(point.unsigned_abs() as usize)))
    } else if point as usize >= digits.len() {
        (format!("{digits}{}", "0".repeat(point as usize - digits.len())), String::new())
    } else {
        let (int_part, frac_part) = digits.split_at(point as usize);
        (int_part.to_string(), frac_part.to_string())
    };

    let int_part = match int_part.trim_start_matches('0') {
        "" => "0",
        rest => rest,
    };
    let sign = if negative { "-" } else { "" };
    Some(if frac_part.is_empty() {
        format!("{sign}{int_part}")
    } else {
        format!("{sign}{int_part}.{frac_part}")
    })
}

/// One spelling per value: no leading or trailing zeros, no negative zero.
fn canonical_decimal(s: &str) -> Option<String> {
    let plain = parse_decimal(s)?;
    let (negative, unsigned) = match plain.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, plain.as_str()),
    };
    let (whole, frac) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let whole = match whole.trim_start_matches('0') {
        "" => "0",
        rest => rest,
    };
    let frac = frac.trim_end_matches('0');

    let mut out = String::new();
    if negative && (whole != "0" || !frac.is_empty()) {
        out.push('-');
    }
    out.push_str(whole);
    if !frac.is_empty() {
        out.push('.');
        out.push_str(frac);
    }
    Some(out)
}

fn join_nonempty(parts: impl Iterator<Item = String>) -> String {
    parts.filter(|p| !p.is_empty()).collect::<Vec<_>>().join(" ")
}

fn kind_of(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
