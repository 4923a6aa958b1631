//! Fixture values and their conversion into SQL statement inputs.
//!
//! Scalar values map directly to bound parameters. Two kinds of string get
//! special treatment: strings starting with the `RAW=` marker are spliced
//! into the statement verbatim, and strings matching one of the recognized
//! date/time layouts are bound as typed temporal values so that the server
//! receives a real date instead of text. Nested sequences and mappings are
//! serialized to a JSON string, which is what JSON-typed columns expect.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;

use crate::backend::SqlValue;

/// Marker prefix for values spliced into SQL without binding.
pub const RAW_MARKER: &str = "RAW=";

/// A single value from a fixture record.
#[derive(Debug, Clone, PartialEq)]
pub enum FixtureValue {
	/// Explicit null.
	Null,
	/// Boolean scalar.
	Bool(bool),
	/// Integer scalar.
	Int(i64),
	/// Floating point scalar.
	Float(f64),
	/// String scalar, inspected for the `RAW=` marker and temporal layouts.
	Str(String),
	/// Nested sequence, bound as a JSON string.
	List(Vec<FixtureValue>),
	/// Nested mapping, bound as a JSON string. Key order is preserved.
	Map(IndexMap<String, FixtureValue>),
}

impl From<bool> for FixtureValue {
	fn from(value: bool) -> Self {
		FixtureValue::Bool(value)
	}
}

impl From<i64> for FixtureValue {
	fn from(value: i64) -> Self {
		FixtureValue::Int(value)
	}
}

impl From<i32> for FixtureValue {
	fn from(value: i32) -> Self {
		FixtureValue::Int(value.into())
	}
}

impl From<f64> for FixtureValue {
	fn from(value: f64) -> Self {
		FixtureValue::Float(value)
	}
}

impl From<&str> for FixtureValue {
	fn from(value: &str) -> Self {
		FixtureValue::Str(value.to_string())
	}
}

impl From<String> for FixtureValue {
	fn from(value: String) -> Self {
		FixtureValue::Str(value)
	}
}

impl serde::Serialize for FixtureValue {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		match self {
			FixtureValue::Null => serializer.serialize_unit(),
			FixtureValue::Bool(v) => serializer.serialize_bool(*v),
			FixtureValue::Int(v) => serializer.serialize_i64(*v),
			FixtureValue::Float(v) => serializer.serialize_f64(*v),
			FixtureValue::Str(v) => serializer.serialize_str(v),
			FixtureValue::List(items) => serializer.collect_seq(items),
			FixtureValue::Map(entries) => serializer.collect_map(entries),
		}
	}
}

impl FixtureValue {
	/// Converts a parsed YAML value, rejecting shapes that have no SQL
	/// equivalent. Unknown YAML tags are unwrapped to their inner value.
	#[cfg(feature = "yaml")]
	pub(crate) fn from_yaml(value: serde_yaml::Value) -> Result<Self, String> {
		match value {
			serde_yaml::Value::Null => Ok(FixtureValue::Null),
			serde_yaml::Value::Bool(v) => Ok(FixtureValue::Bool(v)),
			serde_yaml::Value::Number(n) => {
				if let Some(v) = n.as_i64() {
					Ok(FixtureValue::Int(v))
				} else if let Some(v) = n.as_u64() {
					i64::try_from(v)
						.map(FixtureValue::Int)
						.map_err(|_| format!("integer {v} is out of range"))
				} else if let Some(v) = n.as_f64() {
					Ok(FixtureValue::Float(v))
				} else {
					Err(format!("unsupported number {n}"))
				}
			}
			serde_yaml::Value::String(v) => Ok(FixtureValue::Str(v)),
			serde_yaml::Value::Sequence(items) => items
				.into_iter()
				.map(FixtureValue::from_yaml)
				.collect::<Result<Vec<_>, _>>()
				.map(FixtureValue::List),
			serde_yaml::Value::Mapping(entries) => {
				let mut map = IndexMap::with_capacity(entries.len());
				for (key, value) in entries {
					let serde_yaml::Value::String(key) = key else {
						return Err("mapping keys must be strings".to_string());
					};
					map.insert(key, FixtureValue::from_yaml(value)?);
				}
				Ok(FixtureValue::Map(map))
			}
			serde_yaml::Value::Tagged(tagged) => FixtureValue::from_yaml(tagged.value),
		}
	}

	/// Converts a parsed JSON value.
	pub(crate) fn from_json(value: serde_json::Value) -> Result<Self, String> {
		match value {
			serde_json::Value::Null => Ok(FixtureValue::Null),
			serde_json::Value::Bool(v) => Ok(FixtureValue::Bool(v)),
			serde_json::Value::Number(n) => {
				if let Some(v) = n.as_i64() {
					Ok(FixtureValue::Int(v))
				} else if let Some(v) = n.as_f64() {
					Ok(FixtureValue::Float(v))
				} else {
					Err(format!("integer {n} is out of range"))
				}
			}
			serde_json::Value::String(v) => Ok(FixtureValue::Str(v)),
			serde_json::Value::Array(items) => items
				.into_iter()
				.map(FixtureValue::from_json)
				.collect::<Result<Vec<_>, _>>()
				.map(FixtureValue::List),
			serde_json::Value::Object(entries) => {
				let mut map = IndexMap::with_capacity(entries.len());
				for (key, value) in entries {
					map.insert(key, FixtureValue::from_json(value)?);
				}
				Ok(FixtureValue::Map(map))
			}
		}
	}
}

/// A fixture value converted for use in an INSERT statement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EncodedValue {
	/// SQL text spliced directly into the VALUES list.
	Fragment(String),
	/// A value bound through a placeholder.
	Param(SqlValue),
}

/// Converts a fixture value into either a SQL fragment or a bound parameter.
pub(crate) fn encode(value: &FixtureValue) -> Result<EncodedValue, String> {
	match value {
		FixtureValue::Null => Ok(EncodedValue::Fragment("NULL".to_string())),
		FixtureValue::Bool(v) => Ok(EncodedValue::Param(SqlValue::Bool(*v))),
		FixtureValue::Int(v) => Ok(EncodedValue::Param(SqlValue::Int(*v))),
		FixtureValue::Float(v) => Ok(EncodedValue::Param(SqlValue::Float(*v))),
		FixtureValue::Str(v) => {
			if let Some(raw) = v.strip_prefix(RAW_MARKER) {
				return Ok(EncodedValue::Fragment(raw.to_string()));
			}
			if let Some(temporal) = try_parse_temporal(v) {
				return Ok(EncodedValue::Param(temporal));
			}
			Ok(EncodedValue::Param(SqlValue::Text(v.clone())))
		}
		FixtureValue::List(_) | FixtureValue::Map(_) => {
			if let Some(bad) = first_non_finite(value) {
				return Err(format!("nested value is not valid JSON: non-finite number {bad}"));
			}
			let json = serde_json::to_string(value)
				.map_err(|err| format!("nested value is not valid JSON: {err}"))?;
			Ok(EncodedValue::Param(SqlValue::Text(json)))
		}
	}
}

// JSON has no representation for NaN or the infinities; serde_json would
// write `null` instead of failing.
fn first_non_finite(value: &FixtureValue) -> Option<f64> {
	match value {
		FixtureValue::Float(v) if !v.is_finite() => Some(*v),
		FixtureValue::List(items) => items.iter().find_map(first_non_finite),
		FixtureValue::Map(entries) => entries.values().find_map(first_non_finite),
		_ => None,
	}
}

enum LayoutKind {
	Date,
	DateTime,
}

/// Recognized layouts without a zone, tried in order. A layout only matches
/// when it consumes the whole string.
const NAIVE_LAYOUTS: &[(&str, LayoutKind)] = &[
	("%Y-%m-%d", LayoutKind::Date),
	("%Y-%m-%d %H:%M", LayoutKind::DateTime),
	("%Y-%m-%d %H:%M:%S", LayoutKind::DateTime),
	("%Y%m%d", LayoutKind::Date),
	("%Y%m%d %H:%M", LayoutKind::DateTime),
	("%Y%m%d %H:%M:%S", LayoutKind::DateTime),
	("%d/%m/%Y", LayoutKind::Date),
	("%d/%m/%Y %H:%M", LayoutKind::DateTime),
	("%d/%m/%Y %H:%M:%S", LayoutKind::DateTime),
];

/// Zone-carrying layouts tried after RFC 3339.
const ZONED_LAYOUTS: &[&str] = &[
	"%Y-%m-%dT%H:%M%:z",
	"%Y-%m-%dT%H:%M:%S%:z",
	"%Y-%m-%d %H:%M:%S%:z",
	"%Y-%m-%dT%H:%M:%S%z",
	"%Y-%m-%d %H:%M:%S%z",
];

/// Tries the recognized date/time layouts against a string, returning the
/// typed value on the first match.
pub(crate) fn try_parse_temporal(text: &str) -> Option<SqlValue> {
	for (layout, kind) in NAIVE_LAYOUTS {
		match kind {
			LayoutKind::Date => {
				if let Ok(date) = NaiveDate::parse_from_str(text, layout) {
					return Some(SqlValue::Date(date));
				}
			}
			LayoutKind::DateTime => {
				if let Ok(datetime) = NaiveDateTime::parse_from_str(text, layout) {
					return Some(SqlValue::DateTime(datetime));
				}
			}
		}
	}
	if let Ok(zoned) = DateTime::parse_from_rfc3339(text) {
		return Some(SqlValue::TimestampTz(zoned.with_timezone(&Utc)));
	}
	for layout in ZONED_LAYOUTS {
		if let Ok(zoned) = DateTime::parse_from_str(text, layout) {
			return Some(SqlValue::TimestampTz(zoned.with_timezone(&Utc)));
		}
	}
	// Space-separated variant of RFC 3339, e.g. "2021-01-02 15:04:05Z".
	if let Some((date, time)) = text.split_once(' ') {
		if let Ok(zoned) = DateTime::parse_from_rfc3339(&format!("{date}T{time}")) {
			return Some(SqlValue::TimestampTz(zoned.with_timezone(&Utc)));
		}
	}
	None
}
