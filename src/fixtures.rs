//! Fixture sources and their parsed form.
//!
//! A fixture source is a named YAML or JSON document describing the rows of
//! one table (or, for multi-table sources, of several). Sources are usually
//! file contents, but nothing here touches the filesystem; callers hand in
//! the text and a name, and the name doubles as the table name once its
//! extension is stripped.

use indexmap::IndexMap;

use crate::error::{FixtureError, Result};
use crate::value::FixtureValue;

/// Serialization format of a fixture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureFormat {
	/// YAML, the default (requires the `yaml` feature).
	Yaml,
	/// JSON.
	Json,
}

impl FixtureFormat {
	/// Detects the format from a source name extension, if recognized.
	pub fn from_source_name(name: &str) -> Option<Self> {
		let lower = name.to_lowercase();
		if lower.ends_with(".yml") || lower.ends_with(".yaml") {
			Some(FixtureFormat::Yaml)
		} else if lower.ends_with(".json") {
			Some(FixtureFormat::Json)
		} else {
			None
		}
	}
}

/// One record of a fixture set: column names mapped to values, in the order
/// they appeared in the source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixtureRecord {
	values: IndexMap<String, FixtureValue>,
}

impl FixtureRecord {
	/// Creates an empty record.
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets a column value, keeping insertion order.
	pub fn set(&mut self, column: impl Into<String>, value: impl Into<FixtureValue>) {
		self.values.insert(column.into(), value.into());
	}

	/// Returns the value of `column`, if present.
	pub fn get(&self, column: &str) -> Option<&FixtureValue> {
		self.values.get(column)
	}

	/// Number of columns in the record.
	pub fn len(&self) -> usize {
		self.values.len()
	}

	/// Whether the record has no columns.
	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	/// Iterates over `(column, value)` pairs in source order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &FixtureValue)> {
		self.values.iter().map(|(k, v)| (k.as_str(), v))
	}
}

impl FromIterator<(String, FixtureValue)> for FixtureRecord {
	fn from_iter<T: IntoIterator<Item = (String, FixtureValue)>>(iter: T) -> Self {
		Self {
			values: iter.into_iter().collect(),
		}
	}
}

/// The parsed records for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureSet {
	source: String,
	table: String,
	records: Vec<FixtureRecord>,
}

impl FixtureSet {
	/// Creates a set directly from records, with the table name doubling as
	/// the source name.
	pub fn new(table: impl Into<String>, records: Vec<FixtureRecord>) -> Self {
		let table = table.into();
		Self {
			source: table.clone(),
			table,
			records,
		}
	}

	/// Parses a single-table source, detecting the format from the source
	/// name and defaulting to YAML.
	pub fn parse(source_name: &str, contents: &str) -> Result<Self> {
		let format = FixtureFormat::from_source_name(source_name).unwrap_or(FixtureFormat::Yaml);
		Self::parse_with_format(source_name, contents, format)
	}

	/// Parses a single-table source in an explicit format. The document must
	/// be a sequence of records or a mapping of labels to records; labels
	/// are only for the reader and are discarded.
	pub fn parse_with_format(
		source_name: &str,
		contents: &str,
		format: FixtureFormat,
	) -> Result<Self> {
		let table = table_name_from_source(source_name).to_string();
		let records = parse_records(source_name, &table, contents, format)?;
		Ok(Self {
			source: source_name.to_string(),
			table,
			records,
		})
	}

	/// Parses a multi-table source, detecting the format from the source
	/// name and defaulting to YAML.
	pub fn parse_multi(source_name: &str, contents: &str) -> Result<Vec<Self>> {
		let format = FixtureFormat::from_source_name(source_name).unwrap_or(FixtureFormat::Yaml);
		Self::parse_multi_with_format(source_name, contents, format)
	}

	/// Parses a multi-table source: a mapping of table names to record
	/// sequences (or record mappings). Table order is preserved.
	pub fn parse_multi_with_format(
		source_name: &str,
		contents: &str,
		format: FixtureFormat,
	) -> Result<Vec<Self>> {
		let tables = parse_document(source_name, contents, format)?;
		let Some(tables) = tables else {
			return Ok(Vec::new());
		};
		let Document::Mapping(tables) = tables else {
			return Err(FixtureError::Fixture {
				name: source_name.to_string(),
				detail: "multi-table sources must be a mapping of table names to records"
					.to_string(),
			});
		};
		tables
			.into_iter()
			.map(|(table, document)| {
				let records = records_from_document(source_name, &table, document)?;
				Ok(Self {
					source: source_name.to_string(),
					table,
					records,
				})
			})
			.collect()
	}

	/// Name of the source this set was parsed from.
	pub fn source(&self) -> &str {
		&self.source
	}

	/// Table the records belong to.
	pub fn table(&self) -> &str {
		&self.table
	}

	/// The records, in source order.
	pub fn records(&self) -> &[FixtureRecord] {
		&self.records
	}
}

/// Strips a recognized fixture extension; anything else is kept, so dotted
/// table names like `test_schema.posts` survive.
pub(crate) fn table_name_from_source(name: &str) -> &str {
	for extension in [".yml", ".yaml", ".json"] {
		if let Some(stripped) = name.strip_suffix(extension) {
			return stripped;
		}
	}
	name
}

/// Format-independent document shape used while parsing.
enum Document {
	Sequence(Vec<Document>),
	Mapping(Vec<(String, Document)>),
	Value(FixtureValue),
}

fn parse_document(
	source_name: &str,
	contents: &str,
	format: FixtureFormat,
) -> Result<Option<Document>> {
	if contents.trim().is_empty() {
		return Ok(None);
	}
	match format {
		#[cfg(feature = "yaml")]
		FixtureFormat::Yaml => {
			let value: serde_yaml::Value = serde_yaml::from_str(contents)?;
			document_from_yaml(source_name, value).map(Some)
		}
		#[cfg(not(feature = "yaml"))]
		FixtureFormat::Yaml => Err(FixtureError::Fixture {
			name: source_name.to_string(),
			detail: "YAML support is not enabled (missing the `yaml` feature)".to_string(),
		}),
		FixtureFormat::Json => {
			let value: serde_json::Value = serde_json::from_str(contents)?;
			document_from_json(source_name, value).map(Some)
		}
	}
}

#[cfg(feature = "yaml")]
fn document_from_yaml(source_name: &str, value: serde_yaml::Value) -> Result<Document> {
	match value {
		serde_yaml::Value::Sequence(items) => items
			.into_iter()
			.map(|item| document_from_yaml(source_name, item))
			.collect::<Result<Vec<_>>>()
			.map(Document::Sequence),
		serde_yaml::Value::Mapping(entries) => entries
			.into_iter()
			.map(|(key, value)| {
				let serde_yaml::Value::String(key) = key else {
					return Err(FixtureError::Fixture {
						name: source_name.to_string(),
						detail: "mapping keys must be strings".to_string(),
					});
				};
				Ok((key, document_from_yaml(source_name, value)?))
			})
			.collect::<Result<Vec<_>>>()
			.map(Document::Mapping),
		other => FixtureValue::from_yaml(other)
			.map(Document::Value)
			.map_err(|detail| FixtureError::Fixture {
				name: source_name.to_string(),
				detail,
			}),
	}
}

fn document_from_json(source_name: &str, value: serde_json::Value) -> Result<Document> {
	match value {
		serde_json::Value::Array(items) => items
			.into_iter()
			.map(|item| document_from_json(source_name, item))
			.collect::<Result<Vec<_>>>()
			.map(Document::Sequence),
		serde_json::Value::Object(entries) => entries
			.into_iter()
			.map(|(key, value)| Ok((key, document_from_json(source_name, value)?)))
			.collect::<Result<Vec<_>>>()
			.map(Document::Mapping),
		other => FixtureValue::from_json(other)
			.map(Document::Value)
			.map_err(|detail| FixtureError::Fixture {
				name: source_name.to_string(),
				detail,
			}),
	}
}

fn parse_records(
	source_name: &str,
	table: &str,
	contents: &str,
	format: FixtureFormat,
) -> Result<Vec<FixtureRecord>> {
	match parse_document(source_name, contents, format)? {
		None => Ok(Vec::new()),
		Some(document) => records_from_document(source_name, table, document),
	}
}

fn records_from_document(
	source_name: &str,
	table: &str,
	document: Document,
) -> Result<Vec<FixtureRecord>> {
	let items: Vec<Document> = match document {
		Document::Sequence(items) => items,
		// A mapping of labels to records; the labels are discarded.
		Document::Mapping(entries) => entries.into_iter().map(|(_, value)| value).collect(),
		Document::Value(FixtureValue::Null) => Vec::new(),
		Document::Value(_) => {
			return Err(FixtureError::Fixture {
				name: source_name.to_string(),
				detail: format!("table {table}: expected a sequence or mapping of records"),
			});
		}
	};
	items
		.into_iter()
		.map(|item| record_from_document(source_name, table, item))
		.collect()
}

fn record_from_document(
	source_name: &str,
	table: &str,
	document: Document,
) -> Result<FixtureRecord> {
	let Document::Mapping(entries) = document else {
		return Err(FixtureError::Fixture {
			name: source_name.to_string(),
			detail: format!("table {table}: each record must be a mapping of columns to values"),
		});
	};
	let mut record = FixtureRecord::new();
	for (column, value) in entries {
		record.set(column, fixture_value_from_document(value));
	}
	Ok(record)
}

fn fixture_value_from_document(document: Document) -> FixtureValue {
	match document {
		Document::Value(value) => value,
		Document::Sequence(items) => {
			FixtureValue::List(items.into_iter().map(fixture_value_from_document).collect())
		}
		Document::Mapping(entries) => FixtureValue::Map(
			entries
				.into_iter()
				.map(|(key, value)| (key, fixture_value_from_document(value)))
				.collect(),
		),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case("posts.yml", "posts")]
	#[case("posts.yaml", "posts")]
	#[case("posts.json", "posts")]
	#[case("test_schema.posts_tags.yml", "test_schema.posts_tags")]
	#[case("accounts", "accounts")]
	fn test_table_name_from_source(#[case] source: &str, #[case] expected: &str) {
		assert_eq!(table_name_from_source(source), expected);
	}

	#[rstest]
	#[case("posts.yml", Some(FixtureFormat::Yaml))]
	#[case("posts.YAML", Some(FixtureFormat::Yaml))]
	#[case("posts.json", Some(FixtureFormat::Json))]
	#[case("posts", None)]
	fn test_format_detection(#[case] source: &str, #[case] expected: Option<FixtureFormat>) {
		assert_eq!(FixtureFormat::from_source_name(source), expected);
	}

	#[cfg(feature = "yaml")]
	#[rstest]
	fn test_parse_sequence_of_records() {
		let contents = "\
- id: 1
  title: First post
- id: 2
  title: Second post
";
		let set = FixtureSet::parse("posts.yml", contents).unwrap();
		assert_eq!(set.table(), "posts");
		assert_eq!(set.records().len(), 2);
		assert_eq!(
			set.records()[0].get("title"),
			Some(&FixtureValue::from("First post"))
		);
	}

	#[cfg(feature = "yaml")]
	#[rstest]
	fn test_parse_labelled_records_keeps_order() {
		let contents = "\
second:
  id: 2
first:
  id: 1
";
		let set = FixtureSet::parse("posts.yml", contents).unwrap();
		assert_eq!(set.records().len(), 2);
		assert_eq!(set.records()[0].get("id"), Some(&FixtureValue::Int(2)));
		assert_eq!(set.records()[1].get("id"), Some(&FixtureValue::Int(1)));
	}

	#[rstest]
	fn test_parse_json_array() {
		let contents = r#"[{"id": 1, "name": "one"}, {"id": 2, "name": "two"}]"#;
		let set = FixtureSet::parse("tags.json", contents).unwrap();
		assert_eq!(set.table(), "tags");
		assert_eq!(set.records().len(), 2);
		assert_eq!(set.records()[1].get("name"), Some(&FixtureValue::from("two")));
	}

	#[cfg(feature = "yaml")]
	#[rstest]
	fn test_parse_multi_table_preserves_table_order() {
		let contents = "\
authors:
  - id: 1
    name: someone
posts:
  - id: 1
    author_id: 1
";
		let sets = FixtureSet::parse_multi("seed.yml", contents).unwrap();
		assert_eq!(sets.len(), 2);
		assert_eq!(sets[0].table(), "authors");
		assert_eq!(sets[1].table(), "posts");
		assert_eq!(sets[0].source(), "seed.yml");
	}

	#[cfg(feature = "yaml")]
	#[rstest]
	fn test_parse_empty_source_yields_no_records() {
		let set = FixtureSet::parse("posts.yml", "").unwrap();
		assert!(set.records().is_empty());
	}

	#[cfg(feature = "yaml")]
	#[rstest]
	fn test_parse_rejects_scalar_document() {
		let err = FixtureSet::parse("posts.yml", "42").unwrap_err();
		assert!(matches!(err, FixtureError::Fixture { .. }));
	}

	#[cfg(feature = "yaml")]
	#[rstest]
	fn test_parse_rejects_scalar_record() {
		let err = FixtureSet::parse("posts.yml", "- 42").unwrap_err();
		assert!(matches!(err, FixtureError::Fixture { .. }));
	}

	#[cfg(feature = "yaml")]
	#[rstest]
	fn test_parse_multi_rejects_sequence_document() {
		let err = FixtureSet::parse_multi("seed.yml", "- a\n- b").unwrap_err();
		assert!(matches!(err, FixtureError::Fixture { .. }));
	}

	#[cfg(feature = "yaml")]
	#[rstest]
	fn test_nested_values_survive_parsing() {
		let contents = "\
- id: 1
  attributes:
    color: red
    sizes:
      - s
      - m
";
		let set = FixtureSet::parse("products.yml", contents).unwrap();
		let FixtureValue::Map(attributes) =
			set.records()[0].get("attributes").unwrap()
		else {
			panic!("expected a mapping");
		};
		assert_eq!(attributes.get("color"), Some(&FixtureValue::from("red")));
		assert!(matches!(
			attributes.get("sizes"),
			Some(FixtureValue::List(items)) if items.len() == 2
		));
	}

	#[cfg(feature = "yaml")]
	#[rstest]
	fn test_invalid_yaml_reports_parse_error() {
		let err = FixtureSet::parse("posts.yml", "- id: [unclosed").unwrap_err();
		assert!(matches!(err, FixtureError::Yaml(_)));
	}
}
