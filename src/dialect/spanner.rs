//! Cloud Spanner (GoogleSQL) adapter.
//!
//! Spanner cannot suspend foreign keys, so they are dropped before the load
//! and recreated from the column lists collected at startup. Identifiers
//! pass through unquoted and `JSON` column values have to be wrapped in
//! `PARSE_JSON` because the type has no literal form.

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::backend::{DatabaseBackend, DatabaseError};
use crate::builder::{InsertPieces, LoadBatch};
use crate::dialect::{Dialect, DialectAdapter, ParamType, fetch_single_column};
use crate::error::{FixtureError, Result};
use crate::guard;

const TABLE_NAMES_SQL: &str = "\
SELECT TABLE_NAME \
FROM INFORMATION_SCHEMA.TABLES \
WHERE TABLE_SCHEMA = ''";

const FOREIGN_KEYS_SQL: &str = "\
SELECT tc.TABLE_NAME, tc.CONSTRAINT_NAME, kcu.COLUMN_NAME, \
kcu2.TABLE_NAME AS REFERENCED_TABLE_NAME, kcu2.COLUMN_NAME AS REFERENCED_COLUMN_NAME \
FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME \
JOIN INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc \
ON tc.CONSTRAINT_NAME = rc.CONSTRAINT_NAME \
JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu2 \
ON rc.UNIQUE_CONSTRAINT_NAME = kcu2.CONSTRAINT_NAME \
AND kcu.ORDINAL_POSITION = kcu2.ORDINAL_POSITION \
WHERE tc.CONSTRAINT_TYPE = 'FOREIGN KEY' \
ORDER BY tc.TABLE_NAME, tc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION";

const JSON_COLUMNS_SQL: &str = "\
SELECT TABLE_NAME, COLUMN_NAME \
FROM INFORMATION_SCHEMA.COLUMNS \
WHERE TABLE_SCHEMA = '' AND SPANNER_TYPE = 'JSON'";

/// One foreign key, with its columns in ordinal position order.
#[derive(Debug, Clone)]
struct SpannerForeignKey {
	table: String,
	name: String,
	columns: Vec<String>,
	referenced_table: String,
	referenced_columns: Vec<String>,
}

impl SpannerForeignKey {
	fn drop_statement(&self) -> String {
		format!("ALTER TABLE {} DROP CONSTRAINT {}", self.table, self.name)
	}

	fn recreate_statement(&self) -> String {
		format!(
			"ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
			self.table,
			self.name,
			self.columns.join(", "),
			self.referenced_table,
			self.referenced_columns.join(", ")
		)
	}
}

pub(crate) struct SpannerAdapter {
	tables: Vec<String>,
	foreign_keys: Vec<SpannerForeignKey>,
	json_columns: IndexMap<String, Vec<String>>,
}

impl SpannerAdapter {
	pub fn new() -> Self {
		Self { tables: Vec::new(), foreign_keys: Vec::new(), json_columns: IndexMap::new() }
	}

	async fn fetch_foreign_keys(
		db: &mut dyn DatabaseBackend,
	) -> std::result::Result<Vec<SpannerForeignKey>, DatabaseError> {
		let rows = db.fetch_all(FOREIGN_KEYS_SQL, Vec::new()).await?;
		// Rows are ordered by constraint and ordinal position, so grouping
		// by (table, name) keeps the column lists position-ordered.
		let mut grouped: IndexMap<(String, String), SpannerForeignKey> = IndexMap::new();
		for row in rows {
			let table = row.get::<String>(0)?;
			let name = row.get::<String>(1)?;
			let column = row.get::<String>(2)?;
			let referenced_table = row.get::<String>(3)?;
			let referenced_column = row.get::<String>(4)?;
			let entry = grouped
				.entry((table.clone(), name.clone()))
				.or_insert_with(|| SpannerForeignKey {
					table,
					name,
					columns: Vec::new(),
					referenced_table,
					referenced_columns: Vec::new(),
				});
			entry.columns.push(column);
			entry.referenced_columns.push(referenced_column);
		}
		Ok(grouped.into_values().collect())
	}

	async fn fetch_json_columns(
		db: &mut dyn DatabaseBackend,
	) -> std::result::Result<IndexMap<String, Vec<String>>, DatabaseError> {
		let rows = db.fetch_all(JSON_COLUMNS_SQL, Vec::new()).await?;
		let mut columns: IndexMap<String, Vec<String>> = IndexMap::new();
		for row in rows {
			let table = row.get::<String>(0)?;
			let column = row.get::<String>(1)?;
			columns.entry(table).or_default().push(column);
		}
		Ok(columns)
	}
}

#[async_trait]
impl DialectAdapter for SpannerAdapter {
	fn dialect(&self) -> Dialect {
		Dialect::Spanner
	}

	fn default_param_type(&self) -> ParamType {
		ParamType::AtSign
	}

	// Spanner identifiers take no quoting.
	fn quote_identifier(&self, name: &str) -> String {
		name.to_string()
	}

	fn clean_table_sql(&self, quoted_table: &str) -> String {
		// Spanner requires a WHERE clause on DELETE.
		format!("DELETE FROM {quoted_table} WHERE true")
	}

	async fn init(&mut self, db: &mut dyn DatabaseBackend) -> Result<()> {
		self.tables =
			fetch_single_column(db, TABLE_NAMES_SQL, Vec::new(), "collecting table names").await?;
		self.foreign_keys = Self::fetch_foreign_keys(db).await.map_err(|source| {
			FixtureError::SchemaIntrospection {
				detail: "collecting foreign keys".to_string(),
				source,
			}
		})?;
		self.json_columns = Self::fetch_json_columns(db).await.map_err(|source| {
			FixtureError::SchemaIntrospection {
				detail: "collecting JSON columns".to_string(),
				source,
			}
		})?;
		Ok(())
	}

	async fn database_name(&self, _db: &mut dyn DatabaseBackend) -> Result<String> {
		// Spanner sessions have no notion of a current database name.
		Err(FixtureError::DatabaseNameUndeterminable)
	}

	async fn build_insert_sql(
		&self,
		_db: &mut dyn DatabaseBackend,
		pieces: InsertPieces<'_>,
	) -> Result<String> {
		let json_columns = self.json_columns.get(pieces.table);
		let values: Vec<String> = pieces
			.columns
			.iter()
			.zip(pieces.values)
			.map(|(column, value)| {
				if json_columns.is_some_and(|columns| columns.contains(column)) {
					format!("PARSE_JSON({value})")
				} else {
					value.clone()
				}
			})
			.collect();
		Ok(format!(
			"INSERT INTO {} ({}) VALUES ({})",
			pieces.quoted_table,
			pieces.quoted_columns.join(", "),
			values.join(", ")
		))
	}

	async fn disable_referential_integrity(
		&self,
		db: &mut dyn DatabaseBackend,
		batch: &LoadBatch<'_>,
	) -> Result<()> {
		let drops: Vec<String> =
			self.foreign_keys.iter().map(SpannerForeignKey::drop_statement).collect();
		let recreates: Vec<String> =
			self.foreign_keys.iter().map(SpannerForeignKey::recreate_statement).collect();

		let load_result = match guard::run_statements(db, &drops).await {
			Ok(()) => guard::run_batch_transaction(db, self, batch, &[], &[]).await,
			Err(source) => Err(FixtureError::IntegrityRelax { source }),
		};

		// The constraints are gone until recreated, so a failure here
		// leaves the schema unprotected.
		let restore_result = guard::run_statements_best_effort(db, &recreates).await;
		guard::combine_restore(load_result, restore_result, true)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn composite_key() -> SpannerForeignKey {
		SpannerForeignKey {
			table: "posts_tags".to_string(),
			name: "fk_posts_tags_post".to_string(),
			columns: vec!["post_id".to_string(), "tag_id".to_string()],
			referenced_table: "posts".to_string(),
			referenced_columns: vec!["id".to_string(), "tag".to_string()],
		}
	}

	#[rstest]
	fn test_quote_identifier_passes_through() {
		let adapter = SpannerAdapter::new();
		assert_eq!(adapter.quote_identifier("posts"), "posts");
	}

	#[rstest]
	fn test_clean_table_sql_has_where_clause() {
		let adapter = SpannerAdapter::new();
		assert_eq!(adapter.clean_table_sql("posts"), "DELETE FROM posts WHERE true");
	}

	#[rstest]
	fn test_drop_statement() {
		assert_eq!(
			composite_key().drop_statement(),
			"ALTER TABLE posts_tags DROP CONSTRAINT fk_posts_tags_post"
		);
	}

	#[rstest]
	fn test_recreate_statement_keeps_column_order() {
		assert_eq!(
			composite_key().recreate_statement(),
			"ALTER TABLE posts_tags ADD CONSTRAINT fk_posts_tags_post \
			 FOREIGN KEY (post_id, tag_id) REFERENCES posts (id, tag)"
		);
	}
}
