//! PostgreSQL adapter.
//!
//! Three referential integrity strategies are available: disabling triggers
//! (the default, requires a superuser), making constraints deferrable, and
//! dropping and recreating constraints. Sequences are reset after every load
//! so tests can insert additional rows without colliding with fixture ids,
//! and per-table MD5 checksums let unchanged tables be skipped entirely.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use crate::backend::{DatabaseBackend, DatabaseError, SqlValue};
use crate::builder::{InsertPieces, LoadBatch};
use crate::checksum::{Checksum, ChecksumCache};
use crate::dialect::{AdapterOptions, Dialect, DialectAdapter, ParamType, fetch_single_column};
use crate::error::{FixtureError, Result};
use crate::guard;

const TABLE_NAMES_SQL: &str = r"
	SELECT pg_namespace.nspname || '.' || pg_class.relname
	FROM pg_class
	INNER JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace
	WHERE pg_class.relkind = 'r'
	  AND pg_namespace.nspname NOT IN ('pg_catalog', 'information_schema', 'crdb_internal')
	  AND pg_namespace.nspname NOT LIKE 'pg_toast%'
	  AND pg_namespace.nspname NOT LIKE '\_timescaledb%'
";

const SEQUENCES_SQL: &str = r"
	SELECT pg_namespace.nspname || '.' || pg_class.relname
	FROM pg_class
	INNER JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace
	WHERE pg_class.relkind = 'S'
	  AND pg_namespace.nspname NOT LIKE '\_timescaledb%'
";

const NON_DEFERRABLE_CONSTRAINTS_SQL: &str = r"
	SELECT table_schema || '.' || table_name, constraint_name
	FROM information_schema.table_constraints
	WHERE constraint_type = 'FOREIGN KEY'
	  AND is_deferrable = 'NO'
	  AND table_schema NOT IN ('crdb_internal')
	  AND table_schema NOT LIKE '\_timescaledb%'
";

const CONSTRAINTS_SQL: &str = "
	SELECT conrelid::regclass AS table_from, conname, pg_get_constraintdef(pg_constraint.oid)
	FROM pg_constraint
	WHERE contype = 'f'
";

const IDENTITY_COLUMNS_SQL: &str = "
	SELECT COUNT(*)
	FROM information_schema.columns
	WHERE table_name = $1
	  AND is_identity = 'YES'
";

const JSON_COLUMNS_SQL: &str = "
	SELECT column_name, data_type
	FROM information_schema.columns
	WHERE table_name = $1
	  AND data_type IN ('json', 'jsonb')
";

/// Quotes a possibly schema-qualified identifier, quoting each dotted part
/// separately.
pub(crate) fn quote_dotted(name: &str) -> String {
	name.split('.')
		.map(|part| format!("\"{part}\""))
		.collect::<Vec<_>>()
		.join(".")
}

/// SETVAL statement bumping a sequence to the floor value.
pub(crate) fn setval_statement(sequence: &str, floor: i64) -> String {
	format!("SELECT SETVAL('{sequence}', {floor})")
}

fn first_major_version(version: &str) -> Option<u32> {
	static MAJOR_VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
	MAJOR_VERSION_RE
		.find(version)
		.and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone)]
struct PgConstraint {
	table: String,
	name: String,
	definition: String,
}

pub(crate) struct PostgresAdapter {
	options: AdapterOptions,
	tables: Vec<String>,
	sequences: Vec<String>,
	non_deferrable_constraints: Vec<PgConstraint>,
	constraints: Vec<PgConstraint>,
	checksums: ChecksumCache,
	major_version: u32,
	// Memoized per table; filled lazily while building INSERT statements.
	identity_tables: Mutex<HashMap<String, bool>>,
	json_columns: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl PostgresAdapter {
	pub fn new(options: AdapterOptions) -> Self {
		Self {
			options,
			tables: Vec::new(),
			sequences: Vec::new(),
			non_deferrable_constraints: Vec::new(),
			constraints: Vec::new(),
			checksums: ChecksumCache::new(),
			major_version: 0,
			identity_tables: Mutex::new(HashMap::new()),
			json_columns: Mutex::new(HashMap::new()),
		}
	}

	async fn fetch_non_deferrable_constraints(
		db: &mut dyn DatabaseBackend,
	) -> Result<Vec<PgConstraint>> {
		let detail = "collecting non-deferrable constraints";
		let rows = db
			.fetch_all(NON_DEFERRABLE_CONSTRAINTS_SQL, Vec::new())
			.await
			.map_err(|source| FixtureError::SchemaIntrospection {
				detail: detail.to_string(),
				source,
			})?;
		rows.iter()
			.map(|row| {
				Ok(PgConstraint {
					table: row.get::<String>(0)?,
					name: row.get::<String>(1)?,
					definition: String::new(),
				})
			})
			.collect::<std::result::Result<Vec<_>, DatabaseError>>()
			.map_err(|source| FixtureError::SchemaIntrospection {
				detail: detail.to_string(),
				source,
			})
	}

	async fn fetch_constraints(db: &mut dyn DatabaseBackend) -> Result<Vec<PgConstraint>> {
		let detail = "collecting foreign key definitions";
		let rows = db
			.fetch_all(CONSTRAINTS_SQL, Vec::new())
			.await
			.map_err(|source| FixtureError::SchemaIntrospection {
				detail: detail.to_string(),
				source,
			})?;
		rows.iter()
			.map(|row| {
				Ok(PgConstraint {
					table: row.get::<String>(0)?,
					name: row.get::<String>(1)?,
					definition: row.get::<String>(2)?,
				})
			})
			.collect::<std::result::Result<Vec<_>, DatabaseError>>()
			.map_err(|source| FixtureError::SchemaIntrospection {
				detail: detail.to_string(),
				source,
			})
	}

	async fn fetch_major_version(db: &mut dyn DatabaseBackend) -> Result<u32> {
		let detail = "reading server version";
		let row = db
			.fetch_optional("SELECT VERSION()", Vec::new())
			.await
			.map_err(|source| FixtureError::SchemaIntrospection {
				detail: detail.to_string(),
				source,
			})?;
		let version = match row {
			Some(row) => {
				row.get::<String>(0)
					.map_err(|source| FixtureError::SchemaIntrospection {
						detail: detail.to_string(),
						source,
					})?
			}
			None => String::new(),
		};
		Ok(first_major_version(&version).unwrap_or(0))
	}

	async fn fetch_checksum(
		&self,
		db: &mut dyn DatabaseBackend,
		table: &str,
	) -> Result<Checksum> {
		let sql = format!(
			"SELECT md5(CAST((json_agg(t.*)) AS TEXT)) FROM {} AS t",
			quote_dotted(table)
		);
		let row = db.fetch_optional(&sql, Vec::new()).await.map_err(|source| {
			FixtureError::ChecksumComputation {
				table: table.to_string(),
				source,
			}
		})?;
		// An empty table aggregates to NULL.
		let checksum = match row.as_ref().and_then(|row| row.value(0)) {
			None | Some(SqlValue::Null) => String::new(),
			Some(SqlValue::Text(text)) => text.clone(),
			Some(other) => {
				return Err(FixtureError::ChecksumComputation {
					table: table.to_string(),
					source: DatabaseError::TypeError(format!(
						"expected an MD5 string, got {other:?}"
					)),
				});
			}
		};
		Ok(Checksum::Text(checksum))
	}

	async fn table_has_identity_column(
		&self,
		db: &mut dyn DatabaseBackend,
		table: &str,
	) -> Result<bool> {
		if let Some(&known) = self.identity_tables.lock().get(table) {
			return Ok(known);
		}
		// The introspection query matches on the bare table name.
		let bare = table.rsplit('.').next().unwrap_or(table);
		let row = db
			.fetch_optional(
				IDENTITY_COLUMNS_SQL,
				vec![SqlValue::Text(bare.to_string())],
			)
			.await
			.map_err(|source| FixtureError::SchemaIntrospection {
				detail: format!("checking identity columns of {table}"),
				source,
			})?;
		let has_identity = match row {
			Some(row) => {
				row.get::<i64>(0)
					.map_err(|source| FixtureError::SchemaIntrospection {
						detail: format!("checking identity columns of {table}"),
						source,
					})? > 0
			}
			None => false,
		};
		self.identity_tables
			.lock()
			.insert(table.to_string(), has_identity);
		Ok(has_identity)
	}

	async fn json_columns_of(
		&self,
		db: &mut dyn DatabaseBackend,
		table: &str,
	) -> Result<HashMap<String, String>> {
		if let Some(known) = self.json_columns.lock().get(table) {
			return Ok(known.clone());
		}
		let bare = table.rsplit('.').next().unwrap_or(table);
		let rows = db
			.fetch_all(JSON_COLUMNS_SQL, vec![SqlValue::Text(bare.to_string())])
			.await
			.map_err(|source| FixtureError::SchemaIntrospection {
				detail: format!("checking JSON columns of {table}"),
				source,
			})?;
		let mut columns = HashMap::new();
		for row in &rows {
			let column = row.get::<String>(0).map_err(|source| {
				FixtureError::SchemaIntrospection {
					detail: format!("checking JSON columns of {table}"),
					source,
				}
			})?;
			let data_type = row.get::<String>(1).map_err(|source| {
				FixtureError::SchemaIntrospection {
					detail: format!("checking JSON columns of {table}"),
					source,
				}
			})?;
			columns.insert(column, data_type);
		}
		self.json_columns
			.lock()
			.insert(table.to_string(), columns.clone());
		Ok(columns)
	}

	async fn reset_sequences(&self, db: &mut dyn DatabaseBackend) -> Result<()> {
		let floor = self.options.sequence_floor();
		for sequence in &self.sequences {
			db.execute(&setval_statement(sequence, floor), Vec::new())
				.await
				.map_err(|source| FixtureError::SequenceReset {
					sequence: sequence.clone(),
					source,
				})?;
		}
		Ok(())
	}

	/// Default strategy: disable all triggers (which includes foreign key
	/// enforcement) inside the transaction, re-enable them afterwards.
	async fn with_disabled_triggers(
		&self,
		db: &mut dyn DatabaseBackend,
		batch: &LoadBatch<'_>,
	) -> Result<()> {
		let prelude: Vec<String> = self
			.tables
			.iter()
			.map(|table| format!("ALTER TABLE {} DISABLE TRIGGER ALL", quote_dotted(table)))
			.collect();
		let load_result = guard::run_batch_transaction(db, self, batch, &prelude, &[]).await;

		let restore: Vec<String> = self
			.tables
			.iter()
			.map(|table| format!("ALTER TABLE {} ENABLE TRIGGER ALL", quote_dotted(table)))
			.collect();
		let restore_result = guard::run_statements_best_effort(db, &restore).await;
		guard::combine_restore(load_result, restore_result, false)
	}

	/// Alternative strategy: make all foreign keys deferrable and defer them
	/// for the duration of the transaction. Works without superuser rights.
	async fn with_deferred_constraints(
		&self,
		db: &mut dyn DatabaseBackend,
		batch: &LoadBatch<'_>,
	) -> Result<()> {
		let deferrable: Vec<String> = self
			.non_deferrable_constraints
			.iter()
			.map(|c| {
				format!(
					"ALTER TABLE {} ALTER CONSTRAINT {} DEFERRABLE",
					quote_dotted(&c.table),
					quote_dotted(&c.name)
				)
			})
			.collect();
		let load_result = match guard::run_statements(db, &deferrable).await {
			Err(source) => Err(FixtureError::IntegrityRelax { source }),
			Ok(()) => {
				let prelude = vec!["SET CONSTRAINTS ALL DEFERRED".to_string()];
				guard::run_batch_transaction(db, self, batch, &prelude, &[]).await
			}
		};

		let restore: Vec<String> = self
			.non_deferrable_constraints
			.iter()
			.map(|c| {
				format!(
					"ALTER TABLE {} ALTER CONSTRAINT {} NOT DEFERRABLE",
					quote_dotted(&c.table),
					quote_dotted(&c.name)
				)
			})
			.collect();
		let restore_result = guard::run_statements_best_effort(db, &restore).await;
		guard::combine_restore(load_result, restore_result, false)
	}

	/// Last-resort strategy: physically drop every foreign key and recreate
	/// it from its saved definition. The drop happens outside the load
	/// transaction, so a failed recreation leaves the schema unprotected.
	async fn with_dropped_constraints(
		&self,
		db: &mut dyn DatabaseBackend,
		batch: &LoadBatch<'_>,
	) -> Result<()> {
		let drops: Vec<String> = self
			.constraints
			.iter()
			.map(|c| {
				format!(
					"ALTER TABLE {} DROP CONSTRAINT {}",
					quote_dotted(&c.table),
					quote_dotted(&c.name)
				)
			})
			.collect();
		let load_result = match guard::run_statements(db, &drops).await {
			Err(source) => Err(FixtureError::IntegrityRelax { source }),
			Ok(()) => guard::run_batch_transaction(db, self, batch, &[], &[]).await,
		};

		let recreates: Vec<String> = self
			.constraints
			.iter()
			.map(|c| {
				format!(
					"ALTER TABLE {} ADD CONSTRAINT {} {}",
					quote_dotted(&c.table),
					quote_dotted(&c.name),
					c.definition
				)
			})
			.collect();
		let restore_result = guard::run_statements_best_effort(db, &recreates).await;
		guard::combine_restore(load_result, restore_result, true)
	}
}

#[async_trait]
impl DialectAdapter for PostgresAdapter {
	fn dialect(&self) -> Dialect {
		Dialect::Postgres
	}

	fn default_param_type(&self) -> ParamType {
		ParamType::Dollar
	}

	fn quote_identifier(&self, name: &str) -> String {
		quote_dotted(name)
	}

	async fn init(&mut self, db: &mut dyn DatabaseBackend) -> Result<()> {
		self.tables =
			fetch_single_column(db, TABLE_NAMES_SQL, Vec::new(), "collecting table names").await?;
		self.sequences =
			fetch_single_column(db, SEQUENCES_SQL, Vec::new(), "collecting sequences").await?;
		self.non_deferrable_constraints = Self::fetch_non_deferrable_constraints(db).await?;
		self.constraints = Self::fetch_constraints(db).await?;
		self.major_version = Self::fetch_major_version(db).await?;
		Ok(())
	}

	async fn database_name(&self, db: &mut dyn DatabaseBackend) -> Result<String> {
		let row = db
			.fetch_optional("SELECT current_database()", Vec::new())
			.await
			.map_err(FixtureError::Database)?;
		match row {
			Some(row) => row.get::<String>(0).map_err(FixtureError::Database),
			None => Err(FixtureError::DatabaseNameUndeterminable),
		}
	}

	async fn build_insert_sql(
		&self,
		db: &mut dyn DatabaseBackend,
		pieces: InsertPieces<'_>,
	) -> Result<String> {
		let json_columns = self.json_columns_of(db, pieces.table).await?;
		let values: Vec<String> = pieces
			.columns
			.iter()
			.zip(pieces.values)
			.map(|(column, value)| match json_columns.get(column) {
				Some(data_type) => format!("CAST({value} AS {data_type})"),
				None => value.clone(),
			})
			.collect();

		// OVERRIDING SYSTEM VALUE exists since version 10 and is required to
		// insert explicit ids into identity columns.
		let overriding = self.major_version >= 10
			&& self.table_has_identity_column(db, pieces.table).await?;
		if overriding {
			Ok(format!(
				"INSERT INTO {} ({}) OVERRIDING SYSTEM VALUE VALUES ({})",
				pieces.quoted_table,
				pieces.quoted_columns.join(", "),
				values.join(", ")
			))
		} else {
			Ok(format!(
				"INSERT INTO {} ({}) VALUES ({})",
				pieces.quoted_table,
				pieces.quoted_columns.join(", "),
				values.join(", ")
			))
		}
	}

	async fn is_table_modified(
		&self,
		db: &mut dyn DatabaseBackend,
		table: &str,
	) -> Result<bool> {
		let Some(recorded) = self.checksums.get(table) else {
			return Ok(true);
		};
		let current = self.fetch_checksum(db, table).await?;
		Ok(&current != recorded)
	}

	async fn refresh_checksums(
		&mut self,
		db: &mut dyn DatabaseBackend,
		dirty: &[String],
	) -> Result<()> {
		if !self.checksums.is_primed() {
			let tables = self.tables.clone();
			for table in &tables {
				let checksum = self.fetch_checksum(db, table).await?;
				self.checksums.put(table.clone(), checksum);
			}
			self.checksums.set_primed();
			return Ok(());
		}
		for table in dirty {
			let checksum = self.fetch_checksum(db, table).await?;
			self.checksums.put(table.clone(), checksum);
		}
		Ok(())
	}

	async fn disable_referential_integrity(
		&self,
		db: &mut dyn DatabaseBackend,
		batch: &LoadBatch<'_>,
	) -> Result<()> {
		let load_result = if self.options.use_drop_constraint {
			self.with_dropped_constraints(db, batch).await
		} else if self.options.use_alter_constraint {
			self.with_deferred_constraints(db, batch).await
		} else {
			self.with_disabled_triggers(db, batch).await
		};

		if self.options.skip_reset_sequences {
			return load_result;
		}
		let sequences_result = self.reset_sequences(db).await;
		match (load_result, sequences_result) {
			(Err(load_error), _) => Err(load_error),
			(Ok(()), result) => result,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case("posts_tags", "\"posts_tags\"")]
	#[case("test_schema.posts_tags", "\"test_schema\".\"posts_tags\"")]
	fn test_quote_identifier(#[case] input: &str, #[case] expected: &str) {
		let adapter = PostgresAdapter::new(AdapterOptions::default());
		assert_eq!(adapter.quote_identifier(input), expected);
	}

	#[rstest]
	fn test_clean_table_sql_is_a_delete() {
		let adapter = PostgresAdapter::new(AdapterOptions::default());
		assert_eq!(
			adapter.clean_table_sql("\"posts\""),
			"DELETE FROM \"posts\""
		);
	}

	#[rstest]
	#[case("PostgreSQL 16.2 (Debian 16.2-1.pgdg120+2) on x86_64-pc-linux-gnu", 16)]
	#[case("PostgreSQL 9.6.24", 9)]
	#[case("CockroachDB CCL v23.1.11", 23)]
	#[case("no digits here", 0)]
	fn test_major_version_extraction(#[case] version: &str, #[case] expected: u32) {
		assert_eq!(first_major_version(version).unwrap_or(0), expected);
	}

	#[rstest]
	fn test_setval_statement_uses_floor() {
		assert_eq!(
			setval_statement("public.posts_id_seq", 10_000),
			"SELECT SETVAL('public.posts_id_seq', 10000)"
		);
	}

	#[rstest]
	fn test_default_param_type_is_dollar() {
		let adapter = PostgresAdapter::new(AdapterOptions::default());
		assert_eq!(adapter.default_param_type(), ParamType::Dollar);
	}
}
