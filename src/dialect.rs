//! Engine dialects and the adapter contract implemented for each of them.
//!
//! A [`Dialect`] is the public handle: a name like `"postgres"` or
//! `"mariadb"` resolves to one. The crate-internal [`DialectAdapter`] trait
//! carries everything that differs between engines: identifier quoting,
//! placeholder style, schema introspection, checksum queries and the
//! referential integrity strategy used around a load.

use async_trait::async_trait;

use crate::backend::{DatabaseBackend, SqlExecutor, SqlValue};
use crate::builder::{InsertPieces, LoadBatch};
use crate::error::{FixtureError, Result};

pub(crate) mod clickhouse;
pub(crate) mod cockroachdb;
pub(crate) mod mysql;
pub(crate) mod oracle;
pub(crate) mod postgres;
pub(crate) mod spanner;
pub(crate) mod sqlite;
pub(crate) mod sqlserver;

/// Sequence floor applied when no explicit reset value is configured.
pub(crate) const DEFAULT_SEQUENCE_FLOOR: i64 = 10_000;

/// A supported database engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
	/// PostgreSQL (also TimescaleDB).
	Postgres,
	/// CockroachDB.
	Cockroach,
	/// MySQL and MariaDB.
	Mysql,
	/// SQLite.
	Sqlite,
	/// Microsoft SQL Server.
	SqlServer,
	/// ClickHouse.
	Clickhouse,
	/// Google Cloud Spanner.
	Spanner,
	/// Oracle Database.
	Oracle,
}

impl Dialect {
	/// Resolves a dialect from its name or a known alias
	/// (case-insensitive).
	pub fn from_name(name: &str) -> Result<Self> {
		match name.to_lowercase().as_str() {
			"postgres" | "postgresql" | "timescaledb" | "pgx" => Ok(Dialect::Postgres),
			"cockroach" | "cockroachdb" | "crdb" => Ok(Dialect::Cockroach),
			"mysql" | "mariadb" => Ok(Dialect::Mysql),
			"sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
			"sqlserver" | "mssql" => Ok(Dialect::SqlServer),
			"clickhouse" => Ok(Dialect::Clickhouse),
			"spanner" | "googlesql" => Ok(Dialect::Spanner),
			"oracle" => Ok(Dialect::Oracle),
			_ => Err(FixtureError::UnknownDialect(name.to_string())),
		}
	}

	/// Canonical name of the dialect.
	pub fn name(&self) -> &'static str {
		match self {
			Dialect::Postgres => "postgres",
			Dialect::Cockroach => "cockroachdb",
			Dialect::Mysql => "mysql",
			Dialect::Sqlite => "sqlite",
			Dialect::SqlServer => "sqlserver",
			Dialect::Clickhouse => "clickhouse",
			Dialect::Spanner => "spanner",
			Dialect::Oracle => "oracle",
		}
	}
}

impl std::fmt::Display for Dialect {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.name())
	}
}

impl std::str::FromStr for Dialect {
	type Err = FixtureError;

	fn from_str(s: &str) -> Result<Self> {
		Dialect::from_name(s)
	}
}

/// Placeholder style used when rendering INSERT statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
	/// `$1`, `$2`, ... (PostgreSQL, CockroachDB).
	Dollar,
	/// `?` (MySQL, SQLite, ClickHouse).
	Question,
	/// `@p1`, `@p2`, ... (SQL Server, Spanner).
	AtSign,
	/// `:1`, `:2`, ... (Oracle).
	Colon,
}

impl ParamType {
	/// Renders the placeholder for the 1-based parameter `index`.
	pub(crate) fn placeholder(self, index: usize) -> String {
		match self {
			ParamType::Dollar => format!("${index}"),
			ParamType::Question => "?".to_string(),
			ParamType::AtSign => format!("@p{index}"),
			ParamType::Colon => format!(":{index}"),
		}
	}
}

/// Statements run immediately before and after the inserts of one table.
#[derive(Debug, Clone)]
pub(crate) struct InsertWrapper {
	/// Statement run before the table's inserts.
	pub before: String,
	/// Statement run after them, even when an insert failed.
	pub after: String,
}

/// Options forwarded from the loader builder into the adapters.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AdapterOptions {
	pub use_alter_constraint: bool,
	pub use_drop_constraint: bool,
	pub skip_reset_sequences: bool,
	/// Requested sequence floor; `0` means the default.
	pub reset_sequences_to: i64,
	pub multi_statements: bool,
	pub clickhouse_delete_from: bool,
}

impl AdapterOptions {
	/// The effective sequence floor.
	pub fn sequence_floor(&self) -> i64 {
		if self.reset_sequences_to > 0 {
			self.reset_sequences_to
		} else {
			DEFAULT_SEQUENCE_FLOOR
		}
	}
}

/// Everything that differs between engines during a load.
///
/// The default method bodies implement the common case: double-quoted
/// identifiers, `DELETE FROM` cleaning, a canonical INSERT, no checksums and
/// no insert wrapping.
#[async_trait]
pub(crate) trait DialectAdapter: Send + Sync {
	fn dialect(&self) -> Dialect;

	fn default_param_type(&self) -> ParamType;

	/// Quotes a table or column identifier.
	fn quote_identifier(&self, name: &str) -> String {
		format!("\"{name}\"")
	}

	/// Statement that removes all rows from a table before reinserting.
	fn clean_table_sql(&self, quoted_table: &str) -> String {
		format!("DELETE FROM {quoted_table}")
	}

	/// Collects schema metadata once, before any load.
	async fn init(&mut self, _db: &mut dyn DatabaseBackend) -> Result<()> {
		Ok(())
	}

	/// Name of the connected database, used for the test database check.
	async fn database_name(&self, db: &mut dyn DatabaseBackend) -> Result<String>;

	/// Renders the INSERT statement for one record.
	async fn build_insert_sql(
		&self,
		_db: &mut dyn DatabaseBackend,
		pieces: InsertPieces<'_>,
	) -> Result<String> {
		Ok(format!(
			"INSERT INTO {} ({}) VALUES ({})",
			pieces.quoted_table,
			pieces.quoted_columns.join(", "),
			pieces.values.join(", ")
		))
	}

	/// Whether the table changed since the checksums were last recorded.
	/// Engines without checksum support treat every table as modified.
	async fn is_table_modified(
		&self,
		_db: &mut dyn DatabaseBackend,
		_table: &str,
	) -> Result<bool> {
		Ok(true)
	}

	/// Records fresh checksums after a load: all known tables on the first
	/// call, only the just-loaded `dirty` tables afterwards.
	async fn refresh_checksums(
		&mut self,
		_db: &mut dyn DatabaseBackend,
		_dirty: &[String],
	) -> Result<()> {
		Ok(())
	}

	/// Per-table statements wrapped around one table's inserts, if the
	/// engine needs any.
	async fn insert_wrapper(
		&self,
		_executor: &mut dyn SqlExecutor,
		_table: &str,
		_quoted_table: &str,
	) -> Result<Option<InsertWrapper>> {
		Ok(None)
	}

	/// Relaxes referential integrity, runs the batch in a transaction and
	/// restores integrity afterwards.
	async fn disable_referential_integrity(
		&self,
		db: &mut dyn DatabaseBackend,
		batch: &LoadBatch<'_>,
	) -> Result<()>;
}

/// Runs an introspection query and collects its first column as strings,
/// tagging failures with the introspection step they belong to.
pub(crate) async fn fetch_single_column(
	db: &mut dyn DatabaseBackend,
	sql: &str,
	params: Vec<SqlValue>,
	detail: &str,
) -> Result<Vec<String>> {
	let rows = db
		.fetch_all(sql, params)
		.await
		.map_err(|source| FixtureError::SchemaIntrospection {
			detail: detail.to_string(),
			source,
		})?;
	rows.iter()
		.map(|row| row.get::<String>(0))
		.collect::<std::result::Result<Vec<_>, _>>()
		.map_err(|source| FixtureError::SchemaIntrospection {
			detail: detail.to_string(),
			source,
		})
}

/// Builds the adapter for a dialect.
pub(crate) fn adapter_for(dialect: Dialect, options: AdapterOptions) -> Box<dyn DialectAdapter> {
	match dialect {
		Dialect::Postgres => Box::new(postgres::PostgresAdapter::new(options)),
		Dialect::Cockroach => Box::new(cockroachdb::CockroachAdapter::new(options)),
		Dialect::Mysql => Box::new(mysql::MysqlAdapter::new(options)),
		Dialect::Sqlite => Box::new(sqlite::SqliteAdapter::new()),
		Dialect::SqlServer => Box::new(sqlserver::SqlServerAdapter::new()),
		Dialect::Clickhouse => Box::new(clickhouse::ClickhouseAdapter::new(options)),
		Dialect::Spanner => Box::new(spanner::SpannerAdapter::new()),
		Dialect::Oracle => Box::new(oracle::OracleAdapter::new(options)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case("postgres", Dialect::Postgres)]
	#[case("postgresql", Dialect::Postgres)]
	#[case("timescaledb", Dialect::Postgres)]
	#[case("pgx", Dialect::Postgres)]
	#[case("PostgreSQL", Dialect::Postgres)]
	#[case("cockroach", Dialect::Cockroach)]
	#[case("cockroachdb", Dialect::Cockroach)]
	#[case("crdb", Dialect::Cockroach)]
	#[case("mysql", Dialect::Mysql)]
	#[case("mariadb", Dialect::Mysql)]
	#[case("sqlite", Dialect::Sqlite)]
	#[case("sqlite3", Dialect::Sqlite)]
	#[case("sqlserver", Dialect::SqlServer)]
	#[case("mssql", Dialect::SqlServer)]
	#[case("clickhouse", Dialect::Clickhouse)]
	#[case("spanner", Dialect::Spanner)]
	#[case("googlesql", Dialect::Spanner)]
	#[case("oracle", Dialect::Oracle)]
	fn test_dialect_aliases(#[case] name: &str, #[case] expected: Dialect) {
		assert_eq!(Dialect::from_name(name).unwrap(), expected);
	}

	#[rstest]
	fn test_unknown_dialect_is_rejected() {
		let err = Dialect::from_name("mongodb").unwrap_err();
		assert!(matches!(err, FixtureError::UnknownDialect(name) if name == "mongodb"));
	}

	#[rstest]
	#[case(ParamType::Dollar, 1, "$1")]
	#[case(ParamType::Dollar, 12, "$12")]
	#[case(ParamType::Question, 3, "?")]
	#[case(ParamType::AtSign, 2, "@p2")]
	#[case(ParamType::Colon, 4, ":4")]
	fn test_placeholder_rendering(
		#[case] param_type: ParamType,
		#[case] index: usize,
		#[case] expected: &str,
	) {
		assert_eq!(param_type.placeholder(index), expected);
	}

	#[rstest]
	fn test_dialect_display_roundtrip() {
		for dialect in [
			Dialect::Postgres,
			Dialect::Cockroach,
			Dialect::Mysql,
			Dialect::Sqlite,
			Dialect::SqlServer,
			Dialect::Clickhouse,
			Dialect::Spanner,
			Dialect::Oracle,
		] {
			assert_eq!(Dialect::from_name(dialect.name()).unwrap(), dialect);
		}
	}
}
