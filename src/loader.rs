//! The loader and its builder.
//!
//! A [`Loader`] is built once per test binary, compiled against a live
//! connection, and then [`Loader::load`] runs before every test case to put
//! the database back into the state the fixtures describe.

use std::collections::HashSet;

use crate::backend::DatabaseBackend;
use crate::builder::{self, CompiledTable, LoadBatch};
use crate::dialect::{AdapterOptions, Dialect, DialectAdapter, ParamType, adapter_for};
use crate::error::{FixtureError, Result};
use crate::fixtures::{FixtureFormat, FixtureSet};

/// Matches the case-insensitive marker a database name must carry before
/// the loader will touch it.
fn looks_like_test_database(name: &str) -> bool {
	name.to_lowercase().contains("test")
}

/// Fixture contents waiting to be parsed at build time.
enum PendingFixture {
	/// One file, one table.
	Single { name: String, contents: String },
	/// One file holding several tables.
	Multi { name: String, contents: String },
	/// Already parsed or built programmatically.
	Parsed(FixtureSet),
}

/// Configures and constructs a [`Loader`].
///
/// ```no_run
/// # async fn example(pool: sqlx::SqlitePool) -> musette::Result<()> {
/// use musette::{Dialect, Loader, SqliteBackend};
///
/// let mut loader = Loader::builder()
/// 	.with_database(SqliteBackend::new(pool))
/// 	.with_dialect(Dialect::Sqlite)
/// 	.with_fixture("posts.yml", "- id: 1\n  title: First post\n")
/// 	.build()
/// 	.await?;
/// loader.load().await?;
/// # Ok(())
/// # }
/// ```
#[must_use = "call build() to obtain the loader"]
pub struct LoaderBuilder {
	database: Option<Box<dyn DatabaseBackend>>,
	dialect: Option<Dialect>,
	dialect_name: Option<String>,
	default_format: Option<FixtureFormat>,
	pending: Vec<PendingFixture>,
	param_type: Option<ParamType>,
	options: AdapterOptions,
	skip_test_database_check: bool,
	skip_cleanup: bool,
	skip_checksum_computation: bool,
}

impl LoaderBuilder {
	/// Creates an empty builder.
	pub fn new() -> Self {
		Self {
			database: None,
			dialect: None,
			dialect_name: None,
			default_format: None,
			pending: Vec::new(),
			param_type: None,
			options: AdapterOptions::default(),
			skip_test_database_check: false,
			skip_cleanup: false,
			skip_checksum_computation: false,
		}
	}

	/// Sets the database connection the fixtures are loaded into.
	pub fn with_database(mut self, backend: impl DatabaseBackend + 'static) -> Self {
		self.database = Some(Box::new(backend));
		self
	}

	/// Sets the database dialect.
	pub fn with_dialect(mut self, dialect: Dialect) -> Self {
		self.dialect = Some(dialect);
		self
	}

	/// Sets the dialect by name or alias, e.g. `"mariadb"` or `"postgres"`.
	/// Resolution happens at build time.
	pub fn with_dialect_name(mut self, name: impl Into<String>) -> Self {
		self.dialect_name = Some(name.into());
		self
	}

	/// Sets the format assumed for fixture sources whose name carries no
	/// recognized extension. YAML is assumed otherwise.
	pub fn with_fixture_format(mut self, format: FixtureFormat) -> Self {
		self.default_format = Some(format);
		self
	}

	/// Adds a single-table fixture. The table name is the source name
	/// without its extension.
	pub fn with_fixture(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
		self.pending.push(PendingFixture::Single {
			name: name.into(),
			contents: contents.into(),
		});
		self
	}

	/// Adds a fixture whose top level maps table names to their records.
	pub fn with_multi_table_fixture(
		mut self,
		name: impl Into<String>,
		contents: impl Into<String>,
	) -> Self {
		self.pending.push(PendingFixture::Multi {
			name: name.into(),
			contents: contents.into(),
		});
		self
	}

	/// Adds an already constructed fixture set.
	pub fn with_fixture_set(mut self, set: FixtureSet) -> Self {
		self.pending.push(PendingFixture::Parsed(set));
		self
	}

	/// Overrides the placeholder style used in the generated INSERTs, for
	/// drivers that diverge from their engine's default.
	pub fn with_param_type(mut self, param_type: ParamType) -> Self {
		self.param_type = Some(param_type);
		self
	}

	/// Skips the check that the connected database name contains `"test"`.
	///
	/// Loading truncates every fixture table, so only do this when the
	/// target database is disposable by construction.
	pub fn dangerously_skip_test_database_check(mut self) -> Self {
		self.skip_test_database_check = true;
		self
	}

	/// Skips deleting existing rows before inserting. Inserts will collide
	/// with whatever the tables already contain.
	pub fn dangerously_skip_cleanup_before_insert(mut self) -> Self {
		self.skip_cleanup = true;
		self
	}

	/// Disables table checksums; every table is reloaded on every load.
	pub fn skip_table_checksum_computation(mut self) -> Self {
		self.skip_checksum_computation = true;
		self
	}

	/// Leaves sequences and auto-increment counters untouched after a load.
	pub fn skip_reset_sequences(mut self) -> Self {
		self.options.skip_reset_sequences = true;
		self
	}

	/// Value sequences are reset to after a load, instead of the default
	/// of 10000. Passing `0` keeps the default.
	pub fn with_reset_sequences_to(mut self, value: i64) -> Self {
		self.options.reset_sequences_to = value;
		self
	}

	/// PostgreSQL only: relax integrity by making constraints deferrable
	/// instead of disabling triggers. Works without superuser rights.
	pub fn use_alter_constraint(mut self) -> Self {
		self.options.use_alter_constraint = true;
		self
	}

	/// PostgreSQL only: relax integrity by dropping constraints and
	/// recreating them after the load.
	pub fn use_drop_constraint(mut self) -> Self {
		self.options.use_drop_constraint = true;
		self
	}

	/// MySQL only: batch statements such as auto-increment resets into one
	/// multi-statement query. The connection must be configured to allow
	/// multiple statements.
	pub fn allow_multiple_statements_in_one_query(mut self) -> Self {
		self.options.multi_statements = true;
		self
	}

	/// ClickHouse only: clean tables with `DELETE FROM` instead of
	/// `TRUNCATE TABLE`.
	pub fn clickhouse_use_delete_from(mut self) -> Self {
		self.options.clickhouse_delete_from = true;
		self
	}

	/// Validates the configuration, introspects the schema and compiles
	/// every fixture into ready-to-run statements.
	pub async fn build(self) -> Result<Loader> {
		let Self {
			database,
			dialect,
			dialect_name,
			default_format,
			pending,
			param_type,
			options,
			skip_test_database_check,
			skip_cleanup,
			skip_checksum_computation,
		} = self;

		let Some(mut backend) = database else {
			return Err(FixtureError::DatabaseRequired);
		};
		let dialect = match (dialect, dialect_name) {
			(Some(dialect), _) => dialect,
			(None, Some(name)) => Dialect::from_name(&name)?,
			(None, None) => return Err(FixtureError::DialectRequired),
		};

		if options.use_alter_constraint && options.use_drop_constraint {
			return Err(FixtureError::ConflictingOptions {
				first: "use_alter_constraint".to_string(),
				second: "use_drop_constraint".to_string(),
			});
		}
		if dialect != Dialect::Postgres {
			if options.use_alter_constraint {
				return Err(incompatible("use_alter_constraint", dialect));
			}
			if options.use_drop_constraint {
				return Err(incompatible("use_drop_constraint", dialect));
			}
		}
		if options.multi_statements && dialect != Dialect::Mysql {
			return Err(incompatible("allow_multiple_statements_in_one_query", dialect));
		}
		if options.clickhouse_delete_from && dialect != Dialect::Clickhouse {
			return Err(incompatible("clickhouse_use_delete_from", dialect));
		}

		let mut sets = Vec::with_capacity(pending.len());
		for fixture in pending {
			match fixture {
				PendingFixture::Single { name, contents } => {
					let format = source_format(&name, default_format);
					sets.push(FixtureSet::parse_with_format(&name, &contents, format)?);
				}
				PendingFixture::Multi { name, contents } => {
					let format = source_format(&name, default_format);
					sets.extend(FixtureSet::parse_multi_with_format(&name, &contents, format)?);
				}
				PendingFixture::Parsed(set) => sets.push(set),
			}
		}

		let mut seen = HashSet::with_capacity(sets.len());
		for set in &sets {
			if !seen.insert(set.table().to_string()) {
				return Err(FixtureError::DuplicateTable(set.table().to_string()));
			}
		}

		let mut adapter = adapter_for(dialect, options);
		adapter.init(backend.as_mut()).await?;

		let param_type = param_type.unwrap_or_else(|| adapter.default_param_type());
		let mut fixtures = Vec::with_capacity(sets.len());
		for set in &sets {
			fixtures.push(builder::compile(adapter.as_ref(), backend.as_mut(), set, param_type).await?);
		}

		Ok(Loader {
			backend,
			adapter,
			dialect,
			fixtures,
			skip_test_database_check,
			skip_cleanup,
			skip_checksum_computation,
		})
	}
}

impl Default for LoaderBuilder {
	fn default() -> Self {
		Self::new()
	}
}

fn incompatible(option: &str, dialect: Dialect) -> FixtureError {
	FixtureError::IncompatibleOption {
		option: option.to_string(),
		dialect: dialect.to_string(),
	}
}

fn source_format(name: &str, default: Option<FixtureFormat>) -> FixtureFormat {
	FixtureFormat::from_source_name(name)
		.or(default)
		.unwrap_or(FixtureFormat::Yaml)
}

/// Loads fixtures into a test database.
///
/// Construct one with [`Loader::builder`], then call [`Loader::load`] before
/// each test case.
pub struct Loader {
	backend: Box<dyn DatabaseBackend>,
	adapter: Box<dyn DialectAdapter>,
	dialect: Dialect,
	fixtures: Vec<CompiledTable>,
	skip_test_database_check: bool,
	skip_cleanup: bool,
	skip_checksum_computation: bool,
}

impl Loader {
	/// Starts building a loader.
	pub fn builder() -> LoaderBuilder {
		LoaderBuilder::new()
	}

	/// The dialect the loader was built for.
	pub fn dialect(&self) -> Dialect {
		self.dialect
	}

	/// Fails with [`FixtureError::NotATestDatabase`] unless the connected
	/// database's name contains `"test"` (case-insensitive).
	pub async fn ensure_test_database(&mut self) -> Result<()> {
		let name = self.adapter.database_name(self.backend.as_mut()).await?;
		if looks_like_test_database(&name) {
			Ok(())
		} else {
			Err(FixtureError::NotATestDatabase { name })
		}
	}

	/// Wipes the fixture tables and loads every record into them.
	///
	/// Tables whose checksum is unchanged since the previous load are
	/// skipped; when nothing changed at all, the database is left untouched.
	pub async fn load(&mut self) -> Result<()> {
		if !self.skip_test_database_check {
			self.ensure_test_database().await?;
		}

		let skip_checksums = self.skip_checksum_computation;
		let skip_cleanup = self.skip_cleanup;
		let dialect = self.dialect;
		let Self {
			backend,
			adapter,
			fixtures,
			..
		} = self;
		let db = backend.as_mut();

		let mut modified: Vec<&CompiledTable> = Vec::with_capacity(fixtures.len());
		if skip_checksums {
			modified.extend(fixtures.iter());
		} else {
			for table in fixtures.iter() {
				match adapter.is_table_modified(db, &table.table).await {
					Ok(true) => modified.push(table),
					Ok(false) => {
						tracing::debug!(
							table = %table.table,
							"table unchanged since last load, skipping"
						);
					}
					Err(error) => {
						// A failed probe must not skip a reload.
						tracing::warn!(
							table = %table.table,
							error = %error,
							"table change probe failed, reloading the table"
						);
						modified.push(table);
					}
				}
			}
		}

		let dirty: Vec<String> = modified.iter().map(|table| table.table.clone()).collect();
		let batch = LoadBatch::new(modified, skip_cleanup);
		if batch.is_empty() {
			tracing::debug!(dialect = %dialect, "no fixture table changed, nothing to load");
		} else {
			tracing::debug!(dialect = %dialect, tables = batch.len(), "loading fixtures");
			adapter.disable_referential_integrity(db, &batch).await?;
		}
		if !skip_checksums {
			adapter.refresh_checksums(db, &dirty).await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::{DatabaseError, ExecResult, Row, SqlExecutor, SqlValue, TransactionExecutor};
	use crate::fixtures::FixtureRecord;
	use rstest::rstest;

	/// Answers every query with a fixed row set and never opens a
	/// transaction.
	struct StubBackend {
		rows: Vec<Row>,
	}

	impl StubBackend {
		fn empty() -> Self {
			Self { rows: Vec::new() }
		}

		fn sqlite_database_list(file: &str) -> Self {
			Self {
				rows: vec![Row::new(
					vec!["seq".to_string(), "name".to_string(), "file".to_string()],
					vec![
						SqlValue::Int(0),
						SqlValue::Text("main".to_string()),
						SqlValue::Text(file.to_string()),
					],
				)],
			}
		}
	}

	#[async_trait::async_trait]
	impl SqlExecutor for StubBackend {
		async fn execute(
			&mut self,
			_sql: &str,
			_params: Vec<SqlValue>,
		) -> std::result::Result<ExecResult, DatabaseError> {
			Ok(ExecResult::default())
		}

		async fn fetch_all(
			&mut self,
			_sql: &str,
			_params: Vec<SqlValue>,
		) -> std::result::Result<Vec<Row>, DatabaseError> {
			Ok(self.rows.clone())
		}
	}

	#[async_trait::async_trait]
	impl DatabaseBackend for StubBackend {
		async fn begin(
			&mut self,
		) -> std::result::Result<Box<dyn TransactionExecutor>, DatabaseError> {
			Err(DatabaseError::TransactionError(
				"stub backend has no transactions".to_string(),
			))
		}
	}

	fn posts_set() -> FixtureSet {
		let mut record = FixtureRecord::new();
		record.set("id", 1i64);
		record.set("title", "First post");
		FixtureSet::new("posts", vec![record])
	}

	#[rstest]
	#[case("myapp_test", true)]
	#[case("db_test", true)]
	#[case("dbTEST", true)]
	#[case("TEST_db", true)]
	#[case("testing", true)]
	#[case("integration-Test", true)]
	#[case("productionTestCopy", true)]
	#[case("production", false)]
	#[case("t_e_s_t", false)]
	#[case("", false)]
	// Cyrillic "т" is not a latin "t".
	#[case("тest", false)]
	fn test_test_database_name_marker(#[case] name: &str, #[case] expected: bool) {
		assert_eq!(looks_like_test_database(name), expected);
	}

	#[rstest]
	#[tokio::test]
	async fn test_build_without_database_fails() {
		let result = LoaderBuilder::new().with_dialect(Dialect::Sqlite).build().await;
		assert!(matches!(result, Err(FixtureError::DatabaseRequired)));
	}

	#[rstest]
	#[tokio::test]
	async fn test_build_without_dialect_fails() {
		let result = LoaderBuilder::new()
			.with_database(StubBackend::empty())
			.build()
			.await;
		assert!(matches!(result, Err(FixtureError::DialectRequired)));
	}

	#[rstest]
	#[tokio::test]
	async fn test_build_with_unknown_dialect_name_fails() {
		let result = LoaderBuilder::new()
			.with_database(StubBackend::empty())
			.with_dialect_name("mongodb")
			.build()
			.await;
		assert!(matches!(result, Err(FixtureError::UnknownDialect(name)) if name == "mongodb"));
	}

	#[rstest]
	#[tokio::test]
	async fn test_dialect_name_aliases_resolve() {
		let loader = LoaderBuilder::new()
			.with_database(StubBackend::empty())
			.with_dialect_name("sqlite3")
			.build()
			.await
			.unwrap();
		assert_eq!(loader.dialect(), Dialect::Sqlite);
	}

	#[rstest]
	#[tokio::test]
	async fn test_conflicting_constraint_options_fail() {
		let result = LoaderBuilder::new()
			.with_database(StubBackend::empty())
			.with_dialect(Dialect::Postgres)
			.use_alter_constraint()
			.use_drop_constraint()
			.build()
			.await;
		assert!(matches!(result, Err(FixtureError::ConflictingOptions { .. })));
	}

	#[rstest]
	#[tokio::test]
	async fn test_alter_constraint_is_postgres_only() {
		let result = LoaderBuilder::new()
			.with_database(StubBackend::empty())
			.with_dialect(Dialect::Sqlite)
			.use_alter_constraint()
			.build()
			.await;
		assert!(matches!(
			result,
			Err(FixtureError::IncompatibleOption { option, dialect })
				if option == "use_alter_constraint" && dialect == "sqlite"
		));
	}

	#[rstest]
	#[tokio::test]
	async fn test_multiple_statements_is_mysql_only() {
		let result = LoaderBuilder::new()
			.with_database(StubBackend::empty())
			.with_dialect(Dialect::Sqlite)
			.allow_multiple_statements_in_one_query()
			.build()
			.await;
		assert!(matches!(
			result,
			Err(FixtureError::IncompatibleOption { option, .. })
				if option == "allow_multiple_statements_in_one_query"
		));
	}

	#[rstest]
	#[tokio::test]
	async fn test_delete_from_is_clickhouse_only() {
		let result = LoaderBuilder::new()
			.with_database(StubBackend::empty())
			.with_dialect(Dialect::Sqlite)
			.clickhouse_use_delete_from()
			.build()
			.await;
		assert!(matches!(
			result,
			Err(FixtureError::IncompatibleOption { option, .. })
				if option == "clickhouse_use_delete_from"
		));
	}

	#[rstest]
	#[tokio::test]
	async fn test_duplicate_tables_are_rejected() {
		let result = LoaderBuilder::new()
			.with_database(StubBackend::empty())
			.with_dialect(Dialect::Sqlite)
			.with_fixture_set(posts_set())
			.with_fixture_set(posts_set())
			.build()
			.await;
		assert!(matches!(result, Err(FixtureError::DuplicateTable(table)) if table == "posts"));
	}

	#[rstest]
	#[tokio::test]
	async fn test_build_compiles_fixture_sets() {
		let loader = LoaderBuilder::new()
			.with_database(StubBackend::empty())
			.with_dialect(Dialect::Sqlite)
			.with_fixture_set(posts_set())
			.build()
			.await
			.unwrap();
		assert_eq!(loader.fixtures.len(), 1);
		let insert = &loader.fixtures[0].inserts[0];
		assert_eq!(insert.sql, "INSERT INTO \"posts\" (\"id\", \"title\") VALUES (?, ?)");
		assert_eq!(insert.params.len(), 2);
	}

	#[rstest]
	#[tokio::test]
	async fn test_param_type_override_changes_placeholders() {
		let loader = LoaderBuilder::new()
			.with_database(StubBackend::empty())
			.with_dialect(Dialect::Sqlite)
			.with_param_type(ParamType::Dollar)
			.with_fixture_set(posts_set())
			.build()
			.await
			.unwrap();
		let insert = &loader.fixtures[0].inserts[0];
		assert_eq!(insert.sql, "INSERT INTO \"posts\" (\"id\", \"title\") VALUES ($1, $2)");
	}

	#[rstest]
	#[tokio::test]
	async fn test_ensure_test_database_accepts_test_names() {
		let mut loader = LoaderBuilder::new()
			.with_database(StubBackend::sqlite_database_list("/tmp/myapp_test.sqlite3"))
			.with_dialect(Dialect::Sqlite)
			.build()
			.await
			.unwrap();
		loader.ensure_test_database().await.unwrap();
	}

	#[rstest]
	#[tokio::test]
	async fn test_ensure_test_database_rejects_other_names() {
		let mut loader = LoaderBuilder::new()
			.with_database(StubBackend::sqlite_database_list("/var/lib/prod.sqlite3"))
			.with_dialect(Dialect::Sqlite)
			.build()
			.await
			.unwrap();
		let err = loader.ensure_test_database().await.unwrap_err();
		assert!(
			matches!(err, FixtureError::NotATestDatabase { name } if name == "prod.sqlite3")
		);
	}
}
