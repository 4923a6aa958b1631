//! Compilation of fixture sets into executable statements.
//!
//! Compilation happens once, at loader construction: every record becomes an
//! INSERT statement with its bound parameters. Loading then only replays the
//! prepared statements, so a load that runs before each test case does no
//! parsing or rendering work.

use crate::backend::{DatabaseBackend, SqlExecutor, SqlValue};
use crate::dialect::{DialectAdapter, ParamType};
use crate::error::{FixtureError, Result};
use crate::fixtures::FixtureSet;
use crate::value::{self, EncodedValue};

/// One ready-to-run INSERT statement.
#[derive(Debug, Clone)]
pub(crate) struct CompiledInsert {
	pub sql: String,
	pub params: Vec<SqlValue>,
	/// Index of the record within its fixture set, for error context.
	pub index: usize,
}

/// All prepared statements for one table.
#[derive(Debug, Clone)]
pub(crate) struct CompiledTable {
	/// Fixture source the table came from, for error context.
	pub source: String,
	pub table: String,
	pub quoted_table: String,
	pub inserts: Vec<CompiledInsert>,
}

/// The rendered pieces of one record, handed to the adapter to assemble the
/// final INSERT statement.
pub(crate) struct InsertPieces<'a> {
	/// Table name as written in the fixture source.
	pub table: &'a str,
	pub quoted_table: &'a str,
	/// Column names as written in the fixture source.
	pub columns: &'a [String],
	pub quoted_columns: &'a [String],
	/// Rendered value expressions: placeholders, `NULL`, or raw fragments.
	pub values: &'a [String],
}

/// Compiles one fixture set against a dialect.
pub(crate) async fn compile(
	adapter: &dyn DialectAdapter,
	db: &mut dyn DatabaseBackend,
	set: &FixtureSet,
	param_type: ParamType,
) -> Result<CompiledTable> {
	let table = set.table().to_string();
	let quoted_table = adapter.quote_identifier(&table);
	let mut inserts = Vec::with_capacity(set.records().len());

	for (index, record) in set.records().iter().enumerate() {
		let mut columns = Vec::with_capacity(record.len());
		let mut quoted_columns = Vec::with_capacity(record.len());
		let mut values = Vec::with_capacity(record.len());
		let mut params = Vec::new();

		for (column, fixture_value) in record.iter() {
			let encoded = value::encode(fixture_value).map_err(|detail| {
				FixtureError::ValueEncoding {
					table: table.clone(),
					column: column.to_string(),
					detail,
				}
			})?;
			columns.push(column.to_string());
			quoted_columns.push(adapter.quote_identifier(column));
			match encoded {
				EncodedValue::Fragment(fragment) => values.push(fragment),
				EncodedValue::Param(param) => {
					// Placeholders are numbered by bound parameters only;
					// fragments do not consume an index.
					params.push(param);
					values.push(param_type.placeholder(params.len()));
				}
			}
		}

		let sql = adapter
			.build_insert_sql(
				db,
				InsertPieces {
					table: &table,
					quoted_table: &quoted_table,
					columns: &columns,
					quoted_columns: &quoted_columns,
					values: &values,
				},
			)
			.await?;
		inserts.push(CompiledInsert { sql, params, index });
	}

	Ok(CompiledTable {
		source: set.source().to_string(),
		table,
		quoted_table,
		inserts,
	})
}

/// The set of tables being loaded in one transaction.
///
/// Running a batch first cleans every table in reverse fixture order, then
/// inserts every record, table by table in fixture order. Fixtures are
/// usually written parents first, so the reverse pass deletes child rows
/// before the rows they reference, which keeps deletes safe even under
/// integrity relaxations that only defer checks to commit time.
pub(crate) struct LoadBatch<'a> {
	tables: Vec<&'a CompiledTable>,
	skip_cleanup: bool,
}

impl<'a> LoadBatch<'a> {
	pub fn new(tables: Vec<&'a CompiledTable>, skip_cleanup: bool) -> Self {
		Self {
			tables,
			skip_cleanup,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.tables.is_empty()
	}

	pub fn len(&self) -> usize {
		self.tables.len()
	}

	/// Runs the batch on an open transaction.
	pub async fn run(
		&self,
		executor: &mut dyn SqlExecutor,
		dialect: &dyn DialectAdapter,
	) -> Result<()> {
		if !self.skip_cleanup {
			for table in self.tables.iter().rev() {
				executor
					.execute(&dialect.clean_table_sql(&table.quoted_table), Vec::new())
					.await
					.map_err(|source| FixtureError::CleanTable {
						table: table.table.clone(),
						source,
					})?;
			}
		}

		for table in &self.tables {
			let wrapper = dialect
				.insert_wrapper(executor, &table.table, &table.quoted_table)
				.await?;
			if let Some(wrapper) = &wrapper {
				executor
					.execute(&wrapper.before, Vec::new())
					.await
					.map_err(FixtureError::Database)?;
			}

			let mut result = Ok(());
			for insert in &table.inserts {
				if let Err(source) = executor.execute(&insert.sql, insert.params.clone()).await {
					result = Err(FixtureError::Insert {
						fixture: table.source.clone(),
						index: insert.index,
						sql: insert.sql.clone(),
						params: insert.params.clone(),
						source,
					});
					break;
				}
			}

			// The closing statement runs even when an insert failed; its
			// error only surfaces when the inserts themselves succeeded.
			if let Some(wrapper) = &wrapper {
				if let Err(source) = executor.execute(&wrapper.after, Vec::new()).await {
					if result.is_ok() {
						result = Err(FixtureError::Database(source));
					}
				}
			}
			result?;
			tracing::debug!(
				table = %table.table,
				rows = table.inserts.len(),
				"table loaded"
			);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dialect::{adapter_for, AdapterOptions, Dialect};
	use crate::fixtures::FixtureRecord;
	use crate::value::FixtureValue;
	use rstest::rstest;

	struct NullBackend;

	#[async_trait::async_trait]
	impl SqlExecutor for NullBackend {
		async fn execute(
			&mut self,
			_sql: &str,
			_params: Vec<SqlValue>,
		) -> std::result::Result<crate::backend::ExecResult, crate::backend::DatabaseError> {
			Ok(crate::backend::ExecResult::default())
		}

		async fn fetch_all(
			&mut self,
			_sql: &str,
			_params: Vec<SqlValue>,
		) -> std::result::Result<Vec<crate::backend::Row>, crate::backend::DatabaseError> {
			Ok(Vec::new())
		}
	}

	#[async_trait::async_trait]
	impl DatabaseBackend for NullBackend {
		async fn begin(
			&mut self,
		) -> std::result::Result<
			Box<dyn crate::backend::TransactionExecutor>,
			crate::backend::DatabaseError,
		> {
			Err(crate::backend::DatabaseError::TransactionError(
				"not supported".to_string(),
			))
		}
	}

	fn sample_set() -> FixtureSet {
		let mut first = FixtureRecord::new();
		first.set("id", 1);
		first.set("title", "a post");
		first.set("created_at", "RAW=CURRENT_TIMESTAMP");
		first.set("deleted_at", FixtureValue::Null);
		let mut second = FixtureRecord::new();
		second.set("id", 2);
		second.set("title", "another");
		FixtureSet::new("posts", vec![first, second])
	}

	async fn compile_with(dialect: Dialect) -> CompiledTable {
		let adapter = adapter_for(dialect, AdapterOptions::default());
		let mut db = NullBackend;
		let param_type = adapter.default_param_type();
		compile(adapter.as_ref(), &mut db, &sample_set(), param_type)
			.await
			.unwrap()
	}

	#[rstest]
	#[tokio::test]
	async fn test_compile_sqlite_renders_question_marks() {
		let compiled = compile_with(Dialect::Sqlite).await;
		assert_eq!(compiled.quoted_table, "\"posts\"");
		assert_eq!(
			compiled.inserts[0].sql,
			"INSERT INTO \"posts\" (\"id\", \"title\", \"created_at\", \"deleted_at\") \
			 VALUES (?, ?, CURRENT_TIMESTAMP, NULL)"
		);
		assert_eq!(
			compiled.inserts[0].params,
			vec![SqlValue::Int(1), SqlValue::Text("a post".to_string())]
		);
	}

	#[rstest]
	#[tokio::test]
	async fn test_compile_mysql_uses_backticks() {
		let compiled = compile_with(Dialect::Mysql).await;
		assert_eq!(
			compiled.inserts[1].sql,
			"INSERT INTO `posts` (`id`, `title`) VALUES (?, ?)"
		);
	}

	#[rstest]
	#[tokio::test]
	async fn test_fragments_do_not_consume_placeholder_indexes() {
		// With dollar placeholders the numbering must skip raw fragments.
		let compiled = compile_with(Dialect::Postgres).await;
		assert_eq!(
			compiled.inserts[0].sql,
			"INSERT INTO \"posts\" (\"id\", \"title\", \"created_at\", \"deleted_at\") \
			 VALUES ($1, $2, CURRENT_TIMESTAMP, NULL)"
		);
		assert_eq!(compiled.inserts[0].params.len(), 2);
	}

	#[rstest]
	#[tokio::test]
	async fn test_record_index_is_preserved() {
		let compiled = compile_with(Dialect::Sqlite).await;
		assert_eq!(compiled.inserts[0].index, 0);
		assert_eq!(compiled.inserts[1].index, 1);
	}
}
