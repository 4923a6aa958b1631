//! Microsoft SQL Server adapter.
//!
//! Constraint checking is suspended with `ALTER TABLE .. NOCHECK CONSTRAINT
//! ALL` per table before the load transaction and re-armed with `WITH CHECK
//! CHECK CONSTRAINT ALL` afterwards. Tables with an identity column need
//! `SET IDENTITY_INSERT .. ON` around their inserts to accept explicit key
//! values.

use async_trait::async_trait;

use crate::backend::{DatabaseBackend, SqlExecutor, SqlValue};
use crate::builder::LoadBatch;
use crate::dialect::{Dialect, DialectAdapter, InsertWrapper, ParamType, fetch_single_column};
use crate::error::{FixtureError, Result};
use crate::guard;

const TABLE_NAMES_SQL: &str = "\
SELECT table_schema + '.' + table_name \
FROM information_schema.tables \
WHERE table_type = 'BASE TABLE'";

const IDENTITY_COLUMNS_SQL: &str = "\
SELECT COUNT(*) \
FROM sys.identity_columns \
WHERE object_id = OBJECT_ID(@p1)";

pub(crate) fn identity_insert_wrapper(quoted_table: &str) -> InsertWrapper {
	InsertWrapper {
		before: format!("SET IDENTITY_INSERT {quoted_table} ON"),
		after: format!("SET IDENTITY_INSERT {quoted_table} OFF"),
	}
}

pub(crate) struct SqlServerAdapter {
	tables: Vec<String>,
}

impl SqlServerAdapter {
	pub fn new() -> Self {
		Self { tables: Vec::new() }
	}

	async fn table_has_identity_column(
		&self,
		executor: &mut dyn SqlExecutor,
		table: &str,
	) -> Result<bool> {
		// OBJECT_ID resolves schema-qualified names, so the raw table name
		// is passed through unquoted.
		let row = executor
			.fetch_optional(IDENTITY_COLUMNS_SQL, vec![SqlValue::Text(table.to_string())])
			.await
			.map_err(|source| FixtureError::SchemaIntrospection {
				detail: format!("checking identity columns of {table}"),
				source,
			})?;
		let count = match row {
			Some(row) => row.get::<i64>(0).map_err(|source| {
				FixtureError::SchemaIntrospection {
					detail: format!("checking identity columns of {table}"),
					source,
				}
			})?,
			None => 0,
		};
		Ok(count > 0)
	}
}

#[async_trait]
impl DialectAdapter for SqlServerAdapter {
	fn dialect(&self) -> Dialect {
		Dialect::SqlServer
	}

	fn default_param_type(&self) -> ParamType {
		ParamType::AtSign
	}

	fn quote_identifier(&self, name: &str) -> String {
		name.split('.')
			.map(|part| format!("[{part}]"))
			.collect::<Vec<_>>()
			.join(".")
	}

	async fn init(&mut self, db: &mut dyn DatabaseBackend) -> Result<()> {
		self.tables =
			fetch_single_column(db, TABLE_NAMES_SQL, Vec::new(), "collecting table names").await?;
		Ok(())
	}

	async fn database_name(&self, db: &mut dyn DatabaseBackend) -> Result<String> {
		let row = db
			.fetch_optional("SELECT DB_NAME()", Vec::new())
			.await
			.map_err(FixtureError::Database)?;
		match row {
			Some(row) => row.get::<String>(0).map_err(FixtureError::Database),
			None => Err(FixtureError::DatabaseNameUndeterminable),
		}
	}

	async fn insert_wrapper(
		&self,
		executor: &mut dyn SqlExecutor,
		table: &str,
		quoted_table: &str,
	) -> Result<Option<InsertWrapper>> {
		if self.table_has_identity_column(executor, table).await? {
			Ok(Some(identity_insert_wrapper(quoted_table)))
		} else {
			Ok(None)
		}
	}

	async fn disable_referential_integrity(
		&self,
		db: &mut dyn DatabaseBackend,
		batch: &LoadBatch<'_>,
	) -> Result<()> {
		let nocheck: Vec<String> = self
			.tables
			.iter()
			.map(|table| {
				format!("ALTER TABLE {} NOCHECK CONSTRAINT ALL", self.quote_identifier(table))
			})
			.collect();
		let recheck: Vec<String> = self
			.tables
			.iter()
			.map(|table| {
				format!(
					"ALTER TABLE {} WITH CHECK CHECK CONSTRAINT ALL",
					self.quote_identifier(table)
				)
			})
			.collect();

		let load_result = match guard::run_statements(db, &nocheck).await {
			Ok(()) => guard::run_batch_transaction(db, self, batch, &[], &[]).await,
			Err(source) => Err(FixtureError::IntegrityRelax { source }),
		};

		// Re-arm the constraints even when the load failed; the NOCHECK
		// statements took effect outside the transaction.
		let restore_result = guard::run_statements_best_effort(db, &recheck).await;
		guard::combine_restore(load_result, restore_result, false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case("posts_tags", "[posts_tags]")]
	#[case("test_schema.posts_tags", "[test_schema].[posts_tags]")]
	fn test_quote_identifier_brackets(#[case] name: &str, #[case] expected: &str) {
		let adapter = SqlServerAdapter::new();
		assert_eq!(adapter.quote_identifier(name), expected);
	}

	#[rstest]
	fn test_identity_insert_wrapper_statements() {
		let wrapper = identity_insert_wrapper("[dbo].[posts]");
		assert_eq!(wrapper.before, "SET IDENTITY_INSERT [dbo].[posts] ON");
		assert_eq!(wrapper.after, "SET IDENTITY_INSERT [dbo].[posts] OFF");
	}

	#[rstest]
	fn test_default_param_type_is_at_sign() {
		let adapter = SqlServerAdapter::new();
		assert_eq!(adapter.default_param_type(), ParamType::AtSign);
		assert_eq!(ParamType::AtSign.placeholder(1), "@p1");
	}
}
