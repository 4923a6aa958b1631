//! MySQL / MariaDB adapter.
//!
//! Referential integrity is session-scoped: `FOREIGN_KEY_CHECKS` is turned
//! off inside the load transaction and back on before committing, so no
//! schema-level restore step is needed. Auto-increment counters play the
//! role of sequences and are bumped on every table after a load.

use async_trait::async_trait;

use crate::backend::{DatabaseBackend, SqlValue};
use crate::builder::LoadBatch;
use crate::checksum::{Checksum, ChecksumCache};
use crate::dialect::{AdapterOptions, Dialect, DialectAdapter, ParamType, fetch_single_column};
use crate::error::{FixtureError, Result};
use crate::guard;

const TABLE_NAMES_SQL: &str = "
	SELECT table_name
	FROM information_schema.tables
	WHERE table_schema = ?
	  AND table_type = 'BASE TABLE'
";

pub(crate) struct MysqlAdapter {
	options: AdapterOptions,
	tables: Vec<String>,
	checksums: ChecksumCache,
}

impl MysqlAdapter {
	pub fn new(options: AdapterOptions) -> Self {
		Self {
			options,
			tables: Vec::new(),
			checksums: ChecksumCache::new(),
		}
	}

	async fn fetch_checksum(
		&self,
		db: &mut dyn DatabaseBackend,
		table: &str,
	) -> Result<Checksum> {
		let sql = format!("CHECKSUM TABLE {}", self.quote_identifier(table));
		let row = db.fetch_optional(&sql, Vec::new()).await.map_err(|source| {
			FixtureError::ChecksumComputation {
				table: table.to_string(),
				source,
			}
		})?;
		// Row shape: (table, checksum); the checksum is NULL when the table
		// does not exist.
		match row.as_ref().and_then(|row| row.value(1)) {
			Some(SqlValue::Int(value)) => Ok(Checksum::Int(*value)),
			_ => Err(FixtureError::ChecksumComputation {
				table: table.to_string(),
				source: crate::backend::DatabaseError::QueryError(format!(
					"table {table} does not exist"
				)),
			}),
		}
	}

	fn reset_statement(&self, table: &str, floor: i64) -> String {
		format!(
			"ALTER TABLE {} AUTO_INCREMENT = {}",
			self.quote_identifier(table),
			floor
		)
	}

	async fn reset_sequences(&self, db: &mut dyn DatabaseBackend) -> Result<()> {
		let floor = self.options.sequence_floor();
		if self.options.multi_statements {
			// One round trip; the connection must allow multi-statement
			// queries for this to work.
			let mut sql = String::new();
			for table in &self.tables {
				sql.push_str(&self.reset_statement(table, floor));
				sql.push(';');
			}
			if sql.is_empty() {
				return Ok(());
			}
			return db.execute(&sql, Vec::new()).await.map(|_| ()).map_err(|source| {
				FixtureError::SequenceReset {
					sequence: "auto-increment counters".to_string(),
					source,
				}
			});
		}
		for table in &self.tables {
			db.execute(&self.reset_statement(table, floor), Vec::new())
				.await
				.map_err(|source| FixtureError::SequenceReset {
					sequence: table.clone(),
					source,
				})?;
		}
		Ok(())
	}
}

#[async_trait]
impl DialectAdapter for MysqlAdapter {
	fn dialect(&self) -> Dialect {
		Dialect::Mysql
	}

	fn default_param_type(&self) -> ParamType {
		ParamType::Question
	}

	fn quote_identifier(&self, name: &str) -> String {
		format!("`{name}`")
	}

	async fn init(&mut self, db: &mut dyn DatabaseBackend) -> Result<()> {
		let database = self.database_name(db).await?;
		self.tables = fetch_single_column(
			db,
			TABLE_NAMES_SQL,
			vec![SqlValue::Text(database)],
			"collecting table names",
		)
		.await?;
		Ok(())
	}

	async fn database_name(&self, db: &mut dyn DatabaseBackend) -> Result<String> {
		let row = db
			.fetch_optional("SELECT DATABASE()", Vec::new())
			.await
			.map_err(FixtureError::Database)?;
		match row {
			Some(row) => row.get::<String>(0).map_err(FixtureError::Database),
			None => Err(FixtureError::DatabaseNameUndeterminable),
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
		let prelude = vec!["SET FOREIGN_KEY_CHECKS = 0".to_string()];
		let epilogue = vec!["SET FOREIGN_KEY_CHECKS = 1".to_string()];
		let load_result =
			guard::run_batch_transaction(db, self, batch, &prelude, &epilogue).await;

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
	fn test_quote_identifier_uses_backticks() {
		let adapter = MysqlAdapter::new(AdapterOptions::default());
		assert_eq!(adapter.quote_identifier("posts"), "`posts`");
	}

	#[rstest]
	fn test_dotted_names_are_not_split() {
		let adapter = MysqlAdapter::new(AdapterOptions::default());
		assert_eq!(adapter.quote_identifier("db.posts"), "`db.posts`");
	}

	#[rstest]
	fn test_reset_statement_uses_floor() {
		let adapter = MysqlAdapter::new(AdapterOptions::default());
		assert_eq!(
			adapter.reset_statement("posts", 10_000),
			"ALTER TABLE `posts` AUTO_INCREMENT = 10000"
		);
	}

	#[rstest]
	fn test_custom_floor_is_respected() {
		let adapter = MysqlAdapter::new(AdapterOptions {
			reset_sequences_to: 500,
			..AdapterOptions::default()
		});
		assert_eq!(
			adapter.reset_statement("posts", adapter.options.sequence_floor()),
			"ALTER TABLE `posts` AUTO_INCREMENT = 500"
		);
	}
}
