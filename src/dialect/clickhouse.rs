//! ClickHouse adapter.
//!
//! ClickHouse has no foreign keys, so the load runs in a plain transaction
//! with no integrity handling. Tables are cleaned with `TRUNCATE TABLE` by
//! default because deletes are comparatively expensive; change detection
//! hashes every row with `cityHash64`.

use async_trait::async_trait;

use crate::backend::{DatabaseBackend, SqlValue};
use crate::builder::LoadBatch;
use crate::checksum::{Checksum, ChecksumCache};
use crate::dialect::{AdapterOptions, Dialect, DialectAdapter, ParamType, fetch_single_column};
use crate::error::{FixtureError, Result};
use crate::guard;

const TABLE_NAMES_SQL: &str = "SELECT name FROM system.tables WHERE database = ?";

pub(crate) struct ClickhouseAdapter {
	options: AdapterOptions,
	tables: Vec<String>,
	checksums: ChecksumCache,
}

impl ClickhouseAdapter {
	pub fn new(options: AdapterOptions) -> Self {
		Self { options, tables: Vec::new(), checksums: ChecksumCache::new() }
	}

	async fn fetch_checksum(&self, db: &mut dyn DatabaseBackend, table: &str) -> Result<Checksum> {
		// toInt64 halves the hash because the client protocol has no
		// unsigned 64-bit type.
		let sql = format!(
			"SELECT toInt64(groupBitXor(cityHash64(*)) / 2) FROM {}",
			self.quote_identifier(table)
		);
		let row = db.fetch_optional(&sql, Vec::new()).await.map_err(|source| {
			FixtureError::ChecksumComputation { table: table.to_string(), source }
		})?;
		// An empty table aggregates to NULL; treat that as zero.
		let value = match row.as_ref().and_then(|row| row.value(0)) {
			Some(SqlValue::Int(value)) => *value,
			Some(SqlValue::Null) | None => 0,
			Some(other) => {
				return Err(FixtureError::ChecksumComputation {
					table: table.to_string(),
					source: crate::backend::DatabaseError::TypeError(format!(
						"unexpected checksum value {other} for table {table}"
					)),
				});
			}
		};
		Ok(Checksum::Int(value))
	}
}

#[async_trait]
impl DialectAdapter for ClickhouseAdapter {
	fn dialect(&self) -> Dialect {
		Dialect::Clickhouse
	}

	fn default_param_type(&self) -> ParamType {
		ParamType::Question
	}

	fn quote_identifier(&self, name: &str) -> String {
		format!("`{name}`")
	}

	fn clean_table_sql(&self, quoted_table: &str) -> String {
		if self.options.clickhouse_delete_from {
			format!("DELETE FROM {quoted_table} WHERE 1")
		} else {
			format!("TRUNCATE TABLE {quoted_table}")
		}
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

	async fn is_table_modified(&self, db: &mut dyn DatabaseBackend, table: &str) -> Result<bool> {
		if !self.checksums.is_primed() {
			return Ok(true);
		}
		let current = self.fetch_checksum(db, table).await?;
		Ok(self.checksums.is_modified(table, &current))
	}

	async fn refresh_checksums(
		&mut self,
		db: &mut dyn DatabaseBackend,
		dirty: &[String],
	) -> Result<()> {
		if !self.checksums.is_primed() {
			for table in self.tables.clone() {
				let checksum = self.fetch_checksum(db, &table).await?;
				self.checksums.put(table, checksum);
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
		guard::run_batch_transaction(db, self, batch, &[], &[]).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_quote_identifier_uses_backticks() {
		let adapter = ClickhouseAdapter::new(AdapterOptions::default());
		assert_eq!(adapter.quote_identifier("posts"), "`posts`");
	}

	#[rstest]
	fn test_clean_table_sql_truncates_by_default() {
		let adapter = ClickhouseAdapter::new(AdapterOptions::default());
		assert_eq!(adapter.clean_table_sql("`posts`"), "TRUNCATE TABLE `posts`");
	}

	#[rstest]
	fn test_clean_table_sql_with_delete_from() {
		let options = AdapterOptions { clickhouse_delete_from: true, ..Default::default() };
		let adapter = ClickhouseAdapter::new(options);
		assert_eq!(adapter.clean_table_sql("`posts`"), "DELETE FROM `posts` WHERE 1");
	}

	#[rstest]
	fn test_default_param_type_is_question() {
		let adapter = ClickhouseAdapter::new(AdapterOptions::default());
		assert_eq!(adapter.default_param_type(), ParamType::Question);
	}
}
