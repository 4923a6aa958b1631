//! SQLite adapter.
//!
//! The lightest of the adapters: `PRAGMA defer_foreign_keys` postpones
//! foreign key enforcement until commit and resets itself automatically, so
//! there is no restore step, no sequence handling and no checksum support.

use async_trait::async_trait;

use crate::backend::DatabaseBackend;
use crate::builder::LoadBatch;
use crate::dialect::{Dialect, DialectAdapter, ParamType};
use crate::error::{FixtureError, Result};
use crate::guard;

pub(crate) struct SqliteAdapter;

impl SqliteAdapter {
	pub fn new() -> Self {
		Self
	}
}

#[async_trait]
impl DialectAdapter for SqliteAdapter {
	fn dialect(&self) -> Dialect {
		Dialect::Sqlite
	}

	fn default_param_type(&self) -> ParamType {
		ParamType::Question
	}

	async fn database_name(&self, db: &mut dyn DatabaseBackend) -> Result<String> {
		// Row shape: (seq, name, file); the first row is the main database.
		let row = db
			.fetch_optional("PRAGMA database_list", Vec::new())
			.await
			.map_err(FixtureError::Database)?;
		let Some(row) = row else {
			return Err(FixtureError::DatabaseNameUndeterminable);
		};
		let file = row.get::<String>(2).map_err(FixtureError::Database)?;
		let base = std::path::Path::new(&file)
			.file_name()
			.map(|name| name.to_string_lossy().into_owned())
			.unwrap_or(file);
		Ok(base)
	}

	async fn disable_referential_integrity(
		&self,
		db: &mut dyn DatabaseBackend,
		batch: &LoadBatch<'_>,
	) -> Result<()> {
		// The pragma only lasts until the end of the transaction, so no
		// restore step is needed.
		let prelude = vec!["PRAGMA defer_foreign_keys = ON".to_string()];
		guard::run_batch_transaction(db, self, batch, &prelude, &[]).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_quote_identifier_uses_double_quotes() {
		let adapter = SqliteAdapter::new();
		assert_eq!(adapter.quote_identifier("posts"), "\"posts\"");
	}

	#[rstest]
	fn test_dotted_names_are_not_split() {
		let adapter = SqliteAdapter::new();
		assert_eq!(adapter.quote_identifier("main.posts"), "\"main.posts\"");
	}

	#[rstest]
	fn test_clean_table_sql_is_a_delete() {
		let adapter = SqliteAdapter::new();
		assert_eq!(adapter.clean_table_sql("\"posts\""), "DELETE FROM \"posts\"");
	}

	#[rstest]
	fn test_default_param_type_is_question() {
		let adapter = SqliteAdapter::new();
		assert_eq!(adapter.default_param_type(), ParamType::Question);
	}
}
