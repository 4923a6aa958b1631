//! Oracle adapter.
//!
//! Enabled foreign keys are disabled one by one before the load and
//! re-enabled afterwards; both run outside the load transaction because
//! Oracle DDL commits implicitly. Sequences have no `SETVAL`, so resetting
//! one means dropping and recreating it.

use async_trait::async_trait;

use crate::backend::{DatabaseBackend, DatabaseError};
use crate::builder::LoadBatch;
use crate::dialect::{AdapterOptions, Dialect, DialectAdapter, ParamType, fetch_single_column};
use crate::error::{FixtureError, Result};
use crate::guard;

const ENABLED_CONSTRAINTS_SQL: &str = "\
SELECT table_name, constraint_name \
FROM user_constraints \
WHERE constraint_type = 'R' AND status = 'ENABLED'";

const SEQUENCES_SQL: &str = "SELECT sequence_name FROM user_sequences";

#[derive(Debug, Clone)]
struct OracleConstraint {
	table: String,
	name: String,
}

pub(crate) struct OracleAdapter {
	options: AdapterOptions,
	constraints: Vec<OracleConstraint>,
	sequences: Vec<String>,
}

impl OracleAdapter {
	pub fn new(options: AdapterOptions) -> Self {
		Self { options, constraints: Vec::new(), sequences: Vec::new() }
	}

	async fn fetch_constraints(
		db: &mut dyn DatabaseBackend,
	) -> std::result::Result<Vec<OracleConstraint>, DatabaseError> {
		let rows = db.fetch_all(ENABLED_CONSTRAINTS_SQL, Vec::new()).await?;
		let mut constraints = Vec::with_capacity(rows.len());
		for row in rows {
			constraints.push(OracleConstraint {
				table: row.get::<String>(0)?,
				name: row.get::<String>(1)?,
			});
		}
		Ok(constraints)
	}

	async fn reset_sequences(&self, db: &mut dyn DatabaseBackend) -> Result<()> {
		let floor = self.options.sequence_floor();
		for sequence in &self.sequences {
			let quoted = self.quote_identifier(sequence);
			for sql in [
				format!("DROP SEQUENCE {quoted}"),
				format!("CREATE SEQUENCE {quoted} START WITH {floor}"),
			] {
				db.execute(&sql, Vec::new()).await.map_err(|source| {
					FixtureError::SequenceReset { sequence: sequence.clone(), source }
				})?;
			}
		}
		Ok(())
	}
}

#[async_trait]
impl DialectAdapter for OracleAdapter {
	fn dialect(&self) -> Dialect {
		Dialect::Oracle
	}

	fn default_param_type(&self) -> ParamType {
		ParamType::Colon
	}

	// Unquoted Oracle identifiers fold to upper case, so quoting has to
	// upper-case the name to keep matching them.
	fn quote_identifier(&self, name: &str) -> String {
		format!("\"{}\"", name.to_uppercase())
	}

	async fn init(&mut self, db: &mut dyn DatabaseBackend) -> Result<()> {
		self.constraints = Self::fetch_constraints(db).await.map_err(|source| {
			FixtureError::SchemaIntrospection {
				detail: "collecting enabled foreign keys".to_string(),
				source,
			}
		})?;
		self.sequences =
			fetch_single_column(db, SEQUENCES_SQL, Vec::new(), "collecting sequences").await?;
		Ok(())
	}

	async fn database_name(&self, db: &mut dyn DatabaseBackend) -> Result<String> {
		let row = db
			.fetch_optional("SELECT user FROM dual", Vec::new())
			.await
			.map_err(FixtureError::Database)?;
		match row {
			Some(row) => row.get::<String>(0).map_err(FixtureError::Database),
			None => Err(FixtureError::DatabaseNameUndeterminable),
		}
	}

	async fn disable_referential_integrity(
		&self,
		db: &mut dyn DatabaseBackend,
		batch: &LoadBatch<'_>,
	) -> Result<()> {
		let disable: Vec<String> = self
			.constraints
			.iter()
			.map(|c| {
				format!(
					"ALTER TABLE {} DISABLE CONSTRAINT {}",
					self.quote_identifier(&c.table),
					self.quote_identifier(&c.name)
				)
			})
			.collect();
		let enable: Vec<String> = self
			.constraints
			.iter()
			.map(|c| {
				format!(
					"ALTER TABLE {} ENABLE CONSTRAINT {}",
					self.quote_identifier(&c.table),
					self.quote_identifier(&c.name)
				)
			})
			.collect();

		let load_result = match guard::run_statements(db, &disable).await {
			Ok(()) => guard::run_batch_transaction(db, self, batch, &[], &[]).await,
			Err(source) => Err(FixtureError::IntegrityRelax { source }),
		};

		let restore_result = guard::run_statements_best_effort(db, &enable).await;
		let load_result = guard::combine_restore(load_result, restore_result, false);

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
	#[case("posts", "\"POSTS\"")]
	#[case("PostsTags", "\"POSTSTAGS\"")]
	fn test_quote_identifier_upper_cases(#[case] name: &str, #[case] expected: &str) {
		let adapter = OracleAdapter::new(AdapterOptions::default());
		assert_eq!(adapter.quote_identifier(name), expected);
	}

	#[rstest]
	fn test_dotted_names_are_not_split() {
		let adapter = OracleAdapter::new(AdapterOptions::default());
		assert_eq!(adapter.quote_identifier("scott.posts"), "\"SCOTT.POSTS\"");
	}

	#[rstest]
	fn test_default_param_type_is_colon() {
		let adapter = OracleAdapter::new(AdapterOptions::default());
		assert_eq!(adapter.default_param_type(), ParamType::Colon);
		assert_eq!(ParamType::Colon.placeholder(2), ":2");
	}
}
