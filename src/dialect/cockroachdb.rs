//! CockroachDB adapter.
//!
//! CockroachDB speaks the PostgreSQL wire protocol but supports neither
//! `DISABLE TRIGGER` nor deferrable constraints, so foreign keys are always
//! dropped before the load and recreated from the definitions reported by
//! `SHOW CONSTRAINTS`.

use async_trait::async_trait;

use crate::backend::DatabaseBackend;
use crate::builder::LoadBatch;
use crate::dialect::postgres::{quote_dotted, setval_statement};
use crate::dialect::{AdapterOptions, Dialect, DialectAdapter, ParamType, fetch_single_column};
use crate::error::{FixtureError, Result};
use crate::guard;

const TABLE_NAMES_SQL: &str = "
	SELECT pg_namespace.nspname || '.' || pg_class.relname
	FROM pg_class
	INNER JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace
	WHERE pg_class.relkind = 'r'
	  AND pg_namespace.nspname NOT IN ('pg_catalog', 'information_schema')
	  AND pg_namespace.nspname NOT LIKE 'crdb_internal%'
	  AND pg_namespace.nspname NOT LIKE 'pg_toast%'
";

const SEQUENCES_SQL: &str = "
	SELECT pg_namespace.nspname || '.' || pg_class.relname
	FROM pg_class
	INNER JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace
	WHERE pg_class.relkind = 'S'
";

#[derive(Debug, Clone)]
struct CrdbConstraint {
	table: String,
	name: String,
	/// Definition as reported by SHOW CONSTRAINTS, e.g.
	/// `FOREIGN KEY (author_id) REFERENCES authors(id)`.
	details: String,
}

pub(crate) struct CockroachAdapter {
	options: AdapterOptions,
	tables: Vec<String>,
	sequences: Vec<String>,
	constraints: Vec<CrdbConstraint>,
}

impl CockroachAdapter {
	pub fn new(options: AdapterOptions) -> Self {
		Self {
			options,
			tables: Vec::new(),
			sequences: Vec::new(),
			constraints: Vec::new(),
		}
	}

	async fn fetch_constraints(
		db: &mut dyn DatabaseBackend,
		tables: &[String],
	) -> Result<Vec<CrdbConstraint>> {
		let mut constraints = Vec::new();
		for table in tables {
			let detail = format!("reading constraints of {table}");
			let sql = format!("SHOW CONSTRAINTS FROM {}", quote_dotted(table));
			let rows = db.fetch_all(&sql, Vec::new()).await.map_err(|source| {
				FixtureError::SchemaIntrospection {
					detail: detail.clone(),
					source,
				}
			})?;
			for row in &rows {
				// Columns: table_name, constraint_name, constraint_type,
				// details, validated.
				let constraint_type = row.get::<String>(2).map_err(|source| {
					FixtureError::SchemaIntrospection {
						detail: detail.clone(),
						source,
					}
				})?;
				if constraint_type != "FOREIGN KEY" {
					continue;
				}
				let name = row.get::<String>(1).map_err(|source| {
					FixtureError::SchemaIntrospection {
						detail: detail.clone(),
						source,
					}
				})?;
				let details = row.get::<String>(3).map_err(|source| {
					FixtureError::SchemaIntrospection {
						detail: detail.clone(),
						source,
					}
				})?;
				constraints.push(CrdbConstraint {
					table: table.clone(),
					name,
					details,
				});
			}
		}
		Ok(constraints)
	}

	fn drop_statements(&self) -> Vec<String> {
		self.constraints
			.iter()
			.map(|c| {
				format!(
					"ALTER TABLE {} DROP CONSTRAINT {}",
					quote_dotted(&c.table),
					quote_dotted(&c.name)
				)
			})
			.collect()
	}

	fn recreate_statements(&self) -> Vec<String> {
		self.constraints
			.iter()
			.map(|c| {
				format!(
					"ALTER TABLE {} ADD CONSTRAINT {} {}",
					quote_dotted(&c.table),
					quote_dotted(&c.name),
					c.details
				)
			})
			.collect()
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
}

#[async_trait]
impl DialectAdapter for CockroachAdapter {
	fn dialect(&self) -> Dialect {
		Dialect::Cockroach
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
		self.constraints = Self::fetch_constraints(db, &self.tables).await?;
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

	async fn disable_referential_integrity(
		&self,
		db: &mut dyn DatabaseBackend,
		batch: &LoadBatch<'_>,
	) -> Result<()> {
		let load_result = match guard::run_statements(db, &self.drop_statements()).await {
			Err(source) => Err(FixtureError::IntegrityRelax { source }),
			Ok(()) => guard::run_batch_transaction(db, self, batch, &[], &[]).await,
		};
		let restore_result =
			guard::run_statements_best_effort(db, &self.recreate_statements()).await;
		let load_result = guard::combine_restore(load_result, restore_result, true);

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

	fn adapter_with_constraint() -> CockroachAdapter {
		let mut adapter = CockroachAdapter::new(AdapterOptions::default());
		adapter.constraints.push(CrdbConstraint {
			table: "public.posts".to_string(),
			name: "fk_author".to_string(),
			details: "FOREIGN KEY (author_id) REFERENCES authors(id)".to_string(),
		});
		adapter
	}

	#[rstest]
	fn test_drop_statements() {
		assert_eq!(
			adapter_with_constraint().drop_statements(),
			vec!["ALTER TABLE \"public\".\"posts\" DROP CONSTRAINT \"fk_author\""]
		);
	}

	#[rstest]
	fn test_recreate_statements_reuse_reported_details() {
		assert_eq!(
			adapter_with_constraint().recreate_statements(),
			vec![
				"ALTER TABLE \"public\".\"posts\" ADD CONSTRAINT \"fk_author\" \
				 FOREIGN KEY (author_id) REFERENCES authors(id)"
			]
		);
	}

	#[rstest]
	fn test_quoting_matches_postgres() {
		let adapter = CockroachAdapter::new(AdapterOptions::default());
		assert_eq!(
			adapter.quote_identifier("test_schema.posts"),
			"\"test_schema\".\"posts\""
		);
	}
}
