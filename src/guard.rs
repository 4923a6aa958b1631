//! Transaction protocol shared by the referential integrity strategies.
//!
//! Every strategy follows the same shape: optionally relax integrity
//! (outside or inside a transaction), run the batch inside the transaction,
//! commit or roll back, then restore integrity. Restoration always runs,
//! even when the load failed, and its own failure is reported together with
//! the load error it interrupted.

use crate::backend::{DatabaseBackend, DatabaseError, SqlExecutor};
use crate::builder::LoadBatch;
use crate::dialect::DialectAdapter;
use crate::error::{FixtureError, Result};

/// Phases of a guarded load, used for trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuardState {
	IntegrityRelaxed,
	LoadRunning,
	LoadCommitted,
	LoadRolledBack,
	IntegrityRestored,
}

impl std::fmt::Display for GuardState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			GuardState::IntegrityRelaxed => "integrity_relaxed",
			GuardState::LoadRunning => "load_running",
			GuardState::LoadCommitted => "load_committed",
			GuardState::LoadRolledBack => "load_rolled_back",
			GuardState::IntegrityRestored => "integrity_restored",
		};
		f.write_str(name)
	}
}

/// Runs statements in order, stopping at the first failure. Used for the
/// relaxation steps, where continuing after a failure has no point.
pub(crate) async fn run_statements(
	db: &mut dyn DatabaseBackend,
	statements: &[String],
) -> std::result::Result<(), DatabaseError> {
	for sql in statements {
		db.execute(sql, Vec::new()).await?;
	}
	if !statements.is_empty() {
		tracing::debug!(
			state = %GuardState::IntegrityRelaxed,
			statements = statements.len(),
			"referential integrity relaxed"
		);
	}
	Ok(())
}

/// Runs statements in order, attempting every one and returning the first
/// failure. Used for the restore steps, where each statement repairs an
/// independent table or constraint.
pub(crate) async fn run_statements_best_effort(
	db: &mut dyn DatabaseBackend,
	statements: &[String],
) -> std::result::Result<(), DatabaseError> {
	let mut first_error = None;
	for sql in statements {
		if let Err(error) = db.execute(sql, Vec::new()).await {
			tracing::warn!(statement = %sql, error = %error, "restore statement failed");
			if first_error.is_none() {
				first_error = Some(error);
			}
		}
	}
	match first_error {
		Some(error) => Err(error),
		None => Ok(()),
	}
}

/// Opens a transaction, runs `prelude` statements, the batch, then
/// `epilogue` statements, and commits.
///
/// A prelude failure rolls back and reports an integrity relaxation error.
/// The epilogue always runs before the commit decision; its failure rolls
/// back and is reported as a restore failure. A batch failure rolls back
/// and is returned as-is.
pub(crate) async fn run_batch_transaction(
	db: &mut dyn DatabaseBackend,
	dialect: &dyn DialectAdapter,
	batch: &LoadBatch<'_>,
	prelude: &[String],
	epilogue: &[String],
) -> Result<()> {
	let mut tx = db.begin().await.map_err(FixtureError::Database)?;

	for sql in prelude {
		if let Err(source) = tx.execute(sql, Vec::new()).await {
			rollback_quietly(tx).await;
			return Err(FixtureError::IntegrityRelax { source });
		}
	}
	tracing::debug!(state = %GuardState::LoadRunning, tables = batch.len(), "running fixture batch");

	let executor: &mut dyn SqlExecutor = tx.as_mut();
	let load_result = batch.run(executor, dialect).await;

	// Counterpart of the prelude; runs regardless of the batch outcome so
	// engines whose relaxation is session-scoped (MySQL) leave the
	// connection as they found it.
	let mut epilogue_error = None;
	for sql in epilogue {
		if let Err(error) = tx.execute(sql, Vec::new()).await {
			epilogue_error = Some(error);
			break;
		}
	}

	match (load_result, epilogue_error) {
		(Err(load_error), _) => {
			rollback_quietly(tx).await;
			tracing::debug!(state = %GuardState::LoadRolledBack, "fixture batch rolled back");
			Err(load_error)
		}
		(Ok(()), Some(source)) => {
			rollback_quietly(tx).await;
			tracing::debug!(state = %GuardState::LoadRolledBack, "fixture batch rolled back");
			Err(FixtureError::IntegrityRestore {
				load_error: None,
				restore_error: Box::new(FixtureError::Database(source)),
			})
		}
		(Ok(()), None) => {
			tx.commit().await.map_err(FixtureError::Database)?;
			tracing::debug!(state = %GuardState::LoadCommitted, "fixture batch committed");
			Ok(())
		}
	}
}

async fn rollback_quietly(tx: Box<dyn crate::backend::TransactionExecutor>) {
	if let Err(error) = tx.rollback().await {
		tracing::warn!(error = %error, "rollback failed");
	}
}

/// Folds the result of the always-run restore step into the load result.
///
/// `unprotected` marks strategies that physically dropped constraints: when
/// their restore fails the database is left without referential integrity,
/// which is escalated to [`FixtureError::ConstraintsNotRestored`].
pub(crate) fn combine_restore(
	load_result: Result<()>,
	restore_result: std::result::Result<(), DatabaseError>,
	unprotected: bool,
) -> Result<()> {
	match (load_result, restore_result) {
		(Ok(()), Ok(())) => {
			tracing::debug!(state = %GuardState::IntegrityRestored, "referential integrity restored");
			Ok(())
		}
		(Err(load_error), Ok(())) => {
			tracing::debug!(state = %GuardState::IntegrityRestored, "referential integrity restored");
			Err(load_error)
		}
		(load_result, Err(source)) => {
			let load_error = load_result.err().map(Box::new);
			let restore_error = Box::new(FixtureError::Database(source));
			if unprotected {
				tracing::error!(
					error = %restore_error,
					"foreign key constraints could not be recreated; the database is left unprotected"
				);
				Err(FixtureError::ConstraintsNotRestored {
					load_error,
					restore_error,
				})
			} else {
				Err(FixtureError::IntegrityRestore {
					load_error,
					restore_error,
				})
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_combine_restore_passes_success_through() {
		assert!(combine_restore(Ok(()), Ok(()), false).is_ok());
	}

	#[rstest]
	fn test_combine_restore_keeps_load_error() {
		let result = combine_restore(
			Err(FixtureError::DuplicateTable("posts".to_string())),
			Ok(()),
			true,
		);
		assert!(matches!(result, Err(FixtureError::DuplicateTable(_))));
	}

	#[rstest]
	fn test_combine_restore_wraps_restore_failure() {
		let result = combine_restore(
			Ok(()),
			Err(DatabaseError::QueryError("boom".to_string())),
			false,
		);
		assert!(matches!(
			result,
			Err(FixtureError::IntegrityRestore {
				load_error: None,
				..
			})
		));
	}

	#[rstest]
	fn test_combine_restore_escalates_unprotected_database() {
		let result = combine_restore(
			Err(FixtureError::DuplicateTable("posts".to_string())),
			Err(DatabaseError::QueryError("boom".to_string())),
			true,
		);
		let Err(error) = result else {
			panic!("expected an error");
		};
		assert!(error.leaves_database_unprotected());
		let FixtureError::ConstraintsNotRestored { load_error, .. } = error else {
			panic!("expected ConstraintsNotRestored");
		};
		assert!(load_error.is_some());
	}
}
