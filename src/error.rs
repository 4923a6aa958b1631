//! Error types for fixture loading.

use crate::backend::{DatabaseError, SqlValue};

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, FixtureError>;

/// Renders the restore failure, folding in the load error it interrupted,
/// if any.
fn restore_failure(load_error: &Option<Box<FixtureError>>, restore_error: &FixtureError) -> String {
	match load_error {
		Some(load) => format!("{restore_error} (while recovering from: {load})"),
		None => restore_error.to_string(),
	}
}

/// Errors that can occur while building a loader or loading fixtures.
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
	/// No database backend was supplied to the builder.
	#[error("Database connection is required")]
	DatabaseRequired,

	/// No dialect was supplied to the builder.
	#[error("Database dialect is required")]
	DialectRequired,

	/// The dialect name did not match any supported engine.
	#[error("Unrecognized dialect: {0}")]
	UnknownDialect(String),

	/// An option was used with a dialect that does not support it.
	#[error("Option {option} is not supported for dialect {dialect}")]
	IncompatibleOption {
		/// Name of the offending option.
		option: String,
		/// The dialect it was applied to.
		dialect: String,
	},

	/// Two mutually exclusive options were both enabled.
	#[error("Options {first} and {second} are mutually exclusive")]
	ConflictingOptions {
		/// First of the conflicting options.
		first: String,
		/// Second of the conflicting options.
		second: String,
	},

	/// Two fixture sets target the same table.
	#[error("More than one fixture set targets table {0}")]
	DuplicateTable(String),

	/// The connected database does not carry the test marker in its name.
	#[error("Database \"{name}\" does not look like a test database (name must contain \"test\")")]
	NotATestDatabase {
		/// Name the database reported for itself.
		name: String,
	},

	/// The engine cannot report a database name to check.
	#[error("Could not determine the database name; skip the test database check to proceed")]
	DatabaseNameUndeterminable,

	/// A schema metadata query failed during loader construction.
	#[error("Could not inspect database schema ({detail})")]
	SchemaIntrospection {
		/// Which piece of metadata was being collected.
		detail: String,
		/// Underlying connection error.
		source: DatabaseError,
	},

	/// A table checksum query failed.
	#[error("Could not compute checksum for table {table}")]
	ChecksumComputation {
		/// Table whose checksum was requested.
		table: String,
		/// Underlying connection error.
		source: DatabaseError,
	},

	/// Deleting existing rows from a fixture table failed.
	#[error("Could not clean table {table}")]
	CleanTable {
		/// Table that was being cleaned.
		table: String,
		/// Underlying connection error.
		source: DatabaseError,
	},

	/// A fixture row failed to insert.
	#[error(
		"Error inserting record: {source}, fixture: {fixture}, index: {index}, sql: {sql}, params: {params:?}"
	)]
	Insert {
		/// Fixture source the record came from.
		fixture: String,
		/// Zero-based index of the record within its fixture set.
		index: usize,
		/// The INSERT statement that failed.
		sql: String,
		/// Parameters bound to the statement.
		params: Vec<SqlValue>,
		/// Underlying connection error.
		source: DatabaseError,
	},

	/// A fixture value could not be converted to a bindable form.
	#[error("Could not encode value for {table}.{column}: {detail}")]
	ValueEncoding {
		/// Table the value belongs to.
		table: String,
		/// Column the value belongs to.
		column: String,
		/// What went wrong.
		detail: String,
	},

	/// A fixture source was structurally invalid.
	#[error("Invalid fixture {name}: {detail}")]
	Fixture {
		/// Name of the fixture source.
		name: String,
		/// What was wrong with it.
		detail: String,
	},

	/// A YAML fixture source failed to parse.
	#[cfg(feature = "yaml")]
	#[error(transparent)]
	Yaml(#[from] serde_yaml::Error),

	/// A JSON fixture source failed to parse.
	#[error(transparent)]
	Json(#[from] serde_json::Error),

	/// A statement relaxing referential integrity failed; nothing was loaded.
	#[error("Could not relax referential integrity: {source}")]
	IntegrityRelax {
		/// Underlying connection error.
		source: DatabaseError,
	},

	/// Re-enabling referential integrity failed after the load step, but the
	/// constraints themselves still exist.
	#[error("Could not restore referential integrity: {}", restore_failure(.load_error, .restore_error))]
	IntegrityRestore {
		/// The load error the restore attempt was recovering from, if any.
		load_error: Option<Box<FixtureError>>,
		/// The failure hit while restoring.
		#[source]
		restore_error: Box<FixtureError>,
	},

	/// Dropped foreign key constraints could not be recreated. The database
	/// is left without constraint protection and should be rebuilt.
	#[error(
		"Foreign key constraints could not be recreated, the database is left unprotected: {}",
		restore_failure(.load_error, .restore_error)
	)]
	ConstraintsNotRestored {
		/// The load error the restore attempt was recovering from, if any.
		load_error: Option<Box<FixtureError>>,
		/// The failure hit while recreating the constraints.
		#[source]
		restore_error: Box<FixtureError>,
	},

	/// Resetting a sequence or auto-increment counter failed. Loaded data is
	/// already committed when this is reported.
	#[error("Could not reset sequence {sequence}")]
	SequenceReset {
		/// Sequence (or table, for auto-increment counters) being reset.
		sequence: String,
		/// Underlying connection error.
		source: DatabaseError,
	},

	/// Connection-level failure outside any more specific step.
	#[error(transparent)]
	Database(#[from] DatabaseError),
}

impl FixtureError {
	/// Returns `true` when the database may be left without foreign key
	/// protection and should be rebuilt before reuse.
	pub fn leaves_database_unprotected(&self) -> bool {
		matches!(self, FixtureError::ConstraintsNotRestored { .. })
	}
}
