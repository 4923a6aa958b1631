//! Connection abstraction between the loader and the actual database driver.
//!
//! The loader never talks to a concrete driver directly. Everything goes
//! through [`SqlExecutor`] (run a statement, fetch rows), [`DatabaseBackend`]
//! (an executor that can also open transactions) and [`TransactionExecutor`]
//! (an executor that can commit or roll back). The `sqlx`-based
//! implementations for PostgreSQL, MySQL and SQLite live in the submodules
//! and are enabled through the corresponding cargo features; engines without
//! a bundled driver (SQL Server, ClickHouse, Spanner, Oracle) are reached by
//! implementing these traits over whatever client the caller already uses.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mysql")]
pub use mysql::MySqlBackend;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// A database value crossing the backend boundary, either as a bound
/// parameter or as a cell of a fetched row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
	/// SQL NULL.
	Null,
	/// Boolean value.
	Bool(bool),
	/// Signed integer value.
	Int(i64),
	/// Double-precision floating point value.
	Float(f64),
	/// Text value.
	Text(String),
	/// Raw binary value.
	Bytes(Vec<u8>),
	/// Calendar date without a time component.
	Date(NaiveDate),
	/// Date and time without a timezone.
	DateTime(NaiveDateTime),
	/// Date and time pinned to an instant (stored as UTC).
	TimestampTz(DateTime<Utc>),
}

impl SqlValue {
	/// Returns `true` for [`SqlValue::Null`].
	pub fn is_null(&self) -> bool {
		matches!(self, SqlValue::Null)
	}
}

impl std::fmt::Display for SqlValue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SqlValue::Null => write!(f, "NULL"),
			SqlValue::Bool(v) => write!(f, "{v}"),
			SqlValue::Int(v) => write!(f, "{v}"),
			SqlValue::Float(v) => write!(f, "{v}"),
			SqlValue::Text(v) => write!(f, "{v}"),
			SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
			SqlValue::Date(v) => write!(f, "{v}"),
			SqlValue::DateTime(v) => write!(f, "{v}"),
			SqlValue::TimestampTz(v) => write!(f, "{v}"),
		}
	}
}

impl TryFrom<SqlValue> for String {
	type Error = DatabaseError;

	fn try_from(value: SqlValue) -> Result<Self, Self::Error> {
		match value {
			SqlValue::Text(v) => Ok(v),
			other => Err(DatabaseError::TypeError(format!(
				"expected text, got {other:?}"
			))),
		}
	}
}

impl TryFrom<SqlValue> for i64 {
	type Error = DatabaseError;

	fn try_from(value: SqlValue) -> Result<Self, Self::Error> {
		match value {
			SqlValue::Int(v) => Ok(v),
			other => Err(DatabaseError::TypeError(format!(
				"expected integer, got {other:?}"
			))),
		}
	}
}

impl TryFrom<SqlValue> for bool {
	type Error = DatabaseError;

	fn try_from(value: SqlValue) -> Result<Self, Self::Error> {
		match value {
			SqlValue::Bool(v) => Ok(v),
			SqlValue::Int(v) => Ok(v != 0),
			other => Err(DatabaseError::TypeError(format!(
				"expected boolean, got {other:?}"
			))),
		}
	}
}

/// A single fetched row with positional values and their column names.
#[derive(Debug, Clone, Default)]
pub struct Row {
	/// Column names in result order.
	pub columns: Vec<String>,
	/// Cell values in result order.
	pub values: Vec<SqlValue>,
}

impl Row {
	/// Creates a row from parallel column and value lists.
	pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
		Self { columns, values }
	}

	/// Returns the value at `index`, or `None` when out of bounds.
	pub fn value(&self, index: usize) -> Option<&SqlValue> {
		self.values.get(index)
	}

	/// Returns the value at `index` converted to `T`.
	pub fn get<T>(&self, index: usize) -> Result<T, DatabaseError>
	where
		T: TryFrom<SqlValue, Error = DatabaseError>,
	{
		let value = self
			.values
			.get(index)
			.ok_or_else(|| DatabaseError::ColumnNotFound(format!("index {index}")))?;
		T::try_from(value.clone())
	}

	/// Returns the value under the column `name` converted to `T`.
	pub fn get_named<T>(&self, name: &str) -> Result<T, DatabaseError>
	where
		T: TryFrom<SqlValue, Error = DatabaseError>,
	{
		let index = self
			.columns
			.iter()
			.position(|c| c == name)
			.ok_or_else(|| DatabaseError::ColumnNotFound(name.to_string()))?;
		T::try_from(self.values[index].clone())
	}
}

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
	/// Number of rows affected by the statement.
	pub rows_affected: u64,
}

/// Failure raised by the connection layer.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
	/// A requested column was not present in the fetched row.
	#[error("Column {0} not found in row")]
	ColumnNotFound(String),

	/// A fetched value could not be converted to the requested Rust type.
	#[error("Type error: {0}")]
	TypeError(String),

	/// Transaction lifecycle failure.
	#[error("Transaction error: {0}")]
	TransactionError(String),

	/// A statement failed to execute.
	#[error("Query error: {0}")]
	QueryError(String),

	/// Error surfaced by the underlying `sqlx` driver.
	#[error(transparent)]
	Sqlx(#[from] sqlx::Error),
}

/// Executes statements against a connection, a pool or an open transaction.
#[async_trait]
pub trait SqlExecutor: Send {
	/// Runs a statement that returns no rows.
	async fn execute(&mut self, sql: &str, params: Vec<SqlValue>)
	-> Result<ExecResult, DatabaseError>;

	/// Runs a query and returns every resulting row.
	async fn fetch_all(&mut self, sql: &str, params: Vec<SqlValue>)
	-> Result<Vec<Row>, DatabaseError>;

	/// Runs a query expected to return at most one row.
	async fn fetch_optional(
		&mut self,
		sql: &str,
		params: Vec<SqlValue>,
	) -> Result<Option<Row>, DatabaseError> {
		let mut rows = self.fetch_all(sql, params).await?;
		if rows.is_empty() {
			Ok(None)
		} else {
			Ok(Some(rows.swap_remove(0)))
		}
	}
}

/// A database handle that can open transactions.
#[async_trait]
pub trait DatabaseBackend: SqlExecutor {
	/// Opens a new transaction.
	async fn begin(&mut self) -> Result<Box<dyn TransactionExecutor>, DatabaseError>;
}

/// An open transaction. Dropping it without calling [`commit`] or
/// [`rollback`] aborts the transaction.
///
/// [`commit`]: TransactionExecutor::commit
/// [`rollback`]: TransactionExecutor::rollback
#[async_trait]
pub trait TransactionExecutor: SqlExecutor {
	/// Commits the transaction.
	async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

	/// Rolls the transaction back.
	async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn sample_row() -> Row {
		Row::new(
			vec!["name".to_string(), "count".to_string(), "active".to_string()],
			vec![
				SqlValue::Text("posts".to_string()),
				SqlValue::Int(3),
				SqlValue::Bool(true),
			],
		)
	}

	#[rstest]
	fn test_row_get_by_index() {
		let row = sample_row();
		assert_eq!(row.get::<String>(0).unwrap(), "posts");
		assert_eq!(row.get::<i64>(1).unwrap(), 3);
		assert!(row.get::<bool>(2).unwrap());
	}

	#[rstest]
	fn test_row_get_by_name() {
		let row = sample_row();
		assert_eq!(row.get_named::<i64>("count").unwrap(), 3);
		assert!(matches!(
			row.get_named::<i64>("missing"),
			Err(DatabaseError::ColumnNotFound(_))
		));
	}

	#[rstest]
	fn test_row_get_out_of_bounds() {
		let row = sample_row();
		assert!(matches!(
			row.get::<String>(9),
			Err(DatabaseError::ColumnNotFound(_))
		));
	}

	#[rstest]
	fn test_type_mismatch_reports_type_error() {
		let row = sample_row();
		assert!(matches!(
			row.get::<i64>(0),
			Err(DatabaseError::TypeError(_))
		));
	}

	#[rstest]
	fn test_bool_from_integer() {
		assert!(bool::try_from(SqlValue::Int(1)).unwrap());
		assert!(!bool::try_from(SqlValue::Int(0)).unwrap());
	}

	#[rstest]
	#[case(SqlValue::Null, "NULL")]
	#[case(SqlValue::Int(42), "42")]
	#[case(SqlValue::Text("abc".to_string()), "abc")]
	#[case(SqlValue::Bytes(vec![1, 2, 3]), "<3 bytes>")]
	fn test_sql_value_display(#[case] value: SqlValue, #[case] expected: &str) {
		assert_eq!(value.to_string(), expected);
	}
}
