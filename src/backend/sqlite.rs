//! SQLite backend over `sqlx`.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqlitePool, SqliteRow};
use sqlx::{Column, Row as SqlxRow, Sqlite, Transaction};

use super::{DatabaseBackend, DatabaseError, ExecResult, Row, SqlExecutor, SqlValue,
	TransactionExecutor};

/// [`DatabaseBackend`] for SQLite, wrapping a [`SqlitePool`].
pub struct SqliteBackend {
	pool: Arc<SqlitePool>,
}

impl SqliteBackend {
	/// Wraps an existing pool.
	pub fn new(pool: SqlitePool) -> Self {
		Self {
			pool: Arc::new(pool),
		}
	}

	/// Returns the underlying pool.
	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}
}

fn bind_value<'q>(
	query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
	value: SqlValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
	match value {
		SqlValue::Null => query.bind(None::<String>),
		SqlValue::Bool(v) => query.bind(v),
		SqlValue::Int(v) => query.bind(v),
		SqlValue::Float(v) => query.bind(v),
		SqlValue::Text(v) => query.bind(v),
		SqlValue::Bytes(v) => query.bind(v),
		SqlValue::Date(v) => query.bind(v),
		SqlValue::DateTime(v) => query.bind(v),
		SqlValue::TimestampTz(v) => query.bind(v),
	}
}

fn convert_row(sqlite_row: &SqliteRow) -> Row {
	let mut row = Row::default();
	for (index, column) in sqlite_row.columns().iter().enumerate() {
		row.columns.push(column.name().to_string());

		// Probe with Option<T> first; SQLite is dynamically typed and a bare
		// try_get::<i64> can coerce NULL to 0.
		let is_null = sqlite_row
			.try_get::<Option<i64>, _>(index)
			.ok()
			.flatten()
			.is_none() && sqlite_row
			.try_get::<Option<String>, _>(index)
			.ok()
			.flatten()
			.is_none() && sqlite_row
			.try_get::<Option<f64>, _>(index)
			.ok()
			.flatten()
			.is_none() && sqlite_row
			.try_get::<Option<Vec<u8>>, _>(index)
			.ok()
			.flatten()
			.is_none();
		if is_null {
			row.values.push(SqlValue::Null);
			continue;
		}

		let value = if let Ok(v) = sqlite_row.try_get::<i64, _>(index) {
			SqlValue::Int(v)
		} else if let Ok(v) = sqlite_row.try_get::<bool, _>(index) {
			SqlValue::Bool(v)
		} else if let Ok(v) = sqlite_row.try_get::<f64, _>(index) {
			SqlValue::Float(v)
		} else if let Ok(v) = sqlite_row.try_get::<String, _>(index) {
			SqlValue::Text(v)
		} else if let Ok(v) = sqlite_row.try_get::<Vec<u8>, _>(index) {
			SqlValue::Bytes(v)
		} else {
			SqlValue::Null
		};
		row.values.push(value);
	}
	row
}

#[async_trait]
impl SqlExecutor for SqliteBackend {
	async fn execute(
		&mut self,
		sql: &str,
		params: Vec<SqlValue>,
	) -> Result<ExecResult, DatabaseError> {
		let mut query = sqlx::query(sql);
		for value in params {
			query = bind_value(query, value);
		}
		let result = query.execute(&*self.pool).await?;
		Ok(ExecResult {
			rows_affected: result.rows_affected(),
		})
	}

	async fn fetch_all(
		&mut self,
		sql: &str,
		params: Vec<SqlValue>,
	) -> Result<Vec<Row>, DatabaseError> {
		let mut query = sqlx::query(sql);
		for value in params {
			query = bind_value(query, value);
		}
		let rows = query.fetch_all(&*self.pool).await?;
		Ok(rows.iter().map(convert_row).collect())
	}
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
	async fn begin(&mut self) -> Result<Box<dyn TransactionExecutor>, DatabaseError> {
		let tx = self.pool.begin().await?;
		Ok(Box::new(SqliteTransactionExecutor { tx: Some(tx) }))
	}
}

struct SqliteTransactionExecutor {
	tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteTransactionExecutor {
	fn transaction(&mut self) -> Result<&mut Transaction<'static, Sqlite>, DatabaseError> {
		self.tx.as_mut().ok_or_else(|| {
			DatabaseError::TransactionError("Transaction already consumed".to_string())
		})
	}
}

#[async_trait]
impl SqlExecutor for SqliteTransactionExecutor {
	async fn execute(
		&mut self,
		sql: &str,
		params: Vec<SqlValue>,
	) -> Result<ExecResult, DatabaseError> {
		let mut query = sqlx::query(sql);
		for value in params {
			query = bind_value(query, value);
		}
		let tx = self.transaction()?;
		let result = query.execute(&mut **tx).await?;
		Ok(ExecResult {
			rows_affected: result.rows_affected(),
		})
	}

	async fn fetch_all(
		&mut self,
		sql: &str,
		params: Vec<SqlValue>,
	) -> Result<Vec<Row>, DatabaseError> {
		let mut query = sqlx::query(sql);
		for value in params {
			query = bind_value(query, value);
		}
		let tx = self.transaction()?;
		let rows = query.fetch_all(&mut **tx).await?;
		Ok(rows.iter().map(convert_row).collect())
	}
}

#[async_trait]
impl TransactionExecutor for SqliteTransactionExecutor {
	async fn commit(mut self: Box<Self>) -> Result<(), DatabaseError> {
		let tx = self.tx.take().ok_or_else(|| {
			DatabaseError::TransactionError("Transaction already consumed".to_string())
		})?;
		tx.commit().await?;
		Ok(())
	}

	async fn rollback(mut self: Box<Self>) -> Result<(), DatabaseError> {
		let tx = self.tx.take().ok_or_else(|| {
			DatabaseError::TransactionError("Transaction already consumed".to_string())
		})?;
		tx.rollback().await?;
		Ok(())
	}
}
