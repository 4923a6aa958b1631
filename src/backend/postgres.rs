//! PostgreSQL backend over `sqlx`. Also used for CockroachDB, which speaks
//! the PostgreSQL wire protocol.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::{Column, Postgres, Row as SqlxRow, Transaction, ValueRef};

use super::{DatabaseBackend, DatabaseError, ExecResult, Row, SqlExecutor, SqlValue,
	TransactionExecutor};

/// [`DatabaseBackend`] for PostgreSQL, wrapping a [`PgPool`].
pub struct PostgresBackend {
	pool: Arc<PgPool>,
}

impl PostgresBackend {
	/// Wraps an existing pool.
	pub fn new(pool: PgPool) -> Self {
		Self {
			pool: Arc::new(pool),
		}
	}

	/// Returns the underlying pool.
	pub fn pool(&self) -> &PgPool {
		&self.pool
	}
}

fn bind_value<'q>(
	query: sqlx::query::Query<'q, Postgres, PgArguments>,
	value: SqlValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
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

fn convert_row(pg_row: &PgRow) -> Row {
	let mut row = Row::default();
	for (index, column) in pg_row.columns().iter().enumerate() {
		row.columns.push(column.name().to_string());

		if let Ok(raw) = pg_row.try_get_raw(index) {
			if raw.is_null() {
				row.values.push(SqlValue::Null);
				continue;
			}
		}

		let value = if let Ok(v) = pg_row.try_get::<i64, _>(index) {
			SqlValue::Int(v)
		} else if let Ok(v) = pg_row.try_get::<i32, _>(index) {
			SqlValue::Int(v.into())
		} else if let Ok(v) = pg_row.try_get::<i16, _>(index) {
			SqlValue::Int(v.into())
		} else if let Ok(v) = pg_row.try_get::<bool, _>(index) {
			SqlValue::Bool(v)
		} else if let Ok(v) = pg_row.try_get::<String, _>(index) {
			SqlValue::Text(v)
		} else if let Ok(v) = pg_row.try_get::<f64, _>(index) {
			SqlValue::Float(v)
		} else if let Ok(v) = pg_row.try_get::<f32, _>(index) {
			SqlValue::Float(v.into())
		} else if let Ok(v) = pg_row.try_get::<chrono::NaiveDate, _>(index) {
			SqlValue::Date(v)
		} else if let Ok(v) = pg_row.try_get::<chrono::NaiveDateTime, _>(index) {
			SqlValue::DateTime(v)
		} else if let Ok(v) = pg_row.try_get::<chrono::DateTime<chrono::Utc>, _>(index) {
			SqlValue::TimestampTz(v)
		} else if let Ok(v) = pg_row.try_get::<Vec<u8>, _>(index) {
			SqlValue::Bytes(v)
		} else {
			SqlValue::Null
		};
		row.values.push(value);
	}
	row
}

#[async_trait]
impl SqlExecutor for PostgresBackend {
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
impl DatabaseBackend for PostgresBackend {
	async fn begin(&mut self) -> Result<Box<dyn TransactionExecutor>, DatabaseError> {
		let tx = self.pool.begin().await?;
		Ok(Box::new(PgTransactionExecutor { tx: Some(tx) }))
	}
}

struct PgTransactionExecutor {
	tx: Option<Transaction<'static, Postgres>>,
}

impl PgTransactionExecutor {
	fn transaction(&mut self) -> Result<&mut Transaction<'static, Postgres>, DatabaseError> {
		self.tx.as_mut().ok_or_else(|| {
			DatabaseError::TransactionError("Transaction already consumed".to_string())
		})
	}
}

#[async_trait]
impl SqlExecutor for PgTransactionExecutor {
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
impl TransactionExecutor for PgTransactionExecutor {
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
