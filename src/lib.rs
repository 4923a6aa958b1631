//! Declarative test fixtures for SQL databases.
//!
//! Fixtures describe table contents in YAML or JSON. A [`Loader`] compiled
//! once per test binary wipes the fixture tables and reinserts every record
//! before each test case, so tests always start from the same database
//! state no matter what the previous test did:
//!
//! - **Declarative fixtures**: one YAML/JSON source per table, or a single
//!   multi-table document
//! - **Referential integrity handling**: per-engine strategies disable,
//!   defer or drop foreign keys for the duration of the load
//! - **Change detection**: per-table checksums skip tables no test has
//!   written to, so repeated loads cost almost nothing
//! - **Sequence resets**: sequences and auto-increment counters are bumped
//!   past the fixture ids after every load
//!
//! # Features
//!
//! - `postgres` - PostgreSQL connection backend (enabled by default)
//! - `mysql` - MySQL/MariaDB connection backend (enabled by default)
//! - `sqlite` - SQLite connection backend (enabled by default)
//! - `cockroachdb` - CockroachDB, over the PostgreSQL backend
//! - `yaml` - YAML fixture sources (enabled by default)
//!
//! Engines without a bundled backend (SQL Server, ClickHouse, Spanner,
//! Oracle) are supported through their dialects; implement
//! [`DatabaseBackend`] over the driver of your choice.
//!
//! # Quick Start
//!
//! Describe a table (`posts.yml`):
//!
//! ```yaml
//! - id: 1
//!   title: Fixtures for everyone
//!   created_at: 2025-03-01 10:00:00
//! - id: 2
//!   title: Raw SQL when you need it
//!   created_at: RAW=NOW()
//! ```
//!
//! Build a loader once and call it before every test case:
//!
//! ```ignore
//! use musette::prelude::*;
//!
//! let mut loader = Loader::builder()
//! 	.with_database(PostgresBackend::new(pool))
//! 	.with_dialect(Dialect::Postgres)
//! 	.with_fixture("posts.yml", include_str!("../fixtures/posts.yml"))
//! 	.build()
//! 	.await?;
//!
//! // In each test, before exercising the code under test:
//! loader.load().await?;
//! ```
//!
//! # The test database check
//!
//! Loading destroys data. Unless explicitly disabled, every load first
//! checks that the connected database's name contains `"test"`
//! (case-insensitive) and refuses to run otherwise, so a misconfigured
//! connection string cannot wipe a real database.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backend;
mod builder;
mod checksum;
pub mod dialect;
pub mod error;
pub mod fixtures;
mod guard;
pub mod loader;
pub mod prelude;
pub mod value;

// Re-export commonly used types at crate root
pub use backend::{
	DatabaseBackend, DatabaseError, ExecResult, Row, SqlExecutor, SqlValue, TransactionExecutor,
};
pub use dialect::{Dialect, ParamType};
pub use error::{FixtureError, Result};
pub use fixtures::{FixtureFormat, FixtureRecord, FixtureSet};
pub use loader::{Loader, LoaderBuilder};
pub use value::FixtureValue;

#[cfg(feature = "mysql")]
pub use backend::MySqlBackend;
#[cfg(feature = "postgres")]
pub use backend::PostgresBackend;
#[cfg(feature = "sqlite")]
pub use backend::SqliteBackend;
