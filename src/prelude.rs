//! Convenience re-exports for common usage.
//!
//! A single import for the items almost every fixture-loading test needs.
//!
//! # Example
//!
//! ```ignore
//! use musette::prelude::*;
//! ```

// Error types
pub use crate::error::{FixtureError, Result};

// Loader and configuration
pub use crate::dialect::{Dialect, ParamType};
pub use crate::loader::{Loader, LoaderBuilder};

// Fixture types
pub use crate::fixtures::{FixtureFormat, FixtureRecord, FixtureSet};
pub use crate::value::FixtureValue;

// Connection seam
pub use crate::backend::{DatabaseBackend, Row, SqlExecutor, SqlValue};

#[cfg(feature = "mysql")]
pub use crate::backend::MySqlBackend;
#[cfg(feature = "postgres")]
pub use crate::backend::PostgresBackend;
#[cfg(feature = "sqlite")]
pub use crate::backend::SqliteBackend;
