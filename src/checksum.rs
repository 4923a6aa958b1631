//! Per-table checksums used to skip cleaning and reinserting tables whose
//! contents have not changed since the previous load.

use std::collections::HashMap;

/// A table content fingerprint. The representation is engine-specific: an
/// MD5 string on PostgreSQL, a hash aggregate on MySQL and ClickHouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
	/// Numeric checksum.
	Int(i64),
	/// Textual checksum.
	Text(String),
}

/// Cache of the checksums recorded after the last load.
///
/// The cache starts unprimed: every table counts as modified, so the first
/// load always cleans and inserts. After a load, the checksums of the
/// touched tables are recorded (and on the very first pass, of every known
/// table), and later loads skip tables whose current checksum still matches.
#[derive(Debug, Default)]
pub struct ChecksumCache {
	entries: HashMap<String, Checksum>,
	primed: bool,
}

impl ChecksumCache {
	/// Creates an empty, unprimed cache.
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether the initial full snapshot has been recorded.
	pub fn is_primed(&self) -> bool {
		self.primed
	}

	/// Marks the initial full snapshot as recorded.
	pub fn set_primed(&mut self) {
		self.primed = true;
	}

	/// Returns the recorded checksum for `table`, if any.
	pub fn get(&self, table: &str) -> Option<&Checksum> {
		self.entries.get(table)
	}

	/// Records the checksum for `table`.
	pub fn put(&mut self, table: impl Into<String>, checksum: Checksum) {
		self.entries.insert(table.into(), checksum);
	}

	/// Whether `table` should be treated as modified given its `current`
	/// checksum. Unknown tables are always modified.
	pub fn is_modified(&self, table: &str, current: &Checksum) -> bool {
		match self.entries.get(table) {
			Some(recorded) => recorded != current,
			None => true,
		}
	}
}
