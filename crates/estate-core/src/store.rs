//! The synchronous store seams the minter and the evolver are written
//! against.
//!
//! Backends (e.g. `estate-store-sqlite`) implement these traits over a live
//! connection. Nothing in this crate knows which engine sits behind them.

use crate::{policy::CodeTarget, schema::ObservedTable};

// ─── Uniqueness lookups ──────────────────────────────────────────────────────

/// Read-only uniqueness checks used while minting.
pub trait CodeIndex {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Whether `code` already exists verbatim in the target column.
  fn code_exists(&self, target: &CodeTarget, code: &str) -> Result<bool, Self::Error>;

  /// Whether any value in the target column starts with `prefix`.
  ///
  /// The match is anchored at the start of the value and compares the
  /// prefix literally; no pattern characters are interpreted.
  fn prefix_in_use(&self, target: &CodeTarget, prefix: &str) -> Result<bool, Self::Error>;
}

// ─── Schema access ───────────────────────────────────────────────────────────

/// What a store can do in place, used to pick a migration strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
  /// `ADD COLUMN` accepts a non-constant default such as
  /// `CURRENT_TIMESTAMP`.
  pub non_constant_column_defaults: bool,
  /// Constraints can be added to an existing table with `ALTER TABLE`.
  pub alter_constraints:            bool,
  /// DDL statements take part in transactions and roll back with them.
  pub transactional_ddl:            bool,
}

/// Introspection and DDL execution against a live store.
pub trait SchemaStore {
  type Error: std::error::Error + Send + Sync + 'static;

  fn capabilities(&self) -> Capabilities;

  /// Read the live shape of `table`, or `None` if no such table exists.
  fn observe_table(&self, table: &str) -> Result<Option<ObservedTable>, Self::Error>;

  /// Execute one or more statements that return no rows.
  fn execute(&self, sql: &str) -> Result<(), Self::Error>;

  fn begin(&self) -> Result<(), Self::Error>;
  fn commit(&self) -> Result<(), Self::Error>;
  fn rollback(&self) -> Result<(), Self::Error>;

  fn row_count(&self, table: &str) -> Result<u64, Self::Error>;

  /// Turn foreign-key enforcement off, returning whether it was on.
  fn suspend_foreign_keys(&self) -> Result<bool, Self::Error>;

  fn restore_foreign_keys(&self, enabled: bool) -> Result<(), Self::Error>;

  /// Number of rows in `table` whose foreign keys point at nothing.
  fn foreign_key_violations(&self, table: &str) -> Result<u64, Self::Error>;

  /// The highest id `table`'s `AUTOINCREMENT` column has handed out, for
  /// stores that track one apart from the rows.
  fn sequence_value(&self, _table: &str) -> Result<Option<i64>, Self::Error> { Ok(None) }

  /// Raise `table`'s `AUTOINCREMENT` high-water mark to at least `value`.
  fn restore_sequence_value(&self, _table: &str, _value: i64) -> Result<(), Self::Error> {
    Ok(())
  }
}
