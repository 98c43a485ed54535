//! [`Session`]: the core store traits over a borrowed SQLite connection.

use rusqlite::{Connection, OptionalExtension as _, ffi};

use estate_core::{
  policy::CodeTarget,
  schema::{ObservedColumn, ObservedForeignKey, ObservedTable, quote_ident},
  store::{Capabilities, CodeIndex, SchemaStore},
};

/// SQLite takes only constant defaults in `ADD COLUMN`, cannot add a foreign
/// key to an existing table, and runs DDL inside transactions.
pub const SQLITE_CAPABILITIES: Capabilities = Capabilities {
  non_constant_column_defaults: false,
  alter_constraints:            false,
  transactional_ddl:            true,
};

/// A borrowed connection seen through [`CodeIndex`] and [`SchemaStore`].
///
/// Created inside `tokio_rusqlite::Connection::call` so the synchronous core
/// algorithms run on the connection's thread.
#[derive(Clone, Copy)]
pub struct Session<'c> {
  conn: &'c Connection,
  caps: Capabilities,
}

impl<'c> Session<'c> {
  pub fn new(conn: &'c Connection) -> Self { Self { conn, caps: SQLITE_CAPABILITIES } }

  /// Report different capabilities than SQLite's own, e.g. to run DDL outside
  /// a transaction.
  pub fn with_capabilities(conn: &'c Connection, caps: Capabilities) -> Self {
    Self { conn, caps }
  }

  fn table_name(&self, table: &str) -> rusqlite::Result<Option<String>> {
    self
      .conn
      .query_row(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        [table],
        |r| r.get(0),
      )
      .optional()
  }
}

/// Whether `err` is SQLite rejecting a row because its key is already taken.
pub(crate) fn is_key_conflict(err: &rusqlite::Error) -> bool {
  matches!(
    err,
    rusqlite::Error::SqliteFailure(e, _)
      if e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
  )
}

// ─── CodeIndex ───────────────────────────────────────────────────────────────

impl CodeIndex for Session<'_> {
  type Error = rusqlite::Error;

  fn code_exists(&self, target: &CodeTarget, code: &str) -> rusqlite::Result<bool> {
    let sql = format!(
      "SELECT EXISTS (SELECT 1 FROM {} WHERE {} = ?1)",
      quote_ident(&target.table),
      quote_ident(&target.column),
    );
    self.conn.query_row(&sql, [code], |r| r.get(0))
  }

  fn prefix_in_use(&self, target: &CodeTarget, prefix: &str) -> rusqlite::Result<bool> {
    // substr counts characters, so compare against the prefix's char count.
    let sql = format!(
      "SELECT EXISTS (SELECT 1 FROM {table} WHERE substr({column}, 1, ?2) = ?1)",
      table = quote_ident(&target.table),
      column = quote_ident(&target.column),
    );
    let len = prefix.chars().count() as i64;
    self.conn.query_row(&sql, rusqlite::params![prefix, len], |r| r.get(0))
  }
}

// ─── SchemaStore ─────────────────────────────────────────────────────────────

impl SchemaStore for Session<'_> {
  type Error = rusqlite::Error;

  fn capabilities(&self) -> Capabilities { self.caps }

  fn observe_table(&self, table: &str) -> rusqlite::Result<Option<ObservedTable>> {
    let Some(name) = self.table_name(table)? else {
      return Ok(None);
    };

    let mut stmt = self.conn.prepare(
      "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let columns = stmt
      .query_map([&name], |r| {
        Ok(ObservedColumn {
          name:        r.get(0)?,
          sql_type:    r.get(1)?,
          not_null:    r.get(2)?,
          default_sql: r.get(3)?,
          primary_key: r.get::<_, i64>(4)? > 0,
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt =
      self.conn.prepare("SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1)")?;
    let foreign_keys = stmt
      .query_map([&name], |r| {
        Ok(ObservedForeignKey {
          column:     r.get(0)?,
          ref_table:  r.get(1)?,
          ref_column: r.get(2)?,
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = self.conn.prepare("SELECT name FROM pragma_index_list(?1)")?;
    let indexes = stmt
      .query_map([&name], |r| r.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;

    Ok(Some(ObservedTable { name, columns, foreign_keys, indexes }))
  }

  fn execute(&self, sql: &str) -> rusqlite::Result<()> { self.conn.execute_batch(sql) }

  fn begin(&self) -> rusqlite::Result<()> { self.conn.execute_batch("BEGIN IMMEDIATE") }

  fn commit(&self) -> rusqlite::Result<()> { self.conn.execute_batch("COMMIT") }

  fn rollback(&self) -> rusqlite::Result<()> { self.conn.execute_batch("ROLLBACK") }

  fn row_count(&self, table: &str) -> rusqlite::Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    let count: i64 = self.conn.query_row(&sql, [], |r| r.get(0))?;
    Ok(count.unsigned_abs())
  }

  fn suspend_foreign_keys(&self) -> rusqlite::Result<bool> {
    let enabled: bool = self.conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?;
    self.conn.execute_batch("PRAGMA foreign_keys = OFF")?;
    Ok(enabled)
  }

  fn restore_foreign_keys(&self, enabled: bool) -> rusqlite::Result<()> {
    self
      .conn
      .execute_batch(if enabled { "PRAGMA foreign_keys = ON" } else { "PRAGMA foreign_keys = OFF" })
  }

  fn foreign_key_violations(&self, table: &str) -> rusqlite::Result<u64> {
    let mut stmt = self.conn.prepare(&format!("PRAGMA foreign_key_check({})", quote_ident(table)))?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while rows.next()?.is_some() {
      count += 1;
    }
    Ok(count)
  }

  fn sequence_value(&self, table: &str) -> rusqlite::Result<Option<i64>> {
    // Only exists once some table has used AUTOINCREMENT.
    if self.table_name("sqlite_sequence")?.is_none() {
      return Ok(None);
    }
    self
      .conn
      .query_row("SELECT seq FROM sqlite_sequence WHERE name = ?1 COLLATE NOCASE", [table], |r| {
        r.get(0)
      })
      .optional()
  }

  fn restore_sequence_value(&self, table: &str, value: i64) -> rusqlite::Result<()> {
    let raised = self.conn.execute(
      "UPDATE sqlite_sequence SET seq = max(seq, ?2) WHERE name = ?1 COLLATE NOCASE",
      rusqlite::params![table, value],
    )?;
    if raised == 0 {
      self.conn.execute(
        "INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)",
        rusqlite::params![table, value],
      )?;
    }
    Ok(())
  }
}
