//! Table descriptors (the declared target shape) and observed tables (the
//! live shape read back from a store), plus the DDL rendering shared by every
//! migration strategy.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Quote an identifier, doubling embedded quotes. Column names such as
/// `Property-area` are legal once quoted.
pub fn quote_ident(ident: &str) -> String { format!("\"{}\"", ident.replace('"', "\"\"")) }

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String { format!("'{}'", value.replace('\'', "''")) }

/// SQL identifiers compare ASCII case-insensitively.
pub fn same_ident(a: &str, b: &str) -> bool { a.eq_ignore_ascii_case(b) }

// ─── Columns ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDefault {
  Text(String),
  Integer(i64),
  Real(f64),
  CurrentTimestamp,
}

impl ColumnDefault {
  /// Constant defaults can be attached by any `ADD COLUMN`.
  pub fn is_constant(&self) -> bool { !matches!(self, Self::CurrentTimestamp) }

  pub fn to_sql(&self) -> String {
    match self {
      Self::Text(text) => quote_literal(text),
      Self::Integer(n) => n.to_string(),
      Self::Real(x) => format!("{x:?}"),
      Self::CurrentTimestamp => "CURRENT_TIMESTAMP".to_owned(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
  pub name:          String,
  pub sql_type:      String,
  #[serde(default)]
  pub primary_key:   bool,
  #[serde(default)]
  pub autoincrement: bool,
  #[serde(default)]
  pub not_null:      bool,
  #[serde(default)]
  pub default:       Option<ColumnDefault>,
}

impl ColumnDef {
  pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
    Self {
      name:          name.into(),
      sql_type:      sql_type.into(),
      primary_key:   false,
      autoincrement: false,
      not_null:      false,
      default:       None,
    }
  }

  pub fn text(name: impl Into<String>) -> Self { Self::new(name, "TEXT") }

  pub fn integer(name: impl Into<String>) -> Self { Self::new(name, "INTEGER") }

  pub fn real(name: impl Into<String>) -> Self { Self::new(name, "REAL") }

  pub fn primary_key(mut self) -> Self {
    self.primary_key = true;
    self
  }

  pub fn autoincrement(mut self) -> Self {
    self.primary_key = true;
    self.autoincrement = true;
    self
  }

  pub fn not_null(mut self) -> Self {
    self.not_null = true;
    self
  }

  pub fn default(mut self, default: ColumnDefault) -> Self {
    self.default = Some(default);
    self
  }

  /// Full column definition as it appears inside `CREATE TABLE`.
  pub fn definition_sql(&self) -> String {
    let mut sql = format!("{} {}", quote_ident(&self.name), self.sql_type);
    if self.primary_key {
      sql.push_str(" PRIMARY KEY");
      if self.autoincrement {
        sql.push_str(" AUTOINCREMENT");
      }
    }
    if self.not_null {
      sql.push_str(" NOT NULL");
    }
    if let Some(default) = &self.default {
      sql.push_str(" DEFAULT ");
      sql.push_str(&default.to_sql());
    }
    sql
  }
}

// ─── Constraints and indexes ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
  pub column:     String,
  pub ref_table:  String,
  pub ref_column: String,
}

impl ForeignKey {
  pub fn new(
    column: impl Into<String>,
    ref_table: impl Into<String>,
    ref_column: impl Into<String>,
  ) -> Self {
    Self { column: column.into(), ref_table: ref_table.into(), ref_column: ref_column.into() }
  }

  /// Stable constraint name for stores that name their constraints.
  pub fn constraint_name(&self, table: &str) -> String {
    format!("fk_{table}_{}", self.column)
  }

  pub fn clause_sql(&self) -> String {
    format!(
      "FOREIGN KEY ({}) REFERENCES {}({})",
      quote_ident(&self.column),
      quote_ident(&self.ref_table),
      quote_ident(&self.ref_column),
    )
  }

  /// Whether the live store carries this key. A live key without a target
  /// column references the parent's primary key, which is what every
  /// declared key here points at.
  pub fn matches(&self, observed: &ObservedForeignKey) -> bool {
    same_ident(&self.column, &observed.column)
      && same_ident(&self.ref_table, &observed.ref_table)
      && observed.ref_column.as_deref().is_none_or(|c| same_ident(c, &self.ref_column))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
  pub name:    String,
  pub columns: Vec<String>,
  #[serde(default)]
  pub unique:  bool,
}

impl IndexDef {
  pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      name:    name.into(),
      columns: columns.into_iter().map(Into::into).collect(),
      unique:  false,
    }
  }

  pub fn unique(mut self) -> Self {
    self.unique = true;
    self
  }

  pub fn create_sql(&self, table: &str) -> String {
    let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
    format!(
      "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
      if self.unique { "UNIQUE " } else { "" },
      quote_ident(&self.name),
      quote_ident(table),
      columns.join(", "),
    )
  }
}

// ─── Tables ──────────────────────────────────────────────────────────────────

/// The declared target shape of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
  pub name:         String,
  pub columns:      Vec<ColumnDef>,
  #[serde(default)]
  pub foreign_keys: Vec<ForeignKey>,
  #[serde(default)]
  pub indexes:      Vec<IndexDef>,
}

impl TableDescriptor {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into(), columns: vec![], foreign_keys: vec![], indexes: vec![] }
  }

  pub fn column(mut self, column: ColumnDef) -> Self {
    self.columns.push(column);
    self
  }

  pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
    self.foreign_keys.push(fk);
    self
  }

  pub fn index(mut self, index: IndexDef) -> Self {
    self.indexes.push(index);
    self
  }

  pub fn find_column(&self, name: &str) -> Option<&ColumnDef> {
    self.columns.iter().find(|c| same_ident(&c.name, name))
  }

  /// Tables this one must follow when evolving, excluding itself.
  pub fn dependencies(&self) -> impl Iterator<Item = &str> {
    self
      .foreign_keys
      .iter()
      .map(|fk| fk.ref_table.as_str())
      .filter(|t| !same_ident(t, &self.name))
  }

  pub fn validate(&self) -> Result<()> {
    let invalid = |msg: String| Err(Error::InvalidDescriptor(format!("{}: {msg}", self.name)));

    if self.name.is_empty() {
      return Err(Error::InvalidDescriptor("table name is empty".into()));
    }
    if self.columns.is_empty() {
      return invalid("no columns declared".into());
    }
    for (i, column) in self.columns.iter().enumerate() {
      if column.name.is_empty() {
        return invalid(format!("column {i} has no name"));
      }
      if self.columns[..i].iter().any(|c| same_ident(&c.name, &column.name)) {
        return invalid(format!("column {} declared twice", column.name));
      }
      if let Some(ColumnDefault::Real(x)) = &column.default
        && !x.is_finite()
      {
        return invalid(format!("column {} has non-finite default {x}", column.name));
      }
    }
    if self.columns.iter().filter(|c| c.primary_key).count() > 1 {
      return invalid("more than one primary key column".into());
    }
    for fk in &self.foreign_keys {
      if self.find_column(&fk.column).is_none() {
        return invalid(format!("foreign key on undeclared column {}", fk.column));
      }
    }
    for index in &self.indexes {
      if let Some(missing) = index.columns.iter().find(|c| self.find_column(c).is_none()) {
        return invalid(format!("index {} covers undeclared column {missing}", index.name));
      }
    }
    Ok(())
  }

  /// `CREATE TABLE` for the full target shape under `as_name`.
  pub fn create_sql(&self, as_name: &str) -> String { self.create_sql_keeping(as_name, &[]) }

  /// As [`create_sql`](Self::create_sql), with live columns the descriptor
  /// does not declare appended after the declared ones.
  pub fn create_sql_keeping(&self, as_name: &str, kept: &[&ObservedColumn]) -> String {
    let mut parts: Vec<String> = self.columns.iter().map(ColumnDef::definition_sql).collect();
    parts.extend(kept.iter().map(|c| c.definition_sql()));
    parts.extend(self.foreign_keys.iter().map(ForeignKey::clause_sql));
    format!("CREATE TABLE {} (\n    {}\n)", quote_ident(as_name), parts.join(",\n    "))
  }
}

// ─── Observed shape ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedColumn {
  pub name:        String,
  pub sql_type:    String,
  pub not_null:    bool,
  /// The default expression as the store reports it, if any.
  pub default_sql: Option<String>,
  pub primary_key: bool,
}

impl ObservedColumn {
  /// The live column as a `CREATE TABLE` entry, without any key role.
  pub fn definition_sql(&self) -> String {
    let mut sql = quote_ident(&self.name);
    if !self.sql_type.is_empty() {
      sql.push(' ');
      sql.push_str(&self.sql_type);
    }
    if self.not_null {
      sql.push_str(" NOT NULL");
    }
    if let Some(default) = &self.default_sql {
      sql.push_str(" DEFAULT ");
      sql.push_str(default);
    }
    sql
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedForeignKey {
  pub column:     String,
  pub ref_table:  String,
  pub ref_column: Option<String>,
}

/// The live shape of a table, read fresh from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedTable {
  pub name:         String,
  pub columns:      Vec<ObservedColumn>,
  pub foreign_keys: Vec<ObservedForeignKey>,
  pub indexes:      Vec<String>,
}

impl ObservedTable {
  pub fn find_column(&self, name: &str) -> Option<&ObservedColumn> {
    self.columns.iter().find(|c| same_ident(&c.name, name))
  }

  pub fn has_column(&self, name: &str) -> bool { self.find_column(name).is_some() }

  /// Live columns `desc` does not declare.
  pub fn undeclared_columns<'a>(&'a self, desc: &TableDescriptor) -> Vec<&'a ObservedColumn> {
    self.columns.iter().filter(|c| desc.find_column(&c.name).is_none()).collect()
  }

  pub fn has_index(&self, name: &str) -> bool { self.indexes.iter().any(|i| same_ident(i, name)) }

  pub fn has_foreign_key(&self, fk: &ForeignKey) -> bool {
    self.foreign_keys.iter().any(|o| fk.matches(o))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn properties() -> TableDescriptor {
    TableDescriptor::new("properties")
      .column(ColumnDef::text("property_code").primary_key())
      .column(ColumnDef::text("owner_code"))
      .column(ColumnDef::real("Property-area").default(ColumnDefault::Real(0.0)))
      .column(ColumnDef::text("created_at").default(ColumnDefault::CurrentTimestamp))
      .foreign_key(ForeignKey::new("owner_code", "owners", "owner_code"))
      .index(IndexDef::new("properties_owner_idx", ["owner_code"]))
  }

  #[test]
  fn create_sql_quotes_and_bakes_constraints() {
    let sql = properties().create_sql("properties_rebuild");
    assert!(sql.starts_with("CREATE TABLE \"properties_rebuild\" ("));
    assert!(sql.contains("\"property_code\" TEXT PRIMARY KEY"));
    assert!(sql.contains("\"Property-area\" REAL DEFAULT 0.0"));
    assert!(sql.contains("\"created_at\" TEXT DEFAULT CURRENT_TIMESTAMP"));
    assert!(sql.contains("FOREIGN KEY (\"owner_code\") REFERENCES \"owners\"(\"owner_code\")"));
  }

  #[test]
  fn unique_index_sql() {
    let index = IndexDef::new("owners_phone_idx", ["phone"]).unique();
    assert_eq!(
      index.create_sql("owners"),
      "CREATE UNIQUE INDEX IF NOT EXISTS \"owners_phone_idx\" ON \"owners\" (\"phone\")"
    );
  }

  #[test]
  fn literals_and_identifiers_are_escaped() {
    assert_eq!(quote_literal("it's"), "'it''s'");
    assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    assert_eq!(ColumnDefault::Text("لا".into()).to_sql(), "'لا'");
  }

  #[test]
  fn only_current_timestamp_is_non_constant() {
    assert!(ColumnDefault::Integer(0).is_constant());
    assert!(ColumnDefault::Text("x".into()).is_constant());
    assert!(!ColumnDefault::CurrentTimestamp.is_constant());
  }

  #[test]
  fn validate_rejects_duplicate_columns() {
    let desc = TableDescriptor::new("t")
      .column(ColumnDef::text("id"))
      .column(ColumnDef::text("ID"));
    assert!(matches!(desc.validate(), Err(Error::InvalidDescriptor(_))));
  }

  #[test]
  fn validate_rejects_foreign_key_on_unknown_column() {
    let desc = TableDescriptor::new("t")
      .column(ColumnDef::text("id"))
      .foreign_key(ForeignKey::new("owner", "owners", "owner_code"));
    assert!(matches!(desc.validate(), Err(Error::InvalidDescriptor(_))));
  }

  #[test]
  fn validate_rejects_non_finite_real_defaults() {
    for x in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
      let desc = TableDescriptor::new("t")
        .column(ColumnDef::text("id").primary_key())
        .column(ColumnDef::real("area").default(ColumnDefault::Real(x)));
      assert!(matches!(desc.validate(), Err(Error::InvalidDescriptor(_))), "{x}");
    }
  }

  #[test]
  fn kept_columns_follow_declared_ones() {
    let legacy = ObservedColumn {
      name:        "legacy_note".into(),
      sql_type:    "TEXT".into(),
      not_null:    true,
      default_sql: Some("'none'".into()),
      primary_key: false,
    };
    let untyped = ObservedColumn {
      name:        "extra".into(),
      sql_type:    String::new(),
      not_null:    false,
      default_sql: None,
      primary_key: true,
    };
    let sql = properties().create_sql_keeping("properties_rebuild", &[&legacy, &untyped]);
    let created_at = sql.find("\"created_at\"").unwrap();
    let kept = sql.find("\"legacy_note\" TEXT NOT NULL DEFAULT 'none'").unwrap();
    let fk = sql.find("FOREIGN KEY").unwrap();
    assert!(created_at < kept && kept < fk);
    assert!(sql.contains("\"extra\",\n"));
  }

  #[test]
  fn undeclared_columns_compare_case_insensitively() {
    let column = |name: &str| ObservedColumn {
      name:        name.into(),
      sql_type:    "TEXT".into(),
      not_null:    false,
      default_sql: None,
      primary_key: false,
    };
    let observed = ObservedTable {
      name:         "properties".into(),
      columns:      vec![column("PROPERTY_CODE"), column("owner_code"), column("legacy")],
      foreign_keys: vec![],
      indexes:      vec![],
    };
    let names: Vec<&str> =
      observed.undeclared_columns(&properties()).iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["legacy"]);
  }

  #[test]
  fn validate_accepts_registry_shape() { properties().validate().unwrap(); }

  #[test]
  fn observed_foreign_key_without_target_column_matches() {
    let fk = ForeignKey::new("owner_code", "owners", "owner_code");
    let observed = ObservedForeignKey {
      column:     "OWNER_CODE".into(),
      ref_table:  "Owners".into(),
      ref_column: None,
    };
    assert!(fk.matches(&observed));
  }

  #[test]
  fn dependencies_skip_self_references() {
    let desc = TableDescriptor::new("codes")
      .column(ColumnDef::text("code").primary_key())
      .column(ColumnDef::text("parent_code"))
      .foreign_key(ForeignKey::new("parent_code", "codes", "code"))
      .column(ColumnDef::text("owner_code"))
      .foreign_key(ForeignKey::new("owner_code", "owners", "owner_code"));
    assert_eq!(desc.dependencies().collect::<Vec<_>>(), vec!["owners"]);
  }
}
