//! [`SchemaEvolver`]: brings live tables to their declared shape at startup.

use crate::{
  Error, Result,
  migrate::{
    AdditiveStep, Gap, MigrationOutcome, Migrator, in_transaction, migrator_for, plan_columns,
    recover_leftover_shadow, structural_gaps,
  },
  schema::{ObservedTable, TableDescriptor, same_ident},
  store::SchemaStore,
};

// ─── Reports ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnReport {
  /// The table did not exist and was created in its target shape.
  pub created:         bool,
  pub added:           Vec<String>,
  pub backfilled:      Vec<String>,
  pub indexes_created: Vec<String>,
  /// Set when defaults had to be attached after the columns were added.
  pub defaults:        Option<MigrationOutcome>,
}

impl ColumnReport {
  pub fn is_noop(&self) -> bool {
    !self.created
      && self.added.is_empty()
      && self.indexes_created.is_empty()
      && self.defaults.is_none()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintReport {
  pub gaps:    Vec<String>,
  pub outcome: Option<MigrationOutcome>,
}

#[derive(Debug)]
pub enum TableOutcome {
  Evolved {
    columns:     ColumnReport,
    constraints: ConstraintReport,
  },
  /// Left in a usable but not fully evolved state.
  Degraded(Error),
}

#[derive(Debug)]
pub struct TableReport {
  pub table:   String,
  pub outcome: TableOutcome,
}

#[derive(Debug, Default)]
pub struct EvolutionReport {
  /// In the order the tables were evolved.
  pub tables: Vec<TableReport>,
}

impl EvolutionReport {
  pub fn is_degraded(&self) -> bool { self.degraded().next().is_some() }

  pub fn degraded(&self) -> impl Iterator<Item = (&str, &Error)> {
    self.tables.iter().filter_map(|t| match &t.outcome {
      TableOutcome::Degraded(err) => Some((t.table.as_str(), err)),
      TableOutcome::Evolved { .. } => None,
    })
  }

  pub fn get(&self, table: &str) -> Option<&TableOutcome> {
    self.tables.iter().find(|t| same_ident(&t.table, table)).map(|t| &t.outcome)
  }
}

// ─── Ordering ────────────────────────────────────────────────────────────────

/// Order descriptors so every table follows the tables its foreign keys
/// reference. Ties keep input order; references to tables outside the set
/// are ignored.
pub fn evolution_order(descs: &[TableDescriptor]) -> Result<Vec<&TableDescriptor>> {
  for (i, desc) in descs.iter().enumerate() {
    if descs[..i].iter().any(|d| same_ident(&d.name, &desc.name)) {
      return Err(Error::InvalidDescriptor(format!("table {} declared twice", desc.name)));
    }
  }

  let mut placed = vec![false; descs.len()];
  let mut order = Vec::with_capacity(descs.len());

  while order.len() < descs.len() {
    let ready = (0..descs.len()).find(|&i| {
      !placed[i]
        && descs[i].dependencies().all(|dep| {
          descs.iter().zip(&placed).all(|(d, &done)| done || !same_ident(&d.name, dep))
        })
    });
    match ready {
      Some(i) => {
        placed[i] = true;
        order.push(&descs[i]);
      }
      None => {
        let stuck = descs
          .iter()
          .zip(&placed)
          .filter(|(_, done)| !**done)
          .map(|(d, _)| d.name.clone())
          .collect();
        return Err(Error::DependencyCycle(stuck));
      }
    }
  }

  Ok(order)
}

// ─── Evolver ─────────────────────────────────────────────────────────────────

/// Applies table descriptors to a live store.
///
/// Meant to run once, serially, before anything else touches the tables.
pub struct SchemaEvolver<'s, S: SchemaStore> {
  store:    &'s S,
  migrator: Box<dyn Migrator<S> + 's>,
}

impl<'s, S: SchemaStore + 's> SchemaEvolver<'s, S> {
  /// An evolver using the strategy the store's capabilities allow.
  pub fn new(store: &'s S) -> Self {
    let migrator = migrator_for(store.capabilities());
    Self { store, migrator }
  }

  pub fn with_migrator(store: &'s S, migrator: Box<dyn Migrator<S> + 's>) -> Self {
    Self { store, migrator }
  }

  pub fn strategy(&self) -> &'static str { self.migrator.name() }

  fn observe(&self, table: &str) -> Result<Option<ObservedTable>> {
    self.store.observe_table(table).map_err(Error::store)
  }

  fn observe_existing(&self, table: &str) -> Result<ObservedTable> {
    self
      .observe(table)?
      .ok_or_else(|| Error::Store(format!("table {table} vanished during evolution").into()))
  }

  fn create(&self, desc: &TableDescriptor) -> Result<ColumnReport> {
    in_transaction(self.store, |store| {
      store.execute(&desc.create_sql(&desc.name)).map_err(Error::store)?;
      for index in &desc.indexes {
        store.execute(&index.create_sql(&desc.name)).map_err(Error::store)?;
      }
      Ok(())
    })?;
    tracing::info!(table = %desc.name, "created table");
    Ok(ColumnReport {
      created: true,
      indexes_created: desc.indexes.iter().map(|i| i.name.clone()).collect(),
      ..ColumnReport::default()
    })
  }

  /// Add every declared column the live table lacks, backfilling pre-existing
  /// rows, and create missing indexes. Creates the table if it is absent.
  ///
  /// When the store cannot attach a column's default while adding it, the
  /// column is added bare and backfilled, then the default is attached by the
  /// configured strategy. If that last step fails the backfilled table stays
  /// in place and the error is returned.
  pub fn ensure_columns(&self, desc: &TableDescriptor) -> Result<ColumnReport> {
    desc.validate()?;
    recover_leftover_shadow(self.store, &desc.name)?;

    let Some(observed) = self.observe(&desc.name)? else {
      return self.create(desc);
    };

    let plan = plan_columns(desc, &observed, self.store.capabilities())?;
    let mut report = ColumnReport::default();
    if plan.steps.is_empty() {
      return Ok(report);
    }

    in_transaction(self.store, |store| {
      for step in &plan.steps {
        store.execute(&step.sql(&desc.name)).map_err(Error::store)?;
      }
      Ok(())
    })?;

    for step in &plan.steps {
      match step {
        AdditiveStep::AddColumn { column, .. } => {
          tracing::info!(table = %desc.name, column = %column.name, "added column");
          report.added.push(column.name.clone());
        }
        AdditiveStep::Backfill { column, .. } => {
          tracing::info!(table = %desc.name, %column, "backfilled column");
          report.backfilled.push(column.clone());
        }
        AdditiveStep::CreateIndex(index) => {
          tracing::info!(table = %desc.name, index = %index.name, "created index");
          report.indexes_created.push(index.name.clone());
        }
      }
    }

    if !plan.deferred_defaults.is_empty() {
      let observed = self.observe_existing(&desc.name)?;
      let gaps: Vec<Gap> = plan.deferred_defaults.into_iter().map(Gap::MissingDefault).collect();
      report.defaults = Some(self.migrator.close_gaps(self.store, desc, &observed, &gaps)?);
    }

    Ok(report)
  }

  /// Close structural gaps (missing foreign keys, missing defaults) with the
  /// configured strategy. Creates the table if it is absent.
  pub fn ensure_constraints(&self, desc: &TableDescriptor) -> Result<ConstraintReport> {
    desc.validate()?;
    recover_leftover_shadow(self.store, &desc.name)?;

    let Some(observed) = self.observe(&desc.name)? else {
      self.create(desc)?;
      return Ok(ConstraintReport::default());
    };

    let gaps = structural_gaps(desc, &observed);
    if gaps.is_empty() {
      return Ok(ConstraintReport::default());
    }

    let outcome = self.migrator.close_gaps(self.store, desc, &observed, &gaps)?;
    Ok(ConstraintReport {
      gaps:    gaps.iter().map(ToString::to_string).collect(),
      outcome: Some(outcome),
    })
  }

  /// Evolve every table, referenced tables first.
  ///
  /// A table that fails without a fatal error is recorded as degraded and
  /// the pass moves on. A fatal error stops the pass immediately.
  pub fn run_all(&self, descs: &[TableDescriptor]) -> Result<EvolutionReport> {
    for desc in descs {
      desc.validate()?;
    }
    let order = evolution_order(descs)?;

    let mut report = EvolutionReport::default();
    for desc in order {
      let outcome = self
        .ensure_columns(desc)
        .and_then(|columns| Ok((columns, self.ensure_constraints(desc)?)));

      let outcome = match outcome {
        Ok((columns, constraints)) => TableOutcome::Evolved { columns, constraints },
        Err(err) if err.is_fatal() => {
          tracing::error!(table = %desc.name, error = %err, "schema evolution hit a fatal error");
          return Err(err);
        }
        Err(err) => {
          tracing::warn!(table = %desc.name, error = %err, "table left short of its target shape");
          TableOutcome::Degraded(err)
        }
      };
      report.tables.push(TableReport { table: desc.name.clone(), outcome });
    }

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use std::{cell::RefCell, collections::HashMap, convert::Infallible};

  use super::*;
  use crate::{
    migrate::{AdditiveMigrator, RebuildMigrator},
    schema::{
      ColumnDef, ColumnDefault, ForeignKey, IndexDef, ObservedColumn, ObservedForeignKey,
    },
    store::Capabilities,
  };

  /// Serves canned observations and records every statement it is asked to
  /// run. It does not interpret SQL.
  struct Recording {
    caps:     Capabilities,
    tables:   HashMap<String, ObservedTable>,
    executed: RefCell<Vec<String>>,
  }

  impl Recording {
    fn new(caps: Capabilities, tables: Vec<ObservedTable>) -> Self {
      Self {
        caps,
        tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        executed: RefCell::new(vec![]),
      }
    }

    fn executed(&self) -> Vec<String> { self.executed.borrow().clone() }
  }

  impl SchemaStore for Recording {
    type Error = Infallible;

    fn capabilities(&self) -> Capabilities { self.caps }

    fn observe_table(&self, table: &str) -> Result<Option<ObservedTable>, Infallible> {
      Ok(self.tables.get(table).cloned())
    }

    fn execute(&self, sql: &str) -> Result<(), Infallible> {
      self.executed.borrow_mut().push(sql.to_owned());
      Ok(())
    }

    fn begin(&self) -> Result<(), Infallible> { self.execute("BEGIN") }

    fn commit(&self) -> Result<(), Infallible> { self.execute("COMMIT") }

    fn rollback(&self) -> Result<(), Infallible> { self.execute("ROLLBACK") }

    fn row_count(&self, _: &str) -> Result<u64, Infallible> { Ok(0) }

    fn suspend_foreign_keys(&self) -> Result<bool, Infallible> { Ok(true) }

    fn restore_foreign_keys(&self, _: bool) -> Result<(), Infallible> { Ok(()) }

    fn foreign_key_violations(&self, _: &str) -> Result<u64, Infallible> { Ok(0) }
  }

  const SQLITE_LIKE: Capabilities = Capabilities {
    non_constant_column_defaults: false,
    alter_constraints:            false,
    transactional_ddl:            true,
  };

  const SERVER_LIKE: Capabilities = Capabilities {
    non_constant_column_defaults: true,
    alter_constraints:            true,
    transactional_ddl:            true,
  };

  fn column(name: &str, default_sql: Option<&str>) -> ObservedColumn {
    ObservedColumn {
      name:        name.into(),
      sql_type:    "TEXT".into(),
      not_null:    false,
      default_sql: default_sql.map(Into::into),
      primary_key: name == "id",
    }
  }

  fn observed(name: &str, columns: &[&str]) -> ObservedTable {
    ObservedTable {
      name:         name.into(),
      columns:      columns.iter().map(|c| column(c, None)).collect(),
      foreign_keys: vec![],
      indexes:      vec![],
    }
  }

  fn items() -> TableDescriptor {
    TableDescriptor::new("items")
      .column(ColumnDef::text("id").primary_key())
      .column(ColumnDef::text("name"))
      .column(ColumnDef::integer("qty").not_null().default(ColumnDefault::Integer(0)))
      .column(ColumnDef::text("created_at").default(ColumnDefault::CurrentTimestamp))
  }

  fn owners() -> TableDescriptor {
    TableDescriptor::new("owners").column(ColumnDef::text("owner_code").primary_key())
  }

  fn properties() -> TableDescriptor {
    TableDescriptor::new("properties")
      .column(ColumnDef::text("property_code").primary_key())
      .column(ColumnDef::text("owner_code"))
      .foreign_key(ForeignKey::new("owner_code", "owners", "owner_code"))
  }

  fn photos() -> TableDescriptor {
    TableDescriptor::new("property_photos")
      .column(ColumnDef::integer("id").autoincrement())
      .column(ColumnDef::text("property_code"))
      .foreign_key(ForeignKey::new("property_code", "properties", "property_code"))
  }

  #[test]
  fn order_puts_referenced_tables_first() {
    let descs = vec![photos(), properties(), owners()];
    let names: Vec<&str> =
      evolution_order(&descs).unwrap().into_iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["owners", "properties", "property_photos"]);
  }

  #[test]
  fn order_keeps_input_order_for_independent_tables() {
    let descs = vec![items(), owners(), properties()];
    let names: Vec<&str> =
      evolution_order(&descs).unwrap().into_iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["items", "owners", "properties"]);
  }

  #[test]
  fn order_reports_cycles() {
    let a = TableDescriptor::new("a")
      .column(ColumnDef::text("b_id"))
      .foreign_key(ForeignKey::new("b_id", "b", "id"));
    let b = TableDescriptor::new("b")
      .column(ColumnDef::text("a_id"))
      .foreign_key(ForeignKey::new("a_id", "a", "id"));
    let err = evolution_order(&[a, b, owners()]).unwrap_err();
    assert!(matches!(err, Error::DependencyCycle(ref t) if t == &["a", "b"]));
  }

  #[test]
  fn missing_table_is_created_with_full_shape() {
    let store = Recording::new(SQLITE_LIKE, vec![]);
    let report = SchemaEvolver::new(&store).ensure_columns(&properties()).unwrap();
    assert!(report.created);
    let executed = store.executed();
    assert_eq!(executed.first().map(String::as_str), Some("BEGIN"));
    assert!(executed[1].starts_with("CREATE TABLE \"properties\""));
    assert!(executed[1].contains("FOREIGN KEY"));
  }

  #[test]
  fn constant_default_is_attached_in_place() {
    let store = Recording::new(SQLITE_LIKE, vec![observed("items", &["id", "name", "created_at"])]);
    let report = SchemaEvolver::new(&store).ensure_columns(&items()).unwrap();
    assert_eq!(report.added, ["qty"]);
    assert!(report.backfilled.is_empty());
    assert!(
      store
        .executed()
        .contains(&"ALTER TABLE \"items\" ADD COLUMN \"qty\" INTEGER NOT NULL DEFAULT 0".into())
    );
  }

  #[test]
  fn non_constant_default_is_backfilled_then_attached() {
    let store = Recording::new(SERVER_LIKE, vec![observed("items", &["id", "name", "qty"])]);
    let caps = Capabilities { non_constant_column_defaults: false, ..SERVER_LIKE };
    let store = Recording { caps, ..store };
    let evolver = SchemaEvolver::with_migrator(&store, Box::new(AdditiveMigrator));
    let report = evolver.ensure_columns(&items()).unwrap();

    assert_eq!(report.added, ["created_at"]);
    assert_eq!(report.backfilled, ["created_at"]);
    assert_eq!(report.defaults.map(|o| o.strategy), Some("additive"));
    let executed = store.executed();
    let add = executed
      .iter()
      .position(|s| s == "ALTER TABLE \"items\" ADD COLUMN \"created_at\" TEXT")
      .unwrap();
    let fill = executed
      .iter()
      .position(|s| {
        s == "UPDATE \"items\" SET \"created_at\" = CURRENT_TIMESTAMP WHERE \"created_at\" IS NULL"
      })
      .unwrap();
    let attach = executed
      .iter()
      .position(|s| s.contains("ALTER COLUMN \"created_at\" SET DEFAULT CURRENT_TIMESTAMP"))
      .unwrap();
    assert!(add < fill && fill < attach);
  }

  #[test]
  fn stores_with_rich_alter_add_defaults_directly() {
    let store = Recording::new(SERVER_LIKE, vec![observed("items", &["id", "name", "qty"])]);
    let report = SchemaEvolver::new(&store).ensure_columns(&items()).unwrap();
    assert_eq!(report.added, ["created_at"]);
    assert!(report.backfilled.is_empty());
    assert!(report.defaults.is_none());
  }

  #[test]
  fn adding_primary_key_column_is_rejected() {
    let store = Recording::new(SQLITE_LIKE, vec![observed("items", &["name"])]);
    let err = SchemaEvolver::new(&store).ensure_columns(&items()).unwrap_err();
    assert!(matches!(err, Error::InvalidDescriptor(_)));
    assert!(store.executed().is_empty());
  }

  #[test]
  fn nothing_to_do_executes_nothing() {
    let mut table = observed("items", &["id", "name", "qty", "created_at"]);
    table.columns[2].default_sql = Some("0".into());
    table.columns[3].default_sql = Some("CURRENT_TIMESTAMP".into());
    let store = Recording::new(SQLITE_LIKE, vec![table]);
    let evolver = SchemaEvolver::new(&store);
    assert!(evolver.ensure_columns(&items()).unwrap().is_noop());
    assert_eq!(evolver.ensure_constraints(&items()).unwrap(), ConstraintReport::default());
    assert!(store.executed().is_empty());
  }

  #[test]
  fn missing_foreign_key_is_added_in_place_when_supported() {
    let store = Recording::new(SERVER_LIKE, vec![observed("properties", &[
      "property_code",
      "owner_code",
    ])]);
    let evolver = SchemaEvolver::new(&store);
    assert_eq!(evolver.strategy(), "additive");
    let report = evolver.ensure_constraints(&properties()).unwrap();
    assert_eq!(report.gaps, ["foreign key owner_code -> owners.owner_code"]);
    assert!(store.executed().contains(
      &"ALTER TABLE \"properties\" ADD CONSTRAINT \"fk_properties_owner_code\" FOREIGN KEY \
        (\"owner_code\") REFERENCES \"owners\"(\"owner_code\")"
        .into()
    ));
  }

  #[test]
  fn present_foreign_key_is_not_a_gap() {
    let mut table = observed("properties", &["property_code", "owner_code"]);
    table.foreign_keys.push(ObservedForeignKey {
      column:     "owner_code".into(),
      ref_table:  "owners".into(),
      ref_column: Some("owner_code".into()),
    });
    let store = Recording::new(SQLITE_LIKE, vec![table]);
    let report = SchemaEvolver::new(&store).ensure_constraints(&properties()).unwrap();
    assert!(report.outcome.is_none());
  }

  #[test]
  fn rebuild_runs_in_fixed_order_inside_one_transaction() {
    let store = Recording::new(SQLITE_LIKE, vec![observed("properties", &[
      "property_code",
      "owner_code",
    ])]);
    let desc = properties().index(IndexDef::new("properties_owner_idx", ["owner_code"]));
    let evolver = SchemaEvolver::with_migrator(&store, Box::new(RebuildMigrator));
    let report = evolver.ensure_constraints(&desc).unwrap();
    assert_eq!(report.outcome.map(|o| o.strategy), Some("rebuild"));

    let executed = store.executed();
    let kinds: Vec<&str> = executed
      .iter()
      .map(|s| s.split_whitespace().take(2).collect::<Vec<_>>().join(" "))
      .map(|s| match s.as_str() {
        "CREATE TABLE" => "create",
        "INSERT INTO" => "copy",
        "DROP TABLE" => "drop",
        "ALTER TABLE" => "rename",
        "CREATE INDEX" => "index",
        "BEGIN" => "begin",
        "COMMIT" => "commit",
        _ => "other",
      })
      .collect();
    assert_eq!(kinds, ["begin", "create", "copy", "drop", "rename", "index", "commit"]);
    assert_eq!(
      executed[2],
      "INSERT INTO \"properties_rebuild\" (\"property_code\", \"owner_code\") SELECT \
       \"property_code\", \"owner_code\" FROM \"properties\""
    );
  }

  #[test]
  fn rebuild_carries_undeclared_columns() {
    let store = Recording::new(SQLITE_LIKE, vec![observed("properties", &[
      "property_code",
      "owner_code",
      "legacy_note",
    ])]);
    let evolver = SchemaEvolver::with_migrator(&store, Box::new(RebuildMigrator));
    evolver.ensure_constraints(&properties()).unwrap();

    let executed = store.executed();
    assert!(executed[1].contains("\"legacy_note\" TEXT"));
    assert_eq!(
      executed[2],
      "INSERT INTO \"properties_rebuild\" (\"property_code\", \"owner_code\", \"legacy_note\") \
       SELECT \"property_code\", \"owner_code\", \"legacy_note\" FROM \"properties\""
    );
  }

  #[test]
  fn shadow_without_original_is_fatal() {
    let store = Recording::new(SQLITE_LIKE, vec![observed("properties_rebuild", &[
      "property_code",
    ])]);
    let err = SchemaEvolver::new(&store).run_all(&[owners(), properties()]).unwrap_err();
    assert!(err.is_fatal());
  }

  #[test]
  fn run_all_records_degraded_tables_and_continues() {
    // `items` lacks its primary key column, which cannot be added.
    let store = Recording::new(SQLITE_LIKE, vec![observed("items", &["name"])]);
    let report = SchemaEvolver::new(&store).run_all(&[items(), owners()]).unwrap();
    assert!(report.is_degraded());
    assert!(matches!(report.get("items"), Some(TableOutcome::Degraded(_))));
    assert!(matches!(report.get("owners"), Some(TableOutcome::Evolved { .. })));
  }
}
