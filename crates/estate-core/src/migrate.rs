//! Migration planning and the two strategies that close a table's
//! structural gaps: in-place `ALTER TABLE` and full rebuild.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  schema::{
    ColumnDef, ColumnDefault, ForeignKey, IndexDef, ObservedColumn, ObservedTable,
    TableDescriptor, quote_ident,
  },
  store::{Capabilities, SchemaStore},
};

/// Name of the table a rebuild of `table` stages its rows in.
pub fn shadow_name(table: &str) -> String { format!("{table}_rebuild") }

// ─── Additive steps ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum AdditiveStep {
  /// `attach_default` is false when the store cannot take the column's
  /// default in the same statement.
  AddColumn { column: ColumnDef, attach_default: bool },
  Backfill { column: String, value: ColumnDefault },
  CreateIndex(IndexDef),
}

impl AdditiveStep {
  pub fn sql(&self, table: &str) -> String {
    let table_ident = quote_ident(table);
    match self {
      Self::AddColumn { column, attach_default: true } => {
        format!("ALTER TABLE {table_ident} ADD COLUMN {}", column.definition_sql())
      }
      Self::AddColumn { column, attach_default: false } => format!(
        "ALTER TABLE {table_ident} ADD COLUMN {} {}",
        quote_ident(&column.name),
        column.sql_type
      ),
      Self::Backfill { column, value } => {
        let column = quote_ident(column);
        format!("UPDATE {table_ident} SET {column} = {} WHERE {column} IS NULL", value.to_sql())
      }
      Self::CreateIndex(index) => index.create_sql(table),
    }
  }
}

/// What `EnsureColumns` will do to one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnPlan {
  pub steps:             Vec<AdditiveStep>,
  /// Columns whose default could not be attached by `ADD COLUMN`.
  pub deferred_defaults: Vec<String>,
}

pub fn plan_columns(
  desc: &TableDescriptor,
  observed: &ObservedTable,
  caps: Capabilities,
) -> Result<ColumnPlan> {
  let mut plan = ColumnPlan::default();

  for column in desc.columns.iter().filter(|c| !observed.has_column(&c.name)) {
    if column.primary_key {
      return Err(Error::InvalidDescriptor(format!(
        "{}: primary key column {} cannot be added to an existing table",
        desc.name, column.name
      )));
    }
    match &column.default {
      None if column.not_null => {
        return Err(Error::InvalidDescriptor(format!(
          "{}: NOT NULL column {} needs a default to be added to an existing table",
          desc.name, column.name
        )));
      }
      Some(default) if !default.is_constant() && !caps.non_constant_column_defaults => {
        plan
          .steps
          .push(AdditiveStep::AddColumn { column: column.clone(), attach_default: false });
        plan
          .steps
          .push(AdditiveStep::Backfill { column: column.name.clone(), value: default.clone() });
        plan.deferred_defaults.push(column.name.clone());
      }
      _ => {
        plan.steps.push(AdditiveStep::AddColumn { column: column.clone(), attach_default: true });
      }
    }
  }

  plan.steps.extend(
    desc
      .indexes
      .iter()
      .filter(|i| !observed.has_index(&i.name))
      .cloned()
      .map(AdditiveStep::CreateIndex),
  );

  Ok(plan)
}

// ─── Structural gaps ─────────────────────────────────────────────────────────

/// A difference between declared and live shape that adding columns cannot
/// fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gap {
  MissingForeignKey(ForeignKey),
  /// The column exists but carries no default.
  MissingDefault(String),
}

impl fmt::Display for Gap {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::MissingForeignKey(fk) => {
        write!(f, "foreign key {} -> {}.{}", fk.column, fk.ref_table, fk.ref_column)
      }
      Self::MissingDefault(column) => write!(f, "default on {column}"),
    }
  }
}

pub fn structural_gaps(desc: &TableDescriptor, observed: &ObservedTable) -> Vec<Gap> {
  let missing_fks = desc
    .foreign_keys
    .iter()
    .filter(|fk| !observed.has_foreign_key(fk))
    .cloned()
    .map(Gap::MissingForeignKey);

  let missing_defaults = desc
    .columns
    .iter()
    .filter(|c| c.default.is_some())
    .filter(|c| observed.find_column(&c.name).is_some_and(|o| o.default_sql.is_none()))
    .map(|c| Gap::MissingDefault(c.name.clone()));

  missing_fks.chain(missing_defaults).collect()
}

// ─── Strategies ──────────────────────────────────────────────────────────────

/// What a strategy did while closing gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
  pub strategy:      &'static str,
  /// Rows whose foreign keys point at nothing once the new constraints are
  /// in place. They are kept, never deleted.
  pub orphaned_rows: u64,
}

/// Brings a live table's constraints and defaults in line with its
/// descriptor.
pub trait Migrator<S: SchemaStore> {
  fn name(&self) -> &'static str;

  fn close_gaps(
    &self,
    store: &S,
    desc: &TableDescriptor,
    observed: &ObservedTable,
    gaps: &[Gap],
  ) -> Result<MigrationOutcome>;
}

/// Pick the strategy a store's capabilities allow.
pub fn migrator_for<'s, S: SchemaStore + 's>(caps: Capabilities) -> Box<dyn Migrator<S> + 's> {
  if caps.alter_constraints {
    Box::new(AdditiveMigrator)
  } else {
    Box::new(RebuildMigrator)
  }
}

/// Closes gaps with `ALTER TABLE ... ADD CONSTRAINT` and
/// `ALTER COLUMN ... SET DEFAULT`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdditiveMigrator;

impl AdditiveMigrator {
  pub fn gap_sql(table: &str, gap: &Gap, desc: &TableDescriptor) -> Result<String> {
    let table_ident = quote_ident(table);
    match gap {
      Gap::MissingForeignKey(fk) => Ok(format!(
        "ALTER TABLE {table_ident} ADD CONSTRAINT {} {}",
        quote_ident(&fk.constraint_name(table)),
        fk.clause_sql()
      )),
      Gap::MissingDefault(column) => {
        let default = desc
          .find_column(column)
          .and_then(|c| c.default.as_ref())
          .ok_or_else(|| Error::InvalidDescriptor(format!("{table}: no default for {column}")))?;
        Ok(format!(
          "ALTER TABLE {table_ident} ALTER COLUMN {} SET DEFAULT {}",
          quote_ident(column),
          default.to_sql()
        ))
      }
    }
  }
}

impl<S: SchemaStore> Migrator<S> for AdditiveMigrator {
  fn name(&self) -> &'static str { "additive" }

  fn close_gaps(
    &self,
    store: &S,
    desc: &TableDescriptor,
    _observed: &ObservedTable,
    gaps: &[Gap],
  ) -> Result<MigrationOutcome> {
    let statements = gaps
      .iter()
      .map(|gap| Self::gap_sql(&desc.name, gap, desc))
      .collect::<Result<Vec<_>>>()?;

    in_transaction(store, |store| {
      for sql in &statements {
        store.execute(sql).map_err(Error::store)?;
      }
      Ok(())
    })?;

    for gap in gaps {
      tracing::info!(table = %desc.name, %gap, "altered in place");
    }
    Ok(MigrationOutcome { strategy: "additive", orphaned_rows: 0 })
  }
}

/// Closes gaps by recreating the table in its full target shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct RebuildMigrator;

impl<S: SchemaStore> Migrator<S> for RebuildMigrator {
  fn name(&self) -> &'static str { "rebuild" }

  fn close_gaps(
    &self,
    store: &S,
    desc: &TableDescriptor,
    observed: &ObservedTable,
    gaps: &[Gap],
  ) -> Result<MigrationOutcome> {
    for gap in gaps {
      tracing::info!(table = %desc.name, %gap, "rebuilding to add");
    }
    let orphaned_rows = rebuild(store, desc, observed)?;
    Ok(MigrationOutcome { strategy: "rebuild", orphaned_rows })
  }
}

/// Run `body` inside a transaction when the store's DDL is transactional.
pub(crate) fn in_transaction<S, T>(store: &S, body: impl FnOnce(&S) -> Result<T>) -> Result<T>
where
  S: SchemaStore,
{
  if !store.capabilities().transactional_ddl {
    return body(store);
  }
  store.begin().map_err(Error::store)?;
  match body(store) {
    Ok(value) => {
      store.commit().map_err(Error::store)?;
      Ok(value)
    }
    Err(err) => {
      if let Err(rollback_err) = store.rollback() {
        tracing::error!(error = %rollback_err, "rollback failed");
      }
      Err(err)
    }
  }
}

// ─── Rebuild ─────────────────────────────────────────────────────────────────

/// Where a rebuild was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStage {
  CreateShadow,
  CopyRows,
  DropOriginal,
  RenameShadow,
  Finalize,
  Commit,
}

impl fmt::Display for RebuildStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::CreateShadow => "create shadow",
      Self::CopyRows => "copy rows",
      Self::DropOriginal => "drop original",
      Self::RenameShadow => "rename shadow",
      Self::Finalize => "finalize",
      Self::Commit => "commit",
    })
  }
}

/// Recreate `desc.name` in its full target shape, keeping every row.
///
/// Order is fixed: create shadow, copy rows by explicit column list, verify
/// the row count, drop original, rename shadow, restore the `AUTOINCREMENT`
/// sequence, recreate indexes. Live columns the descriptor does not declare
/// are kept after the declared ones. Stores with transactional DDL run it as
/// one transaction. Elsewhere a failure before the drop removes the shadow
/// and leaves the original as it was, a failure between drop and rename is
/// fatal, and a failure after the rename leaves the rebuilt table in place.
///
/// Returns the number of rows left violating the new foreign keys.
pub fn rebuild<S: SchemaStore>(
  store: &S,
  desc: &TableDescriptor,
  observed: &ObservedTable,
) -> Result<u64> {
  let copied: Vec<&ColumnDef> =
    desc.columns.iter().filter(|c| observed.has_column(&c.name)).collect();
  if copied.is_empty() {
    return Err(Error::InvalidDescriptor(format!(
      "{}: shares no columns with the live table",
      desc.name
    )));
  }

  let kept = observed.undeclared_columns(desc);
  for column in &kept {
    tracing::info!(table = %desc.name, column = %column.name, "keeping undeclared column");
  }

  let job = RebuildJob { store, desc, shadow: shadow_name(&desc.name), copied, kept };
  let foreign_keys_were_on = store.suspend_foreign_keys().map_err(Error::store)?;

  let result = if store.capabilities().transactional_ddl {
    job.run_transactional()
  } else {
    job.run_ordered()
  };

  match (result, store.restore_foreign_keys(foreign_keys_were_on)) {
    (Ok(orphans), Ok(())) => Ok(orphans),
    (Ok(_), Err(err)) => Err(Error::store(err)),
    (Err(err), restored) => {
      if let Err(restore_err) = restored {
        tracing::error!(table = %desc.name, error = %restore_err, "could not re-enable foreign keys");
      }
      Err(err)
    }
  }
}

struct RebuildJob<'a, S> {
  store:  &'a S,
  desc:   &'a TableDescriptor,
  shadow: String,
  copied: Vec<&'a ColumnDef>,
  kept:   Vec<&'a ObservedColumn>,
}

impl<S: SchemaStore> RebuildJob<'_, S> {
  fn copy_sql(&self) -> String {
    let kept = self.kept.iter().map(|c| quote_ident(&c.name));
    let names: Vec<String> =
      self.copied.iter().map(|c| quote_ident(&c.name)).chain(kept.clone()).collect();
    let values: Vec<String> = self
      .copied
      .iter()
      .map(|c| match &c.default {
        Some(default) if c.not_null => {
          format!("COALESCE({}, {})", quote_ident(&c.name), default.to_sql())
        }
        _ => quote_ident(&c.name),
      })
      .chain(kept)
      .collect();
    format!(
      "INSERT INTO {} ({}) SELECT {} FROM {}",
      quote_ident(&self.shadow),
      names.join(", "),
      values.join(", "),
      quote_ident(&self.desc.name),
    )
  }

  fn exec(&self, sql: &str) -> Result<()> { self.store.execute(sql).map_err(Error::store) }

  /// Runs every stage, recording the current one in `stage`.
  fn stages(&self, stage: &mut RebuildStage) -> Result<u64> {
    let table = &self.desc.name;

    *stage = RebuildStage::CreateShadow;
    self.exec(&self.desc.create_sql_keeping(&self.shadow, &self.kept))?;

    *stage = RebuildStage::CopyRows;
    self.exec(&self.copy_sql())?;
    let expected = self.store.row_count(table).map_err(Error::store)?;
    let copied = self.store.row_count(&self.shadow).map_err(Error::store)?;
    if expected != copied {
      return Err(Error::RowCountMismatch { table: table.clone(), expected, copied });
    }
    // Dropping the original takes its sequence row with it.
    let sequence = if self.desc.columns.iter().any(|c| c.autoincrement) {
      self.store.sequence_value(table).map_err(Error::store)?
    } else {
      None
    };

    *stage = RebuildStage::DropOriginal;
    self.exec(&format!("DROP TABLE {}", quote_ident(table)))?;

    *stage = RebuildStage::RenameShadow;
    self.exec(&format!(
      "ALTER TABLE {} RENAME TO {}",
      quote_ident(&self.shadow),
      quote_ident(table)
    ))?;

    *stage = RebuildStage::Finalize;
    if let Some(seq) = sequence {
      self.store.restore_sequence_value(table, seq).map_err(Error::store)?;
    }
    for index in &self.desc.indexes {
      self.exec(&index.create_sql(table))?;
    }
    let orphans = self.store.foreign_key_violations(table).map_err(Error::store)?;
    if orphans > 0 {
      tracing::warn!(%table, orphans, "rows reference missing parents after rebuild");
    }
    tracing::info!(%table, rows = copied, "rebuilt table");
    Ok(orphans)
  }

  fn aborted(&self, stage: RebuildStage, err: Error) -> Error {
    Error::RebuildAborted { table: self.desc.name.clone(), stage, source: Box::new(err) }
  }

  fn run_transactional(&self) -> Result<u64> {
    self.store.begin().map_err(Error::store)?;
    let mut stage = RebuildStage::CreateShadow;
    match self.stages(&mut stage) {
      Ok(orphans) => match self.store.commit() {
        Ok(()) => Ok(orphans),
        Err(err) => {
          self.rollback();
          Err(self.aborted(RebuildStage::Commit, Error::store(err)))
        }
      },
      Err(err) => {
        self.rollback();
        Err(self.aborted(stage, err))
      }
    }
  }

  fn rollback(&self) {
    if let Err(err) = self.store.rollback() {
      tracing::error!(table = %self.desc.name, error = %err, "rollback failed");
    }
  }

  fn run_ordered(&self) -> Result<u64> {
    let mut stage = RebuildStage::CreateShadow;
    let err = match self.stages(&mut stage) {
      Ok(orphans) => return Ok(orphans),
      Err(err) => err,
    };
    match stage {
      RebuildStage::CreateShadow | RebuildStage::CopyRows | RebuildStage::DropOriginal => {
        if let Err(drop_err) =
          self.exec(&format!("DROP TABLE IF EXISTS {}", quote_ident(&self.shadow)))
        {
          tracing::warn!(shadow = %self.shadow, error = %drop_err, "could not remove shadow table");
        }
        Err(self.aborted(stage, err))
      }
      RebuildStage::RenameShadow => Err(Error::RebuildInconsistent {
        table:  self.desc.name.clone(),
        shadow: self.shadow.clone(),
        source: Box::new(err),
      }),
      RebuildStage::Finalize | RebuildStage::Commit => Err(self.aborted(stage, err)),
    }
  }
}

/// Deal with a shadow table left behind by an interrupted rebuild.
///
/// With the original still present the shadow is stale and dropped. With the
/// original gone the data only lives in the shadow, which needs an operator.
pub fn recover_leftover_shadow<S: SchemaStore>(store: &S, table: &str) -> Result<()> {
  let shadow = shadow_name(table);
  if store.observe_table(&shadow).map_err(Error::store)?.is_none() {
    return Ok(());
  }
  if store.observe_table(table).map_err(Error::store)?.is_none() {
    return Err(Error::RebuildInconsistent {
      table:  table.to_owned(),
      source: format!("found {shadow} but no {table}").into(),
      shadow,
    });
  }
  tracing::warn!(%table, %shadow, "dropping stale shadow table from an earlier rebuild");
  store
    .execute(&format!("DROP TABLE {}", quote_ident(&shadow)))
    .map_err(Error::store)
}
