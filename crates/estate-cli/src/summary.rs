//! Flattened, serialisable view of an [`EvolutionReport`].

use estate_core::evolve::{EvolutionReport, TableOutcome};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
  Evolved,
  Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
  pub table:           String,
  pub status:          TableStatus,
  pub created:         bool,
  pub added:           Vec<String>,
  pub backfilled:      Vec<String>,
  pub indexes_created: Vec<String>,
  pub gaps:            Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub strategy:        Option<&'static str>,
  pub orphaned_rows:   u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error:           Option<String>,
}

impl TableSummary {
  fn degraded(table: &str, error: String) -> Self {
    Self {
      table:           table.to_owned(),
      status:          TableStatus::Degraded,
      created:         false,
      added:           vec![],
      backfilled:      vec![],
      indexes_created: vec![],
      gaps:            vec![],
      strategy:        None,
      orphaned_rows:   0,
      error:           Some(error),
    }
  }

  /// One line per table for terminal output.
  pub fn line(&self) -> String {
    if let Some(error) = &self.error {
      return format!("{:<20} degraded: {error}", self.table);
    }
    let mut changes = Vec::new();
    if self.created {
      changes.push("created".to_owned());
    }
    if !self.added.is_empty() {
      changes.push(format!("added {}", self.added.join(", ")));
    }
    if !self.backfilled.is_empty() {
      changes.push(format!("backfilled {}", self.backfilled.join(", ")));
    }
    if !self.indexes_created.is_empty() {
      changes.push(format!("indexed {}", self.indexes_created.join(", ")));
    }
    if !self.gaps.is_empty() {
      changes.push(format!("closed {}", self.gaps.join("; ")));
    }
    if let Some(strategy) = self.strategy {
      changes.push(format!("via {strategy}"));
    }
    if self.orphaned_rows > 0 {
      changes.push(format!("{} orphaned rows kept", self.orphaned_rows));
    }
    if changes.is_empty() {
      changes.push("up to date".to_owned());
    }
    format!("{:<20} {}", self.table, changes.join(", "))
  }
}

pub fn summarize(report: &EvolutionReport) -> Vec<TableSummary> {
  report
    .tables
    .iter()
    .map(|t| match &t.outcome {
      TableOutcome::Degraded(err) => TableSummary::degraded(&t.table, err.to_string()),
      TableOutcome::Evolved { columns, constraints } => {
        let outcomes = [columns.defaults.as_ref(), constraints.outcome.as_ref()];
        TableSummary {
          table:           t.table.clone(),
          status:          TableStatus::Evolved,
          created:         columns.created,
          added:           columns.added.clone(),
          backfilled:      columns.backfilled.clone(),
          indexes_created: columns.indexes_created.clone(),
          gaps:            constraints.gaps.clone(),
          strategy:        outcomes.iter().flatten().map(|o| o.strategy).last(),
          orphaned_rows:   outcomes.iter().flatten().map(|o| o.orphaned_rows).sum(),
          error:           None,
        }
      }
    })
    .collect()
}
