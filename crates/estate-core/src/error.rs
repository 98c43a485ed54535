//! Error types for `estate-core`.

use thiserror::Error;

use crate::{migrate::RebuildStage, mint::MintStage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid code policy: {0}")]
  InvalidPolicy(String),

  #[error("invalid table descriptor: {0}")]
  InvalidDescriptor(String),

  /// Every draw within the policy's attempt budget collided.
  #[error("no free {stage} for {target} after {attempts} attempts")]
  Exhausted {
    target:   String,
    stage:    MintStage,
    attempts: u32,
  },

  #[error("foreign keys form a cycle between tables: {}", .0.join(", "))]
  DependencyCycle(Vec<String>),

  /// A rebuild failed but the table is still usable, just not fully in its
  /// target shape. Up to `DropOriginal`, and at any stage inside a
  /// transaction, the original is untouched. At `Finalize` the rebuilt table
  /// already holds every row; only its indexes, sequence or orphan count are
  /// missing.
  #[error("rebuild of {table} aborted during {stage}: {source}")]
  RebuildAborted {
    table:  String,
    stage:  RebuildStage,
    #[source]
    source: BoxError,
  },

  /// The original table was dropped but the shadow table never took its
  /// name. Needs an operator; never retried automatically.
  #[error(
    "rebuild of {table} left the store inconsistent (shadow table {shadow} \
     holds the data): {source}"
  )]
  RebuildInconsistent {
    table:  String,
    shadow: String,
    #[source]
    source: BoxError,
  },

  #[error("copying {table} moved {copied} of {expected} rows")]
  RowCountMismatch {
    table:    String,
    expected: u64,
    copied:   u64,
  },

  #[error("store error: {0}")]
  Store(#[source] BoxError),
}

impl Error {
  pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(err))
  }

  /// Fatal errors stop startup; everything else leaves the store usable.
  pub fn is_fatal(&self) -> bool { matches!(self, Self::RebuildInconsistent { .. }) }

  pub fn is_store(&self) -> bool { matches!(self, Self::Store(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
