//! Error type for `estate-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] estate_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("owner not found: {0}")]
  OwnerNotFound(String),

  #[error("property not found: {0}")]
  PropertyNotFound(String),

  #[error("owner {owner_code} still has {properties} properties")]
  OwnerHasProperties { owner_code: String, properties: u64 },
}

impl Error {
  /// The store could not be reached or failed mid-query, as opposed to a
  /// policy or schema problem.
  pub fn is_unavailable(&self) -> bool {
    match self {
      Self::Core(err) => err.is_store(),
      Self::Database(_) | Self::Sqlite(_) => true,
      _ => false,
    }
  }

  /// Schema evolution left the store needing an operator.
  pub fn is_fatal(&self) -> bool { matches!(self, Self::Core(err) if err.is_fatal()) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
