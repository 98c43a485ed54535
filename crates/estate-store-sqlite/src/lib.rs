//! SQLite backend for the estate registry.
//!
//! Wraps [`tokio_rusqlite`] so the synchronous minting and evolution
//! algorithms run on the connection's own thread without blocking the async
//! runtime.

mod encode;
mod session;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use session::{SQLITE_CAPABILITIES, Session};
pub use store::SqliteStore;
