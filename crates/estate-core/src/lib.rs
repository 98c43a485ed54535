//! Core types and algorithms for the estate registry: minting business codes
//! and evolving the schema they are stored in.
//!
//! This crate has no database dependency. Stores are reached through the
//! synchronous traits in [`store`]; `estate-store-sqlite` implements them.

pub mod error;
pub mod evolve;
pub mod migrate;
pub mod mint;
pub mod policy;
pub mod registry;
pub mod schema;
pub mod store;

pub use error::{Error, Result};
