//! Configuration and report formatting for the `estate` binary.

pub mod config;
pub mod summary;

pub use config::EstateConfig;
