//! Runtime configuration, layered from a TOML file and `ESTATE_`-prefixed
//! environment variables.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
};

use estate_core::registry::PolicySet;
use serde::{Deserialize, Serialize};

/// Prefix for environment overrides, e.g. `ESTATE_STORE_PATH`.
pub const ENV_PREFIX: &str = "ESTATE";

fn default_store_path() -> PathBuf { PathBuf::from("estate.db") }

/// Runtime configuration, deserialised from `estate.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstateConfig {
  #[serde(default = "default_store_path")]
  pub store_path: PathBuf,
  #[serde(default)]
  pub policies:   PolicySet,
}

impl Default for EstateConfig {
  fn default() -> Self { Self { store_path: default_store_path(), policies: PolicySet::default() } }
}

impl EstateConfig {
  /// Read `path` if it exists, then apply the process environment.
  pub fn load(path: &Path) -> Result<Self, config::ConfigError> { Self::load_with_env(path, None) }

  /// As [`load`](Self::load), reading overrides from `env` instead of the
  /// process environment when given.
  pub fn load_with_env(
    path: &Path,
    env: Option<HashMap<String, String>>,
  ) -> Result<Self, config::ConfigError> {
    let mut cfg: Self = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix(ENV_PREFIX)
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true)
          .source(env),
      )
      .build()?
      .try_deserialize()?;
    cfg.store_path = expand_tilde(&cfg.store_path);
    Ok(cfg)
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
