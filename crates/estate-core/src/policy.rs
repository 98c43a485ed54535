//! Code policies: the declarative rules a business code is minted under.
//!
//! Policies are plain values. The application builds them from its registry
//! or its configuration file and hands them to the minter explicitly.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Attempt budget used when a policy does not name one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

const fn default_max_attempts() -> u32 { DEFAULT_MAX_ATTEMPTS }

// ─── Segment ─────────────────────────────────────────────────────────────────

/// A run of `length` characters, each drawn uniformly from `alphabet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
  pub alphabet: String,
  pub length:   usize,
}

impl Segment {
  pub fn new(alphabet: impl Into<String>, length: usize) -> Self {
    Self { alphabet: alphabet.into(), length }
  }

  fn validate(&self, what: &str) -> Result<()> {
    if self.alphabet.is_empty() {
      return Err(Error::InvalidPolicy(format!("{what}: alphabet is empty")));
    }
    if self.length == 0 {
      return Err(Error::InvalidPolicy(format!("{what}: length must be at least 1")));
    }
    Ok(())
  }

  fn draw_into<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut String) {
    let chars: Vec<char> = self.alphabet.chars().collect();
    for _ in 0..self.length {
      out.push(chars[rng.random_range(0..chars.len())]);
    }
  }
}

/// Draw one candidate made of `segments` laid end to end.
pub fn draw<R: Rng + ?Sized>(segments: &[Segment], rng: &mut R) -> String {
  let mut out = String::with_capacity(segments.iter().map(|s| s.length).sum());
  for segment in segments {
    segment.draw_into(rng, &mut out);
  }
  out
}

// ─── Target ──────────────────────────────────────────────────────────────────

/// The column a code must be unique within.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeTarget {
  pub table:  String,
  pub column: String,
}

impl std::fmt::Display for CodeTarget {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}.{}", self.table, self.column)
  }
}

fn validate_target(target: &CodeTarget) -> Result<()> {
  if target.table.is_empty() || target.column.is_empty() {
    return Err(Error::InvalidPolicy("target table and column must be named".into()));
  }
  Ok(())
}

// ─── Simple codes ────────────────────────────────────────────────────────────

/// A fixed-length code drawn from a single alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePolicy {
  pub alphabet:     String,
  pub length:       usize,
  #[serde(flatten)]
  pub target:       CodeTarget,
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
}

impl CodePolicy {
  pub fn new(
    alphabet: impl Into<String>,
    length: usize,
    table: impl Into<String>,
    column: impl Into<String>,
  ) -> Self {
    Self {
      alphabet: alphabet.into(),
      length,
      target: CodeTarget { table: table.into(), column: column.into() },
      max_attempts: DEFAULT_MAX_ATTEMPTS,
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  pub fn segment(&self) -> Segment { Segment::new(self.alphabet.clone(), self.length) }

  pub fn validate(&self) -> Result<()> {
    self.segment().validate("code")?;
    validate_target(&self.target)?;
    if self.max_attempts == 0 {
      return Err(Error::InvalidPolicy("max_attempts must be at least 1".into()));
    }
    Ok(())
  }
}

// ─── Structured codes ────────────────────────────────────────────────────────

/// A code made of a prefix that must be unused as the start of any existing
/// code, followed by a suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredPolicy {
  pub prefix:       Vec<Segment>,
  pub suffix:       Vec<Segment>,
  #[serde(flatten)]
  pub target:       CodeTarget,
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
}

impl StructuredPolicy {
  pub fn new(
    prefix: Vec<Segment>,
    suffix: Vec<Segment>,
    table: impl Into<String>,
    column: impl Into<String>,
  ) -> Self {
    Self {
      prefix,
      suffix,
      target: CodeTarget { table: table.into(), column: column.into() },
      max_attempts: DEFAULT_MAX_ATTEMPTS,
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  pub fn prefix_len(&self) -> usize { self.prefix.iter().map(|s| s.length).sum() }

  pub fn code_len(&self) -> usize {
    self.prefix_len() + self.suffix.iter().map(|s| s.length).sum::<usize>()
  }

  pub fn validate(&self) -> Result<()> {
    if self.prefix.is_empty() || self.suffix.is_empty() {
      return Err(Error::InvalidPolicy(
        "structured codes need at least one prefix and one suffix segment".into(),
      ));
    }
    for segment in &self.prefix {
      segment.validate("prefix")?;
    }
    for segment in &self.suffix {
      segment.validate("suffix")?;
    }
    validate_target(&self.target)?;
    if self.max_attempts == 0 {
      return Err(Error::InvalidPolicy("max_attempts must be at least 1".into()));
    }
    Ok(())
  }
}
