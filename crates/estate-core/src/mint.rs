//! Minting collision-free business codes.
//!
//! Two strategies are offered. The `mint_*` functions pre-check a candidate
//! against the store and return it; the caller inserts later and owns the
//! small race between the check and its insert. The `claim_*` functions hand
//! each candidate straight to the caller's insert and treat a key violation
//! as the collision signal, which closes that race.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  policy::{CodePolicy, CodeTarget, StructuredPolicy, draw},
  store::CodeIndex,
};

/// Which loop ran out of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MintStage {
  Code,
  Prefix,
  Suffix,
}

impl std::fmt::Display for MintStage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Self::Code => "code",
      Self::Prefix => "prefix",
      Self::Suffix => "suffix",
    })
  }
}

/// A code handed out by a path that may have skipped the uniqueness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "lowercase")]
pub enum Minted {
  /// Checked against the store at generation time.
  Verified(String),
  /// Built by [`fallback_token`] after the store failed; never checked.
  Fallback(String),
}

impl Minted {
  pub fn code(&self) -> &str {
    match self {
      Self::Verified(code) | Self::Fallback(code) => code,
    }
  }

  pub fn into_code(self) -> String {
    match self {
      Self::Verified(code) | Self::Fallback(code) => code,
    }
  }

  pub fn is_verified(&self) -> bool { matches!(self, Self::Verified(_)) }
}

fn exhausted(target: &CodeTarget, stage: MintStage, attempts: u32) -> Error {
  Error::Exhausted { target: target.to_string(), stage, attempts }
}

/// Redraw until `is_taken` reports a free candidate or the budget runs out.
fn draw_until_free<R, F>(
  target: &CodeTarget,
  stage: MintStage,
  max_attempts: u32,
  rng: &mut R,
  mut candidate: impl FnMut(&mut R) -> String,
  mut is_taken: F,
) -> Result<String>
where
  R: Rng + ?Sized,
  F: FnMut(&str) -> Result<bool>,
{
  for attempt in 1..=max_attempts {
    let code = candidate(rng);
    if !is_taken(&code)? {
      return Ok(code);
    }
    tracing::debug!(code_target = %target, %stage, attempt, %code, "candidate collided");
  }
  Err(exhausted(target, stage, max_attempts))
}

// ─── Pre-checked minting ─────────────────────────────────────────────────────

/// Draw `policy.length` characters from `policy.alphabet` until the result
/// does not exist in the target column.
pub fn mint_simple_code<I, R>(index: &I, policy: &CodePolicy, rng: &mut R) -> Result<String>
where
  I: CodeIndex,
  R: Rng + ?Sized,
{
  policy.validate()?;
  let segments = [policy.segment()];
  draw_until_free(
    &policy.target,
    MintStage::Code,
    policy.max_attempts,
    rng,
    |rng| draw(&segments, rng),
    |code| index.code_exists(&policy.target, code).map_err(Error::store),
  )
}

/// Draw prefixes until one is not the start of any existing code.
pub fn lock_prefix<I, R>(index: &I, policy: &StructuredPolicy, rng: &mut R) -> Result<String>
where
  I: CodeIndex,
  R: Rng + ?Sized,
{
  policy.validate()?;
  draw_until_free(
    &policy.target,
    MintStage::Prefix,
    policy.max_attempts,
    rng,
    |rng| draw(&policy.prefix, rng),
    |prefix| index.prefix_in_use(&policy.target, prefix).map_err(Error::store),
  )
}

/// Lock an unused prefix, then draw suffixes until the composed code is
/// absent from the target column.
pub fn mint_structured_code<I, R>(
  index: &I,
  policy: &StructuredPolicy,
  rng: &mut R,
) -> Result<String>
where
  I: CodeIndex,
  R: Rng + ?Sized,
{
  let prefix = lock_prefix(index, policy, rng)?;
  draw_until_free(
    &policy.target,
    MintStage::Suffix,
    policy.max_attempts,
    rng,
    |rng| format!("{prefix}{}", draw(&policy.suffix, rng)),
    |code| index.code_exists(&policy.target, code).map_err(Error::store),
  )
}

/// An unchecked token built from `tag`, today's UTC date and a short random
/// suffix, for when the store cannot be consulted at all.
pub fn fallback_token(tag: &str) -> String {
  let random = Uuid::new_v4().simple().to_string();
  format!("{tag}{}{}", Utc::now().format("%Y%m%d"), random[..6].to_uppercase())
}

/// Mint a simple code, or hand out an unchecked [`fallback_token`] when the
/// store itself failed. Exhaustion and invalid policies are still errors.
pub fn mint_simple_code_or_fallback<I, R>(
  index: &I,
  policy: &CodePolicy,
  rng: &mut R,
  tag: &str,
) -> Result<Minted>
where
  I: CodeIndex,
  R: Rng + ?Sized,
{
  match mint_simple_code(index, policy, rng) {
    Ok(code) => Ok(Minted::Verified(code)),
    Err(err) if err.is_store() => {
      let token = fallback_token(tag);
      tracing::warn!(code_target = %policy.target, error = %err, %token, "store unavailable, using fallback token");
      Ok(Minted::Fallback(token))
    }
    Err(err) => Err(err),
  }
}

// ─── Insert-time claiming ────────────────────────────────────────────────────

/// Offer candidates to `insert` until one is accepted.
///
/// `insert` returns `Ok(None)` when the store rejected the candidate because
/// the key is taken; any `Err` is a real failure and stops the loop.
fn claim<R, T, E, F>(
  target: &CodeTarget,
  stage: MintStage,
  max_attempts: u32,
  rng: &mut R,
  mut candidate: impl FnMut(&mut R) -> String,
  mut insert: F,
) -> Result<(String, T)>
where
  R: Rng + ?Sized,
  E: std::error::Error + Send + Sync + 'static,
  F: FnMut(&str) -> Result<Option<T>, E>,
{
  for attempt in 1..=max_attempts {
    let code = candidate(rng);
    match insert(&code).map_err(Error::store)? {
      Some(row) => return Ok((code, row)),
      None => {
        tracing::debug!(code_target = %target, %stage, attempt, %code, "insert hit an existing key");
      }
    }
  }
  Err(exhausted(target, stage, max_attempts))
}

/// Insert a row keyed by a fresh simple code, redrawing on key collisions.
pub fn claim_simple_code<R, T, E, F>(
  policy: &CodePolicy,
  rng: &mut R,
  insert: F,
) -> Result<(String, T)>
where
  R: Rng + ?Sized,
  E: std::error::Error + Send + Sync + 'static,
  F: FnMut(&str) -> Result<Option<T>, E>,
{
  policy.validate()?;
  let segments = [policy.segment()];
  claim(
    &policy.target,
    MintStage::Code,
    policy.max_attempts,
    rng,
    |rng| draw(&segments, rng),
    insert,
  )
}

/// Insert a row keyed by a fresh structured code.
///
/// The prefix rule cannot be expressed as a key constraint, so the prefix is
/// still locked by lookup; suffixes are then claimed at insert time.
pub fn claim_structured_code<I, R, T, E, F>(
  index: &I,
  policy: &StructuredPolicy,
  rng: &mut R,
  insert: F,
) -> Result<(String, T)>
where
  I: CodeIndex,
  R: Rng + ?Sized,
  E: std::error::Error + Send + Sync + 'static,
  F: FnMut(&str) -> Result<Option<T>, E>,
{
  let prefix = lock_prefix(index, policy, rng)?;
  claim(
    &policy.target,
    MintStage::Suffix,
    policy.max_attempts,
    rng,
    |rng| format!("{prefix}{}", draw(&policy.suffix, rng)),
    insert,
  )
}
