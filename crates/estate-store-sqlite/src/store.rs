//! [`SqliteStore`]: the registry on a single SQLite file.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension as _};

use estate_core::{
  evolve::{ColumnReport, ConstraintReport, EvolutionReport, SchemaEvolver},
  mint::{self, Minted},
  policy::{CodePolicy, StructuredPolicy},
  registry::{self, NewOwner, NewProperty, Owner, PolicySet, Property},
  schema::TableDescriptor,
  store::CodeIndex as _,
};

use crate::{
  Error, Result,
  encode::{OWNER_COLUMNS, PROPERTY_COLUMNS, RawOwner, RawProperty},
  session::{Session, is_key_conflict},
};

/// Tag on owner codes handed out while the store is unavailable.
pub const OWNER_FALLBACK_TAG: &str = "OWN";

// ─── Store ───────────────────────────────────────────────────────────────────

/// The estate registry backed by a single SQLite file.
///
/// Cloning is cheap: the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
  policies:        PolicySet,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and evolve the registry tables.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let store = Self::connect(path).await?;
    store.evolve_registry().await?;
    Ok(store)
  }

  /// Open an in-memory store with evolved registry tables.
  pub async fn open_in_memory() -> Result<Self> {
    let store = Self::connect_in_memory().await?;
    store.evolve_registry().await?;
    Ok(store)
  }

  /// Open (or create) a store at `path` without touching its schema.
  pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  pub async fn connect_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch("PRAGMA journal_mode = WAL;\nPRAGMA foreign_keys = ON;")?;
        Ok(())
      })
      .await?;
    Ok(Self { conn, policies: PolicySet::default() })
  }

  /// Replace the code policies this store mints under.
  pub fn with_policies(mut self, policies: PolicySet) -> Result<Self> {
    policies.validate()?;
    self.policies = policies;
    Ok(self)
  }

  /// Run `f` on the connection's thread with a [`Session`] over it.
  async fn with_session<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(Session<'_>) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    self.conn.call(move |conn| Ok(f(Session::new(conn)))).await?
  }

  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    self.conn.call(move |conn| Ok(f(conn))).await?
  }

  // ── Schema ────────────────────────────────────────────────────────────────

  async fn evolve_registry(&self) -> Result<EvolutionReport> {
    let report = self.evolve(registry::tables()).await?;
    for (table, err) in report.degraded() {
      tracing::warn!(%table, error = %err, "registry table is not in its target shape");
    }
    Ok(report)
  }

  /// Evolve `tables`, referenced tables first. Degraded tables are reported;
  /// a fatal error is returned.
  pub async fn evolve(&self, tables: Vec<TableDescriptor>) -> Result<EvolutionReport> {
    self
      .with_session(move |session| Ok(SchemaEvolver::new(&session).run_all(&tables)?))
      .await
  }

  pub async fn ensure_columns(&self, table: TableDescriptor) -> Result<ColumnReport> {
    self
      .with_session(move |session| Ok(SchemaEvolver::new(&session).ensure_columns(&table)?))
      .await
  }

  pub async fn ensure_constraints(&self, table: TableDescriptor) -> Result<ConstraintReport> {
    self
      .with_session(move |session| Ok(SchemaEvolver::new(&session).ensure_constraints(&table)?))
      .await
  }

  // ── Minting ───────────────────────────────────────────────────────────────

  /// A code unused in the policy's column at the time of the call.
  pub async fn mint_simple_code(&self, policy: CodePolicy) -> Result<String> {
    self
      .with_session(move |session| {
        Ok(mint::mint_simple_code(&session, &policy, &mut rand::rng())?)
      })
      .await
  }

  pub async fn mint_structured_code(&self, policy: StructuredPolicy) -> Result<String> {
    self
      .with_session(move |session| {
        Ok(mint::mint_structured_code(&session, &policy, &mut rand::rng())?)
      })
      .await
  }

  pub async fn mint_owner_code(&self) -> Result<String> {
    self.mint_simple_code(self.policies.owner.clone()).await
  }

  pub async fn mint_property_code(&self) -> Result<String> {
    self.mint_structured_code(self.policies.property.clone()).await
  }

  /// An owner code, or an unchecked fallback token when the store cannot be
  /// reached.
  pub async fn mint_owner_code_or_fallback(&self) -> Result<Minted> {
    let policy = self.policies.owner.clone();
    let minted = self
      .with_session(move |session| {
        Ok(mint::mint_simple_code_or_fallback(
          &session,
          &policy,
          &mut rand::rng(),
          OWNER_FALLBACK_TAG,
        )?)
      })
      .await;

    match minted {
      Err(err) if err.is_unavailable() => {
        let token = mint::fallback_token(OWNER_FALLBACK_TAG);
        tracing::warn!(error = %err, %token, "connection unavailable, using fallback owner code");
        Ok(Minted::Fallback(token))
      }
      other => other,
    }
  }

  // ── Owners ────────────────────────────────────────────────────────────────

  /// Insert an owner under a freshly claimed code.
  pub async fn add_owner(&self, owner: NewOwner) -> Result<Owner> {
    let policy = self.policies.owner.clone();
    let raw = self
      .with_conn(move |conn| {
        let conn: &Connection = conn;
        let (code, ()) = mint::claim_simple_code(&policy, &mut rand::rng(), |code| {
          conflict_as_none(conn.execute(
            "INSERT INTO owners (owner_code, name, phone, note) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![code, owner.name, owner.phone, owner.note],
          ))
        })?;
        select_owner(conn, &code)?.ok_or(Error::OwnerNotFound(code))
      })
      .await?;
    let owner = raw.into_owner()?;
    tracing::info!(owner_code = %owner.owner_code, "added owner");
    Ok(owner)
  }

  pub async fn get_owner(&self, owner_code: &str) -> Result<Option<Owner>> {
    let code = owner_code.to_owned();
    self
      .with_conn(move |conn| select_owner(conn, &code))
      .await?
      .map(RawOwner::into_owner)
      .transpose()
  }

  /// Delete an owner with no properties. Returns whether a row was removed.
  pub async fn delete_owner(&self, owner_code: &str) -> Result<bool> {
    let code = owner_code.to_owned();
    let deleted = self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        let properties: i64 = tx.query_row(
          "SELECT COUNT(*) FROM properties WHERE owner_code = ?1",
          [&code],
          |r| r.get(0),
        )?;
        if properties > 0 {
          return Err(Error::OwnerHasProperties {
            owner_code: code,
            properties: properties.unsigned_abs(),
          });
        }
        let deleted = tx.execute("DELETE FROM owners WHERE owner_code = ?1", [&code])?;
        tx.commit()?;
        Ok(deleted > 0)
      })
      .await?;
    if deleted {
      tracing::info!(%owner_code, "deleted owner");
    }
    Ok(deleted)
  }

  // ── Properties ────────────────────────────────────────────────────────────

  /// Insert a property under a freshly claimed structured code.
  pub async fn add_property(&self, property: NewProperty) -> Result<Property> {
    let policy = self.policies.property.clone();
    let raw = self
      .with_conn(move |conn| {
        let conn: &Connection = conn;
        if let Some(owner_code) = &property.owner_code {
          if select_owner(conn, owner_code)?.is_none() {
            return Err(Error::OwnerNotFound(owner_code.clone()));
          }
        }
        let session = Session::new(conn);
        let (code, ()) =
          mint::claim_structured_code(&session, &policy, &mut rand::rng(), |code| {
            conflict_as_none(conn.execute(
              "INSERT INTO properties (
                 property_code, owner_code, property_type, offer_type, province_code,
                 region_code, address, area, bedrooms, bathrooms, description
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
              rusqlite::params![
                code,
                property.owner_code,
                property.property_type,
                property.offer_type,
                property.province_code,
                property.region_code,
                property.address,
                property.area,
                property.bedrooms,
                property.bathrooms,
                property.description,
              ],
            ))
          })?;
        select_property(conn, &code)?.ok_or(Error::PropertyNotFound(code))
      })
      .await?;
    let property = raw.into_property()?;
    tracing::info!(property_code = %property.property_code, "added property");
    Ok(property)
  }

  pub async fn get_property(&self, property_code: &str) -> Result<Option<Property>> {
    let code = property_code.to_owned();
    self
      .with_conn(move |conn| select_property(conn, &code))
      .await?
      .map(RawProperty::into_property)
      .transpose()
  }

  /// Delete a property and its photo records. Returns whether the property
  /// existed. Its code prefix becomes free for new properties.
  pub async fn delete_property(&self, property_code: &str) -> Result<bool> {
    let code = property_code.to_owned();
    let deleted = self
      .with_conn(move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM property_photos WHERE property_code = ?1", [&code])?;
        let deleted = tx.execute("DELETE FROM properties WHERE property_code = ?1", [&code])?;
        tx.commit()?;
        Ok(deleted > 0)
      })
      .await?;
    if deleted {
      tracing::info!(%property_code, "deleted property");
    }
    Ok(deleted)
  }

  /// Record a photo path against an existing property, returning its row id.
  pub async fn add_photo(&self, property_code: &str, photo_path: &str) -> Result<i64> {
    let (code, path) = (property_code.to_owned(), photo_path.to_owned());
    let target = self.policies.property.target.clone();
    self
      .with_conn(move |conn| {
        if !Session::new(conn).code_exists(&target, &code)? {
          return Err(Error::PropertyNotFound(code));
        }
        conn.execute(
          "INSERT INTO property_photos (property_code, photo_path) VALUES (?1, ?2)",
          rusqlite::params![code, path],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await
  }

  pub async fn photos(&self, property_code: &str) -> Result<Vec<String>> {
    let code = property_code.to_owned();
    self
      .with_conn(move |conn| {
        let mut stmt = conn
          .prepare("SELECT photo_path FROM property_photos WHERE property_code = ?1 ORDER BY id")?;
        let paths = stmt
          .query_map([&code], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(paths)
      })
      .await
  }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Turn a key conflict into the "try another code" signal.
fn conflict_as_none(result: rusqlite::Result<usize>) -> rusqlite::Result<Option<()>> {
  match result {
    Ok(_) => Ok(Some(())),
    Err(err) if is_key_conflict(&err) => Ok(None),
    Err(err) => Err(err),
  }
}

fn select_owner(conn: &Connection, owner_code: &str) -> Result<Option<RawOwner>> {
  let sql = format!("SELECT {OWNER_COLUMNS} FROM owners WHERE owner_code = ?1");
  Ok(conn.query_row(&sql, [owner_code], RawOwner::from_row).optional()?)
}

fn select_property(conn: &Connection, property_code: &str) -> Result<Option<RawProperty>> {
  let sql = format!("SELECT {PROPERTY_COLUMNS} FROM properties WHERE property_code = ?1");
  Ok(conn.query_row(&sql, [property_code], RawProperty::from_row).optional()?)
}
