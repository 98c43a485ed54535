//! Row decoding for the registry tables.

use chrono::NaiveDateTime;
use rusqlite::Row;

use estate_core::registry::{Owner, Property};

use crate::{Error, Result};

/// Format SQLite's `CURRENT_TIMESTAMP` writes.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn decode_timestamp(s: &str) -> Result<NaiveDateTime> {
  NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

// ─── Row types ───────────────────────────────────────────────────────────────

pub const OWNER_COLUMNS: &str = "owner_code, name, phone, note, created_at";

/// Raw values read directly from an `owners` row.
pub struct RawOwner {
  pub owner_code: String,
  pub name:       String,
  pub phone:      Option<String>,
  pub note:       Option<String>,
  pub created_at: Option<String>,
}

impl RawOwner {
  /// Expects the columns in [`OWNER_COLUMNS`] order.
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      owner_code: row.get(0)?,
      name:       row.get(1)?,
      phone:      row.get(2)?,
      note:       row.get(3)?,
      created_at: row.get(4)?,
    })
  }

  pub fn into_owner(self) -> Result<Owner> {
    Ok(Owner {
      owner_code: self.owner_code,
      name:       self.name,
      phone:      self.phone,
      note:       self.note,
      created_at: self.created_at.as_deref().map(decode_timestamp).transpose()?,
    })
  }
}

pub const PROPERTY_COLUMNS: &str = "property_code, owner_code, property_type, offer_type, \
                                    province_code, region_code, address, area, bedrooms, \
                                    bathrooms, description, created_at";

/// Raw values read directly from a `properties` row.
pub struct RawProperty {
  pub property_code: String,
  pub owner_code:    Option<String>,
  pub property_type: Option<String>,
  pub offer_type:    Option<String>,
  pub province_code: Option<String>,
  pub region_code:   Option<String>,
  pub address:       Option<String>,
  pub area:          Option<f64>,
  pub bedrooms:      Option<i64>,
  pub bathrooms:     Option<i64>,
  pub description:   Option<String>,
  pub created_at:    Option<String>,
}

impl RawProperty {
  /// Expects the columns in [`PROPERTY_COLUMNS`] order.
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      property_code: row.get(0)?,
      owner_code:    row.get(1)?,
      property_type: row.get(2)?,
      offer_type:    row.get(3)?,
      province_code: row.get(4)?,
      region_code:   row.get(5)?,
      address:       row.get(6)?,
      area:          row.get(7)?,
      bedrooms:      row.get(8)?,
      bathrooms:     row.get(9)?,
      description:   row.get(10)?,
      created_at:    row.get(11)?,
    })
  }

  pub fn into_property(self) -> Result<Property> {
    Ok(Property {
      property_code: self.property_code,
      owner_code:    self.owner_code,
      property_type: self.property_type,
      offer_type:    self.offer_type,
      province_code: self.province_code,
      region_code:   self.region_code,
      address:       self.address,
      area:          self.area.unwrap_or_default(),
      bedrooms:      self.bedrooms.unwrap_or_default(),
      bathrooms:     self.bathrooms.unwrap_or_default(),
      description:   self.description,
      created_at:    self.created_at.as_deref().map(decode_timestamp).transpose()?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decodes_sqlite_timestamps() {
    let ts = decode_timestamp("2024-03-01 09:15:00").unwrap();
    assert_eq!(ts.to_string(), "2024-03-01 09:15:00");
  }

  #[test]
  fn rejects_other_formats() {
    assert!(matches!(decode_timestamp("2024-03-01T09:15:00Z"), Err(Error::DateParse(_))));
  }
}
