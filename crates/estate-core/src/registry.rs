//! The application's tables, their default code policies, and the records
//! stored in them.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{
  policy::{CodePolicy, Segment, StructuredPolicy},
  schema::{ColumnDef, ColumnDefault, ForeignKey, IndexDef, TableDescriptor},
};

pub const OWNERS: &str = "owners";
pub const PROPERTIES: &str = "properties";
pub const PROPERTY_PHOTOS: &str = "property_photos";

/// Uppercase letters and digits without the easily confused `I`, `O`, `0`
/// and `1`.
pub const OWNER_CODE_ALPHABET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";

// ─── Tables ──────────────────────────────────────────────────────────────────

pub fn owners() -> TableDescriptor {
  TableDescriptor::new(OWNERS)
    .column(ColumnDef::text("owner_code").primary_key())
    .column(ColumnDef::text("name").not_null())
    .column(ColumnDef::text("phone"))
    .column(ColumnDef::text("note"))
    .column(ColumnDef::text("created_at").default(ColumnDefault::CurrentTimestamp))
}

pub fn properties() -> TableDescriptor {
  TableDescriptor::new(PROPERTIES)
    .column(ColumnDef::text("property_code").primary_key())
    .column(ColumnDef::text("owner_code"))
    .column(ColumnDef::text("property_type"))
    .column(ColumnDef::text("offer_type"))
    .column(ColumnDef::text("province_code"))
    .column(ColumnDef::text("region_code"))
    .column(ColumnDef::text("address"))
    .column(ColumnDef::real("area").default(ColumnDefault::Real(0.0)))
    .column(ColumnDef::integer("bedrooms").default(ColumnDefault::Integer(0)))
    .column(ColumnDef::integer("bathrooms").default(ColumnDefault::Integer(0)))
    .column(ColumnDef::text("description"))
    .column(ColumnDef::text("created_at").default(ColumnDefault::CurrentTimestamp))
    .foreign_key(ForeignKey::new("owner_code", OWNERS, "owner_code"))
    .index(IndexDef::new("properties_owner_idx", ["owner_code"]))
}

pub fn property_photos() -> TableDescriptor {
  TableDescriptor::new(PROPERTY_PHOTOS)
    .column(ColumnDef::integer("id").autoincrement())
    .column(ColumnDef::text("property_code"))
    .column(ColumnDef::text("photo_path").not_null())
    .column(ColumnDef::text("uploaded_at").default(ColumnDefault::CurrentTimestamp))
    .foreign_key(ForeignKey::new("property_code", PROPERTIES, "property_code"))
}

/// Every table the application keeps, in declaration order.
pub fn tables() -> Vec<TableDescriptor> { vec![owners(), properties(), property_photos()] }

// ─── Policies ────────────────────────────────────────────────────────────────

pub fn owner_code_policy() -> CodePolicy {
  CodePolicy::new(OWNER_CODE_ALPHABET, 8, OWNERS, "owner_code")
}

/// One letter and three digits that no other property starts with, then
/// four digits.
pub fn property_code_policy() -> StructuredPolicy {
  StructuredPolicy::new(
    vec![Segment::new(UPPERCASE, 1), Segment::new(DIGITS, 3)],
    vec![Segment::new(DIGITS, 4)],
    PROPERTIES,
    "property_code",
  )
}

/// The policies a store mints under. Either may be overridden from
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
  #[serde(default = "owner_code_policy")]
  pub owner:    CodePolicy,
  #[serde(default = "property_code_policy")]
  pub property: StructuredPolicy,
}

impl Default for PolicySet {
  fn default() -> Self { Self { owner: owner_code_policy(), property: property_code_policy() } }
}

impl PolicySet {
  pub fn validate(&self) -> crate::Result<()> {
    self.owner.validate()?;
    self.property.validate()
  }
}

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewOwner {
  pub name:  String,
  pub phone: Option<String>,
  pub note:  Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
  pub owner_code: String,
  pub name:       String,
  pub phone:      Option<String>,
  pub note:       Option<String>,
  pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewProperty {
  pub owner_code:    Option<String>,
  pub property_type: Option<String>,
  pub offer_type:    Option<String>,
  pub province_code: Option<String>,
  pub region_code:   Option<String>,
  pub address:       Option<String>,
  pub area:          f64,
  pub bedrooms:      i64,
  pub bathrooms:     i64,
  pub description:   Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
  pub property_code: String,
  pub owner_code:    Option<String>,
  pub property_type: Option<String>,
  pub offer_type:    Option<String>,
  pub province_code: Option<String>,
  pub region_code:   Option<String>,
  pub address:       Option<String>,
  pub area:          f64,
  pub bedrooms:      i64,
  pub bathrooms:     i64,
  pub description:   Option<String>,
  pub created_at:    Option<NaiveDateTime>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::evolve::evolution_order;

  #[test]
  fn registry_descriptors_are_valid() {
    for table in tables() {
      table.validate().unwrap();
    }
  }

  #[test]
  fn registry_evolves_parents_first() {
    let tables = tables();
    let order: Vec<&str> =
      evolution_order(&tables).unwrap().into_iter().map(|t| t.name.as_str()).collect();
    assert_eq!(order, [OWNERS, PROPERTIES, PROPERTY_PHOTOS]);
  }

  #[test]
  fn default_policies_are_valid() {
    PolicySet::default().validate().unwrap();
    assert_eq!(property_code_policy().prefix_len(), 4);
    assert_eq!(property_code_policy().code_len(), 8);
  }

  #[test]
  fn owner_alphabet_has_no_ambiguous_characters() {
    assert!(!OWNER_CODE_ALPHABET.contains(['I', 'O', '0', '1']));
    assert_eq!(OWNER_CODE_ALPHABET.len(), 32);
  }
}
