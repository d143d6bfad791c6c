//! Identity schema: which columns of which tables carry identifiers.
//!
//! The schema is a JSON document keyed by table name. Each table is either a
//! plain column map or a full declaration with explicit slots:
//!
//! ```json
//! {
//!   "pseudonym_dim": {
//!     "user_id": ["DatasetId"],
//!     "canvas_id": ["PlatformId"],
//!     "sis_user_id": ["InstitutionalId", "GuestId"],
//!     "unique_name": ["Other"]
//!   },
//!   "submission_dim": {
//!     "columns": { "user_id": ["DatasetId"], "grader_id": ["DatasetId"] },
//!     "slots": { "grader_id": "grader" }
//!   }
//! }
//! ```
//!
//! A column listing several types is multiplexed: a value takes the first
//! type whose validator accepts it, or `Other` when none does. Columns with
//! no explicit slot belong to [`DEFAULT_SLOT`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identifier::IdentifierType;

/// Slot for columns that do not declare one.
pub const DEFAULT_SLOT: &str = "primary";

/// Declared identifier types and slot of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRule {
    pub column: String,
    pub types: Vec<IdentifierType>,
    pub slot: String,
}

impl ColumnRule {
    /// Pick the identifier type for a raw value and return its canonical form.
    ///
    /// Returns `None` for blank values. Values no declared type accepts are
    /// classified as `Other`.
    pub fn classify(&self, raw: &str) -> Option<(IdentifierType, String)> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let classified = self
            .types
            .iter()
            .find_map(|t| t.normalize(trimmed).map(|v| (*t, v)))
            .unwrap_or_else(|| (IdentifierType::Other, trimmed.to_string()));
        Some(classified)
    }

    /// True if any declared type links to the identity map.
    pub fn is_linking(&self) -> bool {
        self.types.iter().any(|t| t.is_linking())
    }

    /// Name of the research id column this column becomes, if any.
    pub fn output_column(&self) -> Option<String> {
        self.types.iter().find_map(|t| t.output_column(&self.column))
    }
}

/// Identity declaration of one table.
#[derive(Debug, Clone)]
pub struct TableIdentity {
    name: String,
    columns: BTreeMap<String, ColumnRule>,
}

impl TableIdentity {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column(&self, column: &str) -> Option<&ColumnRule> {
        self.columns.get(column)
    }

    pub fn rules(&self) -> impl Iterator<Item = &ColumnRule> {
        self.columns.values()
    }

    /// Distinct slot names, sorted.
    pub fn slot_names(&self) -> BTreeSet<&str> {
        self.columns.values().map(|r| r.slot.as_str()).collect()
    }
}

/// Immutable identity schema for a run.
#[derive(Debug, Clone)]
pub struct IdentitySchema {
    tables: BTreeMap<String, TableIdentity>,
    fingerprint: String,
}

impl IdentitySchema {
    /// Load a schema from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Reading identity schema from {}", path.display());
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Schema(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(text)
            .map_err(|e| Error::Schema(format!("Malformed schema JSON: {}", e)))?;
        Self::from_json(&doc)
    }

    pub fn from_json(doc: &Value) -> Result<Self> {
        let tables_json = doc
            .as_object()
            .ok_or_else(|| Error::Schema("Schema root must be an object".into()))?;

        let mut tables = BTreeMap::new();
        for (table, decl) in tables_json {
            let parsed = parse_table(table, decl)?;
            debug!("Table {}: {} identifying columns", table, parsed.columns.len());
            tables.insert(table.clone(), parsed);
        }

        let fingerprint = fingerprint(&tables)?;
        info!(
            "Identity schema loaded: {} tables, fingerprint={}",
            tables.len(),
            &fingerprint[..12]
        );
        Ok(Self {
            tables,
            fingerprint,
        })
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    pub fn table(&self, table: &str) -> Option<&TableIdentity> {
        self.tables.get(table)
    }

    /// Column → declared identifier types for a table.
    pub fn columns_for(&self, table: &str) -> Option<BTreeMap<&str, &[IdentifierType]>> {
        self.tables.get(table).map(|t| {
            t.columns
                .iter()
                .map(|(c, r)| (c.as_str(), r.types.as_slice()))
                .collect()
        })
    }

    /// Column → slot name for a table.
    pub fn slots_for(&self, table: &str) -> Option<BTreeMap<&str, &str>> {
        self.tables.get(table).map(|t| {
            t.columns
                .iter()
                .map(|(c, r)| (c.as_str(), r.slot.as_str()))
                .collect()
        })
    }

    /// SHA-256 of the canonical schema, hex encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn parse_table(table: &str, decl: &Value) -> Result<TableIdentity> {
    let obj = decl
        .as_object()
        .ok_or_else(|| Error::Schema(format!("Table {} must be an object", table)))?;

    let (columns_json, slots_json) = match obj.get("columns") {
        Some(Value::Object(columns)) => (columns, obj.get("slots")),
        _ => (obj, None),
    };

    let mut slots: BTreeMap<String, String> = BTreeMap::new();
    if let Some(slots_json) = slots_json {
        let slots_obj = slots_json
            .as_object()
            .ok_or_else(|| Error::Schema(format!("{}: slots must be an object", table)))?;
        for (column, slot) in slots_obj {
            let slot = slot
                .as_str()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| {
                    Error::Schema(format!("{}.{}: slot must be a non-empty string", table, column))
                })?;
            if !columns_json.contains_key(column) {
                return Err(Error::Schema(format!(
                    "{}: slot declared for undeclared column {}",
                    table, column
                )));
            }
            slots.insert(column.clone(), slot.to_string());
        }
    }

    if columns_json.is_empty() {
        return Err(Error::Schema(format!("Table {} declares no columns", table)));
    }

    let mut columns = BTreeMap::new();
    for (column, types_json) in columns_json {
        let types = parse_types(table, column, types_json)?;
        let slot = slots
            .remove(column)
            .unwrap_or_else(|| DEFAULT_SLOT.to_string());
        columns.insert(
            column.clone(),
            ColumnRule {
                column: column.clone(),
                types,
                slot,
            },
        );
    }

    check_slot_types(table, &columns)?;

    Ok(TableIdentity {
        name: table.to_string(),
        columns,
    })
}

fn parse_types(table: &str, column: &str, types_json: &Value) -> Result<Vec<IdentifierType>> {
    let names = types_json.as_array().ok_or_else(|| {
        Error::Schema(format!("{}.{}: expected a list of identifier types", table, column))
    })?;
    if names.is_empty() {
        return Err(Error::Schema(format!(
            "{}.{}: empty identifier type list",
            table, column
        )));
    }

    let mut types: Vec<IdentifierType> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_str().ok_or_else(|| {
            Error::Schema(format!("{}.{}: identifier types must be strings", table, column))
        })?;
        let t: IdentifierType = name
            .parse()
            .map_err(|e| Error::Schema(format!("{}.{}: {}", table, column, e)))?;
        if types.contains(&t) {
            return Err(Error::Schema(format!(
                "{}.{}: {} declared twice",
                table, column, t
            )));
        }
        if let Some(prev) = types.iter().find(|p| p.is_catch_all()) {
            return Err(Error::Schema(format!(
                "{}.{}: {} can never match after {}",
                table, column, t, prev
            )));
        }
        types.push(t);
    }
    Ok(types)
}

/// Within one slot, a linking type may come from at most one column.
fn check_slot_types(table: &str, columns: &BTreeMap<String, ColumnRule>) -> Result<()> {
    let mut seen: BTreeMap<(&str, IdentifierType), &str> = BTreeMap::new();
    for rule in columns.values() {
        for t in rule.types.iter().filter(|t| t.is_linking()) {
            if let Some(other) = seen.insert((rule.slot.as_str(), *t), rule.column.as_str()) {
                return Err(Error::Schema(format!(
                    "{}: columns {} and {} both carry {} in slot {}",
                    table, other, rule.column, t, rule.slot
                )));
            }
        }
    }
    Ok(())
}

fn fingerprint(tables: &BTreeMap<String, TableIdentity>) -> Result<String> {
    let canonical: BTreeMap<&str, BTreeMap<&str, (Vec<&str>, &str)>> = tables
        .iter()
        .map(|(name, t)| {
            let cols = t
                .columns
                .iter()
                .map(|(c, r)| {
                    let types = r.types.iter().map(|t| t.field_name()).collect();
                    (c.as_str(), (types, r.slot.as_str()))
                })
                .collect();
            (name.as_str(), cols)
        })
        .collect();
    let bytes = serde_json::to_vec(&canonical)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
