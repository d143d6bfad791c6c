//! Identity map schema SQL.
//!
//! Column order follows `IdentifierType::linking()`.

/// The identity map table. Every linking column is UNIQUE; SQLite allows
/// any number of NULLs under a UNIQUE constraint.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS identity_map (
    research_id TEXT PRIMARY KEY NOT NULL CHECK (length(research_id) = 36),
    dataset_id TEXT UNIQUE,
    platform_id TEXT UNIQUE,
    institutional_id TEXT UNIQUE,
    guest_id TEXT UNIQUE,
    eppn TEXT UNIQUE,
    created_at INTEGER NOT NULL,
    updated_at INTEGER
);
"#;

/// Published pseudonyms never change meaning: rows are never deleted, the
/// research id never changes, and a filled slot is never overwritten.
pub const GUARD_TRIGGERS_SQL: &str = r#"
CREATE TRIGGER IF NOT EXISTS identity_map_no_delete BEFORE DELETE ON identity_map BEGIN
    SELECT RAISE(ABORT, 'identity_map rows are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS identity_map_fixed_id BEFORE UPDATE OF research_id ON identity_map BEGIN
    SELECT RAISE(ABORT, 'research_id is immutable');
END;

CREATE TRIGGER IF NOT EXISTS identity_map_fill_only BEFORE UPDATE ON identity_map
WHEN (old.dataset_id IS NOT NULL AND new.dataset_id IS NOT old.dataset_id)
  OR (old.platform_id IS NOT NULL AND new.platform_id IS NOT old.platform_id)
  OR (old.institutional_id IS NOT NULL AND new.institutional_id IS NOT old.institutional_id)
  OR (old.guest_id IS NOT NULL AND new.guest_id IS NOT old.guest_id)
  OR (old.eppn IS NOT NULL AND new.eppn IS NOT old.eppn)
BEGIN
    SELECT RAISE(ABORT, 'identity_map slots are fill-only');
END;
"#;

/// Columns selected when reading a full identity row.
pub const IDENTITY_COLUMNS: &str =
    "research_id, dataset_id, platform_id, institutional_id, guest_id, eppn, created_at, updated_at";
