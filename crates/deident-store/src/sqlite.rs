//! SQLite-backed identity map.
//!
//! One row per individual. Linking columns are UNIQUE, so two concurrent
//! writers can never bind the same value to different research ids: the
//! loser gets `Error::UniqueViolation` and re-reads. Several processes may
//! open the same file; WAL mode and a busy timeout serialise their writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::schema::{GUARD_TRIGGERS_SQL, IDENTITY_COLUMNS, SCHEMA_SQL};
use crate::types::*;
use deident_core::{Error, IdentifierType, ResearchId, Result};

const DB_FILE: &str = "identity.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity map stored in `<db_dir>/identity.db`.
pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

/// Row as read from SQLite, before the research id is validated.
struct RawIdentity {
    research_id: String,
    slots: [Option<String>; 5],
    created_at: i64,
    updated_at: Option<i64>,
}

impl SqliteIdentityStore {
    /// Open or create the identity map under `db_dir`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join(DB_FILE);

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        info!(
            "SqliteIdentityStore initialized: {} identities, path={}",
            store.count()?,
            store.db_path.display()
        );
        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(|e| Error::Database(e.to_string()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}", SCHEMA_SQL, GUARD_TRIGGERS_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn get_stats(&self) -> Result<StoreStats> {
        let total_identities = self.count()?;

        let counts_sql = format!(
            "SELECT {} FROM identity_map",
            IdentifierType::linking()
                .iter()
                .map(|t| format!("COUNT({})", t.field_name()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let conn = self.conn.lock();
        let counts: Vec<i64> = conn
            .query_row(&counts_sql, [], |row| {
                (0..IdentifierType::linking().len())
                    .map(|i| row.get::<_, i64>(i))
                    .collect::<rusqlite::Result<Vec<i64>>>()
            })
            .map_err(|e| Error::Database(e.to_string()))?;
        drop(conn);

        let filled = IdentifierType::linking()
            .iter()
            .copied()
            .zip(counts)
            .collect();

        let db_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StoreStats {
            total_identities,
            filled,
            db_path: self.db_path.to_string_lossy().to_string(),
            db_size_mb: db_size as f64 / (1024.0 * 1024.0),
        })
    }

    fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawIdentity> {
        Ok(RawIdentity {
            research_id: row.get(0)?,
            slots: [row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?],
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_identity(raw: RawIdentity) -> Result<CanonicalIdentity> {
        let values = IdentifierType::linking()
            .iter()
            .copied()
            .zip(raw.slots)
            .filter_map(|(t, v)| v.map(|v| (t, v)))
            .collect::<BTreeMap<_, _>>();
        Ok(CanonicalIdentity {
            research_id: ResearchId::parse(&raw.research_id)?,
            values,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }

    fn query_identities(
        &self,
        sql: &str,
        values: impl IntoIterator<Item = String>,
    ) -> Result<Vec<CanonicalIdentity>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(values), Self::read_row)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(e.to_string()))?;
        drop(stmt);
        drop(conn);
        rows.into_iter().map(Self::into_identity).collect()
    }
}

/// Column holding `identifier_type`, or an error for confidential types.
fn slot_column(identifier_type: IdentifierType) -> Result<&'static str> {
    if identifier_type.is_linking() {
        Ok(identifier_type.field_name())
    } else {
        Err(Error::Schema(format!(
            "{} is confidential and has no identity map column",
            identifier_type
        )))
    }
}

fn map_write_err(e: rusqlite::Error) -> Error {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint") {
        Error::UniqueViolation(msg)
    } else {
        Error::Database(msg)
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn find_matches(&self, pairs: &[(IdentifierType, String)]) -> Result<Vec<CanonicalIdentity>> {
        let mut clauses = Vec::with_capacity(pairs.len());
        let mut values = Vec::with_capacity(pairs.len());
        for (t, v) in pairs.iter().filter(|(t, _)| t.is_linking()) {
            clauses.push(format!("{} = ?", t.field_name()));
            values.push(v.clone());
        }
        if clauses.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {} FROM identity_map WHERE {} ORDER BY research_id",
            IDENTITY_COLUMNS,
            clauses.join(" OR ")
        );
        self.query_identities(&sql, values)
    }

    fn insert(&self, identity: &CanonicalIdentity) -> Result<()> {
        let mut slots: [Option<&str>; 5] = [None; 5];
        for (t, v) in &identity.values {
            slot_column(*t)?;
            if let Some(i) = IdentifierType::linking().iter().position(|l| l == t) {
                slots[i] = Some(v.as_str());
            }
        }

        let conn = self.conn.lock();
        conn.prepare_cached(&format!(
            "INSERT INTO identity_map ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            IDENTITY_COLUMNS
        ))
        .map_err(|e| Error::Database(e.to_string()))?
        .execute(params![
            identity.research_id.as_str(),
            slots[0],
            slots[1],
            slots[2],
            slots[3],
            slots[4],
            identity.created_at,
            identity.updated_at,
        ])
        .map_err(map_write_err)?;

        debug!(
            "Inserted identity {} with {} slots",
            identity.research_id,
            identity.values.len()
        );
        Ok(())
    }

    fn fill_slot(
        &self,
        research_id: &ResearchId,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<()> {
        let column = slot_column(identifier_type)?;
        let conn = self.conn.lock();

        let updated = conn
            .prepare_cached(&format!(
                "UPDATE identity_map SET {col} = ?1, updated_at = ?2 \
                 WHERE research_id = ?3 AND {col} IS NULL",
                col = column
            ))
            .map_err(|e| Error::Database(e.to_string()))?
            .execute(params![value, now_millis(), research_id.as_str()])
            .map_err(map_write_err)?;
        if updated > 0 {
            debug!("Filled {} of {}", identifier_type, research_id);
            return Ok(());
        }

        let current: Option<Option<String>> = conn
            .prepare_cached(&format!(
                "SELECT {} FROM identity_map WHERE research_id = ?1",
                column
            ))
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![research_id.as_str()], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;

        match current {
            None => Err(Error::NotFound(format!("identity {}", research_id))),
            // Another writer filled the same value; nothing left to do.
            Some(Some(existing)) if existing == value => Ok(()),
            Some(_) => Err(Error::SlotRace {
                research_id: research_id.clone(),
                identifier_type,
            }),
        }
    }

    fn lookup(&self, identifier_type: IdentifierType, value: &str) -> Result<Option<ResearchId>> {
        let column = slot_column(identifier_type)?;
        let conn = self.conn.lock();
        let id: Option<String> = conn
            .prepare_cached(&format!(
                "SELECT research_id FROM identity_map WHERE {} = ?1",
                column
            ))
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![value], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        id.as_deref().map(ResearchId::parse).transpose()
    }

    fn get(&self, research_id: &ResearchId) -> Result<Option<CanonicalIdentity>> {
        let sql = format!(
            "SELECT {} FROM identity_map WHERE research_id = ?",
            IDENTITY_COLUMNS
        );
        Ok(self
            .query_identities(&sql, [research_id.to_string()])?
            .into_iter()
            .next())
    }

    fn all(&self) -> Result<Vec<CanonicalIdentity>> {
        let sql = format!(
            "SELECT {} FROM identity_map ORDER BY research_id",
            IDENTITY_COLUMNS
        );
        self.query_identities(&sql, Vec::<String>::new())
    }

    fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM identity_map", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_store() -> (SqliteIdentityStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteIdentityStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn identity(values: &[(IdentifierType, &str)]) -> CanonicalIdentity {
        CanonicalIdentity::new(
            ResearchId::generate(),
            values.iter().map(|(t, v)| (*t, v.to_string())).collect(),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let (store, _dir) = test_store();
        let id = identity(&[
            (IdentifierType::DatasetId, "500"),
            (IdentifierType::InstitutionalId, "99999999"),
        ]);
        store.insert(&id).unwrap();

        let got = store.get(&id.research_id).unwrap().unwrap();
        assert_eq!(got, id);
        assert_eq!(got.get(IdentifierType::PlatformId), None);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_value_is_unique_violation() {
        let (store, _dir) = test_store();
        store
            .insert(&identity(&[(IdentifierType::DatasetId, "500")]))
            .unwrap();

        let result = store.insert(&identity(&[(IdentifierType::DatasetId, "500")]));
        assert!(matches!(result, Err(Error::UniqueViolation(_))));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_same_value_different_types_allowed() {
        let (store, _dir) = test_store();
        store
            .insert(&identity(&[(IdentifierType::DatasetId, "500")]))
            .unwrap();
        store
            .insert(&identity(&[(IdentifierType::PlatformId, "500")]))
            .unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_confidential_types_rejected() {
        let (store, _dir) = test_store();
        let result = store.insert(&identity(&[(IdentifierType::Email, "a@b.org")]));
        assert!(matches!(result, Err(Error::Schema(_))));
        assert!(store.lookup(IdentifierType::Name, "Ann").is_err());
    }

    #[test]
    fn test_find_matches_or_semantics() {
        let (store, _dir) = test_store();
        let a = identity(&[(IdentifierType::DatasetId, "1")]);
        let b = identity(&[(IdentifierType::GuestId, "xx99xxxx")]);
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        let found = store
            .find_matches(&[
                (IdentifierType::DatasetId, "1".into()),
                (IdentifierType::GuestId, "xx99xxxx".into()),
                (IdentifierType::Eppn, "nobody@x".into()),
            ])
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(store
            .find_matches(&[(IdentifierType::Other, "1".into())])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_fill_slot() {
        let (store, _dir) = test_store();
        let a = identity(&[(IdentifierType::DatasetId, "1")]);
        store.insert(&a).unwrap();

        store
            .fill_slot(&a.research_id, IdentifierType::Eppn, "ann@example.edu")
            .unwrap();
        let got = store.get(&a.research_id).unwrap().unwrap();
        assert_eq!(got.get(IdentifierType::Eppn), Some("ann@example.edu"));
        assert!(got.updated_at.is_some());

        // Same value again is a no-op, a different one is a race.
        store
            .fill_slot(&a.research_id, IdentifierType::Eppn, "ann@example.edu")
            .unwrap();
        let err = store
            .fill_slot(&a.research_id, IdentifierType::Eppn, "bob@example.edu")
            .unwrap_err();
        assert!(matches!(err, Error::SlotRace { .. }));
    }

    #[test]
    fn test_fill_slot_value_bound_elsewhere() {
        let (store, _dir) = test_store();
        let a = identity(&[(IdentifierType::DatasetId, "1")]);
        let b = identity(&[(IdentifierType::DatasetId, "2"), (IdentifierType::PlatformId, "7")]);
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        let err = store
            .fill_slot(&a.research_id, IdentifierType::PlatformId, "7")
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_fill_slot_missing_identity() {
        let (store, _dir) = test_store();
        let err = store
            .fill_slot(&ResearchId::generate(), IdentifierType::Eppn, "a@b")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_lookup() {
        let (store, _dir) = test_store();
        let a = identity(&[(IdentifierType::PlatformId, "42")]);
        store.insert(&a).unwrap();
        assert_eq!(
            store.lookup(IdentifierType::PlatformId, "42").unwrap(),
            Some(a.research_id.clone())
        );
        assert_eq!(store.lookup(IdentifierType::DatasetId, "42").unwrap(), None);
    }

    #[test]
    fn test_guard_triggers() {
        let (store, _dir) = test_store();
        let a = identity(&[(IdentifierType::DatasetId, "1")]);
        store.insert(&a).unwrap();

        let conn = store.conn.lock();
        assert!(conn
            .execute("DELETE FROM identity_map", [])
            .is_err());
        assert!(conn
            .execute("UPDATE identity_map SET dataset_id = '2'", [])
            .is_err());
        assert!(conn
            .execute(
                "UPDATE identity_map SET research_id = ?1",
                params![ResearchId::generate().as_str()]
            )
            .is_err());
        drop(conn);

        assert_eq!(store.get(&a.research_id).unwrap().unwrap(), a);
    }

    #[test]
    fn test_stats() {
        let (store, _dir) = test_store();
        store
            .insert(&identity(&[
                (IdentifierType::DatasetId, "1"),
                (IdentifierType::Eppn, "a@b"),
            ]))
            .unwrap();
        store
            .insert(&identity(&[(IdentifierType::DatasetId, "2")]))
            .unwrap();

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_identities, 2);
        assert_eq!(stats.filled[&IdentifierType::DatasetId], 2);
        assert_eq!(stats.filled[&IdentifierType::Eppn], 1);
        assert_eq!(stats.filled[&IdentifierType::GuestId], 0);
        assert!(stats.db_path.ends_with("identity.db"));
    }

    #[test]
    fn test_concurrent_connections_share_uniqueness() {
        let dir = TempDir::new().unwrap();
        let stores: Vec<Arc<SqliteIdentityStore>> = (0..4)
            .map(|_| Arc::new(SqliteIdentityStore::open(dir.path()).unwrap()))
            .collect();

        let handles: Vec<_> = stores
            .iter()
            .cloned()
            .map(|store| {
                std::thread::spawn(move || {
                    store.insert(&identity(&[(IdentifierType::DatasetId, "500")]))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(Error::is_retryable));
        assert_eq!(stores[0].count().unwrap(), 1);
    }
}
