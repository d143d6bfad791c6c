//! In-process identity store with the same uniqueness rules as SQLite.
//!
//! Used by tests and by single-process runs that publish a snapshot instead
//! of keeping a database file.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::types::*;
use deident_core::{Error, IdentifierType, ResearchId, Result};

#[derive(Default)]
pub struct MemoryIdentityStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<ResearchId, CanonicalIdentity>,
    index: HashMap<(IdentifierType, String), ResearchId>,
    writes: u64,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful inserts and fills so far.
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }
}

fn ensure_linking(identifier_type: IdentifierType) -> Result<()> {
    if identifier_type.is_linking() {
        Ok(())
    } else {
        Err(Error::Schema(format!(
            "{} is confidential and has no identity map column",
            identifier_type
        )))
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn find_matches(&self, pairs: &[(IdentifierType, String)]) -> Result<Vec<CanonicalIdentity>> {
        let inner = self.inner.lock();
        let mut ids: Vec<&ResearchId> = pairs
            .iter()
            .filter_map(|(t, v)| inner.index.get(&(*t, v.clone())))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids
            .into_iter()
            .filter_map(|id| inner.rows.get(id).cloned())
            .collect())
    }

    fn insert(&self, identity: &CanonicalIdentity) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.rows.contains_key(&identity.research_id) {
            return Err(Error::UniqueViolation(format!(
                "research id {} already exists",
                identity.research_id
            )));
        }
        for (t, v) in &identity.values {
            ensure_linking(*t)?;
            if inner.index.contains_key(&(*t, v.clone())) {
                return Err(Error::UniqueViolation(format!("{} already bound", t)));
            }
        }

        for (t, v) in &identity.values {
            inner
                .index
                .insert((*t, v.clone()), identity.research_id.clone());
        }
        inner
            .rows
            .insert(identity.research_id.clone(), identity.clone());
        inner.writes += 1;
        Ok(())
    }

    fn fill_slot(
        &self,
        research_id: &ResearchId,
        identifier_type: IdentifierType,
        value: &str,
    ) -> Result<()> {
        ensure_linking(identifier_type)?;
        let mut inner = self.inner.lock();
        let key = (identifier_type, value.to_string());

        let current = inner
            .rows
            .get(research_id)
            .ok_or_else(|| Error::NotFound(format!("identity {}", research_id)))?
            .get(identifier_type)
            .map(str::to_string);
        match current {
            Some(existing) if existing == value => return Ok(()),
            Some(_) => {
                return Err(Error::SlotRace {
                    research_id: research_id.clone(),
                    identifier_type,
                })
            }
            None => {}
        }
        if inner.index.contains_key(&key) {
            return Err(Error::UniqueViolation(format!(
                "{} already bound",
                identifier_type
            )));
        }

        inner.index.insert(key, research_id.clone());
        if let Some(row) = inner.rows.get_mut(research_id) {
            row.values.insert(identifier_type, value.to_string());
            row.updated_at = Some(now_millis());
        }
        inner.writes += 1;
        Ok(())
    }

    fn lookup(&self, identifier_type: IdentifierType, value: &str) -> Result<Option<ResearchId>> {
        ensure_linking(identifier_type)?;
        Ok(self
            .inner
            .lock()
            .index
            .get(&(identifier_type, value.to_string()))
            .cloned())
    }

    fn get(&self, research_id: &ResearchId) -> Result<Option<CanonicalIdentity>> {
        Ok(self.inner.lock().rows.get(research_id).cloned())
    }

    fn all(&self) -> Result<Vec<CanonicalIdentity>> {
        Ok(self.inner.lock().rows.values().cloned().collect())
    }

    fn count(&self) -> Result<i64> {
        Ok(self.inner.lock().rows.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(values: &[(IdentifierType, &str)]) -> CanonicalIdentity {
        CanonicalIdentity::new(
            ResearchId::generate(),
            values.iter().map(|(t, v)| (*t, v.to_string())).collect(),
        )
    }

    #[test]
    fn test_uniqueness_per_type() {
        let store = MemoryIdentityStore::new();
        store
            .insert(&identity(&[(IdentifierType::DatasetId, "1")]))
            .unwrap();
        assert!(matches!(
            store.insert(&identity(&[(IdentifierType::DatasetId, "1")])),
            Err(Error::UniqueViolation(_))
        ));
        store
            .insert(&identity(&[(IdentifierType::PlatformId, "1")]))
            .unwrap();
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn test_failed_insert_leaves_no_partial_index() {
        let store = MemoryIdentityStore::new();
        store
            .insert(&identity(&[(IdentifierType::Eppn, "a@b")]))
            .unwrap();
        let clash = identity(&[(IdentifierType::DatasetId, "9"), (IdentifierType::Eppn, "a@b")]);
        assert!(store.insert(&clash).is_err());
        assert_eq!(store.lookup(IdentifierType::DatasetId, "9").unwrap(), None);
    }

    #[test]
    fn test_fill_slot_rules() {
        let store = MemoryIdentityStore::new();
        let a = identity(&[(IdentifierType::DatasetId, "1")]);
        let b = identity(&[(IdentifierType::DatasetId, "2"), (IdentifierType::GuestId, "xx99xxxx")]);
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        assert!(store
            .fill_slot(&a.research_id, IdentifierType::GuestId, "xx99xxxx")
            .unwrap_err()
            .is_retryable());
        store
            .fill_slot(&a.research_id, IdentifierType::GuestId, "yy99yyyy")
            .unwrap();
        assert!(matches!(
            store.fill_slot(&a.research_id, IdentifierType::GuestId, "zz99zzzz"),
            Err(Error::SlotRace { .. })
        ));
        assert_eq!(
            store.lookup(IdentifierType::GuestId, "yy99yyyy").unwrap(),
            Some(a.research_id.clone())
        );
    }

    #[test]
    fn test_find_matches_dedups() {
        let store = MemoryIdentityStore::new();
        let a = identity(&[(IdentifierType::DatasetId, "1"), (IdentifierType::PlatformId, "5")]);
        store.insert(&a).unwrap();
        let found = store
            .find_matches(&[
                (IdentifierType::DatasetId, "1".into()),
                (IdentifierType::PlatformId, "5".into()),
            ])
            .unwrap();
        assert_eq!(found, vec![a]);
    }
}
