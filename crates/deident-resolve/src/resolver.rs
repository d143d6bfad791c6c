//! Witness set → research id.
//!
//! Resolvers hold no locks of their own. Concurrent resolvers may both see
//! "no match" for the same individual; the store's uniqueness constraints let
//! exactly one insert win and the others retry from the lookup.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::types::Resolution;
use deident_core::{Error, IdentifierType, ResearchId, ResolverConfig, Result};
use deident_ingest::WitnessSet;
use deident_store::{CanonicalIdentity, IdentityStore};

pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    config: ResolverConfig,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    /// Map a witness set to its research id, creating or extending the
    /// identity as needed.
    pub fn resolve(&self, set: &WitnessSet) -> Result<Resolution> {
        let pairs = set.linking_pairs()?;

        let mut retries = 0;
        loop {
            match self.try_resolve(&pairs) {
                Ok(mut resolution) => {
                    resolution.retries = retries;
                    return Ok(resolution);
                }
                Err(e) if e.is_retryable() => {
                    if retries >= self.config.max_retries {
                        error!(
                            "Giving up on {}.{} after {} attempts: {}",
                            set.table,
                            set.slot,
                            retries + 1,
                            e
                        );
                        return Err(Error::RetriesExhausted {
                            attempts: retries + 1,
                            last: e.to_string(),
                        });
                    }
                    let delay = self.backoff(retries);
                    warn!(
                        "Store race resolving {}.{} ({}), retrying in {:?}",
                        set.table, set.slot, e, delay
                    );
                    std::thread::sleep(delay);
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.config.backoff_base_ms.saturating_mul(1 << retry.min(16)))
    }

    /// One lookup-then-write round. Store races surface as retryable errors.
    fn try_resolve(&self, pairs: &[(IdentifierType, String)]) -> Result<Resolution> {
        let mut matches = self.store.find_matches(pairs)?;

        match matches.len() {
            0 => {
                let identity = CanonicalIdentity::new(
                    ResearchId::generate(),
                    pairs.iter().cloned().collect(),
                );
                self.store.insert(&identity)?;
                debug!(
                    "New identity {} from {} identifiers",
                    identity.research_id,
                    pairs.len()
                );
                Ok(Resolution {
                    research_id: identity.research_id,
                    created: true,
                    filled: 0,
                    retries: 0,
                })
            }
            1 => {
                let existing = matches.remove(0);
                self.extend(existing, pairs)
            }
            _ => {
                let research_ids: Vec<ResearchId> =
                    matches.into_iter().map(|m| m.research_id).collect();
                let err = Error::BridgingConflict {
                    research_ids,
                    bridging: describe(pairs),
                };
                error!("{}; manual review required", err);
                Err(err)
            }
        }
    }

    /// Fill the empty slots of the single matching identity.
    ///
    /// Every pair is checked before anything is written, so a conflicting set
    /// leaves the identity untouched.
    fn extend(
        &self,
        existing: CanonicalIdentity,
        pairs: &[(IdentifierType, String)],
    ) -> Result<Resolution> {
        let mut to_fill = Vec::new();
        for (t, value) in pairs {
            match existing.get(*t) {
                Some(v) if v == value => {}
                Some(v) => {
                    let err = Error::SlotConflict {
                        research_id: existing.research_id.clone(),
                        identifier_type: *t,
                        existing: v.to_string(),
                        witnessed: value.clone(),
                    };
                    error!("{}", err);
                    return Err(err);
                }
                None => to_fill.push((*t, value.as_str())),
            }
        }

        for (t, value) in &to_fill {
            self.store.fill_slot(&existing.research_id, *t, value)?;
        }
        if !to_fill.is_empty() {
            debug!(
                "Extended identity {} with {} identifiers",
                existing.research_id,
                to_fill.len()
            );
        }

        Ok(Resolution {
            research_id: existing.research_id,
            created: false,
            filled: to_fill.len(),
            retries: 0,
        })
    }
}

fn describe(pairs: &[(IdentifierType, String)]) -> String {
    pairs
        .iter()
        .map(|(t, v)| format!("{}={}", t, v))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use deident_ingest::IdentityWitness;
    use deident_store::{MemoryIdentityStore, SqliteIdentityStore};
    use tempfile::TempDir;

    fn set(slot: &str, pairs: &[(IdentifierType, &str)]) -> WitnessSet {
        WitnessSet {
            table: "users".into(),
            slot: slot.into(),
            witnesses: pairs
                .iter()
                .map(|(t, v)| IdentityWitness {
                    source_table: "users".into(),
                    source_column: t.field_name().into(),
                    slot: slot.into(),
                    identifier_type: *t,
                    raw_value: v.to_string(),
                })
                .collect(),
        }
    }

    fn resolver(store: Arc<dyn IdentityStore>) -> IdentityResolver {
        IdentityResolver::new(
            store,
            ResolverConfig {
                max_retries: 3,
                backoff_base_ms: 1,
            },
        )
    }

    #[test]
    fn test_fresh_identity_then_idempotent() {
        let store = Arc::new(MemoryIdentityStore::new());
        let r = resolver(store.clone());
        let s = set("primary", &[(IdentifierType::DatasetId, "500"), (IdentifierType::PlatformId, "42")]);

        let first = r.resolve(&s).unwrap();
        assert!(first.created);
        let second = r.resolve(&s).unwrap();
        assert_eq!(second.research_id, first.research_id);
        assert!(!second.created);
        assert_eq!(second.filled, 0);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_shared_value_links_and_fills() {
        let store = Arc::new(MemoryIdentityStore::new());
        let r = resolver(store.clone());

        let a = r
            .resolve(&set("primary", &[(IdentifierType::DatasetId, "500")]))
            .unwrap();
        let b = r
            .resolve(&set(
                "primary",
                &[(IdentifierType::DatasetId, "500"), (IdentifierType::InstitutionalId, "99999999")],
            ))
            .unwrap();
        assert_eq!(a.research_id, b.research_id);
        assert_eq!(b.filled, 1);

        let c = r
            .resolve(&set("primary", &[(IdentifierType::InstitutionalId, "99999999")]))
            .unwrap();
        assert_eq!(c.research_id, a.research_id);
    }

    #[test]
    fn test_disjoint_sets_never_merge() {
        let store = Arc::new(MemoryIdentityStore::new());
        let r = resolver(store.clone());
        let a = r
            .resolve(&set("primary", &[(IdentifierType::DatasetId, "1")]))
            .unwrap();
        let b = r
            .resolve(&set("primary", &[(IdentifierType::PlatformId, "1")]))
            .unwrap();
        assert_ne!(a.research_id, b.research_id);
    }

    #[test]
    fn test_slot_conflict_leaves_identity_untouched() {
        let store = Arc::new(MemoryIdentityStore::new());
        let r = resolver(store.clone());
        let a = r
            .resolve(&set("primary", &[(IdentifierType::DatasetId, "1"), (IdentifierType::PlatformId, "7")]))
            .unwrap();

        let err = r
            .resolve(&set(
                "primary",
                &[
                    (IdentifierType::DatasetId, "1"),
                    (IdentifierType::PlatformId, "8"),
                    (IdentifierType::Eppn, "a@b"),
                ],
            ))
            .unwrap_err();
        assert!(matches!(err, Error::SlotConflict { identifier_type: IdentifierType::PlatformId, .. }));

        let identity = store.get(&a.research_id).unwrap().unwrap();
        assert_eq!(identity.get(IdentifierType::Eppn), None);
        assert_eq!(identity.get(IdentifierType::PlatformId), Some("7"));
    }

    #[test]
    fn test_bridging_conflict_names_both_identities() {
        let store = Arc::new(MemoryIdentityStore::new());
        let r = resolver(store.clone());
        let a = r
            .resolve(&set("primary", &[(IdentifierType::DatasetId, "1")]))
            .unwrap();
        let b = r
            .resolve(&set("primary", &[(IdentifierType::PlatformId, "2")]))
            .unwrap();

        let err = r
            .resolve(&set(
                "primary",
                &[(IdentifierType::DatasetId, "1"), (IdentifierType::PlatformId, "2")],
            ))
            .unwrap_err();
        match err {
            Error::BridgingConflict { research_ids, bridging } => {
                assert_eq!(research_ids.len(), 2);
                assert!(research_ids.contains(&a.research_id));
                assert!(research_ids.contains(&b.research_id));
                assert!(bridging.contains("platform_id=2"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_confidential_only_set_rejected() {
        let store = Arc::new(MemoryIdentityStore::new());
        let r = resolver(store.clone());
        let err = r
            .resolve(&set("primary", &[(IdentifierType::Email, "a@b.org")]))
            .unwrap_err();
        assert!(matches!(err, Error::EmptyWitnessSet { .. }));
        assert_eq!(store.count().unwrap(), 0);
    }

    /// Loses the first `losses` inserts to a phantom competitor that binds
    /// the same values under another id.
    struct RacingStore {
        inner: MemoryIdentityStore,
        losses: AtomicU32,
    }

    impl IdentityStore for RacingStore {
        fn find_matches(&self, pairs: &[(IdentifierType, String)]) -> Result<Vec<CanonicalIdentity>> {
            self.inner.find_matches(pairs)
        }

        fn insert(&self, identity: &CanonicalIdentity) -> Result<()> {
            if self.losses.load(Ordering::SeqCst) > 0 {
                self.losses.fetch_sub(1, Ordering::SeqCst);
                let winner = CanonicalIdentity::new(ResearchId::generate(), identity.values.clone());
                self.inner.insert(&winner)?;
                return Err(Error::UniqueViolation("lost insert".into()));
            }
            self.inner.insert(identity)
        }

        fn fill_slot(&self, id: &ResearchId, t: IdentifierType, v: &str) -> Result<()> {
            self.inner.fill_slot(id, t, v)
        }

        fn lookup(&self, t: IdentifierType, v: &str) -> Result<Option<ResearchId>> {
            self.inner.lookup(t, v)
        }

        fn get(&self, id: &ResearchId) -> Result<Option<CanonicalIdentity>> {
            self.inner.get(id)
        }

        fn all(&self) -> Result<Vec<CanonicalIdentity>> {
            self.inner.all()
        }

        fn count(&self) -> Result<i64> {
            self.inner.count()
        }
    }

    #[test]
    fn test_lost_insert_retries_and_links_to_winner() {
        let store = Arc::new(RacingStore {
            inner: MemoryIdentityStore::new(),
            losses: AtomicU32::new(1),
        });
        let r = resolver(store.clone());
        let res = r
            .resolve(&set("primary", &[(IdentifierType::DatasetId, "500")]))
            .unwrap();
        assert!(!res.created);
        assert_eq!(res.retries, 1);
        assert_eq!(
            store.lookup(IdentifierType::DatasetId, "500").unwrap(),
            Some(res.research_id)
        );
        assert_eq!(store.count().unwrap(), 1);
    }

    /// Always rejects writes as if another writer keeps winning.
    struct HostileStore;

    impl IdentityStore for HostileStore {
        fn find_matches(&self, _: &[(IdentifierType, String)]) -> Result<Vec<CanonicalIdentity>> {
            Ok(Vec::new())
        }
        fn insert(&self, _: &CanonicalIdentity) -> Result<()> {
            Err(Error::UniqueViolation("always".into()))
        }
        fn fill_slot(&self, _: &ResearchId, _: IdentifierType, _: &str) -> Result<()> {
            Err(Error::UniqueViolation("always".into()))
        }
        fn lookup(&self, _: IdentifierType, _: &str) -> Result<Option<ResearchId>> {
            Ok(None)
        }
        fn get(&self, _: &ResearchId) -> Result<Option<CanonicalIdentity>> {
            Ok(None)
        }
        fn all(&self) -> Result<Vec<CanonicalIdentity>> {
            Ok(Vec::new())
        }
        fn count(&self) -> Result<i64> {
            Ok(0)
        }
    }

    #[test]
    fn test_retries_exhausted() {
        let r = resolver(Arc::new(HostileStore));
        let err = r
            .resolve(&set("primary", &[(IdentifierType::DatasetId, "500")]))
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 4, .. }));
    }

    #[test]
    fn test_concurrent_resolvers_agree_on_sqlite() {
        let dir = TempDir::new().unwrap();
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let store: Arc<dyn IdentityStore> =
                    Arc::new(SqliteIdentityStore::open(dir.path()).unwrap());
                std::thread::spawn(move || {
                    resolver(store)
                        .resolve(&set(
                            "primary",
                            &[(IdentifierType::DatasetId, "500"), (IdentifierType::Eppn, "ann@x.edu")],
                        ))
                        .unwrap()
                        .research_id
                })
            })
            .collect();
        let ids: Vec<ResearchId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        let check = SqliteIdentityStore::open(dir.path()).unwrap();
        assert_eq!(check.count().unwrap(), 1);
    }
}
