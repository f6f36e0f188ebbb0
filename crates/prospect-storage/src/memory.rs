//! In-process store with whole-write-set atomicity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use prospect_core::Prospect;
use tokio::sync::RwLock;

use crate::{ProspectStore, StoreError, WriteSet};

#[derive(Debug, Clone, Default)]
pub struct MemoryProspectStore {
    rows: Arc<RwLock<HashMap<String, Prospect>>>,
}

impl MemoryProspectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prospects(prospects: impl IntoIterator<Item = Prospect>) -> Self {
        let rows = prospects
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect::<HashMap<_, _>>();
        Self {
            rows: Arc::new(RwLock::new(rows)),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// All rows ordered by id.
    pub async fn snapshot(&self) -> Vec<Prospect> {
        let mut rows = self.rows.read().await.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }
}

#[async_trait]
impl ProspectStore for MemoryProspectStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Prospect>, StoreError> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Prospect>, StoreError> {
        let rows = self.rows.read().await;
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn list_by_source(&self, source_id: &str) -> Result<Vec<Prospect>, StoreError> {
        let mut out = self
            .rows
            .read()
            .await
            .values()
            .filter(|p| p.source_id == source_id)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn commit(&self, writes: WriteSet) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;

        let mut staged_ids = HashSet::with_capacity(writes.inserts.len());
        for prospect in &writes.inserts {
            if rows.contains_key(&prospect.id) || !staged_ids.insert(prospect.id.as_str()) {
                return Err(StoreError::DuplicateId(prospect.id.clone()));
            }
        }
        for prospect in &writes.updates {
            if !rows.contains_key(&prospect.id) {
                return Err(StoreError::MissingProspect(prospect.id.clone()));
            }
        }

        for prospect in writes.inserts.into_iter().chain(writes.updates) {
            rows.insert(prospect.id.clone(), prospect);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use prospect_core::IncomingRecord;

    fn prospect(id: &str, source_id: &str, hour: u32) -> Prospect {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap();
        let record = IncomingRecord {
            title: Some(format!("Opportunity {id}")),
            ..Default::default()
        };
        Prospect::from_record(id, source_id, &record, at)
    }

    #[tokio::test]
    async fn list_by_source_is_scoped_and_ordered() {
        let store = MemoryProspectStore::with_prospects([
            prospect("c", "dod", 3),
            prospect("a", "dod", 5),
            prospect("b", "doe", 1),
        ]);

        let ids = store
            .list_by_source("dod")
            .await
            .expect("list")
            .into_iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn get_many_skips_unknown_ids() {
        let store = MemoryProspectStore::with_prospects([prospect("a", "dod", 1)]);
        let found = store
            .get_many(&["a".to_string(), "zzz".to_string()])
            .await
            .expect("get_many");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[tokio::test]
    async fn commit_applies_inserts_and_updates() {
        let store = MemoryProspectStore::with_prospects([prospect("a", "dod", 1)]);
        let mut updated = prospect("a", "dod", 1);
        updated.title = Some("Renamed".into());

        store
            .commit(WriteSet {
                inserts: vec![prospect("b", "dod", 2)],
                updates: vec![updated],
            })
            .await
            .expect("commit");

        assert_eq!(store.len().await, 2);
        let a = store.get_by_id("a").await.expect("get").expect("row");
        assert_eq!(a.title.as_deref(), Some("Renamed"));
    }

    #[tokio::test]
    async fn failed_commit_leaves_store_untouched() {
        let store = MemoryProspectStore::with_prospects([prospect("a", "dod", 1)]);

        let err = store
            .commit(WriteSet {
                inserts: vec![prospect("b", "dod", 2), prospect("a", "dod", 2)],
                updates: vec![],
            })
            .await
            .expect_err("duplicate insert");
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "a"));
        assert_eq!(store.len().await, 1);

        let err = store
            .commit(WriteSet {
                inserts: vec![prospect("c", "dod", 2)],
                updates: vec![prospect("missing", "dod", 2)],
            })
            .await
            .expect_err("missing update target");
        assert!(matches!(err, StoreError::MissingProspect(_)));
        assert!(store.get_by_id("c").await.expect("get").is_none());
    }
}
