//! Single-slot, per-source index over persisted prospects.

use std::collections::HashMap;

use prospect_core::{Prospect, RecordField};
use prospect_storage::{ProspectStore, StoreError};
use tracing::{debug, info};

type LocationKey = (String, String, String);

/// In-memory indices over one source's prospects, rebuilt once per batch.
///
/// Posting lists hold prospect ids; a dangling id means the indices and
/// `prospects` went out of sync.
#[derive(Debug, Default)]
pub struct SourceCache {
    source_id: Option<String>,
    stale: bool,
    scan_limit: usize,
    prospects: Vec<Prospect>,
    by_id: HashMap<String, usize>,
    by_native_id: HashMap<String, Vec<String>>,
    by_naics_location: HashMap<LocationKey, Vec<String>>,
    by_agency_location: HashMap<LocationKey, Vec<String>>,
}

impl SourceCache {
    pub fn new(scan_limit: usize) -> Self {
        Self {
            scan_limit,
            ..Default::default()
        }
    }

    /// Build directly from already-loaded prospects.
    pub fn build(source_id: &str, prospects: Vec<Prospect>, scan_limit: usize) -> Self {
        let mut cache = Self::new(scan_limit);
        cache.rebuild(source_id, prospects);
        cache
    }

    /// Make sure the cache holds `source_id`, querying the store only when the
    /// active source changed or the cache was invalidated. Returns whether a
    /// rebuild happened.
    pub async fn preload(
        &mut self,
        store: &dyn ProspectStore,
        source_id: &str,
    ) -> Result<bool, StoreError> {
        if !self.stale && self.source_id.as_deref() == Some(source_id) {
            debug!(source_id, cached = self.prospects.len(), "source cache hit");
            return Ok(false);
        }
        let prospects = store.list_by_source(source_id).await?;
        self.rebuild(source_id, prospects);
        info!(
            source_id,
            prospects = self.prospects.len(),
            native_ids = self.by_native_id.len(),
            "source cache built"
        );
        Ok(true)
    }

    /// Force the next `preload` to hit the store.
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn len(&self) -> usize {
        self.prospects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prospects.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Prospect> {
        self.by_id.get(id).and_then(|&idx| self.prospects.get(idx))
    }

    pub fn native_id_postings(&self, native_id: &str) -> &[String] {
        postings(&self.by_native_id, native_id.trim())
    }

    pub fn naics_location_postings(&self, naics: &str, city: &str, state: &str) -> &[String] {
        let key = (naics.trim().to_string(), fold(city), fold(state));
        self.by_naics_location
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn agency_location_postings(&self, agency: &str, city: &str, state: &str) -> &[String] {
        let key = (agency.trim().to_string(), fold(city), fold(state));
        self.by_agency_location
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The bounded flat list scanned by content-only matching.
    pub fn scan_window(&self) -> &[Prospect] {
        let end = self.prospects.len().min(self.scan_limit);
        &self.prospects[..end]
    }

    fn rebuild(&mut self, source_id: &str, prospects: Vec<Prospect>) {
        self.source_id = Some(source_id.to_string());
        self.stale = false;
        self.by_id.clear();
        self.by_native_id.clear();
        self.by_naics_location.clear();
        self.by_agency_location.clear();

        for (idx, prospect) in prospects.iter().enumerate() {
            self.by_id.insert(prospect.id.clone(), idx);

            if let Some(native_id) = prospect.field(RecordField::NativeId) {
                self.by_native_id
                    .entry(native_id.to_string())
                    .or_default()
                    .push(prospect.id.clone());
            }

            let city = prospect.field(RecordField::PlaceCity);
            let state = prospect.field(RecordField::PlaceState);
            let (Some(city), Some(state)) = (city, state) else {
                continue;
            };
            if let Some(naics) = prospect.field(RecordField::Naics) {
                self.by_naics_location
                    .entry((naics.to_string(), fold(city), fold(state)))
                    .or_default()
                    .push(prospect.id.clone());
            }
            if let Some(agency) = prospect.field(RecordField::Agency) {
                self.by_agency_location
                    .entry((agency.to_string(), fold(city), fold(state)))
                    .or_default()
                    .push(prospect.id.clone());
            }
        }
        self.prospects = prospects;
    }
}

fn postings<'a>(index: &'a HashMap<String, Vec<String>>, key: &str) -> &'a [String] {
    index.get(key).map(Vec::as_slice).unwrap_or_default()
}

fn fold(value: &str) -> String {
    value.trim().to_lowercase()
}
