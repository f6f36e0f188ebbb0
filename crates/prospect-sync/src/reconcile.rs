//! Batch upsert orchestration: insert, update, or preserve each record.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use prospect_core::{IncomingRecord, MatchCandidate, Prospect, SourcedRecord};
use prospect_storage::{prospect_id, ProspectStore, StoreError, WriteSet};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, Instrument};

use crate::cache::SourceCache;
use crate::config::{DuplicateConfig, ReconcileOptions};
use crate::detector::DuplicateDetector;
use crate::similarity::SimilarityScorer;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("batch for source {source_id} aborted after {processed} records")]
    Aborted { source_id: String, processed: usize },
    #[error("record names source {found} but the batch is for {expected}")]
    SourceMismatch { expected: String, found: String },
    #[error("worker for source {source_id} failed: {message}")]
    Worker { source_id: String, message: String },
}

/// Counters reported for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub processed: usize,
    pub matched: usize,
    pub inserted: usize,
    pub duplicates_prevented: usize,
    pub ai_preserved: usize,
    pub in_batch_duplicates: usize,
}

/// Cooperative cancellation flag, checked between records.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drop records whose primary id was already produced earlier in the batch.
///
/// Returns the surviving `(id, record)` pairs in input order and the number of
/// records dropped.
pub fn dedupe_batch(source_id: &str, records: Vec<IncomingRecord>) -> (Vec<(String, IncomingRecord)>, usize) {
    let mut seen = HashSet::with_capacity(records.len());
    let mut unique = Vec::with_capacity(records.len());
    let mut dropped = 0usize;
    for record in records {
        let id = prospect_id(source_id, &record);
        if seen.insert(id.clone()) {
            unique.push((id, record));
        } else {
            dropped += 1;
        }
    }
    (unique, dropped)
}

#[derive(Default)]
struct StagedWrites {
    inserts: Vec<Prospect>,
    updates: BTreeMap<String, Prospect>,
}

impl StagedWrites {
    fn into_write_set(self) -> WriteSet {
        WriteSet {
            inserts: self.inserts,
            updates: self.updates.into_values().collect(),
        }
    }
}

/// Reconciles batches for one worker.
///
/// Owns its source cache; run one reconciler per concurrent worker. The
/// similarity scorer may be shared.
pub struct ProspectReconciler {
    store: Arc<dyn ProspectStore>,
    detector: DuplicateDetector,
    cache: SourceCache,
    options: ReconcileOptions,
}

impl ProspectReconciler {
    pub fn new(store: Arc<dyn ProspectStore>, config: DuplicateConfig, options: ReconcileOptions) -> Self {
        let scorer = Arc::new(SimilarityScorer::new(config.similarity_cache_capacity));
        Self::with_scorer(store, config, options, scorer)
    }

    pub fn with_scorer(
        store: Arc<dyn ProspectStore>,
        config: DuplicateConfig,
        options: ReconcileOptions,
        scorer: Arc<SimilarityScorer>,
    ) -> Self {
        Self::with_detector(store, DuplicateDetector::new(config, scorer), options)
    }

    pub fn with_detector(store: Arc<dyn ProspectStore>, detector: DuplicateDetector, options: ReconcileOptions) -> Self {
        let cache = SourceCache::new(detector.config().fuzzy_scan_limit);
        Self {
            store,
            detector,
            cache,
            options,
        }
    }

    pub fn options(&self) -> ReconcileOptions {
        self.options
    }

    pub fn cache(&self) -> &SourceCache {
        &self.cache
    }

    /// Load (or reuse) the source cache for `source_id`.
    pub async fn preload(&mut self, source_id: &str) -> Result<(), ReconcileError> {
        self.cache.preload(self.store.as_ref(), source_id).await?;
        Ok(())
    }

    /// Ranked candidates for one record without staging any writes.
    pub async fn find_candidates(
        &mut self,
        source_id: &str,
        record: &IncomingRecord,
    ) -> Result<Vec<MatchCandidate>, ReconcileError> {
        let source_id = source_id.trim();
        self.preload(source_id).await?;
        Ok(self
            .detector
            .find_candidates(SourcedRecord::new(source_id, record), &self.cache))
    }

    /// Reconcile one batch and commit it as a single write set.
    ///
    /// `source_id` is trimmed once here; ids, cache keys and stored rows all
    /// use the trimmed value.
    pub async fn reconcile_batch(
        &mut self,
        source_id: &str,
        records: Vec<IncomingRecord>,
        abort: &AbortSignal,
    ) -> Result<BatchStats, ReconcileError> {
        let source_id = source_id.trim();
        let span = info_span!(
            "reconcile_batch",
            source_id,
            records = records.len(),
            smart_matching = self.options.enable_smart_matching,
            preserve_ai_data = self.options.preserve_ai_data
        );
        self.reconcile_batch_inner(source_id, records, abort)
            .instrument(span)
            .await
    }

    async fn reconcile_batch_inner(
        &mut self,
        source_id: &str,
        records: Vec<IncomingRecord>,
        abort: &AbortSignal,
    ) -> Result<BatchStats, ReconcileError> {
        check_sources(source_id, &records)?;

        let (unique, dropped) = dedupe_batch(source_id, records);
        if dropped > 0 {
            info!(dropped, "dropped in-batch duplicates");
        }
        let mut stats = BatchStats {
            in_batch_duplicates: dropped,
            ..Default::default()
        };
        let now = Utc::now();

        let staged = if self.options.enable_smart_matching {
            self.preload(source_id).await?;
            self.stage_with_detector(source_id, unique, abort, now, &mut stats)
                .await?
        } else {
            self.stage_bulk(source_id, unique, abort, now, &mut stats).await?
        };

        let writes = staged.into_write_set();
        if !writes.is_empty() {
            let inserts = writes.inserts.len();
            let updates = writes.updates.len();
            if let Err(err) = self.store.commit(writes).await {
                error!(error = %err, inserts, updates, "batch commit failed; rolled back");
                return Err(err.into());
            }
        }
        self.cache.invalidate();

        info!(
            processed = stats.processed,
            matched = stats.matched,
            inserted = stats.inserted,
            duplicates_prevented = stats.duplicates_prevented,
            ai_preserved = stats.ai_preserved,
            "batch reconciled"
        );
        Ok(stats)
    }

    async fn stage_with_detector(
        &self,
        source_id: &str,
        unique: Vec<(String, IncomingRecord)>,
        abort: &AbortSignal,
        now: DateTime<Utc>,
        stats: &mut BatchStats,
    ) -> Result<StagedWrites, ReconcileError> {
        let mut staged = StagedWrites::default();

        for (id, record) in unique {
            check_abort(abort, source_id, stats)?;
            stats.processed += 1;

            let direct = match staged.updates.remove(&id) {
                Some(prospect) => Some(prospect),
                None => self.store.get_by_id(&id).await?,
            };
            if let Some(mut prospect) = direct {
                self.apply_update(&mut prospect, &record, now, stats);
                stats.matched += 1;
                staged.updates.insert(id, prospect);
                continue;
            }

            let sourced = SourcedRecord::new(source_id, &record);
            let target = self.detector.best_match(sourced, &self.cache).and_then(|candidate| {
                let prospect = staged
                    .updates
                    .remove(&candidate.prospect_id)
                    .or_else(|| self.cache.get(&candidate.prospect_id).cloned())?;
                Some((candidate, prospect))
            });

            match target {
                Some((candidate, mut prospect)) => {
                    debug!(
                        prospect_id = %candidate.prospect_id,
                        confidence = candidate.confidence_score,
                        match_type = ?candidate.match_type,
                        "merged into existing prospect"
                    );
                    self.apply_update(&mut prospect, &record, now, stats);
                    stats.matched += 1;
                    stats.duplicates_prevented += 1;
                    staged.updates.insert(prospect.id.clone(), prospect);
                }
                None => {
                    staged.inserts.push(Prospect::from_record(id, source_id, &record, now));
                    stats.inserted += 1;
                }
            }
        }
        Ok(staged)
    }

    async fn stage_bulk(
        &self,
        source_id: &str,
        unique: Vec<(String, IncomingRecord)>,
        abort: &AbortSignal,
        now: DateTime<Utc>,
        stats: &mut BatchStats,
    ) -> Result<StagedWrites, ReconcileError> {
        let ids = unique.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>();
        let mut existing = self
            .store
            .get_many(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect::<HashMap<_, _>>();
        debug!(existing = existing.len(), candidates = ids.len(), "bulk existence check");

        let mut staged = StagedWrites::default();
        for (id, record) in unique {
            check_abort(abort, source_id, stats)?;
            stats.processed += 1;
            match existing.remove(&id) {
                Some(mut prospect) => {
                    self.apply_update(&mut prospect, &record, now, stats);
                    stats.matched += 1;
                    staged.updates.insert(id, prospect);
                }
                None => {
                    staged.inserts.push(Prospect::from_record(id, source_id, &record, now));
                    stats.inserted += 1;
                }
            }
        }
        Ok(staged)
    }

    fn apply_update(&self, prospect: &mut Prospect, record: &IncomingRecord, now: DateTime<Utc>, stats: &mut BatchStats) {
        let outcome = prospect.apply_record(record, self.options.preserve_ai_data, now);
        if outcome.protected_preserved {
            stats.ai_preserved += 1;
        }
    }
}

fn check_sources(source_id: &str, records: &[IncomingRecord]) -> Result<(), ReconcileError> {
    let mismatch = records.iter().find_map(|r| {
        let found = r.source_id.as_deref()?.trim();
        (!found.is_empty() && found != source_id).then(|| found.to_string())
    });
    match mismatch {
        Some(found) => Err(ReconcileError::SourceMismatch {
            expected: source_id.to_string(),
            found,
        }),
        None => Ok(()),
    }
}

fn check_abort(abort: &AbortSignal, source_id: &str, stats: &BatchStats) -> Result<(), ReconcileError> {
    if abort.is_aborted() {
        return Err(ReconcileError::Aborted {
            source_id: source_id.to_string(),
            processed: stats.processed,
        });
    }
    Ok(())
}

/// One source's records for [`reconcile_sources`].
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub source_id: String,
    pub records: Vec<IncomingRecord>,
}

/// Reconcile several batches concurrently, one task per source.
///
/// Batches naming the same source run one after another inside that source's
/// task. Every task owns its reconciler; only the similarity scorer is
/// shared. Results come back in input order.
pub async fn reconcile_sources(
    store: Arc<dyn ProspectStore>,
    config: DuplicateConfig,
    options: ReconcileOptions,
    batches: Vec<SourceBatch>,
    abort: AbortSignal,
) -> Vec<(String, Result<BatchStats, ReconcileError>)> {
    let scorer = Arc::new(SimilarityScorer::new(config.similarity_cache_capacity));

    let mut by_source: BTreeMap<String, Vec<(usize, Vec<IncomingRecord>)>> = BTreeMap::new();
    let total = batches.len();
    for (idx, batch) in batches.into_iter().enumerate() {
        by_source
            .entry(batch.source_id.trim().to_string())
            .or_default()
            .push((idx, batch.records));
    }

    let mut handles = Vec::with_capacity(by_source.len());
    for (source_id, queue) in by_source {
        let store = Arc::clone(&store);
        let scorer = Arc::clone(&scorer);
        let abort = abort.clone();
        let indices = queue.iter().map(|(idx, _)| *idx).collect::<Vec<_>>();
        let task_source = source_id.clone();
        let handle = tokio::spawn(async move {
            let mut reconciler = ProspectReconciler::with_scorer(store, config, options, scorer);
            let mut out = Vec::with_capacity(queue.len());
            for (idx, records) in queue {
                let result = reconciler.reconcile_batch(&task_source, records, &abort).await;
                out.push((idx, result));
            }
            out
        });
        handles.push((source_id, indices, handle));
    }

    let mut results: Vec<Option<(String, Result<BatchStats, ReconcileError>)>> =
        (0..total).map(|_| None).collect();
    for (source_id, indices, handle) in handles {
        match handle.await {
            Ok(outcomes) => {
                for (idx, result) in outcomes {
                    results[idx] = Some((source_id.clone(), result));
                }
            }
            Err(join_err) => {
                error!(source_id = %source_id, error = %join_err, "reconcile worker failed");
                for idx in indices {
                    results[idx] = Some((
                        source_id.clone(),
                        Err(ReconcileError::Worker {
                            source_id: source_id.clone(),
                            message: join_err.to_string(),
                        }),
                    ));
                }
            }
        }
    }
    results.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(native_id: &str, title: &str) -> IncomingRecord {
        IncomingRecord {
            native_id: Some(native_id.into()),
            title: Some(title.into()),
            ..Default::default()
        }
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let mut second = rec("A", "Help Desk");
        second.extra.insert("row".into(), serde_json::json!(2));
        let records = vec![rec("A", "Help Desk"), rec("B", "Janitorial"), second];

        let (unique, dropped) = dedupe_batch("gsa", records);

        assert_eq!(dropped, 1);
        assert_eq!(unique.len(), 2);
        assert!(unique[0].1.extra.is_empty());
        assert_eq!(unique[1].1.native_id.as_deref(), Some("B"));
    }

    #[test]
    fn source_mismatch_is_rejected() {
        let mut foreign = rec("A", "Help Desk");
        foreign.source_id = Some("doe".into());
        let err = check_sources("dod", &[rec("B", "x"), foreign]).expect_err("mismatch");
        assert!(matches!(err, ReconcileError::SourceMismatch { found, .. } if found == "doe"));

        let mut same = rec("A", "Help Desk");
        same.source_id = Some("dod".into());
        assert!(check_sources("dod", &[same]).is_ok());
    }

    #[test]
    fn abort_signal_is_shared_between_clones() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_aborted());
        clone.abort();
        assert!(signal.is_aborted());
    }
}
