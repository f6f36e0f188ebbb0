//! Runs the strategy cascade and ranks candidates.

use std::collections::HashMap;
use std::sync::Arc;

use prospect_core::{MatchCandidate, MatchType, SourcedRecord};
use tracing::{trace, warn};

use crate::cache::SourceCache;
use crate::config::DuplicateConfig;
use crate::similarity::SimilarityScorer;
use crate::strategies::{default_strategies, MatchStrategy, StrategyContext, StrategySpec};

pub struct DuplicateDetector {
    strategies: Vec<Box<dyn MatchStrategy>>,
    scorer: Arc<SimilarityScorer>,
    config: DuplicateConfig,
}

impl DuplicateDetector {
    pub fn new(config: DuplicateConfig, scorer: Arc<SimilarityScorer>) -> Self {
        Self::with_strategies(config, scorer, default_strategies())
    }

    pub fn with_strategies(
        config: DuplicateConfig,
        scorer: Arc<SimilarityScorer>,
        strategies: Vec<Box<dyn MatchStrategy>>,
    ) -> Self {
        Self {
            strategies,
            scorer,
            config,
        }
    }

    pub fn config(&self) -> &DuplicateConfig {
        &self.config
    }

    pub fn scorer(&self) -> &Arc<SimilarityScorer> {
        &self.scorer
    }

    pub fn strategy_specs(&self) -> impl Iterator<Item = &StrategySpec> {
        self.strategies.iter().map(|s| s.spec())
    }

    /// All candidates for `record`, one per prospect, highest confidence first.
    ///
    /// Strategies missing a required field are skipped; a failing strategy is
    /// logged and the rest still run.
    pub fn find_candidates(&self, record: SourcedRecord<'_>, cache: &SourceCache) -> Vec<MatchCandidate> {
        let ctx = StrategyContext {
            scorer: &self.scorer,
            config: &self.config,
        };
        let mut best: HashMap<String, MatchCandidate> = HashMap::new();

        for strategy in &self.strategies {
            let spec = strategy.spec();
            if !record.has_all(spec.required_fields) {
                trace!(strategy = spec.name, "required fields missing; skipped");
                continue;
            }
            let found = match strategy.evaluate(record, cache, &ctx) {
                Ok(found) => found,
                Err(err) => {
                    warn!(strategy = spec.name, error = %err, "matching strategy failed");
                    continue;
                }
            };
            trace!(strategy = spec.name, candidates = found.len(), "strategy evaluated");
            for candidate in found {
                merge_candidate(&mut best, candidate);
            }
        }

        let mut ranked = best.into_values().collect::<Vec<_>>();
        ranked.sort_by(|a, b| {
            b.confidence_score
                .total_cmp(&a.confidence_score)
                .then_with(|| a.prospect_id.cmp(&b.prospect_id))
        });
        ranked
    }

    /// The top candidate, if it clears the global acceptance threshold.
    pub fn best_match(&self, record: SourcedRecord<'_>, cache: &SourceCache) -> Option<MatchCandidate> {
        self.find_candidates(record, cache)
            .into_iter()
            .next()
            .filter(|c| c.confidence_score >= self.config.min_confidence)
    }
}

fn merge_candidate(best: &mut HashMap<String, MatchCandidate>, candidate: MatchCandidate) {
    match best.get_mut(&candidate.prospect_id) {
        Some(current) => {
            current.matched_fields.extend(candidate.matched_fields);
            if candidate.confidence_score > current.confidence_score {
                current.confidence_score = candidate.confidence_score;
                current.match_type = MatchType::from_confidence(candidate.confidence_score);
            }
        }
        None => {
            best.insert(candidate.prospect_id.clone(), candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::StrategyError;
    use chrono::{TimeZone, Utc};
    use prospect_core::{IncomingRecord, Prospect, RecordField};

    struct Fixed {
        spec: StrategySpec,
        result: Result<Vec<(&'static str, f64, RecordField)>, &'static str>,
    }

    impl MatchStrategy for Fixed {
        fn spec(&self) -> &StrategySpec {
            &self.spec
        }

        fn evaluate(
            &self,
            _record: SourcedRecord<'_>,
            _cache: &SourceCache,
            _ctx: &StrategyContext<'_>,
        ) -> Result<Vec<MatchCandidate>, StrategyError> {
            match &self.result {
                Ok(items) => Ok(items
                    .iter()
                    .map(|(id, score, field)| MatchCandidate::new(*id, *score, [*field]))
                    .collect()),
                Err(id) => Err(StrategyError::DanglingEntry {
                    prospect_id: id.to_string(),
                }),
            }
        }
    }

    fn fixed(
        name: &'static str,
        required: &'static [RecordField],
        result: Result<Vec<(&'static str, f64, RecordField)>, &'static str>,
    ) -> Box<dyn MatchStrategy> {
        Box::new(Fixed {
            spec: StrategySpec {
                name,
                weight: 1.0,
                min_confidence: 0.0,
                required_fields: required,
                optional_fields: &[],
            },
            result,
        })
    }

    fn detector(strategies: Vec<Box<dyn MatchStrategy>>) -> DuplicateDetector {
        DuplicateDetector::with_strategies(
            DuplicateConfig::default(),
            Arc::new(SimilarityScorer::new(64)),
            strategies,
        )
    }

    fn titled(title: &str) -> IncomingRecord {
        IncomingRecord {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    #[test]
    fn keeps_max_confidence_per_prospect_and_sorts_descending() {
        let detector = detector(vec![
            fixed(
                "one",
                &[],
                Ok(vec![("a", 0.4, RecordField::NativeId), ("b", 0.7, RecordField::Title)]),
            ),
            fixed("two", &[], Ok(vec![("a", 0.9, RecordField::Agency)])),
        ]);
        let record = titled("Anything");
        let cache = SourceCache::new(10);

        let ranked = detector.find_candidates(SourcedRecord::new("dod", &record), &cache);

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].prospect_id, "a");
        assert_eq!(ranked[0].confidence_score, 0.9);
        assert_eq!(ranked[0].match_type, MatchType::Strong);
        assert!(ranked[0].matched_fields.contains(&RecordField::NativeId));
        assert!(ranked[0].matched_fields.contains(&RecordField::Agency));
        assert_eq!(ranked[1].prospect_id, "b");
    }

    #[test]
    fn failing_strategy_does_not_stop_the_cascade() {
        let detector = detector(vec![
            fixed("broken", &[], Err("gone")),
            fixed("healthy", &[], Ok(vec![("a", 0.88, RecordField::Title)])),
        ]);
        let record = titled("Anything");
        let ranked = detector.find_candidates(SourcedRecord::new("dod", &record), &SourceCache::new(10));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].prospect_id, "a");
    }

    #[test]
    fn strategies_missing_required_fields_are_skipped() {
        let detector = detector(vec![fixed(
            "needs_native_id",
            &[RecordField::NativeId],
            Ok(vec![("a", 0.99, RecordField::NativeId)]),
        )]);
        let record = titled("No native id here");
        assert!(detector
            .find_candidates(SourcedRecord::new("dod", &record), &SourceCache::new(10))
            .is_empty());
    }

    #[test]
    fn best_match_applies_global_threshold() {
        let detector = detector(vec![fixed("one", &[], Ok(vec![("a", 0.84, RecordField::Title)]))]);
        let record = titled("Anything");
        let cache = SourceCache::new(10);
        assert!(detector
            .best_match(SourcedRecord::new("dod", &record), &cache)
            .is_none());
    }

    #[test]
    fn default_cascade_runs_all_five_strategies_in_order() {
        let detector = DuplicateDetector::new(DuplicateConfig::default(), Arc::new(SimilarityScorer::new(64)));
        let names = detector.strategy_specs().map(|s| s.name).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "exact_native_id",
                "native_id_title_fuzzy",
                "naics_location_title",
                "agency_location_content",
                "fuzzy_content"
            ]
        );
    }

    #[test]
    fn default_cascade_scores_stay_in_unit_range() {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();
        let stored = IncomingRecord {
            native_id: Some("X".into()),
            title: Some("Software Engineer".into()),
            description: Some("Python role".into()),
            agency: Some("DoD".into()),
            place_city: Some("Washington".into()),
            place_state: Some("DC".into()),
            ..Default::default()
        };
        let cache = SourceCache::build(
            "dod",
            vec![Prospect::from_record("a", "dod", &stored, at)],
            1000,
        );
        let detector = DuplicateDetector::new(DuplicateConfig::default(), Arc::new(SimilarityScorer::new(64)));

        for title in ["Software Engineer", "Sr. Software Engineer", "Network Administrator", "SE"] {
            let mut incoming = stored.clone();
            incoming.title = Some(title.into());
            for candidate in detector.find_candidates(SourcedRecord::new("dod", &incoming), &cache) {
                assert!((0.0..=1.0).contains(&candidate.confidence_score));
            }
        }
    }
}
