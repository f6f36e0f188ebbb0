//! The fixed cascade of matching strategies.
//!
//! Each strategy sees the incoming record (with its batch source) and the
//! source cache, and emits candidates that clear its own `min_confidence`.
//! The detector decides which strategies run; a strategy never has to check
//! its `required_fields` itself.

use prospect_core::{MatchCandidate, Prospect, RecordField, SourcedRecord};
use thiserror::Error;

use crate::cache::SourceCache;
use crate::config::DuplicateConfig;
use crate::similarity::SimilarityScorer;

/// Static description of a strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategySpec {
    pub name: &'static str,
    pub weight: f64,
    pub min_confidence: f64,
    pub required_fields: &'static [RecordField],
    pub optional_fields: &'static [RecordField],
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("index entry {prospect_id} has no cached prospect")]
    DanglingEntry { prospect_id: String },
}

/// Shared read-only inputs for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub scorer: &'a SimilarityScorer,
    pub config: &'a DuplicateConfig,
}

pub trait MatchStrategy: Send + Sync {
    fn spec(&self) -> &StrategySpec;

    fn evaluate(
        &self,
        record: SourcedRecord<'_>,
        cache: &SourceCache,
        ctx: &StrategyContext<'_>,
    ) -> Result<Vec<MatchCandidate>, StrategyError>;
}

/// The five strategies in cascade order.
pub fn default_strategies() -> Vec<Box<dyn MatchStrategy>> {
    vec![
        Box::new(ExactNativeId),
        Box::new(NativeIdTitleFuzzy),
        Box::new(NaicsLocationTitle),
        Box::new(AgencyLocationContent),
        Box::new(FuzzyContent),
    ]
}

pub const EXACT_NATIVE_ID: StrategySpec = StrategySpec {
    name: "exact_native_id",
    weight: 1.0,
    min_confidence: 0.3,
    required_fields: &[RecordField::NativeId, RecordField::Source],
    optional_fields: &[
        RecordField::Title,
        RecordField::Description,
        RecordField::Agency,
        RecordField::PlaceCity,
        RecordField::PlaceState,
    ],
};

pub const NATIVE_ID_TITLE_FUZZY: StrategySpec = StrategySpec {
    name: "native_id_title_fuzzy",
    weight: 0.9,
    min_confidence: 0.7,
    required_fields: &[RecordField::NativeId, RecordField::Title],
    optional_fields: &[],
};

pub const NAICS_LOCATION_TITLE: StrategySpec = StrategySpec {
    name: "naics_location_title",
    weight: 0.85,
    min_confidence: 0.6,
    required_fields: &[
        RecordField::Naics,
        RecordField::PlaceCity,
        RecordField::PlaceState,
        RecordField::Title,
    ],
    optional_fields: &[],
};

pub const AGENCY_LOCATION_CONTENT: StrategySpec = StrategySpec {
    name: "agency_location_content",
    weight: 0.8,
    min_confidence: 0.6,
    required_fields: &[RecordField::Agency, RecordField::PlaceCity, RecordField::PlaceState],
    optional_fields: &[RecordField::Title, RecordField::Description],
};

pub const FUZZY_CONTENT: StrategySpec = StrategySpec {
    name: "fuzzy_content",
    weight: 0.9,
    min_confidence: 0.7,
    required_fields: &[RecordField::Title],
    optional_fields: &[RecordField::Description],
};

const NAICS_LOCATION_TITLE_GATE: f64 = 0.6;
const AGENCY_LOCATION_CONTENT_GATE: f64 = 0.8;
const CONTRIBUTING_FIELD_SIM: f64 = 0.5;

/// Per-field similarities feeding the exact_native_id score.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContentSimilarity {
    pub title: f64,
    pub description: f64,
    pub agency: f64,
    pub location: f64,
}

impl ContentSimilarity {
    pub fn measure(scorer: &SimilarityScorer, record: SourcedRecord<'_>, existing: &Prospect) -> Self {
        let sim = |field| scorer.similarity(record.field(field), existing.field(field));
        Self {
            title: sim(RecordField::Title),
            description: sim(RecordField::Description),
            agency: sim(RecordField::Agency),
            location: (sim(RecordField::PlaceCity) + sim(RecordField::PlaceState)) / 2.0,
        }
    }

    pub fn blended(&self) -> f64 {
        self.title * 0.4 + self.description * 0.3 + self.agency * 0.2 + self.location * 0.1
    }
}

/// Confidence for two records sharing a native id.
///
/// A tiered base picked from title and blended similarity is lifted by the
/// blend itself, then cut back when the content barely overlaps: halved when
/// both title and description are near zero, and reduced again when the title
/// falls under `min_content_sim`.
pub fn exact_native_id_confidence(sims: &ContentSimilarity, weight: f64, min_content_sim: f64) -> f64 {
    let blended = sims.blended();
    let base = if sims.title >= 0.8 {
        0.4
    } else if sims.title >= 0.6 || blended >= 0.6 {
        0.3
    } else if blended >= 0.4 {
        0.2
    } else {
        0.1
    };

    let mut confidence = (0.5 + base + 0.1 * blended) * weight;
    if sims.title < 0.1 && sims.description < 0.1 {
        confidence *= 0.5;
    }
    if sims.title < min_content_sim {
        confidence *= 0.7;
    }
    confidence.clamp(0.0, 1.0)
}

pub struct ExactNativeId;

impl MatchStrategy for ExactNativeId {
    fn spec(&self) -> &StrategySpec {
        &EXACT_NATIVE_ID
    }

    fn evaluate(
        &self,
        record: SourcedRecord<'_>,
        cache: &SourceCache,
        ctx: &StrategyContext<'_>,
    ) -> Result<Vec<MatchCandidate>, StrategyError> {
        let Some(native_id) = record.field(RecordField::NativeId) else {
            return Ok(Vec::new());
        };
        let spec = self.spec();
        let mut out = Vec::new();
        for existing in resolve(cache, cache.native_id_postings(native_id))? {
            let sims = ContentSimilarity::measure(ctx.scorer, record, existing);
            let confidence =
                exact_native_id_confidence(&sims, spec.weight, ctx.config.native_id_min_content_sim);

            let mut fields = vec![RecordField::Source, RecordField::NativeId];
            for (field, score) in [
                (RecordField::Title, sims.title),
                (RecordField::Description, sims.description),
                (RecordField::Agency, sims.agency),
            ] {
                if score >= CONTRIBUTING_FIELD_SIM {
                    fields.push(field);
                }
            }
            if sims.location >= CONTRIBUTING_FIELD_SIM {
                fields.extend([RecordField::PlaceCity, RecordField::PlaceState]);
            }
            out.extend(emit(spec, &existing.id, confidence, fields));
        }
        Ok(out)
    }
}

pub struct NativeIdTitleFuzzy;

impl MatchStrategy for NativeIdTitleFuzzy {
    fn spec(&self) -> &StrategySpec {
        &NATIVE_ID_TITLE_FUZZY
    }

    fn evaluate(
        &self,
        record: SourcedRecord<'_>,
        cache: &SourceCache,
        ctx: &StrategyContext<'_>,
    ) -> Result<Vec<MatchCandidate>, StrategyError> {
        let Some(native_id) = record.field(RecordField::NativeId) else {
            return Ok(Vec::new());
        };
        let spec = self.spec();
        let mut out = Vec::new();
        for existing in resolve(cache, cache.native_id_postings(native_id))? {
            let title_sim = title_similarity(ctx, record, existing);
            if title_sim < ctx.config.title_similarity_threshold {
                continue;
            }
            let confidence = 0.4 + title_sim * 0.6 * spec.weight;
            out.extend(emit(
                spec,
                &existing.id,
                confidence,
                [RecordField::NativeId, RecordField::Title],
            ));
        }
        Ok(out)
    }
}

pub struct NaicsLocationTitle;

impl MatchStrategy for NaicsLocationTitle {
    fn spec(&self) -> &StrategySpec {
        &NAICS_LOCATION_TITLE
    }

    fn evaluate(
        &self,
        record: SourcedRecord<'_>,
        cache: &SourceCache,
        ctx: &StrategyContext<'_>,
    ) -> Result<Vec<MatchCandidate>, StrategyError> {
        let (Some(naics), Some(city), Some(state)) = (
            record.field(RecordField::Naics),
            record.field(RecordField::PlaceCity),
            record.field(RecordField::PlaceState),
        ) else {
            return Ok(Vec::new());
        };
        let spec = self.spec();
        let mut out = Vec::new();
        for existing in resolve(cache, cache.naics_location_postings(naics, city, state))? {
            let title_sim = title_similarity(ctx, record, existing);
            if title_sim < NAICS_LOCATION_TITLE_GATE {
                continue;
            }
            let confidence = 0.6 * spec.weight + title_sim * 0.4 * spec.weight;
            out.extend(emit(
                spec,
                &existing.id,
                confidence,
                [
                    RecordField::Naics,
                    RecordField::PlaceCity,
                    RecordField::PlaceState,
                    RecordField::Title,
                ],
            ));
        }
        Ok(out)
    }
}

pub struct AgencyLocationContent;

impl MatchStrategy for AgencyLocationContent {
    fn spec(&self) -> &StrategySpec {
        &AGENCY_LOCATION_CONTENT
    }

    fn evaluate(
        &self,
        record: SourcedRecord<'_>,
        cache: &SourceCache,
        ctx: &StrategyContext<'_>,
    ) -> Result<Vec<MatchCandidate>, StrategyError> {
        let (Some(agency), Some(city), Some(state)) = (
            record.field(RecordField::Agency),
            record.field(RecordField::PlaceCity),
            record.field(RecordField::PlaceState),
        ) else {
            return Ok(Vec::new());
        };
        if record.field(RecordField::Title).is_none() && record.field(RecordField::Description).is_none() {
            return Ok(Vec::new());
        }
        let spec = self.spec();
        let mut out = Vec::new();
        for existing in resolve(cache, cache.agency_location_postings(agency, city, state))? {
            let title_sim = title_similarity(ctx, record, existing);
            let desc_sim = ctx.scorer.similarity(
                record.field(RecordField::Description),
                existing.field(RecordField::Description),
            );
            let best = title_sim.max(desc_sim);
            if best < AGENCY_LOCATION_CONTENT_GATE {
                continue;
            }

            let mut fields = vec![RecordField::Agency, RecordField::PlaceCity, RecordField::PlaceState];
            if title_sim >= AGENCY_LOCATION_CONTENT_GATE {
                fields.push(RecordField::Title);
            }
            if desc_sim >= AGENCY_LOCATION_CONTENT_GATE {
                fields.push(RecordField::Description);
            }
            out.extend(emit(spec, &existing.id, spec.weight * best, fields));
        }
        Ok(out)
    }
}

pub struct FuzzyContent;

impl MatchStrategy for FuzzyContent {
    fn spec(&self) -> &StrategySpec {
        &FUZZY_CONTENT
    }

    fn evaluate(
        &self,
        record: SourcedRecord<'_>,
        cache: &SourceCache,
        ctx: &StrategyContext<'_>,
    ) -> Result<Vec<MatchCandidate>, StrategyError> {
        let spec = self.spec();
        let description = record.field(RecordField::Description);
        let mut out = Vec::new();
        for existing in cache.scan_window() {
            let title_sim = title_similarity(ctx, record, existing);
            if title_sim < ctx.config.fuzzy_content_threshold {
                continue;
            }
            let existing_description = existing.field(RecordField::Description);
            let (confidence, fields) = match (description, existing_description) {
                (Some(_), Some(_)) => {
                    let desc_sim = ctx.scorer.similarity(description, existing_description);
                    (
                        spec.weight * (0.7 * title_sim + 0.3 * desc_sim),
                        vec![RecordField::Title, RecordField::Description],
                    )
                }
                _ => (spec.weight * title_sim, vec![RecordField::Title]),
            };
            out.extend(emit(spec, &existing.id, confidence, fields));
        }
        Ok(out)
    }
}

fn title_similarity(ctx: &StrategyContext<'_>, record: SourcedRecord<'_>, existing: &Prospect) -> f64 {
    ctx.scorer
        .similarity(record.field(RecordField::Title), existing.field(RecordField::Title))
}

fn resolve<'c>(cache: &'c SourceCache, ids: &[String]) -> Result<Vec<&'c Prospect>, StrategyError> {
    ids.iter()
        .map(|id| {
            cache.get(id).ok_or_else(|| StrategyError::DanglingEntry {
                prospect_id: id.clone(),
            })
        })
        .collect()
}

fn emit(
    spec: &StrategySpec,
    prospect_id: &str,
    confidence: f64,
    fields: impl IntoIterator<Item = RecordField>,
) -> Option<MatchCandidate> {
    let candidate = MatchCandidate::new(prospect_id, confidence.min(1.0), fields);
    (candidate.confidence_score >= spec.min_confidence).then_some(candidate)
}
