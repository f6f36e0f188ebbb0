//! Core domain model for government contracting prospects.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "prospect-core";

/// Country written on insert when the source leaves it blank.
pub const DEFAULT_PLACE_COUNTRY: &str = "USA";

/// Named record fields that matching strategies gate on and report back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Source,
    NativeId,
    Title,
    Description,
    Agency,
    Naics,
    PlaceCity,
    PlaceState,
}

impl RecordField {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordField::Source => "source",
            RecordField::NativeId => "native_id",
            RecordField::Title => "title",
            RecordField::Description => "description",
            RecordField::Agency => "agency",
            RecordField::Naics => "naics",
            RecordField::PlaceCity => "place_city",
            RecordField::PlaceState => "place_state",
        }
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields written by the enrichment process.
///
/// A routine re-import must not clear these once a prospect has been enriched,
/// see [`Prospect::apply_record`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectedFields {
    pub naics: Option<String>,
    pub naics_description: Option<String>,
    pub naics_source: Option<String>,
    pub estimated_value_min: Option<f64>,
    pub estimated_value_max: Option<f64>,
    pub estimated_value_single: Option<f64>,
    pub primary_contact_email: Option<String>,
    pub primary_contact_name: Option<String>,
    pub enriched_at: Option<DateTime<Utc>>,
    pub enrichment_model_version: Option<String>,
}

/// One normalized opportunity handed over by the transform pipeline.
///
/// Deserializes from a flat string-keyed map. Keys outside the recognized set
/// are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IncomingRecord {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub native_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub place_city: Option<String>,
    #[serde(default)]
    pub place_state: Option<String>,
    #[serde(default)]
    pub place_country: Option<String>,
    #[serde(flatten)]
    pub protected: ProtectedFields,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl IncomingRecord {
    /// Trimmed value of a field; blank strings count as absent.
    ///
    /// `RecordField::Source` reads the record's own `source_id`, which is
    /// usually unset because batches are scoped to one source. Use
    /// [`SourcedRecord`] when the batch source should apply.
    pub fn field(&self, field: RecordField) -> Option<&str> {
        let raw = match field {
            RecordField::Source => &self.source_id,
            RecordField::NativeId => &self.native_id,
            RecordField::Title => &self.title,
            RecordField::Description => &self.description,
            RecordField::Agency => &self.agency,
            RecordField::Naics => &self.protected.naics,
            RecordField::PlaceCity => &self.place_city,
            RecordField::PlaceState => &self.place_state,
        };
        clean(raw)
    }
}

/// A record viewed together with the source its batch belongs to.
#[derive(Debug, Clone, Copy)]
pub struct SourcedRecord<'a> {
    pub source_id: &'a str,
    pub record: &'a IncomingRecord,
}

impl<'a> SourcedRecord<'a> {
    pub fn new(source_id: &'a str, record: &'a IncomingRecord) -> Self {
        Self { source_id, record }
    }

    pub fn field(&self, field: RecordField) -> Option<&'a str> {
        match field {
            RecordField::Source => {
                let source = self.source_id.trim();
                (!source.is_empty()).then_some(source)
            }
            other => self.record.field(other),
        }
    }

    pub fn has_all(&self, fields: &[RecordField]) -> bool {
        fields.iter().all(|f| self.field(*f).is_some())
    }
}

/// Persisted opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prospect {
    pub id: String,
    pub source_id: String,
    pub native_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub agency: Option<String>,
    pub place_city: Option<String>,
    pub place_state: Option<String>,
    pub place_country: Option<String>,
    pub protected: ProtectedFields,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What [`Prospect::apply_record`] did with the protected set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub protected_preserved: bool,
}

impl Prospect {
    pub fn from_record(
        id: impl Into<String>,
        source_id: impl Into<String>,
        record: &IncomingRecord,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            native_id: record.native_id.clone(),
            title: record.title.clone(),
            description: record.description.clone(),
            agency: record.agency.clone(),
            place_city: record.place_city.clone(),
            place_state: record.place_state.clone(),
            place_country: country_or_default(record),
            protected: record.protected.clone(),
            extra: record.extra.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn field(&self, field: RecordField) -> Option<&str> {
        let raw = match field {
            RecordField::Source => return clean_str(&self.source_id),
            RecordField::NativeId => &self.native_id,
            RecordField::Title => &self.title,
            RecordField::Description => &self.description,
            RecordField::Agency => &self.agency,
            RecordField::Naics => &self.protected.naics,
            RecordField::PlaceCity => &self.place_city,
            RecordField::PlaceState => &self.place_state,
        };
        clean(raw)
    }

    pub fn is_enriched(&self) -> bool {
        self.protected.enriched_at.is_some()
    }

    /// Overwrite this prospect with an incoming record.
    ///
    /// `id` and `source_id` never change. With `preserve_ai_data` set and a
    /// non-null enrichment timestamp the protected set is left untouched;
    /// otherwise it is replaced wholesale, nulls included.
    pub fn apply_record(
        &mut self,
        record: &IncomingRecord,
        preserve_ai_data: bool,
        now: DateTime<Utc>,
    ) -> UpdateOutcome {
        self.native_id = record.native_id.clone();
        self.title = record.title.clone();
        self.description = record.description.clone();
        self.agency = record.agency.clone();
        self.place_city = record.place_city.clone();
        self.place_state = record.place_state.clone();
        self.place_country = country_or_default(record);
        self.extra = record.extra.clone();
        self.updated_at = now;

        let protected_preserved = preserve_ai_data && self.is_enriched();
        if !protected_preserved {
            self.protected = record.protected.clone();
        }
        UpdateOutcome { protected_preserved }
    }
}

/// Confidence band attached to a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Strong,
    Fuzzy,
    Weak,
}

impl MatchType {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.95 {
            MatchType::Exact
        } else if confidence >= 0.85 {
            MatchType::Strong
        } else if confidence >= 0.7 {
            MatchType::Fuzzy
        } else {
            MatchType::Weak
        }
    }
}

/// An existing prospect that plausibly denotes the same opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub prospect_id: String,
    pub confidence_score: f64,
    pub match_type: MatchType,
    pub matched_fields: BTreeSet<RecordField>,
}

impl MatchCandidate {
    /// Build a candidate, clamping the score into `[0, 1]`.
    pub fn new(
        prospect_id: impl Into<String>,
        confidence_score: f64,
        matched_fields: impl IntoIterator<Item = RecordField>,
    ) -> Self {
        let confidence_score = if confidence_score.is_nan() {
            0.0
        } else {
            confidence_score.clamp(0.0, 1.0)
        };
        Self {
            prospect_id: prospect_id.into(),
            confidence_score,
            match_type: MatchType::from_confidence(confidence_score),
            matched_fields: matched_fields.into_iter().collect(),
        }
    }
}

fn clean(value: &Option<String>) -> Option<&str> {
    value.as_deref().and_then(clean_str)
}

fn clean_str(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn country_or_default(record: &IncomingRecord) -> Option<String> {
    Some(
        clean(&record.place_country)
            .unwrap_or(DEFAULT_PLACE_COUNTRY)
            .to_string(),
    )
}
