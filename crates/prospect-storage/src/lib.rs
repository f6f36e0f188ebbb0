//! Prospect persistence: primary hashing, the store contract, and its backends.

use async_trait::async_trait;
use prospect_core::{IncomingRecord, Prospect, RecordField};
use sha2::{Digest, Sha256};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryProspectStore;
pub use postgres::{PgProspectStore, MIGRATOR};

pub const CRATE_NAME: &str = "prospect-storage";

/// Record fields folded into the primary id, in hashing order.
pub const HASHED_FIELDS: [RecordField; 7] = [
    RecordField::NativeId,
    RecordField::Title,
    RecordField::Description,
    RecordField::Naics,
    RecordField::Agency,
    RecordField::PlaceCity,
    RecordField::PlaceState,
];

const FIELD_SEPARATOR: char = '\u{1f}';

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic primary id for a record within a source.
///
/// Content fields are part of the digest because sources reuse native ids for
/// unrelated postings. Missing values hash as empty strings.
pub fn prospect_id(source_id: &str, record: &IncomingRecord) -> String {
    let mut material = String::from(source_id.trim());
    for field in HASHED_FIELDS {
        material.push(FIELD_SEPARATOR);
        material.push_str(record.field(field).unwrap_or_default());
    }
    sha256_hex(material.as_bytes())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("prospect {0} already exists")]
    DuplicateId(String),
    #[error("prospect {0} does not exist")]
    MissingProspect(String),
    #[error("encoding extra fields for prospect {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Rows staged by one batch, committed together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSet {
    pub inserts: Vec<Prospect>,
    pub updates: Vec<Prospect>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len()
    }
}

/// Persistence contract the reconciliation engine depends on.
#[async_trait]
pub trait ProspectStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Prospect>, StoreError>;

    /// Bulk existence check; ids without a row are simply absent from the result.
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Prospect>, StoreError>;

    /// Every prospect of a source, oldest first.
    async fn list_by_source(&self, source_id: &str) -> Result<Vec<Prospect>, StoreError>;

    /// Apply a write set atomically. Any failure leaves the store unchanged.
    async fn commit(&self, writes: WriteSet) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(native_id: &str, title: &str) -> IncomingRecord {
        IncomingRecord {
            native_id: Some(native_id.into()),
            title: Some(title.into()),
            description: Some("Python role".into()),
            agency: Some("DoD".into()),
            place_city: Some("Washington".into()),
            place_state: Some("DC".into()),
            ..Default::default()
        }
    }

    #[test]
    fn sha256_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn identical_content_yields_identical_ids() {
        let a = record("X", "Software Engineer");
        let mut b = a.clone();
        b.extra.insert("posted".into(), serde_json::json!("2026-01-01"));
        b.place_country = Some("USA".into());

        let id = prospect_id("dod", &a);
        assert_eq!(id, prospect_id("dod", &b));
        assert_eq!(id.len(), 64);
    }

    #[test]
    fn reused_native_id_with_new_content_gets_new_id() {
        let a = record("X", "Software Engineer");
        let b = record("X", "Network Administrator");
        assert_ne!(prospect_id("dod", &a), prospect_id("dod", &b));
    }

    #[test]
    fn source_scopes_the_id() {
        let a = record("X", "Software Engineer");
        assert_ne!(prospect_id("dod", &a), prospect_id("doe", &a));
    }

    #[test]
    fn field_boundaries_are_not_ambiguous() {
        let mut a = IncomingRecord::default();
        a.native_id = Some("ab".into());
        a.title = Some("c".into());
        let mut b = IncomingRecord::default();
        b.native_id = Some("a".into());
        b.title = Some("bc".into());
        assert_ne!(prospect_id("s", &a), prospect_id("s", &b));
    }

    #[test]
    fn missing_and_blank_fields_hash_alike() {
        let mut a = IncomingRecord::default();
        a.title = Some("Help Desk".into());
        let mut b = a.clone();
        b.description = Some("  ".into());
        assert_eq!(prospect_id("s", &a), prospect_id("s", &b));
    }
}
