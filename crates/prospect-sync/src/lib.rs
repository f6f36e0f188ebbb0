//! Duplicate detection and batch reconciliation for prospects.

mod cache;
mod config;
mod detector;
mod reconcile;
mod similarity;
pub mod strategies;

pub use cache::SourceCache;
pub use config::{DuplicateConfig, ReconcileOptions};
pub use detector::DuplicateDetector;
pub use reconcile::{
    dedupe_batch, reconcile_sources, AbortSignal, BatchStats, ProspectReconciler, ReconcileError, SourceBatch,
};
pub use similarity::{text_similarity, SimilarityScorer};

pub const CRATE_NAME: &str = "prospect-sync";
