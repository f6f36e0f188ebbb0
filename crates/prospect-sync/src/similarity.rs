//! Text similarity with a bounded per-pair memo.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use strsim::normalized_levenshtein;

/// Case-insensitive similarity in `[0, 1]`, uncached.
///
/// Blank input scores 0.0. Strings shorter than three characters only score
/// on exact, containment or alphanumeric-equal matches, checked in that order.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    score_normalized(&normalize(a), &normalize(b))
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn score_normalized(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if a.chars().count() < 3 || b.chars().count() < 3 {
        return short_similarity(a, b);
    }
    normalized_levenshtein(a, b).clamp(0.0, 1.0)
}

fn short_similarity(a: &str, b: &str) -> f64 {
    if a.contains(b) || b.contains(a) {
        return 0.9;
    }
    let stripped_a = alphanumeric(a);
    if !stripped_a.is_empty() && stripped_a == alphanumeric(b) {
        return 0.95;
    }
    0.0
}

fn alphanumeric(value: &str) -> String {
    value.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Memoizing front for [`text_similarity`].
///
/// One scorer can be shared across concurrent batches behind an `Arc`; the
/// memo is keyed on the normalized, order-independent pair.
#[derive(Debug)]
pub struct SimilarityScorer {
    memo: Mutex<LruCache<(String, String), f64>>,
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self::new(crate::DuplicateConfig::default().similarity_cache_capacity)
    }
}

impl SimilarityScorer {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memo: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Similarity of two optional values; a missing side scores 0.0.
    pub fn similarity(&self, a: Option<&str>, b: Option<&str>) -> f64 {
        match (a, b) {
            (Some(a), Some(b)) => self.score(a, b),
            _ => 0.0,
        }
    }

    pub fn score(&self, a: &str, b: &str) -> f64 {
        let a = normalize(a);
        let b = normalize(b);
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let key = if a <= b { (a, b) } else { (b, a) };

        if let Some(hit) = self.lock().get(&key) {
            return *hit;
        }
        let score = score_normalized(&key.0, &key.1);
        self.lock().put(key, score);
        score
    }

    pub fn cached_pairs(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<(String, String), f64>> {
        // A poisoned memo still holds valid scores.
        match self.memo.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_ignores_case_and_padding() {
        assert_eq!(text_similarity("Software Engineer", " software ENGINEER "), 1.0);
    }

    #[test]
    fn blank_input_scores_zero() {
        assert_eq!(text_similarity("", "anything"), 0.0);
        assert_eq!(text_similarity("   ", "   "), 0.0);
        let scorer = SimilarityScorer::new(8);
        assert_eq!(scorer.similarity(None, Some("title")), 0.0);
        assert_eq!(scorer.similarity(Some("title"), None), 0.0);
    }

    #[test]
    fn short_strings_use_special_rules() {
        assert_eq!(text_similarity("DC", "dc"), 1.0);
        assert_eq!(text_similarity("D.C", "DC"), 0.95);
        assert_eq!(text_similarity("VA", "VA-North"), 0.9);
        assert_eq!(text_similarity("DC", "VA"), 0.0);
        assert_eq!(text_similarity("DC", "Denver"), 0.0);
    }

    #[test]
    fn containment_wins_over_punctuation_stripping() {
        assert_eq!(text_similarity("a", "a."), 0.9);
        assert_eq!(text_similarity("D.C", "DC"), 0.95);
    }

    #[test]
    fn edit_distance_ratio_for_longer_strings() {
        let score = text_similarity("Software Engineer", "Sr. Software Engineer");
        assert!((score - (1.0 - 4.0 / 21.0)).abs() < 1e-9, "score={score}");
        assert!(text_similarity("Software Engineer", "Network Administrator") < 0.3);
    }

    #[test]
    fn memo_is_order_independent() {
        let scorer = SimilarityScorer::new(16);
        let first = scorer.score("Janitorial Services", "Janitorial Service");
        let second = scorer.score("janitorial service", "JANITORIAL SERVICES");
        assert_eq!(first, second);
        assert_eq!(scorer.cached_pairs(), 1);
    }

    #[test]
    fn memo_is_bounded() {
        let scorer = SimilarityScorer::new(2);
        scorer.score("alpha one", "alpha two");
        scorer.score("beta one", "beta two");
        scorer.score("gamma one", "gamma two");
        assert_eq!(scorer.capacity(), 2);
        assert_eq!(scorer.cached_pairs(), 2);
    }

    #[test]
    fn zero_capacity_falls_back_to_one_slot() {
        let scorer = SimilarityScorer::new(0);
        assert_eq!(scorer.capacity(), 1);
        assert!(scorer.score("abc", "abd") > 0.0);
    }
}
