//! Tunables for duplicate detection and reconciliation.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DuplicateConfig {
    /// Global acceptance threshold a detector candidate must clear to merge.
    pub min_confidence: f64,
    /// Title similarity below which exact_native_id scores are cut back.
    pub native_id_min_content_sim: f64,
    /// Gate for native_id_title_fuzzy.
    pub title_similarity_threshold: f64,
    /// Gate for fuzzy_content.
    pub fuzzy_content_threshold: f64,
    /// How many cached prospects fuzzy_content scans per record.
    pub fuzzy_scan_limit: usize,
    pub similarity_cache_capacity: usize,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.85,
            native_id_min_content_sim: 0.3,
            title_similarity_threshold: 0.6,
            fuzzy_content_threshold: 0.92,
            fuzzy_scan_limit: 1000,
            similarity_cache_capacity: 10_000,
        }
    }
}

impl DuplicateConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            min_confidence: parse_or(&lookup, "DUPLICATE_MIN_CONFIDENCE", defaults.min_confidence),
            native_id_min_content_sim: parse_or(
                &lookup,
                "DUPLICATE_NATIVE_ID_MIN_CONTENT_SIM",
                defaults.native_id_min_content_sim,
            ),
            title_similarity_threshold: parse_or(
                &lookup,
                "DUPLICATE_TITLE_SIMILARITY_THRESHOLD",
                defaults.title_similarity_threshold,
            ),
            fuzzy_content_threshold: parse_or(
                &lookup,
                "DUPLICATE_FUZZY_CONTENT_THRESHOLD",
                defaults.fuzzy_content_threshold,
            ),
            fuzzy_scan_limit: parse_or(&lookup, "DUPLICATE_FUZZY_SCAN_LIMIT", defaults.fuzzy_scan_limit),
            similarity_cache_capacity: parse_or(
                &lookup,
                "SIMILARITY_CACHE_CAPACITY",
                defaults.similarity_cache_capacity,
            ),
        }
    }
}

/// Per-batch switches for the upsert path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOptions {
    pub preserve_ai_data: bool,
    pub enable_smart_matching: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            preserve_ai_data: true,
            enable_smart_matching: true,
        }
    }
}

impl ReconcileOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            preserve_ai_data: flag_or(&lookup, "PRESERVE_AI_DATA", defaults.preserve_ai_data),
            enable_smart_matching: flag_or(
                &lookup,
                "ENABLE_SMART_MATCHING",
                defaults.enable_smart_matching,
            ),
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn flag_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = DuplicateConfig::from_lookup(|_| None);
        assert_eq!(config, DuplicateConfig::default());
        assert_eq!(config.min_confidence, 0.85);
        assert_eq!(config.fuzzy_scan_limit, 1000);
    }

    #[test]
    fn overrides_are_parsed_and_garbage_ignored() {
        let config = DuplicateConfig::from_lookup(lookup(&[
            ("DUPLICATE_MIN_CONFIDENCE", "0.9"),
            ("DUPLICATE_FUZZY_CONTENT_THRESHOLD", "not-a-number"),
            ("DUPLICATE_FUZZY_SCAN_LIMIT", " 250 "),
        ]));
        assert_eq!(config.min_confidence, 0.9);
        assert_eq!(config.fuzzy_content_threshold, 0.92);
        assert_eq!(config.fuzzy_scan_limit, 250);
    }

    #[test]
    fn option_flags_accept_common_truthy_spellings() {
        let options = ReconcileOptions::from_lookup(lookup(&[
            ("PRESERVE_AI_DATA", "0"),
            ("ENABLE_SMART_MATCHING", "True"),
        ]));
        assert!(!options.preserve_ai_data);
        assert!(options.enable_smart_matching);
    }
}
