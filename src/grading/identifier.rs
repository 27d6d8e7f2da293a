//! Recovers the worksheet's printed business identifier
//! (`ES-NNNN-XXXXXX`) from OCR text, per-page, then votes across pages.

use regex::Regex;
use std::sync::OnceLock;

use super::config::UuidConfidenceWeights;
use super::types::{OcrWord, PageUuidCandidate, UuidStrategy, WordKind, WorksheetUuid};

pub struct IdentifierExtractor {
    weights: UuidConfidenceWeights,
}

fn full_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ES-(\d{4})-([A-Z0-9]{6})").unwrap())
}

fn numeric_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ES-(\d{4})").unwrap())
}

fn alpha_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Z0-9]{6})\b").unwrap())
}

impl IdentifierExtractor {
    pub fn new(weights: UuidConfidenceWeights) -> Self {
        Self { weights }
    }

    /// Extracts a per-page candidate from that page's printed words, joined
    /// into one search stream in reading order.
    pub fn extract_page_candidate(&self, words: &[OcrWord], page_index: usize) -> PageUuidCandidate {
        let mut printed: Vec<&OcrWord> = words
            .iter()
            .filter(|w| w.page_index == page_index && w.kind == WordKind::Printed)
            .collect();
        printed.sort_by(|a, b| a.top().partial_cmp(&b.top()).unwrap().then(a.left().partial_cmp(&b.left()).unwrap()));

        let joined = printed.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ");

        if let Some(caps) = full_pattern().captures(&joined) {
            let full = caps.get(0).unwrap().as_str();
            let confidence = average_confidence_covering(&printed, full);
            return PageUuidCandidate {
                page_index,
                candidate: Some(full.to_string()),
                confidence,
                strategy: UuidStrategy::FullMatch,
            };
        }

        let numeric = numeric_pattern().captures(&joined);
        let alpha = alpha_pattern().captures(&joined);
        if let (Some(n), Some(a)) = (numeric, alpha) {
            let numeric_str = n.get(1).unwrap().as_str();
            let alpha_str = a.get(1).unwrap().as_str();
            let conf_numeric = average_confidence_covering(&printed, n.get(0).unwrap().as_str());
            let conf_alpha = average_confidence_covering(&printed, a.get(0).unwrap().as_str());
            let composite = self.weights.numeric * conf_numeric + self.weights.alpha * conf_alpha;
            return PageUuidCandidate {
                page_index,
                candidate: Some(format!("ES-{numeric_str}-{alpha_str}")),
                confidence: composite,
                strategy: UuidStrategy::TwoPart,
            };
        }

        PageUuidCandidate {
            page_index,
            candidate: None,
            confidence: 0.0,
            strategy: UuidStrategy::None,
        }
    }

    /// Votes across all page candidates: unanimous non-empty candidates win
    /// with `consistent=true`; divergent candidates pick the
    /// highest-confidence one with `consistent=false` and a warning string
    /// enumerating all distinct candidates.
    pub fn consensus(&self, candidates: &[PageUuidCandidate]) -> (Option<WorksheetUuid>, Option<String>) {
        let present: Vec<&PageUuidCandidate> = candidates.iter().filter(|c| c.candidate.is_some()).collect();
        if present.is_empty() {
            return (None, None);
        }

        let distinct: std::collections::HashSet<&str> =
            present.iter().map(|c| c.candidate.as_deref().unwrap()).collect();

        let best = present
            .iter()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap())
            .unwrap();

        if distinct.len() == 1 {
            let max_conf = present.iter().map(|c| c.confidence).fold(0.0_f64, f64::max);
            (
                Some(WorksheetUuid {
                    value: best.candidate.clone().unwrap(),
                    confidence: max_conf,
                    consistent: true,
                }),
                None,
            )
        } else {
            let mut sorted: Vec<&str> = distinct.into_iter().collect();
            sorted.sort();
            let warning = format!("worksheet identifier candidates disagree across pages: {}", sorted.join(", "));
            (
                Some(WorksheetUuid {
                    value: best.candidate.clone().unwrap(),
                    confidence: best.confidence,
                    consistent: false,
                }),
                Some(warning),
            )
        }
    }
}

fn average_confidence_covering(words: &[&OcrWord], substring: &str) -> f64 {
    let matching: Vec<f64> = words
        .iter()
        .filter(|w| substring.contains(w.text.as_str()) && !w.text.trim().is_empty())
        .map(|w| w.confidence as f64)
        .collect();
    if matching.is_empty() {
        words.iter().map(|w| w.confidence as f64).sum::<f64>() / words.len().max(1) as f64
    } else {
        matching.iter().sum::<f64>() / matching.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::types::WordKind;

    fn word(text: &str, confidence: f32) -> OcrWord {
        OcrWord::new(text.to_string(), [0.0, 0.0, 10.0, 10.0], WordKind::Printed, confidence, 0, 0.3)
    }

    #[test]
    fn full_match_wins_over_two_part() {
        let extractor = IdentifierExtractor::new(UuidConfidenceWeights::default());
        let words = vec![word("ES-0055-CF12D2", 0.93)];
        let candidate = extractor.extract_page_candidate(&words, 0);
        assert_eq!(candidate.candidate.as_deref(), Some("ES-0055-CF12D2"));
        assert_eq!(candidate.strategy, UuidStrategy::FullMatch);
    }

    #[test]
    fn two_part_composes_with_asymmetric_weights() {
        let extractor = IdentifierExtractor::new(UuidConfidenceWeights::default());
        let words = vec![word("ES-0055", 0.95), word("CF12D2", 0.70)];
        let candidate = extractor.extract_page_candidate(&words, 0);
        assert_eq!(candidate.candidate.as_deref(), Some("ES-0055-CF12D2"));
        assert!((candidate.confidence - (0.8 * 0.95 + 0.2 * 0.70)).abs() < 1e-9);
        assert_eq!(candidate.strategy, UuidStrategy::TwoPart);
    }

    #[test]
    fn unanimous_candidates_are_consistent() {
        let extractor = IdentifierExtractor::new(UuidConfidenceWeights::default());
        let candidates = vec![
            PageUuidCandidate { page_index: 0, candidate: Some("ES-0055-CF12D2".into()), confidence: 0.9, strategy: UuidStrategy::FullMatch },
            PageUuidCandidate { page_index: 1, candidate: Some("ES-0055-CF12D2".into()), confidence: 0.85, strategy: UuidStrategy::FullMatch },
        ];
        let (uuid, warning) = extractor.consensus(&candidates);
        assert!(uuid.unwrap().consistent);
        assert!(warning.is_none());
    }

    #[test]
    fn divergent_candidates_pick_highest_confidence_and_warn() {
        let extractor = IdentifierExtractor::new(UuidConfidenceWeights::default());
        let candidates = vec![
            PageUuidCandidate { page_index: 0, candidate: Some("ES-0055-CF12D2".into()), confidence: 0.90, strategy: UuidStrategy::TwoPart },
            PageUuidCandidate { page_index: 1, candidate: Some("ES-0056-AB12CD".into()), confidence: 0.88, strategy: UuidStrategy::TwoPart },
        ];
        let (uuid, warning) = extractor.consensus(&candidates);
        let uuid = uuid.unwrap();
        assert_eq!(uuid.value, "ES-0055-CF12D2");
        assert!(!uuid.consistent);
        assert!(warning.unwrap().contains("ES-0056-AB12CD"));
    }
}
