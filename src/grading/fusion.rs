//! Assigns each VLM item zero or one OCR line via the three-strategy
//! cascade (text similarity → vertical proximity to a printed question
//! number → sequential fallback), and produces the fused [`GradedItem`]
//! records.

use super::config::MatchConfig;
use super::types::{GradedItem, MatchMethod, OcrLine, QuestionPosition, RawVlmItem};

const BBOX_PAD: f32 = 6.0;

pub struct FusionMatcher {
    config: MatchConfig,
}

impl FusionMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    /// Fuses every VLM item against the OCR lines and question positions
    /// available for its page. `lines` and `positions` are consulted across
    /// all pages but a consumed line can never be reused, matching the
    /// invariant that no OCR line is shared between two questions.
    pub fn fuse(
        &self,
        items: Vec<RawVlmItem>,
        lines: &mut [OcrLine],
        positions: &[QuestionPosition],
        page_dims: &[(u32, u32)],
    ) -> Vec<GradedItem> {
        items
            .into_iter()
            .map(|item| self.fuse_one(item, lines, positions, page_dims))
            .collect()
    }

    fn fuse_one(
        &self,
        item: RawVlmItem,
        lines: &mut [OcrLine],
        positions: &[QuestionPosition],
        page_dims: &[(u32, u32)],
    ) -> GradedItem {
        let student_text_trimmed = item.student_text.trim();

        let (ocr_text, match_method, consumed_bbox) = if student_text_trimmed.is_empty() {
            (String::new(), MatchMethod::EmptyAnswer, None)
        } else if let Some((idx, ratio)) = self.best_text_match(&item, lines) {
            lines[idx].consumed = true;
            let bbox = lines[idx].bbox;
            (
                lines[idx].text.clone(),
                MatchMethod::TextSimilarity(ratio),
                Some(bbox),
            )
        } else if let Some((idx, _)) = self.best_position_match(&item, lines, positions) {
            lines[idx].consumed = true;
            let bbox = lines[idx].bbox;
            (lines[idx].text.clone(), MatchMethod::Position, Some(bbox))
        } else if let Some(idx) = self.next_sequential(&item, lines) {
            lines[idx].consumed = true;
            let bbox = lines[idx].bbox;
            (lines[idx].text.clone(), MatchMethod::Sequential, Some(bbox))
        } else {
            (String::new(), MatchMethod::None, None)
        };

        let consistency_ok = compute_consistency(&item.student_text, &ocr_text, self.config.consistency_threshold);

        let bbox = resolve_bbox(&item, consumed_bbox, positions, page_dims);

        GradedItem {
            position: item.position,
            section_title: item.section_title,
            section_type: item.section_type,
            zh_hint: item.zh_hint,
            llm_text: item.student_text,
            ocr_text,
            is_correct: item.is_correct,
            confidence: item.confidence,
            note: item.note,
            page_index: item.page_index,
            bbox,
            match_method,
            consistency_ok,
            page_conflict: false,
        }
    }

    fn best_text_match(&self, item: &RawVlmItem, lines: &[OcrLine]) -> Option<(usize, f64)> {
        let target = normalize_for_similarity(&item.student_text);
        if target.is_empty() {
            return None;
        }

        let mut best: Option<(usize, f64)> = None;
        for (idx, line) in lines.iter().enumerate() {
            if line.consumed || line.page_index != item.page_index {
                continue;
            }
            let candidate = normalize_for_similarity(&line.text);
            let ratio = strsim::normalized_levenshtein(&target, &candidate);
            if ratio >= self.config.text_threshold && best.map_or(true, |(_, b)| ratio > b) {
                best = Some((idx, ratio));
            }
        }
        best
    }

    fn best_position_match(
        &self,
        item: &RawVlmItem,
        lines: &[OcrLine],
        positions: &[QuestionPosition],
    ) -> Option<(usize, f32)> {
        let anchor = positions
            .iter()
            .find(|p| p.page_index == item.page_index && p.q_num == item.q)?;

        let mut best: Option<(usize, f32)> = None;
        for (idx, line) in lines.iter().enumerate() {
            if line.consumed || line.page_index != item.page_index {
                continue;
            }
            let dist = (line.top() - anchor.top).abs();
            if dist <= self.config.position_max_distance && best.map_or(true, |(_, b)| dist < b) {
                best = Some((idx, dist));
            }
        }
        best
    }

    fn next_sequential(&self, item: &RawVlmItem, lines: &[OcrLine]) -> Option<usize> {
        lines
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.consumed && l.page_index == item.page_index)
            .min_by(|(_, a), (_, b)| a.top().partial_cmp(&b.top()).unwrap())
            .map(|(idx, _)| idx)
    }
}

/// Lowercased, alphanumeric-only form used for the text-similarity ratio.
fn normalize_for_similarity(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Case-folded, whitespace-collapsed, punctuation-stripped form used for the
/// consistency check — a looser normalization than the match-similarity
/// form, since consistency is about "do the two texts say the same thing",
/// not "is this the right line to consume".
fn normalize_for_consistency(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect()
}

fn compute_consistency(llm_text: &str, ocr_text: &str, threshold: f64) -> Option<bool> {
    if llm_text.trim().is_empty() || ocr_text.trim().is_empty() {
        return None;
    }
    let a = normalize_for_consistency(llm_text);
    let b = normalize_for_consistency(ocr_text);
    let ratio = strsim::normalized_levenshtein(&a, &b);
    Some(ratio >= threshold)
}

/// Prefers the VLM's normalized bbox scaled to the page's original
/// dimensions; falls back to the consumed OCR line's bbox; falls back to a
/// degenerate box at the printed question position when only that is
/// known. The result is padded by [`BBOX_PAD`] on every side before being
/// handed to the Annotator.
fn resolve_bbox(
    item: &RawVlmItem,
    ocr_bbox: Option<[f32; 4]>,
    positions: &[QuestionPosition],
    page_dims: &[(u32, u32)],
) -> [f32; 4] {
    let raw = if let Some(norm) = item.handwriting_bbox {
        let (w, h) = page_dims.get(item.page_index).copied().unwrap_or((0, 0));
        [
            norm[0] * w as f32,
            norm[1] * h as f32,
            norm[2] * w as f32,
            norm[3] * h as f32,
        ]
    } else if let Some(bbox) = ocr_bbox {
        bbox
    } else if let Some(anchor) = positions
        .iter()
        .find(|p| p.page_index == item.page_index && p.q_num == item.q)
    {
        [anchor.top, anchor.top, anchor.top + 1.0, anchor.top + 1.0]
    } else {
        [0.0, 0.0, 1.0, 1.0]
    };

    [
        (raw[0] - BBOX_PAD).max(0.0),
        (raw[1] - BBOX_PAD).max(0.0),
        raw[2] + BBOX_PAD,
        raw[3] + BBOX_PAD,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::types::WordKind;

    fn item(q: u32, hint: &str, ans: &str, ok: bool) -> RawVlmItem {
        RawVlmItem {
            q,
            zh_hint: hint.to_string(),
            student_text: ans.to_string(),
            is_correct: ok,
            confidence: 0.9,
            page_index: 0,
            note: None,
            handwriting_bbox: None,
            section_title: None,
            section_type: None,
            position: q,
        }
    }

    fn line(text: &str, top: f32, page_index: usize) -> OcrLine {
        OcrLine {
            text: text.to_string(),
            bbox: [100.0, top, 200.0, top + 60.0],
            confidence: 0.9,
            page_index,
            words: vec![],
            consumed: false,
        }
    }

    #[test]
    fn empty_answer_never_consumes_a_line() {
        let matcher = FusionMatcher::new(MatchConfig::default());
        let mut lines = vec![line("horse", 700.0, 0)];
        let graded = matcher.fuse(vec![item(3, "马", "", false)], &mut lines, &[], &[(1000, 1000)]);
        assert_eq!(graded[0].match_method, MatchMethod::EmptyAnswer);
        assert_eq!(graded[0].ocr_text, "");
        assert_eq!(graded[0].consistency_ok, None);
        assert!(!lines[0].consumed);
    }

    #[test]
    fn exact_text_match_wins_and_consumes_the_line() {
        let matcher = FusionMatcher::new(MatchConfig::default());
        let mut lines = vec![line("apple", 440.0, 0), line("teil", 520.0, 0)];
        let graded = matcher.fuse(
            vec![item(1, "苹果", "apple", true), item(2, "尾巴", "teil", false)],
            &mut lines,
            &[],
            &[(1000, 1000)],
        );
        assert_eq!(graded[0].ocr_text, "apple");
        assert!(matches!(graded[0].match_method, MatchMethod::TextSimilarity(r) if r > 0.99));
        assert_eq!(graded[0].consistency_ok, Some(true));
        assert_eq!(graded[1].ocr_text, "teil");
        assert!(lines[0].consumed && lines[1].consumed);
    }

    #[test]
    fn a_consumed_line_is_never_assigned_twice() {
        let matcher = FusionMatcher::new(MatchConfig::default());
        let mut lines = vec![line("apple", 440.0, 0)];
        let graded = matcher.fuse(
            vec![item(1, "苹果", "apple", true), item(2, "苹果2", "apple", true)],
            &mut lines,
            &[],
            &[(1000, 1000)],
        );
        // second item can't reuse the already-consumed line via text
        // similarity; it falls through to sequential, finds nothing left.
        assert_eq!(graded[1].match_method, MatchMethod::None);
    }

    #[test]
    fn positional_match_uses_printed_anchor_within_budget() {
        let matcher = FusionMatcher::new(MatchConfig::default());
        let mut lines = vec![line("Pig", 732.0, 0), line("horse", 790.0, 0)];
        let positions = vec![
            QuestionPosition { q_num: 13, top: 730.0, page_index: 0 },
            QuestionPosition { q_num: 14, top: 788.0, page_index: 0 },
        ];
        // deliberately mismatched student_text so text-similarity can't fire
        let graded = matcher.fuse(
            vec![item(13, "猪", "xx", false), item(14, "马", "yy", false)],
            &mut lines,
            &positions,
            &[(1000, 1000)],
        );
        assert_eq!(graded[0].match_method, MatchMethod::Position);
        assert_eq!(graded[0].ocr_text, "Pig");
        assert_eq!(graded[1].match_method, MatchMethod::Position);
        assert_eq!(graded[1].ocr_text, "horse");
    }

    #[test]
    fn sequential_fallback_consumes_in_reading_order() {
        let matcher = FusionMatcher::new(MatchConfig::default());
        let mut lines = vec![line("zzz", 100.0, 0)];
        let graded = matcher.fuse(vec![item(1, "x", "nomatch", false)], &mut lines, &[], &[(1000, 1000)]);
        assert_eq!(graded[0].match_method, MatchMethod::Sequential);
        assert_eq!(graded[0].ocr_text, "zzz");
    }

    #[test]
    fn correctness_always_comes_from_the_vlm_never_ocr() {
        let matcher = FusionMatcher::new(MatchConfig::default());
        let mut lines = vec![line("totally different text", 100.0, 0)];
        let graded = matcher.fuse(vec![item(1, "x", "answer", true)], &mut lines, &[], &[(1000, 1000)]);
        assert!(graded[0].is_correct);
        assert_eq!(graded[0].consistency_ok, Some(false));
    }
}
