//! Groups OCR handwriting words into answer lines using a section-type-aware
//! vertical merge threshold, and extracts printed question numbers as
//! geometric anchors.

use regex::Regex;
use std::sync::OnceLock;

use super::config::MergeConfig;
use super::types::{OcrLine, OcrWord, QuestionPosition, SectionType, WordKind};

pub struct LineBuilder {
    config: MergeConfig,
}

impl LineBuilder {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    fn threshold_for(&self, section_type: Option<SectionType>) -> f32 {
        match section_type {
            Some(SectionType::Word) | None => self.config.word_threshold,
            Some(SectionType::Phrase) | Some(SectionType::Sentence) => self.config.phrase_threshold,
        }
    }

    /// Builds handwriting lines for one page. `dominant_section_type` is the
    /// section type of the question(s) whose answers live on this page;
    /// callers with mixed section types on one page should call this once
    /// per homogeneous run of words, since the threshold is a single value
    /// per invocation.
    pub fn build_lines(
        &self,
        words: &[OcrWord],
        page_index: usize,
        dominant_section_type: Option<SectionType>,
    ) -> Vec<OcrLine> {
        let threshold = self.threshold_for(dominant_section_type);

        let mut handwritten: Vec<&OcrWord> = words
            .iter()
            .filter(|w| w.page_index == page_index && w.kind == WordKind::Handwritten)
            .collect();
        // Stable top-to-bottom then left-to-right order so merge decisions
        // are deterministic regardless of the OCR provider's own ordering.
        handwritten.sort_by(|a, b| {
            a.top()
                .partial_cmp(&b.top())
                .unwrap()
                .then(a.left().partial_cmp(&b.left()).unwrap())
        });

        let mut lines: Vec<Vec<&OcrWord>> = Vec::new();
        for word in handwritten {
            let mut placed = false;
            if let Some(last_line) = lines.last_mut() {
                let anchor = last_line[0];
                let line_height = anchor.height();
                if (word.top() - anchor.top()).abs() < threshold * line_height {
                    last_line.push(word);
                    placed = true;
                }
            }
            if !placed {
                lines.push(vec![word]);
            }
        }

        lines
            .into_iter()
            .map(|mut group| {
                group.sort_by(|a, b| a.left().partial_cmp(&b.left()).unwrap());
                merge_line(group, page_index)
            })
            .collect()
    }

    /// Scans printed OCR tokens for a leading numeral (`^(\d+)[\s.．。:、]`)
    /// and records the first occurrence of each number on the page as a
    /// geometric anchor.
    pub fn extract_question_positions(&self, words: &[OcrWord], page_index: usize) -> Vec<QuestionPosition> {
        let re = question_number_regex();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        let mut printed: Vec<&OcrWord> = words
            .iter()
            .filter(|w| w.page_index == page_index && w.kind == WordKind::Printed)
            .collect();
        printed.sort_by(|a, b| a.top().partial_cmp(&b.top()).unwrap());

        for word in printed {
            if let Some(caps) = re.captures(&word.text) {
                if let Ok(q_num) = caps[1].parse::<u32>() {
                    if seen.insert(q_num) {
                        out.push(QuestionPosition {
                            q_num,
                            top: word.top(),
                            page_index,
                        });
                    }
                }
            }
        }
        out
    }
}

fn question_number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)[\s.．。:、]").unwrap())
}

fn merge_line(words: Vec<&OcrWord>, page_index: usize) -> OcrLine {
    let text = words
        .iter()
        .map(|w| w.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let x1 = words.iter().map(|w| w.bbox[0]).fold(f32::INFINITY, f32::min);
    let y1 = words.iter().map(|w| w.bbox[1]).fold(f32::INFINITY, f32::min);
    let x2 = words.iter().map(|w| w.bbox[2]).fold(f32::NEG_INFINITY, f32::max);
    let y2 = words.iter().map(|w| w.bbox[3]).fold(f32::NEG_INFINITY, f32::max);

    let confidence = words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32;

    OcrLine {
        text,
        bbox: [x1, y1, x2, y2],
        confidence,
        page_index,
        words: words.into_iter().cloned().collect(),
        consumed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, top: f32, height: f32, left: f32) -> OcrWord {
        OcrWord::new(
            text.to_string(),
            [left, top, left + 60.0, top + height],
            WordKind::Handwritten,
            0.9,
            0,
            0.3,
        )
    }

    #[test]
    fn word_section_does_not_merge_close_stacked_answers() {
        // ratio 0.58 > word_threshold 0.1 → stays separate even with a
        // modest vertical gap, matching the `pig`/`horse` fix described in
        // the merge rule.
        let builder = LineBuilder::new(MergeConfig::default());
        let words = vec![word("Pig", 732.0, 79.0, 100.0), word("horse", 778.0, 79.0, 100.0)];
        let lines = builder.build_lines(&words, 0, Some(SectionType::Word));
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn phrase_section_merges_consecutive_words() {
        let builder = LineBuilder::new(MergeConfig::default());
        let words = vec![
            word("walk", 100.0, 80.0, 100.0),
            word("the", 115.0, 80.0, 170.0),
            word("dog", 130.0, 80.0, 230.0),
        ];
        let lines = builder.build_lines(&words, 0, Some(SectionType::Phrase));
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "walk the dog");
    }

    #[test]
    fn missing_section_type_uses_strict_threshold() {
        let builder = LineBuilder::new(MergeConfig::default());
        let words = vec![word("walk", 100.0, 80.0, 100.0), word("the", 115.0, 80.0, 170.0)];
        let lines = builder.build_lines(&words, 0, None);
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn extracts_first_occurrence_of_each_question_number() {
        let builder = LineBuilder::new(MergeConfig::default());
        let mut p13 = OcrWord::new("13.".into(), [10.0, 700.0, 40.0, 730.0], WordKind::Printed, 0.95, 0, 0.3);
        p13.text = "13.".to_string();
        let mut p14 = OcrWord::new("14.".into(), [10.0, 760.0, 40.0, 790.0], WordKind::Printed, 0.95, 0, 0.3);
        p14.text = "14.".to_string();
        let dup = OcrWord::new("13.".into(), [10.0, 900.0, 40.0, 930.0], WordKind::Printed, 0.9, 0, 0.3);
        let positions = builder.extract_question_positions(&[p13, p14, dup], 0);
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].q_num, 13);
        assert_eq!(positions[0].top, 700.0);
    }
}
