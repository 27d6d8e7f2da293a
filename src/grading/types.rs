//! Tagged records for each phase of the pipeline, per the note that the
//! upstream system's dynamic, duck-typed item dictionaries are restated here
//! as explicit structs: [`RawVlmItem`], [`OcrWord`], [`OcrLine`],
//! [`GradedItem`].

use serde::{Deserialize, Serialize};

/// One uploaded page, carried through preprocessing.
///
/// Cloned internally by the orchestrator to fan the same page set out to
/// the VLM and OCR tasks concurrently while the original set is retained
/// for the later annotation pass.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    /// Original bytes as uploaded.
    pub original_bytes: Vec<u8>,
    /// White-balanced, resized, re-encoded JPEG bytes fed to both engines.
    pub normalized_bytes: Vec<u8>,
}

/// Answer-style grouping a [`Section`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SectionType {
    Word,
    Phrase,
    Sentence,
}

/// One question as returned by the VLM, already normalized from the model's
/// short field names (`q, hint, ans, ok, conf, pg, note, bbox`) into the
/// canonical long names used internally.
#[derive(Debug, Clone)]
pub struct RawVlmItem {
    /// The VLM's own question order, scoped to the page (see the Open
    /// Question decision in SPEC_FULL.md §5(i)).
    pub q: u32,
    pub zh_hint: String,
    pub student_text: String,
    pub is_correct: bool,
    pub confidence: f32,
    pub page_index: usize,
    pub note: Option<String>,
    /// Normalized `[x1,y1,x2,y2]` in `[0,1]`, relative to the page's
    /// original (pre-downscale) dimensions.
    pub handwriting_bbox: Option<[f32; 4]>,
    pub section_title: Option<String>,
    pub section_type: Option<SectionType>,
    /// Assigned once, in a single pass over all VLM items across sections,
    /// by the orchestrator — not by this struct's own field `q`, which is
    /// metadata only.
    pub position: u32,
}

/// OCR word-level record, printed or handwritten, in absolute page pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordKind {
    Printed,
    Handwritten,
}

#[derive(Debug, Clone)]
pub struct OcrWord {
    pub text: String,
    /// Absolute pixels `[x1,y1,x2,y2]`; invariant `0 <= x1 < x2 <= width`
    /// (same for y) is enforced by [`OcrWord::new`].
    pub bbox: [f32; 4],
    pub kind: WordKind,
    pub confidence: f32,
    pub page_index: usize,
    pub low_confidence: bool,
}

impl OcrWord {
    pub fn new(
        text: String,
        bbox: [f32; 4],
        kind: WordKind,
        confidence: f32,
        page_index: usize,
        min_word_confidence: f32,
    ) -> Self {
        Self {
            text,
            bbox,
            kind,
            confidence,
            page_index,
            low_confidence: confidence < min_word_confidence,
        }
    }

    pub fn top(&self) -> f32 {
        self.bbox[1]
    }

    pub fn left(&self) -> f32 {
        self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        (self.bbox[3] - self.bbox[1]).max(1.0)
    }
}

/// A horizontal group of handwritten words treated as one answer.
#[derive(Debug, Clone)]
pub struct OcrLine {
    pub text: String,
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub page_index: usize,
    pub words: Vec<OcrWord>,
    pub consumed: bool,
}

impl OcrLine {
    pub fn top(&self) -> f32 {
        self.bbox[1]
    }
}

/// A printed question number and its vertical position, used purely as a
/// geometric anchor for positional fusion.
#[derive(Debug, Clone, Copy)]
pub struct QuestionPosition {
    pub q_num: u32,
    pub top: f32,
    pub page_index: usize,
}

/// The strategy that produced a fusion assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchMethod {
    TextSimilarity(f64),
    Position,
    Sequential,
    EmptyAnswer,
    None,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TextSimilarity(ratio) => write!(f, "text_similarity_{:.2}", ratio),
            Self::Position => write!(f, "position"),
            Self::Sequential => write!(f, "sequential"),
            Self::EmptyAnswer => write!(f, "empty_answer"),
            Self::None => write!(f, "none"),
        }
    }
}

/// The fused per-question record the Annotator and downstream collaborators
/// consume.
#[derive(Debug, Clone)]
pub struct GradedItem {
    pub position: u32,
    pub section_title: Option<String>,
    pub section_type: Option<SectionType>,
    pub zh_hint: String,
    pub llm_text: String,
    pub ocr_text: String,
    pub is_correct: bool,
    pub confidence: f32,
    pub note: Option<String>,
    pub page_index: usize,
    /// Absolute pixels, already padded for the Annotator.
    pub bbox: [f32; 4],
    pub match_method: MatchMethod,
    /// `None` when one side's text is absent (no comparison possible).
    pub consistency_ok: Option<bool>,
    /// Always `false` today; see SPEC_FULL.md §5(ii) for why it is kept as a
    /// forward-compatible field rather than removed.
    pub page_conflict: bool,
}

/// The worksheet's printed business identifier, `ES-NNNN-XXXXXX`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorksheetUuid {
    pub value: String,
    pub confidence: f64,
    pub consistent: bool,
}

/// Which strategy, if any, produced a page's identifier candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UuidStrategy {
    FullMatch,
    TwoPart,
    None,
}

/// Per-page identifier diagnostic, kept rather than discarded (SPEC_FULL.md
/// §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageUuidCandidate {
    pub page_index: usize,
    pub candidate: Option<String>,
    pub confidence: f64,
    pub strategy: UuidStrategy,
}

/// Top-level record returned by a grading request.
#[derive(Debug, Clone)]
pub struct GradingResult {
    pub items: Vec<GradedItem>,
    pub original_image_urls: Vec<Option<String>>,
    pub graded_image_urls: Vec<Option<String>>,
    pub image_count: usize,
    pub extracted_date: Option<String>,
    pub worksheet_uuid: Option<WorksheetUuid>,
    pub page_uuid_candidates: Vec<PageUuidCandidate>,
    /// Populated only when a UUID consensus warning exists (§4.6).
    pub uuid_warning: Option<String>,
    /// Ids returned by the persistence delegate's `put_artifact`, present
    /// only when `debug.save_raw` is enabled (SPEC_FULL.md §3).
    pub debug_artifact_ids: Option<DebugArtifactIds>,
}

#[derive(Debug, Clone, Default)]
pub struct DebugArtifactIds {
    pub vlm_raw: Vec<String>,
    pub ocr_raw: Vec<String>,
}
