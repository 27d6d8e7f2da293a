//! The dictation-worksheet grading core: fuses a vision-language model's
//! logical question structure with an OCR engine's pixel-accurate
//! bounding boxes into graded, annotated pages.
//!
//! Entry point: [`grade`]. Everything else in this module tree is wired
//! together by it; host applications only need this function and
//! [`delegate::PersistenceDelegate`].

pub mod annotator;
pub mod config;
pub mod delegate;
pub mod error;
pub mod fusion;
pub mod identifier;
pub mod line_builder;
pub mod ocr_client;
pub mod preprocessor;
pub mod types;
pub mod vlm_client;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::stream::{self, StreamExt};

use config::GradingConfig;
use delegate::PersistenceDelegate;
use error::{GradingError, Outcome};
use fusion::FusionMatcher;
use identifier::IdentifierExtractor;
use line_builder::LineBuilder;
use ocr_client::OcrClient;
use preprocessor::Preprocessor;
use types::{
    DebugArtifactIds, GradingResult, OcrWord, Page, QuestionPosition, RawVlmItem, SectionType,
};
use vlm_client::VlmClient;

/// One uploaded page blob plus its MIME hint, per the Preprocessor's
/// contract.
pub struct PageUpload {
    pub bytes: Vec<u8>,
    pub mime_hint: Option<String>,
}

/// Runs the full pipeline for one grading request.
///
/// Concurrency model: preprocessing completes before either engine call
/// starts; the VLM call(s) and the N per-page OCR calls then run
/// concurrently, fanning out and back in at exactly the two suspension
/// points the design calls for. If `cancel` fires during either wait, the
/// function returns [`GradingError::Cancelled`] without persisting any
/// partially drawn annotation.
pub async fn grade(
    uploads: Vec<PageUpload>,
    config: &GradingConfig,
    delegate: Arc<dyn PersistenceDelegate>,
    cancel: Option<tokio::sync::watch::Receiver<bool>>,
) -> Outcome<GradingResult> {
    let blobs: Vec<Vec<u8>> = uploads.into_iter().map(|u| u.bytes).collect();

    // CPU-bound decode + white balance runs on the blocking pool.
    let max_long_side = config.image.max_long_side;
    let jpeg_quality = config.image.jpeg_quality;
    let pages = tokio::task::spawn_blocking(move || {
        Preprocessor::new(max_long_side, jpeg_quality).process_all(blobs)
    })
    .await
    .map_err(|e| GradingError::Configuration(format!("preprocessing task panicked: {e}")))??;

    if pages.is_empty() {
        return Err(GradingError::InvalidImage("no pages uploaded".into()));
    }

    let page_dims: Vec<(u32, u32)> = pages.iter().map(|p| (p.width, p.height)).collect();

    let vlm_client = VlmClient::new(config.llm.clone());
    let ocr_client = Arc::new(OcrClient::new(config.ocr.clone()));

    let vlm_task = run_vlm(pages.clone(), config.vlm_max_images_per_call, vlm_client);
    let ocr_task = run_ocr_fan_out(pages.clone(), ocr_client.clone(), config);

    let (vlm_outcome, ocr_outcome) = match cancel {
        Some(mut cancel_rx) => {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    return Err(GradingError::Cancelled);
                }
                joined = future::join(vlm_task, ocr_task) => joined,
            }
        }
        None => future::join(vlm_task, ocr_task).await,
    };

    let (vlm_items, vlm_raw_texts) = vlm_outcome?;
    // OCR is allowed to degrade: a failure here does not abort the request.
    let (ocr_words, ocr_raw_texts) = match ocr_outcome {
        Ok(result) => result,
        Err(e) => {
            log::warn!("[grading] OCR degraded, proceeding text-only: {e}");
            (Vec::new(), Vec::new())
        }
    };

    let line_builder = LineBuilder::new(config.merge.clone());
    let identifier_extractor = IdentifierExtractor::new(config.uuid_confidence_weights.clone());
    let fusion = FusionMatcher::new(config.match_.clone());

    let dominant_type_per_page = dominant_section_type_per_page(&vlm_items);

    let mut lines_per_page: HashMap<usize, Vec<types::OcrLine>> = HashMap::new();
    let mut positions_per_page: HashMap<usize, Vec<QuestionPosition>> = HashMap::new();
    let mut uuid_candidates = Vec::with_capacity(pages.len());

    for page in &pages {
        let dominant = dominant_type_per_page.get(&page.page_index).copied();
        let lines = line_builder.build_lines(&ocr_words, page.page_index, dominant);
        lines_per_page.insert(page.page_index, lines);
        let positions = line_builder.extract_question_positions(&ocr_words, page.page_index);
        positions_per_page.insert(page.page_index, positions);
        uuid_candidates.push(identifier_extractor.extract_page_candidate(&ocr_words, page.page_index));
    }

    let mut all_lines: Vec<types::OcrLine> = lines_per_page.into_values().flatten().collect();
    let all_positions: Vec<QuestionPosition> = positions_per_page.into_values().flatten().collect();

    let items = fusion.fuse(vlm_items, &mut all_lines, &all_positions, &page_dims);

    let (worksheet_uuid, uuid_warning) = identifier_extractor.consensus(&uuid_candidates);

    let annotator = annotator::Annotator::new(config.image.jpeg_quality);
    let mut items_by_page: HashMap<usize, Vec<&types::GradedItem>> = HashMap::new();
    for item in &items {
        items_by_page.entry(item.page_index).or_default().push(item);
    }

    let mut original_image_urls = Vec::with_capacity(pages.len());
    let mut graded_image_urls = Vec::with_capacity(pages.len());

    for page in &pages {
        match delegate.put("original", &page.original_bytes).await {
            Ok(url) => original_image_urls.push(Some(url)),
            Err(e) => {
                log::warn!("[grading] failed to persist original page {}: {e}", page.page_index);
                original_image_urls.push(None);
            }
        }

        let empty: Vec<&types::GradedItem> = Vec::new();
        let page_items = items_by_page.get(&page.page_index).unwrap_or(&empty);
        let annotated_bytes = annotator.annotate_page(page, page_items)?;
        match delegate.put("graded", &annotated_bytes).await {
            Ok(url) => graded_image_urls.push(Some(url)),
            Err(e) => {
                log::warn!("[grading] failed to persist graded page {}: {e}", page.page_index);
                graded_image_urls.push(None);
            }
        }
    }

    let debug_artifact_ids = if config.debug.save_raw {
        let mut ids = DebugArtifactIds::default();
        for text in &vlm_raw_texts {
            if let Ok(id) = delegate.put_artifact("vlm_raw", text).await {
                ids.vlm_raw.push(id);
            }
        }
        for text in &ocr_raw_texts {
            if let Ok(id) = delegate.put_artifact("ocr_raw", text).await {
                ids.ocr_raw.push(id);
            }
        }
        Some(ids)
    } else {
        None
    };

    Ok(GradingResult {
        image_count: pages.len(),
        items,
        original_image_urls,
        graded_image_urls,
        extracted_date: None,
        worksheet_uuid,
        page_uuid_candidates: uuid_candidates,
        uuid_warning,
        debug_artifact_ids,
    })
}

/// Issues one VLM call per chunk of at most `max_images_per_call` pages,
/// merging the flattened items and renumbering `position` across the
/// merged sequence (SPEC_FULL.md §3's chunking supplement).
async fn run_vlm(
    pages: Vec<Page>,
    max_images_per_call: usize,
    client: VlmClient,
) -> Outcome<(Vec<RawVlmItem>, Vec<String>)> {
    let chunk_size = max_images_per_call.max(1);
    let mut merged = Vec::new();
    let mut raw_texts = Vec::new();

    for chunk in pages.chunks(chunk_size) {
        let reply = client.recognize(chunk).await?;
        raw_texts.push(reply.raw_text);
        merged.extend(reply.items);
    }

    for (idx, item) in merged.iter_mut().enumerate() {
        item.position = (idx + 1) as u32;
    }

    Ok((merged, raw_texts))
}

/// Fans out one OCR call per page with bounded concurrency, each wrapped in
/// a bounded retry loop with a fixed delay — the host application's own
/// chunked-retry idiom from its exam-sheet pipeline, minus the persistence
/// bookkeeping that idiom also carries. (The client itself already retries
/// a 429 once with a jittered backoff before this loop ever sees it.)
async fn run_ocr_fan_out(
    pages: Vec<Page>,
    client: Arc<OcrClient>,
    config: &GradingConfig,
) -> Outcome<(Vec<OcrWord>, Vec<String>)> {
    let concurrency = config.ocr_concurrency.max(1);
    let attempts = config.ocr_retry_attempts.max(1);
    let delay = Duration::from_millis(config.ocr_retry_delay_ms);

    let results: Vec<Outcome<(Vec<OcrWord>, String)>> = stream::iter(pages.into_iter())
        .map(|page| {
            let client = client.clone();
            async move {
                let mut last_err = GradingError::OCRFailure("no attempts made".into());
                for attempt in 0..attempts {
                    match client.recognize(&page).await {
                        Ok(reply) => return Ok((reply.words, reply.raw_text)),
                        Err(e) => {
                            let retryable = matches!(
                                e,
                                GradingError::OCRTimeout
                                    | GradingError::OCRFailure(_)
                                    | GradingError::RateLimited(_)
                            );
                            last_err = e;
                            if !retryable || attempt + 1 == attempts {
                                break;
                            }
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                Err(last_err)
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    // A single page's OCR failure degrades that page only; an all-pages
    // failure is treated the same way by the caller (empty word list),
    // since the Fusion Matcher already handles "no OCR lines at all".
    let mut words = Vec::new();
    let mut raw_texts = Vec::new();
    let mut any_ok = false;
    let mut last_err = None;
    for result in results {
        match result {
            Ok((mut page_words, raw_text)) => {
                any_ok = true;
                words.append(&mut page_words);
                raw_texts.push(raw_text);
            }
            Err(e) => last_err = Some(e),
        }
    }

    if !any_ok {
        if let Some(e) = last_err {
            return Err(e);
        }
    }
    Ok((words, raw_texts))
}

/// The modal section type among items on each page, used to pick the Line
/// Builder's merge threshold for that page. An unlabeled page (no item
/// carries a `section_type`) falls through to the Line Builder's own
/// stricter default.
fn dominant_section_type_per_page(items: &[RawVlmItem]) -> HashMap<usize, SectionType> {
    let mut counts: HashMap<usize, HashMap<SectionType, usize>> = HashMap::new();
    for item in items {
        if let Some(st) = item.section_type {
            *counts.entry(item.page_index).or_default().entry(st).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .filter_map(|(page, by_type)| {
            by_type
                .into_iter()
                .max_by_key(|(_, count)| *count)
                .map(|(st, _)| (page, st))
        })
        .collect()
}
