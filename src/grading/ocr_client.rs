//! Per-page document-analysis OCR, returning word-level records tagged
//! printed or handwritten with absolute pixel bounding boxes.
//!
//! Bbox normalization (the upstream OCR API may return `[0,1]`-normalized
//! or pixel coordinates, and either `xywh` or `xyxy` box shapes depending on
//! provider) follows the host application's own `resolve_xywh` heuristic in
//! its PaddleOCR adapter.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde_json::Value;

use super::config::OcrConfig;
use super::error::{GradingError, Outcome};
use super::http::build_http_client;
use super::types::{OcrWord, Page, WordKind};

pub struct OcrClient {
    client: reqwest::Client,
    config: OcrConfig,
}

/// One page's recognized words plus the raw reply body they were parsed
/// from, kept for `debug.save_raw` persistence.
pub struct OcrReply {
    pub words: Vec<OcrWord>,
    pub raw_text: String,
}

impl OcrClient {
    pub fn new(config: OcrConfig) -> Self {
        let client = build_http_client(
            Duration::from_secs(config.timeout_secs),
            Duration::from_secs(15),
        );
        Self { client, config }
    }

    /// Recognizes one page. Failures here do not abort the grading flow —
    /// the caller (the orchestrator) degrades to text-only / sequential
    /// fusion on `Err`.
    pub async fn recognize(&self, page: &Page) -> Outcome<OcrReply> {
        if self.config.endpoint.is_empty() {
            return Err(GradingError::OCRFailure("no OCR endpoint configured".into()));
        }

        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            &page.normalized_bytes,
        );

        let mut body = serde_json::json!({
            "image": encoded,
            "api_key": self.config.api_key,
            "secret_key": self.config.secret_key,
        });
        if let Value::Object(ref mut map) = body {
            if let Value::Object(extra) = &self.config.params {
                for (k, v) in extra {
                    map.insert(k.clone(), v.clone());
                }
            }
        }

        // HTTP 429 is retried once with a jittered backoff (spec.md §5);
        // the page-level bounded retry loop in the orchestrator handles
        // every other transport/status failure on its own fixed delay.
        let backoff = ExponentialBuilder::default()
            .with_jitter()
            .with_min_delay(Duration::from_millis(500))
            .with_max_times(1);
        let raw_text = (|| self.send_once(&body))
            .retry(&backoff)
            .when(|e: &GradingError| matches!(e, GradingError::RateLimited(_)))
            .notify(|e, dur| log::warn!("[ocr] rate limited, retrying in {dur:?}: {e}"))
            .await?;

        let raw: Value = serde_json::from_str(&raw_text).map_err(|e| GradingError::OCRFailure(e.to_string()))?;
        let words = parse_ocr_response(&raw, page.page_index, page.width, page.height, self.config.min_word_confidence)?;
        Ok(OcrReply { words, raw_text })
    }

    async fn send_once(&self, body: &Value) -> Outcome<String> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GradingError::OCRTimeout
                } else {
                    GradingError::OCRFailure(e.to_string())
                }
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let text = response.text().await.unwrap_or_default();
            return Err(GradingError::RateLimited(format!("OCR: {text}")));
        }

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GradingError::OCRFailure(format!("HTTP {status}: {text}")));
        }

        response
            .text()
            .await
            .map_err(|e| GradingError::OCRFailure(e.to_string()))
    }
}

fn parse_ocr_response(
    raw: &Value,
    page_index: usize,
    page_width: u32,
    page_height: u32,
    min_word_confidence: f32,
) -> Outcome<Vec<OcrWord>> {
    let words = raw
        .get("words")
        .or_else(|| raw.get("results"))
        .and_then(|w| w.as_array())
        .ok_or_else(|| GradingError::OCRFailure("response has no word array".into()))?;

    let mut out = Vec::with_capacity(words.len());
    for w in words {
        let text = w
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        if text.is_empty() {
            continue;
        }
        let bbox = resolve_bbox(w, page_width, page_height);
        let Some(bbox) = bbox else { continue };

        let kind = match w.get("type").and_then(|t| t.as_str()) {
            Some("handwritten") | Some("handwriting") => WordKind::Handwritten,
            _ => WordKind::Printed,
        };
        let confidence = w.get("confidence").and_then(|c| c.as_f64()).unwrap_or(1.0) as f32;

        out.push(OcrWord::new(
            text,
            bbox,
            kind,
            confidence,
            page_index,
            min_word_confidence,
        ));
    }
    Ok(out)
}

/// Resolves a word's bounding box from whatever shape the provider sent:
/// `bbox: [x1,y1,x2,y2]`, `box: [x,y,w,h]`, or four corner points. Detects
/// normalized `[0,1]` coordinates by checking whether every component is
/// `<= 1.5` (a pixel box that small would be degenerate) and scales by the
/// page dimensions when so.
fn resolve_bbox(w: &Value, page_width: u32, page_height: u32) -> Option<[f32; 4]> {
    let arr = w
        .get("bbox")
        .or_else(|| w.get("box"))
        .or_else(|| w.get("location"))
        .and_then(|b| b.as_array())?;

    let nums: Vec<f32> = arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect();

    let mut xyxy = match nums.len() {
        4 => {
            // Try xyxy first; if that doesn't describe a valid box (x2<=x1
            // or y2<=y1) but interpreting the last two numbers as width and
            // height does, fall back to xywh. Mirrors the host
            // application's own `resolve_xywh` validity heuristic.
            let as_xyxy_valid = nums[2] > nums[0] && nums[3] > nums[1];
            if as_xyxy_valid {
                [nums[0], nums[1], nums[2], nums[3]]
            } else if nums[2] > 0.0 && nums[3] > 0.0 {
                [nums[0], nums[1], nums[0] + nums[2], nums[1] + nums[3]]
            } else {
                return None;
            }
        }
        8 => {
            let xs: Vec<f32> = (0..4).map(|i| nums[i * 2]).collect();
            let ys: Vec<f32> = (0..4).map(|i| nums[i * 2 + 1]).collect();
            [
                xs.iter().cloned().fold(f32::INFINITY, f32::min),
                ys.iter().cloned().fold(f32::INFINITY, f32::min),
                xs.iter().cloned().fold(f32::NEG_INFINITY, f32::max),
                ys.iter().cloned().fold(f32::NEG_INFINITY, f32::max),
            ]
        }
        _ => return None,
    };

    let looks_normalized = xyxy.iter().all(|v| *v <= 1.5);
    if looks_normalized {
        xyxy[0] *= page_width as f32;
        xyxy[1] *= page_height as f32;
        xyxy[2] *= page_width as f32;
        xyxy[3] *= page_height as f32;
    }

    if xyxy[0] < xyxy[2] && xyxy[1] < xyxy[3] {
        Some(xyxy)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_normalized_xyxy_box() {
        let w = serde_json::json!({"bbox": [0.1, 0.2, 0.3, 0.4]});
        let bbox = resolve_bbox(&w, 1000, 2000).unwrap();
        assert_eq!(bbox, [100.0, 400.0, 300.0, 800.0]);
    }

    #[test]
    fn resolves_pixel_xyxy_box_unscaled() {
        let w = serde_json::json!({"bbox": [10.0, 20.0, 110.0, 220.0]});
        let bbox = resolve_bbox(&w, 1000, 2000).unwrap();
        assert_eq!(bbox, [10.0, 20.0, 110.0, 220.0]);
    }

    #[test]
    fn resolves_corner_points_box() {
        let w = serde_json::json!({"bbox": [10.0,10.0, 50.0,10.0, 50.0,30.0, 10.0,30.0]});
        let bbox = resolve_bbox(&w, 1000, 1000).unwrap();
        assert_eq!(bbox, [10.0, 10.0, 50.0, 30.0]);
    }

    #[test]
    fn parses_word_array_and_flags_low_confidence() {
        let raw = serde_json::json!({
            "words": [
                {"text": "apple", "bbox": [10.0,10.0,60.0,40.0], "type": "handwritten", "confidence": 0.92},
                {"text": "?", "bbox": [70.0,10.0,90.0,40.0], "type": "handwritten", "confidence": 0.1},
            ]
        });
        let words = parse_ocr_response(&raw, 0, 1000, 1000, 0.3).unwrap();
        assert_eq!(words.len(), 2);
        assert!(!words[0].low_confidence);
        assert!(words[1].low_confidence);
    }
}
