//! Converts one or more page JPEGs into a normalized tree of sections and
//! items via a single OpenAI-compatible multimodal chat completion.
//!
//! Request construction (Bearer auth, inline base64 image parts) follows the
//! host application's own `OpenAIAdapter::build_request`; the bounded
//! token-budget retry replaces the source's exception-based retry ladder
//! with the explicit outcome type called for in SPEC_FULL.md's design
//! notes.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use base64::Engine;
use serde_json::{json, Value};

use super::config::LlmConfig;
use super::error::{GradingError, Outcome};
use super::http::build_http_client;
use super::types::{Page, RawVlmItem, SectionType};

pub struct VlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

/// One flattened VLM reply item before `position` assignment, plus the raw
/// text the client parsed it from.
pub struct VlmReply {
    pub items: Vec<RawVlmItem>,
    pub raw_text: String,
}

impl VlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = build_http_client(
            Duration::from_secs(config.timeout_secs),
            Duration::from_secs(30),
        );
        Self { client, config }
    }

    /// Issues one multi-image prompt covering `pages`. Callers with more
    /// pages than `max_images_per_call` split the call themselves (see
    /// [`super::grade`]) and merge the flattened results.
    pub async fn recognize(&self, pages: &[Page]) -> Outcome<VlmReply> {
        let system_prompt = self.config.freeform_prompt.join("\n");

        match self.call_once(pages, &system_prompt, self.config.max_tokens).await {
            Ok(reply) => Ok(reply),
            Err(GradingError::VLMParseFailure(_)) => {
                log::warn!("[vlm] reply truncated, retrying with larger token budget");
                self.call_once(pages, &system_prompt, self.config.max_tokens_retry)
                    .await
            }
            Err(other) => Err(other),
        }
    }

    async fn call_once(
        &self,
        pages: &[Page],
        system_prompt: &str,
        max_tokens: u32,
    ) -> Outcome<VlmReply> {
        let mut content: Vec<Value> = Vec::with_capacity(pages.len() + 1);
        content.push(json!({ "type": "text", "text": "Grade this worksheet." }));
        for page in pages {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&page.normalized_bytes);
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{encoded}") },
            }));
        }

        let body = json!({
            "model": self.config.model,
            "max_tokens": max_tokens,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": content },
            ],
        });

        log::debug!(
            "[vlm] dispatching call: model={} pages={} max_tokens={} key={}",
            self.config.model,
            pages.len(),
            max_tokens,
            mask_for_log(&self.config.api_key)
        );

        // HTTP 429 is retried once with a jittered backoff (spec.md §5);
        // every other transport/status failure surfaces immediately.
        let backoff = ExponentialBuilder::default()
            .with_jitter()
            .with_min_delay(Duration::from_millis(500))
            .with_max_times(1);
        let raw_text = (|| self.send_once(&body))
            .retry(&backoff)
            .when(|e: &GradingError| matches!(e, GradingError::RateLimited(_)))
            .notify(|e, dur| log::warn!("[vlm] rate limited, retrying in {dur:?}: {e}"))
            .await?;

        let items = parse_vlm_reply(&raw_text)?;
        Ok(VlmReply { items, raw_text })
    }

    async fn send_once(&self, body: &Value) -> Outcome<String> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GradingError::VLMTimeout
                } else {
                    GradingError::VLMFailure(e.to_string())
                }
            })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let text = response.text().await.unwrap_or_default();
            return Err(GradingError::RateLimited(format!("VLM: {text}")));
        }

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GradingError::VLMFailure(format!("HTTP {status}: {text}")));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| GradingError::VLMFailure(e.to_string()))?;

        Ok(raw["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

fn mask_for_log(key: &str) -> String {
    if key.len() <= 8 {
        "***".to_string()
    } else {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    }
}

/// Locates the first `{` and its balancing `}` (tolerating surrounding
/// prose), parses JSON, then flattens either the nested `sections` shape or
/// the legacy flat `items` shape into [`RawVlmItem`]s. `position` is left at
/// `0`; the orchestrator assigns it in a single pass.
fn parse_vlm_reply(raw_text: &str) -> Outcome<Vec<RawVlmItem>> {
    let json_slice = extract_json_object(raw_text)
        .ok_or_else(|| GradingError::VLMParseFailure("no JSON object found in reply".into()))?;
    let value: Value = serde_json::from_str(json_slice)
        .map_err(|e| GradingError::VLMParseFailure(e.to_string()))?;

    let mut items = Vec::new();
    if let Some(sections) = value.get("sections").and_then(|s| s.as_array()) {
        for section in sections {
            let title = section
                .get("title")
                .and_then(|t| t.as_str())
                .map(|s| s.to_string());
            let section_type = section
                .get("type")
                .and_then(|t| t.as_str())
                .and_then(parse_section_type);
            let questions = section.get("items").and_then(|i| i.as_array());
            if let Some(questions) = questions {
                for (idx, q) in questions.iter().enumerate() {
                    items.push(parse_item(
                        q,
                        if idx == 0 { title.clone() } else { None },
                        section_type,
                    )?);
                }
            }
        }
    } else if let Some(flat) = value.get("items").and_then(|i| i.as_array()) {
        for q in flat {
            items.push(parse_item(q, None, None)?);
        }
    } else {
        return Err(GradingError::VLMParseFailure(
            "reply has neither `sections` nor `items`".into(),
        ));
    }

    Ok(items)
}

fn parse_section_type(raw: &str) -> Option<SectionType> {
    match raw.to_ascii_uppercase().as_str() {
        "WORD" => Some(SectionType::Word),
        "PHRASE" => Some(SectionType::Phrase),
        "SENTENCE" => Some(SectionType::Sentence),
        _ => None,
    }
}

fn parse_item(
    q: &Value,
    section_title: Option<String>,
    section_type: Option<SectionType>,
) -> Outcome<RawVlmItem> {
    let bbox = q.get("bbox").and_then(|b| b.as_array()).and_then(|arr| {
        if arr.len() == 4 {
            let mut out = [0f32; 4];
            for (i, v) in arr.iter().enumerate() {
                out[i] = v.as_f64()? as f32;
            }
            Some(out)
        } else {
            None
        }
    });

    Ok(RawVlmItem {
        q: q.get("q").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        zh_hint: q
            .get("hint")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        student_text: q
            .get("ans")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        is_correct: q.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        confidence: q.get("conf").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
        page_index: q.get("pg").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
        note: q
            .get("note")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        handwriting_bbox: bbox,
        section_title,
        section_type,
        position: 0,
    })
}

/// Extraction helper mirroring the host application's own
/// `extract_json_from_response`: find the first `{`, then the matching `}`
/// by brace-depth counting, so surrounding prose or a markdown code fence
/// doesn't break parsing.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_fenced_prose() {
        let text = "Here is the result:\n```json\n{\"items\": [{\"q\":1}]}\n```\nThanks.";
        let slice = extract_json_object(text).unwrap();
        assert_eq!(slice, "{\"items\": [{\"q\":1}]}");
    }

    #[test]
    fn flattens_sections_with_title_on_first_item_only() {
        let reply = r#"{
            "sections": [
                {"title": "Words", "type": "WORD", "items": [
                    {"q":1,"hint":"苹果","ans":"apple","ok":true,"conf":0.98,"pg":0},
                    {"q":2,"hint":"尾巴","ans":"teil","ok":false,"conf":0.95,"pg":0}
                ]}
            ]
        }"#;
        let items = parse_vlm_reply(reply).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].section_title.as_deref(), Some("Words"));
        assert_eq!(items[1].section_title, None);
        assert_eq!(items[0].section_type, Some(SectionType::Word));
    }

    #[test]
    fn flattens_legacy_flat_shape() {
        let reply = r#"{"items": [{"q":1,"hint":"马","ans":"","ok":false,"conf":1.0,"pg":0,"note":"未作答"}]}"#;
        let items = parse_vlm_reply(reply).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].note.as_deref(), Some("未作答"));
    }

    #[test]
    fn errors_when_no_json_object_present() {
        let err = parse_vlm_reply("no json here").unwrap_err();
        assert!(matches!(err, GradingError::VLMParseFailure(_)));
    }
}
