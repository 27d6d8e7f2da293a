use serde::Deserialize;

use super::error::{GradingError, Outcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub freeform_prompt: Vec<String>,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub max_tokens_retry: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            freeform_prompt: Vec::new(),
            endpoint: String::new(),
            api_key: String::new(),
            model: String::new(),
            max_tokens: 4096,
            max_tokens_retry: 8192,
            timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub endpoint: String,
    pub api_key: String,
    pub secret_key: String,
    pub params: serde_json::Value,
    pub timeout_secs: u64,
    pub min_word_confidence: f32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            secret_key: String::new(),
            params: serde_json::Value::Null,
            timeout_secs: 30,
            min_word_confidence: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub max_long_side: u32,
    pub jpeg_quality: u8,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_long_side: 3508,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub word_threshold: f32,
    pub phrase_threshold: f32,
    pub handwriting_threshold: f32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            word_threshold: 0.1,
            phrase_threshold: 0.5,
            handwriting_threshold: 0.4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub text_threshold: f64,
    pub position_max_distance: f32,
    pub consistency_threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            text_threshold: 0.6,
            position_max_distance: 100.0,
            consistency_threshold: 0.88,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UuidConfidenceWeights {
    pub numeric: f64,
    pub alpha: f64,
}

impl Default for UuidConfidenceWeights {
    fn default() -> Self {
        Self {
            numeric: 0.8,
            alpha: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub save_raw: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self { save_raw: false }
    }
}

/// Keyed configuration bundle for one grading run. Constructed explicitly by
/// the host and passed into [`crate::grading::grade`] by reference — no
/// hidden globals, no process-wide config path.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    pub llm: LlmConfig,
    pub ocr: OcrConfig,
    pub image: ImageConfig,
    pub merge: MergeConfig,
    #[serde(rename = "match")]
    pub match_: MatchConfig,
    pub uuid_confidence_weights: UuidConfidenceWeights,
    pub debug: DebugConfig,
    /// Maximum number of page images bundled into a single VLM call
    /// (§3 supplement: larger worksheets are split into sequential calls).
    pub vlm_max_images_per_call: usize,
    /// Overall HTTP client timeout shared by both engine clients.
    pub http_overall_timeout_secs: u64,
    /// Bounded fan-out width for the per-page OCR dispatch.
    pub ocr_concurrency: usize,
    /// Bounded retry attempts for a single page's OCR call before it is
    /// treated as a non-recoverable failure for that page.
    pub ocr_retry_attempts: u32,
    pub ocr_retry_delay_ms: u64,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            ocr: OcrConfig::default(),
            image: ImageConfig::default(),
            merge: MergeConfig::default(),
            match_: MatchConfig::default(),
            uuid_confidence_weights: UuidConfidenceWeights::default(),
            debug: DebugConfig::default(),
            vlm_max_images_per_call: 8,
            http_overall_timeout_secs: 270,
            ocr_concurrency: 4,
            ocr_retry_attempts: 3,
            ocr_retry_delay_ms: 400,
        }
    }
}

impl GradingConfig {
    /// Loads configuration the way the host application's own tool configs
    /// are loaded: a `.env` file is consulted first, then an optional TOML
    /// file named `config_name`, then environment variables prefixed
    /// `GRADING__` (double underscore as the nesting separator), each layer
    /// overriding the one before it.
    pub fn from_env_and_file(config_name: &str) -> Outcome<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        let file_path = format!("{config_name}.toml");
        if std::path::Path::new(&file_path).exists() {
            builder = builder.add_source(config::File::with_name(config_name));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GRADING")
                .separator("__")
                .list_separator(","),
        );

        let raw = builder
            .build()
            .map_err(|e| GradingError::Configuration(e.to_string()))?;

        raw.try_deserialize()
            .map_err(|e| GradingError::Configuration(e.to_string()))
    }
}
