use crate::app_error::AppError;

/// Error taxonomy for the grading pipeline.
///
/// `OCRFailure`/`OCRTimeout` are recoverable by callers of the individual
/// clients (the orchestrator in [`crate::grading`] degrades instead of
/// propagating them); every other variant is fatal to a single request.
#[derive(Debug, Clone)]
pub enum GradingError {
    InvalidImage(String),
    TooLarge { width: u32, height: u32, cap: u32 },
    VLMParseFailure(String),
    VLMTimeout,
    VLMFailure(String),
    OCRFailure(String),
    OCRTimeout,
    /// HTTP 429 from either engine. Retried once with a jittered backoff at
    /// the client level (see `vlm_client`/`ocr_client`); surfaced as this
    /// variant only once that single retry is also rate-limited.
    RateLimited(String),
    DelegatePersistFailure(String),
    Configuration(String),
    Cancelled,
}

impl std::fmt::Display for GradingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidImage(msg) => write!(f, "invalid image: {msg}"),
            Self::TooLarge { width, height, cap } => {
                write!(f, "image {width}x{height} exceeds long-side cap {cap}")
            }
            Self::VLMParseFailure(msg) => write!(f, "VLM reply could not be parsed: {msg}"),
            Self::VLMTimeout => write!(f, "VLM request timed out"),
            Self::VLMFailure(msg) => write!(f, "VLM request failed: {msg}"),
            Self::OCRFailure(msg) => write!(f, "OCR request failed: {msg}"),
            Self::OCRTimeout => write!(f, "OCR request timed out"),
            Self::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            Self::DelegatePersistFailure(msg) => write!(f, "could not persist artifact: {msg}"),
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for GradingError {}

impl From<GradingError> for AppError {
    fn from(e: GradingError) -> Self {
        match e {
            GradingError::InvalidImage(msg) => AppError::validation(msg),
            GradingError::TooLarge { width, height, cap } => AppError::validation(format!(
                "image {width}x{height} exceeds long-side cap {cap}"
            )),
            GradingError::VLMParseFailure(msg) => AppError::llm(msg),
            GradingError::VLMTimeout => AppError::network("VLM request timed out"),
            GradingError::VLMFailure(msg) => AppError::llm(msg),
            GradingError::OCRFailure(msg) => AppError::llm(msg),
            GradingError::OCRTimeout => AppError::network("OCR request timed out"),
            GradingError::RateLimited(msg) => AppError::network(msg),
            GradingError::DelegatePersistFailure(msg) => AppError::file_system(msg),
            GradingError::Configuration(msg) => AppError::configuration(msg),
            GradingError::Cancelled => AppError::unknown("request cancelled"),
        }
    }
}

/// Shorthand `Result` alias for this module. Named `Outcome` to avoid
/// colliding with [`crate::grading::types::GradingResult`], the data-model
/// record returned by a successful [`crate::grading::grade`] call.
pub type Outcome<T> = std::result::Result<T, GradingError>;
