use thiserror::Error;

use crate::models::ViewAngle;

pub type Result<T> = std::result::Result<T, GenerationError>;

/// Everything that can go wrong between an API call and a committed image.
///
/// Remote failures are classified exactly once, where the HTTP response is
/// read (see `gemini.rs`); callers branch on the variant, never on the text.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid image data format")]
    InvalidImageFormat,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// 429 / 503 / RESOURCE_EXHAUSTED. The only retryable kind.
    #[error("model capacity exhausted (status={status:?}): {message}")]
    TransientCapacity { status: Option<u16>, message: String },

    #[error("upstream error (status={status:?}): {message}")]
    Upstream { status: Option<u16>, message: String },

    #[error("model returned text instead of an image: {excerpt}")]
    ModelReturnedText { excerpt: String },

    #[error("no image data found in response")]
    EmptyModelResponse,

    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("{0} view is already being generated")]
    AngleBusy(ViewAngle),

    #[error("malformed analysis response: {0}")]
    MalformedAnalysisResponse(String),

    #[error("malformed style list: {0}")]
    MalformedStyleList(String),

    #[error("mask error: {0}")]
    Mask(String),

    /// The session moved on (new upload or new base generation) while the
    /// request was in flight; its result was dropped.
    #[error("result discarded, the session has changed since the request started")]
    Superseded,

    #[error("request cancelled")]
    Cancelled,
}

/// Coarse grouping used for user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Generic,
}

const EXCERPT_CHARS: usize = 100;

impl GenerationError {
    /// Maps a non-success upstream status and body to an error kind.
    pub fn from_upstream(status: u16, body: &str) -> Self {
        let message = body.trim().to_string();
        if status == 429 || status == 503 || body.contains("RESOURCE_EXHAUSTED") {
            Self::TransientCapacity { status: Some(status), message }
        } else {
            Self::Upstream { status: Some(status), message }
        }
    }

    /// Image bytes from the model that cannot be decoded. An upstream
    /// fault, not a client one.
    pub fn undecodable_model_image(detail: impl std::fmt::Display) -> Self {
        Self::Upstream { status: None, message: format!("undecodable image in model response: {detail}") }
    }

    pub fn model_text(text: &str) -> Self {
        let excerpt = if text.chars().count() > EXCERPT_CHARS {
            let cut: String = text.chars().take(EXCERPT_CHARS).collect();
            format!("{cut}...")
        } else {
            text.to_string()
        };
        Self::ModelReturnedText { excerpt }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientCapacity { .. })
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::RateLimited
        } else {
            ErrorClass::Generic
        }
    }

    /// Single message shown to the user for a failed generation.
    /// `angle` is `None` for the base (front) generation.
    pub fn user_message(&self, angle: Option<ViewAngle>) -> String {
        match (self.class(), angle) {
            (ErrorClass::RateLimited, None) => {
                "High traffic volume (Quota Exceeded). Please wait a minute and try again.".into()
            }
            (ErrorClass::RateLimited, Some(_)) => "Quota Exceeded. Please wait a moment.".into(),
            (ErrorClass::Generic, None) | (ErrorClass::Generic, Some(ViewAngle::Front)) => {
                "Failed to generate image. Please try again.".into()
            }
            (ErrorClass::Generic, Some(angle)) => {
                format!("Failed to generate {angle} view. Please try again.")
            }
        }
    }

    /// Stable identifier for API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidImageFormat => "invalid_image_format",
            Self::InvalidRequest(_) => "invalid_request",
            Self::TransientCapacity { .. } => "rate_limited",
            Self::Upstream { .. } => "upstream",
            Self::ModelReturnedText { .. } => "model_returned_text",
            Self::EmptyModelResponse => "empty_model_response",
            Self::PreconditionViolation(_) => "precondition_violation",
            Self::AngleBusy(_) => "angle_busy",
            Self::MalformedAnalysisResponse(_) => "malformed_analysis_response",
            Self::MalformedStyleList(_) => "malformed_style_list",
            Self::Mask(_) => "mask",
            Self::Superseded => "superseded",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<image::ImageError> for GenerationError {
    fn from(e: image::ImageError) -> Self {
        match e {
            image::ImageError::Decoding(_) | image::ImageError::Unsupported(_) => {
                Self::InvalidImageFormat
            }
            other => Self::Mask(other.to_string()),
        }
    }
}
