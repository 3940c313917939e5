use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GenerationError, Result};
use crate::mask::{Point, Tool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ViewAngle {
    #[serde(alias = "front")]
    Front,
    #[serde(alias = "left")]
    Left,
    #[serde(alias = "right")]
    Right,
    #[serde(alias = "back")]
    Back,
}

impl ViewAngle {
    pub const ALL: [ViewAngle; 4] = [ViewAngle::Front, ViewAngle::Left, ViewAngle::Right, ViewAngle::Back];

    /// Views generated from the front result rather than from the upload.
    pub fn is_derived(self) -> bool {
        !matches!(self, ViewAngle::Front)
    }
}

impl fmt::Display for ViewAngle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViewAngle::Front => "Front",
            ViewAngle::Left => "Left",
            ViewAngle::Right => "Right",
            ViewAngle::Back => "Back",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SuggestedStyle {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FaceAnalysis {
    pub face_shape: String,
    pub features: String,
    pub suggestions: Vec<SuggestedStyle>,
}

pub const ANALYSIS_SUGGESTIONS: usize = 3;

impl FaceAnalysis {
    /// Strict parse of the analysis model's JSON reply. Anything short of
    /// the full shape is rejected instead of patched up.
    pub fn from_model_text(text: &str) -> Result<Self> {
        let analysis: FaceAnalysis = serde_json::from_str(text.trim())
            .map_err(|e| GenerationError::MalformedAnalysisResponse(e.to_string()))?;
        if analysis.face_shape.trim().is_empty() {
            return Err(GenerationError::MalformedAnalysisResponse("empty faceShape".into()));
        }
        if analysis.suggestions.len() != ANALYSIS_SUGGESTIONS {
            return Err(GenerationError::MalformedAnalysisResponse(format!(
                "expected {ANALYSIS_SUGGESTIONS} suggestions, got {}",
                analysis.suggestions.len()
            )));
        }
        if analysis
            .suggestions
            .iter()
            .any(|s| s.name.trim().is_empty() || s.description.trim().is_empty())
        {
            return Err(GenerationError::MalformedAnalysisResponse("blank suggestion".into()));
        }
        Ok(analysis)
    }
}

// --- API request bodies ---

#[derive(Debug, Deserialize, Clone)]
pub struct UploadRequest {
    /// `data:<mediaType>;base64,...`
    pub image: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub style_id: Option<String>,
    #[serde(default)]
    pub use_reference: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StrokeRequest {
    pub points: Vec<Point>,
    #[serde(default)]
    pub tool: Tool,
    /// 1-100, relative to image width.
    pub brush_size: f32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SuggestionQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StyleQuery {
    #[serde(default)]
    pub category: Option<crate::styles::Category>,
}

// --- API responses ---

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Ready,
    Unavailable,
}

#[derive(Debug, Serialize, Clone)]
pub struct SessionView {
    pub id: Uuid,
    pub analysis_status: AnalysisStatus,
    pub analysis: Option<FaceAnalysis>,
    pub style_prompt: Option<String>,
    /// Angle -> data URL.
    pub views: BTreeMap<ViewAngle, String>,
    pub generating: Vec<ViewAngle>,
    pub has_mask: bool,
    pub has_reference: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Clone)]
pub struct ImageResponse {
    pub angle: ViewAngle,
    pub image: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct MaskResponse {
    pub mask: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct StylesResponse {
    pub styles: Vec<String>,
}
