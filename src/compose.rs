//! Builds the ordered content parts and instruction texts sent to the model.
//!
//! Nothing here touches the network. Image ordering matters: the
//! instruction text refers to images by position ("the second image").

use serde_json::{json, Value};

use crate::codec::ImagePayload;
use crate::error::{GenerationError, Result};
use crate::models::ViewAngle;

pub const REFERENCE_ONLY_PROMPT: &str = "Change the hairstyle to match the reference image.";

pub const SUGGESTION_COUNT: usize = 4;
pub const TRENDING_COUNT: usize = 5;
pub const MIN_SUGGESTION_INPUT: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Image(ImagePayload),
    Text(String),
}

#[cfg(test)]
impl ContentPart {
    pub fn as_image(&self) -> Option<&ImagePayload> {
        match self {
            ContentPart::Image(img) => Some(img),
            ContentPart::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text(t) => Some(t),
            ContentPart::Image(_) => None,
        }
    }
}

/// Which configured model a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Image,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputFormat {
    Image,
    /// JSON constrained by a Gemini response schema.
    Json(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: ModelKind,
    pub parts: Vec<ContentPart>,
    pub output: OutputFormat,
}

#[cfg(test)]
impl ModelRequest {
    pub fn images(&self) -> Vec<&ImagePayload> {
        self.parts.iter().filter_map(ContentPart::as_image).collect()
    }

    /// The instruction text, always the final part.
    pub fn instruction(&self) -> Option<&str> {
        self.parts.last().and_then(ContentPart::as_text)
    }
}

/// One base (front view) edit.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub source: ImagePayload,
    pub style_prompt: String,
    pub mask: Option<ImagePayload>,
    pub reference: Option<ImagePayload>,
}

impl GenerationRequest {
    /// An empty prompt is only allowed when a reference image supplies the style.
    pub fn new(
        source: ImagePayload,
        style_prompt: &str,
        mask: Option<ImagePayload>,
        reference: Option<ImagePayload>,
    ) -> Result<Self> {
        let prompt = style_prompt.trim();
        let style_prompt = match (prompt.is_empty(), reference.is_some()) {
            (false, _) => prompt.to_string(),
            (true, true) => REFERENCE_ONLY_PROMPT.to_string(),
            (true, false) => {
                return Err(GenerationError::InvalidRequest("a style prompt is required".into()))
            }
        };
        Ok(Self { source, style_prompt, mask, reference })
    }
}

pub fn compose_edit(request: &GenerationRequest) -> ModelRequest {
    let mut parts = vec![ContentPart::Image(request.source.clone())];
    let prompt = &request.style_prompt;

    let mut instruction = if let Some(mask) = &request.mask {
        parts.push(ContentPart::Image(mask.clone()));
        format!(
            "Context: The first image is the source portrait. The second image is a mask where white indicates the hair region.
Task: Edit the source image by changing the hair in the masked area.
Style Instruction: \"{prompt}\"
Constraints:
- Strictly preserve the face, facial features (eyes, nose, mouth), skin tone, and background of the source image.
- Only modify the hair.
- Ensure the new hair blends realistically with the original head shape and lighting.
Output: Generate the resulting image."
        )
    } else {
        format!(
            "Context: The provided image is a portrait.
Task: Automatically detect and segment the person's hair, then replace it.
Style Instruction: \"{prompt}\"
Constraints:
- CRITICAL: Do not change the person's face, identity, or expression.
- Keep the background exactly the same.
- Adjust the new hairstyle to fit the person's head shape naturally.
- The result must be photorealistic.
Output: Generate the resulting image."
        )
    };

    if let Some(reference) = &request.reference {
        parts.push(ContentPart::Image(reference.clone()));
        let position = if request.mask.is_some() { "third" } else { "second" };
        instruction.push_str(&format!(
            "\nReference: Use the hairstyle in the {position} image as a strict visual guide for texture, color, and cut. Transfer this style to the source person."
        ));
    }

    parts.push(ContentPart::Text(instruction));
    ModelRequest { model: ModelKind::Image, parts, output: OutputFormat::Image }
}

fn angle_description(angle: ViewAngle) -> Option<&'static str> {
    match angle {
        ViewAngle::Front => None,
        ViewAngle::Left => Some("left profile"),
        ViewAngle::Right => Some("right profile"),
        ViewAngle::Back => Some("view from behind (back of head)"),
    }
}

/// Identity image first, hairstyle-bearing front result second, text last.
pub fn compose_angle_view(
    identity: &ImagePayload,
    front: &ImagePayload,
    style_prompt: &str,
    angle: ViewAngle,
) -> Result<ModelRequest> {
    let direction = angle_description(angle).ok_or_else(|| {
        GenerationError::PreconditionViolation("the front view comes from the base generation".into())
    })?;
    let instruction = format!(
        "Context:
- Image 1 is the reference for the person's identity (face, skin tone, clothes).
- Image 2 is the reference for the NEW hairstyle that has been applied to them.

Task:
Generate a photorealistic image of this same person, but viewed from the {direction}.

Requirements:
- Identity: Must look like the same person as Image 1 (consistent clothes, skin).
- Hair: Must look like the SAME hairstyle as Image 2, but viewed from the {direction}.
  - Visualize how this specific cut (length, texture, volume) looks from the side/back.
- Style: Photorealistic, studio lighting.
- Hairstyle Description: {style_prompt}.
Output: Generate the resulting image."
    );
    Ok(ModelRequest {
        model: ModelKind::Image,
        parts: vec![
            ContentPart::Image(identity.clone()),
            ContentPart::Image(front.clone()),
            ContentPart::Text(instruction),
        ],
        output: OutputFormat::Image,
    })
}

pub fn compose_hair_segmentation(source: &ImagePayload) -> ModelRequest {
    ModelRequest {
        model: ModelKind::Image,
        parts: vec![
            ContentPart::Image(source.clone()),
            ContentPart::Text(
                "Generate a high-contrast black and white segmentation mask of the hair in this image. \
                 The hair area must be pure white (#FFFFFF) and the background, face, and clothes must be pure black (#000000). \
                 The mask must match the composition and framing of the original image exactly."
                    .into(),
            ),
        ],
        output: OutputFormat::Image,
    }
}

fn analysis_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "faceShape": { "type": "STRING", "description": "The identified face shape" },
            "features": { "type": "STRING", "description": "Brief description of key facial features" },
            "suggestions": {
                "type": "ARRAY",
                "description": "List of 3 suggested hairstyles",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "name": { "type": "STRING", "description": "A catchy name for the hairstyle (e.g. 'Textured French Bob')" },
                        "description": { "type": "STRING", "description": "A complete, actionable image generation prompt starting with 'Change the hairstyle to...'. Include details on texture, volume, color, and how it frames the face. Mention 'Keep the face identical'." }
                    },
                    "required": ["name", "description"]
                }
            }
        },
        "required": ["faceShape", "features", "suggestions"]
    })
}

fn string_list_schema() -> Value {
    json!({ "type": "ARRAY", "items": { "type": "STRING" } })
}

pub fn compose_face_analysis(source: &ImagePayload) -> ModelRequest {
    let instruction = "Analyze the face in this image to provide highly personalized hairstyle recommendations.
1. Accurately identify the face shape (e.g. Oval, Round, Square, Heart, Diamond, Oblong).
2. Describe key facial features relevant to styling (e.g. forehead height, jawline strength, neck length).
3. Suggest 3 distinct, trendy, and flattering hairstyles specifically tailored to this face shape.
   - Variety Requirement: Include one Short/Medium style, one Long style, and one Creative/Bold style.

Return the result in JSON format.";
    ModelRequest {
        model: ModelKind::Text,
        parts: vec![ContentPart::Image(source.clone()), ContentPart::Text(instruction.into())],
        output: OutputFormat::Json(analysis_schema()),
    }
}

pub fn compose_style_suggestions(partial: &str) -> ModelRequest {
    let instruction = format!(
        "The user is using an AI hairstyle editor and typing a prompt: \"{partial}\".
Provide {SUGGESTION_COUNT} short, distinct, and visually descriptive hairstyle phrases that could complete or enhance this thought.
Focus on specific cuts, colors, and textures (e.g. \"Long wavy platinum blonde\", \"Short textured pixie cut\").
Return ONLY a JSON array of strings."
    );
    ModelRequest {
        model: ModelKind::Text,
        parts: vec![ContentPart::Text(instruction)],
        output: OutputFormat::Json(string_list_schema()),
    }
}

pub fn compose_trending_styles() -> ModelRequest {
    let instruction = format!(
        "Identify {TRENDING_COUNT} currently trending hairstyles that are popular globally right now (from social media, fashion, etc).
Provide them as short, creative, and visually descriptive prompt phrases suitable for an AI image editor.
Examples: \"Textured wolf cut with blonde money pieces\", \"Sleek liquid bob with glass hair finish\".
Return ONLY a JSON array of strings."
    );
    ModelRequest {
        model: ModelKind::Text,
        parts: vec![ContentPart::Text(instruction)],
        output: OutputFormat::Json(string_list_schema()),
    }
}
