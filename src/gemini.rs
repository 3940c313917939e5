use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::codec::ImagePayload;
use crate::compose::{ContentPart, ModelKind, ModelRequest, OutputFormat};
use crate::config::GeminiConfig;
use crate::error::{GenerationError, Result};

const DEFAULT_IMAGE_MIME: &str = "image/png";

/// One part of a model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Image(ImagePayload),
    Text(String),
}

/// The remote capability: given ordered image/text parts, return ordered
/// image/text parts or a classified error.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<Vec<ResponsePart>>;
}

/// First inline image wins. Text without an image means the model declined.
pub fn interpret_image_response(parts: Vec<ResponsePart>) -> Result<ImagePayload> {
    let mut text_output = String::new();
    for part in parts {
        match part {
            ResponsePart::Image(img) => return Ok(img),
            ResponsePart::Text(t) => text_output.push_str(&t),
        }
    }
    if text_output.trim().is_empty() {
        Err(GenerationError::EmptyModelResponse)
    } else {
        Err(GenerationError::model_text(&text_output))
    }
}

/// Concatenated text parts, for JSON replies.
pub fn response_text(parts: &[ResponsePart]) -> Option<String> {
    let text: String = parts
        .iter()
        .filter_map(|p| match p {
            ResponsePart::Text(t) => Some(t.as_str()),
            ResponsePart::Image(_) => None,
        })
        .collect();
    (!text.trim().is_empty()).then_some(text)
}

// Helper function to truncate base64 data in JSON for cleaner logging
fn truncate_base64_in_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let Value::String(s) = val {
                        if s.len() > 100 {
                            *val = Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

fn loggable(value: &Value) -> String {
    let mut copy = value.clone();
    truncate_base64_in_json(&mut copy);
    copy.to_string()
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    image_model: String,
    text_model: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GenerationError::Upstream { status: None, message: e.to_string() })?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            image_model: config.image_model.clone(),
            text_model: config.text_model.clone(),
        })
    }

    fn model_name(&self, kind: ModelKind) -> &str {
        match kind {
            ModelKind::Image => &self.image_model,
            ModelKind::Text => &self.text_model,
        }
    }

    fn request_body(request: &ModelRequest) -> Value {
        let parts: Vec<Value> = request
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::Image(img) => json!({
                    "inlineData": { "mimeType": img.media_type, "data": img.to_base64() }
                }),
                ContentPart::Text(text) => json!({ "text": text }),
            })
            .collect();
        let generation_config = match &request.output {
            OutputFormat::Image => json!({
                "responseModalities": ["TEXT", "IMAGE"],
                "candidateCount": 1
            }),
            OutputFormat::Json(schema) => json!({
                "responseMimeType": "application/json",
                "responseSchema": schema
            }),
        };
        json!({
            "contents": [{ "parts": parts }],
            "generationConfig": generation_config
        })
    }
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    async fn generate(&self, request: &ModelRequest) -> Result<Vec<ResponsePart>> {
        let model = self.model_name(request.model);
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let body = Self::request_body(request);

        info!("🔗 Gemini {} request with {} parts", model, request.parts.len());
        debug!("📤 Request body: {}", loggable(&body));

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Upstream { status: None, message: e.without_url().to_string() })?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| GenerationError::Upstream { status: Some(status.as_u16()), message: e.to_string() })?;

        if !status.is_success() {
            error!("❌ Gemini API error {}: {}", status, response_text);
            return Err(GenerationError::from_upstream(status.as_u16(), &response_text));
        }
        info!("📥 Response status: {}", status);

        parse_response(&response_text)
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text {
        text: String,
    },
    #[allow(dead_code)]
    Other(Value),
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
    #[serde(rename = "mimeType", default)]
    mime_type: Option<String>,
}

fn parse_response(response_text: &str) -> Result<Vec<ResponsePart>> {
    let parsed: GeminiResponse = serde_json::from_str(response_text).map_err(|e| GenerationError::Upstream {
        status: None,
        message: format!("unparseable response: {e}"),
    })?;

    let mut out = Vec::new();
    for candidate in parsed.candidates {
        for part in candidate.content.parts {
            match part {
                Part::Inline { inline_data } => {
                    let mime = inline_data.mime_type.unwrap_or_else(|| DEFAULT_IMAGE_MIME.to_string());
                    let image = ImagePayload::from_base64(mime, &inline_data.data)
                        .map_err(GenerationError::undecodable_model_image)?;
                    debug!("🖼️ Found image part: {}", image.summary());
                    out.push(ResponsePart::Image(image));
                }
                Part::Text { text } => out.push(ResponsePart::Text(text)),
                Part::Other(_) => {}
            }
        }
    }
    Ok(out)
}
