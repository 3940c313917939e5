use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::codec::ImagePayload;
use crate::compose::{self, MIN_SUGGESTION_INPUT, SUGGESTION_COUNT, TRENDING_COUNT};
use crate::error::{GenerationError, Result};
use crate::gemini::{interpret_image_response, response_text, GenerativeModel};
use crate::mask::MaskLayer;
use crate::models::FaceAnalysis;
use crate::retry::RetryPolicy;
use crate::session::{AngleTicket, FrontTicket, MaskTicket};
use crate::styles::FALLBACK_TRENDING;

/// Sequences every call against the remote model. Holds no session state:
/// callers pass tickets in and commit the returned images themselves.
pub struct Orchestrator {
    model: Arc<dyn GenerativeModel>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn GenerativeModel>, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }

    async fn call_for_image(&self, request: &compose::ModelRequest, cancel: &CancellationToken) -> Result<ImagePayload> {
        let parts = self.retry.run(cancel, || self.model.generate(request)).await?;
        interpret_image_response(parts)
    }

    async fn call_for_text(&self, request: &compose::ModelRequest, cancel: &CancellationToken) -> Result<Option<String>> {
        let parts = self.retry.run(cancel, || self.model.generate(request)).await?;
        Ok(response_text(&parts))
    }

    /// Face shape and three tailored suggestions. Supplementary: every
    /// failure is logged and reported as "no analysis".
    pub async fn analyze(&self, source: &ImagePayload, cancel: &CancellationToken) -> Option<FaceAnalysis> {
        let request = compose::compose_face_analysis(source);
        let text = match self.call_for_text(&request, cancel).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                warn!("⚠️ Face analysis returned no text");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "⚠️ Face analysis failed");
                return None;
            }
        };
        match FaceAnalysis::from_model_text(&text) {
            Ok(analysis) => {
                info!("🧑 Face analysis ready: {} face, {} suggestions", analysis.face_shape, analysis.suggestions.len());
                Some(analysis)
            }
            Err(e) => {
                warn!(error = %e, "⚠️ Discarding face analysis");
                None
            }
        }
    }

    pub async fn generate_front(&self, ticket: &FrontTicket) -> Result<ImagePayload> {
        let request = compose::compose_edit(&ticket.request);
        info!(
            "🎯 Generating front view (mask: {}, reference: {}): {}",
            ticket.request.mask.is_some(),
            ticket.request.reference.is_some(),
            ticket.request.style_prompt
        );
        match self.call_for_image(&request, &ticket.cancel).await {
            Ok(image) => {
                info!("✅ Front view generated: {}", image.summary());
                Ok(image)
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "❌ Front view generation failed");
                Err(e)
            }
        }
    }

    pub async fn generate_angle(&self, ticket: &AngleTicket) -> Result<ImagePayload> {
        let request = compose::compose_angle_view(&ticket.identity, &ticket.front, &ticket.style_prompt, ticket.angle)?;
        info!("🎯 Generating {} view", ticket.angle);
        match self.call_for_image(&request, &ticket.cancel).await {
            Ok(image) => {
                info!("✅ {} view generated: {}", ticket.angle, image.summary());
                Ok(image)
            }
            Err(e) => {
                error!(error = %e, kind = e.kind(), "❌ {} view generation failed", ticket.angle);
                Err(e)
            }
        }
    }

    /// Asks the model for a hair segmentation and binarizes it into a fresh layer.
    pub async fn detect_hair_mask(&self, ticket: &MaskTicket) -> Result<MaskLayer> {
        let request = compose::compose_hair_segmentation(&ticket.source);
        info!("🪄 Requesting hair segmentation mask");
        let segmentation = self.call_for_image(&request, &ticket.cancel).await.map_err(|e| {
            error!(error = %e, "❌ Mask generation failed");
            e
        })?;
        let mask = MaskLayer::from_segmentation(ticket.width, ticket.height, &segmentation)?;
        info!("✅ Hair mask detected: {} pixels selected", mask.selected_pixels());
        Ok(mask)
    }

    /// Completions for a prompt being typed. Empty on short input or failure.
    pub async fn suggest_styles(&self, partial: &str) -> Vec<String> {
        let partial = partial.trim();
        if partial.chars().count() < MIN_SUGGESTION_INPUT {
            return Vec::new();
        }
        let request = compose::compose_style_suggestions(partial);
        match self.fetch_string_list(&request).await {
            Ok(list) => list.into_iter().take(SUGGESTION_COUNT).collect(),
            Err(e) => {
                warn!(error = %e, "⚠️ Suggestion lookup failed");
                Vec::new()
            }
        }
    }

    pub async fn trending_styles(&self) -> Vec<String> {
        let request = compose::compose_trending_styles();
        match self.fetch_string_list(&request).await {
            Ok(list) if !list.is_empty() => list.into_iter().take(TRENDING_COUNT).collect(),
            Ok(_) => FALLBACK_TRENDING.iter().map(|s| s.to_string()).collect(),
            Err(e) => {
                warn!(error = %e, "⚠️ Trending lookup failed, using fallback list");
                FALLBACK_TRENDING.iter().map(|s| s.to_string()).collect()
            }
        }
    }

    async fn fetch_string_list(&self, request: &compose::ModelRequest) -> Result<Vec<String>> {
        let Some(text) = self.call_for_text(request, &CancellationToken::new()).await? else {
            return Ok(Vec::new());
        };
        let list: Vec<String> = serde_json::from_str(text.trim())
            .map_err(|e| GenerationError::MalformedStyleList(e.to_string()))?;
        Ok(list.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::compose::ModelKind;
    use crate::models::ViewAngle;
    use crate::session::Session;
    use crate::testing::{png, ScriptedModel};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(10), max_jitter: Duration::ZERO }
    }

    fn setup() -> (Arc<ScriptedModel>, Orchestrator) {
        let model = Arc::new(ScriptedModel::new());
        let orchestrator = Orchestrator::new(model.clone(), fast_retry());
        (model, orchestrator)
    }

    fn analysis_reply() -> String {
        serde_json::json!({
            "faceShape": "Heart",
            "features": "Wide forehead, narrow chin",
            "suggestions": [
                {"name": "Textured Lob", "description": "Change the hairstyle to a textured lob. Keep the face identical."},
                {"name": "Long Layers", "description": "Change the hairstyle to long soft layers. Keep the face identical."},
                {"name": "Copper Shag", "description": "Change the hairstyle to a copper shag. Keep the face identical."}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn upload_analyze_then_generate_from_suggestion() {
        let (model, orchestrator) = setup();
        let upload = png(32, 32, [120, 90, 60]);
        let front = png(32, 32, [1, 2, 3]);
        model.push_text(&analysis_reply());
        model.push_image(front.clone());

        let mut session = Session::new(upload.clone()).unwrap();
        let ticket = session.begin_analysis();
        let analysis = orchestrator.analyze(&ticket.source, &ticket.cancel).await.unwrap();
        assert_eq!(analysis.face_shape, "Heart");
        assert_eq!(analysis.suggestions.len(), 3);
        assert!(session.finish_analysis(&ticket, Some(analysis.clone())));

        let prompt = &analysis.suggestions[1].description;
        let ticket = session.begin_front(prompt, false).unwrap();
        let image = orchestrator.generate_front(&ticket).await.unwrap();
        session.commit_front(&ticket, image).unwrap();

        assert_eq!(session.views().len(), 1);
        assert_eq!(session.views().front(), Some(&front));
        let sent = model.requests();
        assert_eq!(sent[0].model, ModelKind::Text);
        assert!(sent[1].instruction().unwrap().contains("long soft layers"));
    }

    #[tokio::test]
    async fn left_view_sends_identity_then_front() {
        let (model, orchestrator) = setup();
        let upload = png(16, 16, [50, 50, 50]);
        let front = png(16, 16, [1, 1, 1]);
        let left = png(16, 16, [2, 2, 2]);
        model.push_image(front.clone()).push_image(left.clone());

        let mut session = Session::new(upload.clone()).unwrap();
        let ticket = session.begin_front("Beach waves", false).unwrap();
        let image = orchestrator.generate_front(&ticket).await.unwrap();
        session.commit_front(&ticket, image).unwrap();

        let ticket = session.begin_angle(ViewAngle::Left).unwrap();
        let image = orchestrator.generate_angle(&ticket).await.unwrap();
        session.commit_angle(&ticket, image).unwrap();

        let sent = &model.requests()[1];
        assert_eq!(sent.parts.len(), 3);
        assert_eq!(sent.images(), vec![&upload, &front]);
        assert!(sent.instruction().unwrap().contains("left profile"));
        assert_eq!(session.views().get(ViewAngle::Left), Some(&left));
        assert_eq!(session.views().front(), Some(&front));
    }

    #[tokio::test(start_paused = true)]
    async fn two_rate_limits_then_success_is_invisible() {
        let (model, orchestrator) = setup();
        let front = png(8, 8, [9, 9, 9]);
        model
            .push_error(GenerationError::from_upstream(429, "RESOURCE_EXHAUSTED"))
            .push_error(GenerationError::from_upstream(429, "RESOURCE_EXHAUSTED"))
            .push_image(front.clone());

        let mut session = Session::new(png(8, 8, [0, 0, 0])).unwrap();
        let ticket = session.begin_front("Pompadour", false).unwrap();
        let image = orchestrator.generate_front(&ticket).await.unwrap();
        session.commit_front(&ticket, image).unwrap();

        assert_eq!(model.calls(), 3);
        assert!(session.last_error().is_none());
        assert_eq!(session.views().front(), Some(&front));
    }

    #[tokio::test]
    async fn non_retryable_failure_is_generic_after_one_attempt() {
        let (model, orchestrator) = setup();
        model.push_error(GenerationError::from_upstream(400, "invalid argument"));

        let mut session = Session::new(png(8, 8, [0, 0, 0])).unwrap();
        let ticket = session.begin_front("Pixie", false).unwrap();
        let err = orchestrator.generate_front(&ticket).await.unwrap_err();
        session.fail_front(&ticket, &err);

        assert_eq!(model.calls(), 1);
        assert_eq!(session.last_error(), Some("Failed to generate image. Please try again."));
        assert!(session.views().is_empty());
    }

    #[tokio::test]
    async fn text_reply_is_a_failure() {
        let (model, orchestrator) = setup();
        model.push_text("I can't modify images of real people.");
        let mut session = Session::new(png(8, 8, [0, 0, 0])).unwrap();
        let ticket = session.begin_front("Bob", false).unwrap();
        let err = orchestrator.generate_front(&ticket).await.unwrap_err();
        assert!(matches!(err, GenerationError::ModelReturnedText { .. }));
    }

    #[tokio::test]
    async fn analysis_failures_are_swallowed() {
        let (model, orchestrator) = setup();
        model.push_text("not json").push_error(GenerationError::from_upstream(500, "boom"));
        let source = png(8, 8, [0, 0, 0]);
        assert!(orchestrator.analyze(&source, &CancellationToken::new()).await.is_none());
        assert!(orchestrator.analyze(&source, &CancellationToken::new()).await.is_none());
    }

    #[tokio::test]
    async fn auto_mask_thresholds_model_output() {
        let (model, orchestrator) = setup();
        model.push_image(png(10, 10, [150, 150, 150]));
        let session = Session::new(png(20, 20, [0, 0, 0])).unwrap();
        let mask = orchestrator.detect_hair_mask(&session.begin_mask_detection()).await.unwrap();
        assert_eq!((mask.width(), mask.height()), (20, 20));
        assert_eq!(mask.selected_pixels(), 400);
        assert!(mask.is_set());
    }

    #[tokio::test]
    async fn suggestions_skip_short_input_and_cap_results() {
        let (model, orchestrator) = setup();
        assert!(orchestrator.suggest_styles("ab").await.is_empty());
        assert_eq!(model.calls(), 0);

        model.push_text(r#"["a","b","c","d","e","f"]"#);
        assert_eq!(orchestrator.suggest_styles("curly").await, vec!["a", "b", "c", "d"]);

        model.push_text("oops");
        assert!(orchestrator.suggest_styles("curly").await.is_empty());
    }

    #[tokio::test]
    async fn trending_falls_back_on_failure() {
        let (model, orchestrator) = setup();
        model.push_error(GenerationError::from_upstream(403, "denied"));
        let trending = orchestrator.trending_styles().await;
        assert_eq!(trending.len(), 5);
        assert_eq!(trending[0], "Soft Butterfly Layers");

        model.push_text(r#"["Wolf cut","Glass bob"]"#);
        assert_eq!(orchestrator.trending_styles().await, vec!["Wolf cut", "Glass bob"]);
    }

    #[tokio::test]
    async fn non_list_reply_is_a_malformed_style_list() {
        let (model, orchestrator) = setup();
        model.push_text(r#"{"styles": "Wolf cut"}"#);
        let err = orchestrator.fetch_string_list(&compose::compose_trending_styles()).await.unwrap_err();
        assert!(matches!(err, GenerationError::MalformedStyleList(_)), "{err:?}");
        assert_eq!(err.kind(), "malformed_style_list");
    }
}
