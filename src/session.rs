//! Per-upload session context.
//!
//! Remote calls never run while the session is borrowed. A `begin_*`
//! method snapshots what the call needs into a ticket, the orchestrator
//! runs the call, and a `commit_*` method applies the result only if the
//! session is still on the same epoch the ticket was issued for.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::ImagePayload;
use crate::compose::GenerationRequest;
use crate::error::{GenerationError, Result};
use crate::mask::MaskLayer;
use crate::models::{AnalysisStatus, FaceAnalysis, SessionView, ViewAngle};

pub type SessionStore = Arc<RwLock<HashMap<Uuid, Session>>>;

/// Upload size limits. The mask raster costs four bytes per source pixel.
pub const MAX_SOURCE_SIDE: u32 = 8192;
pub const MAX_SOURCE_PIXELS: u64 = 40_000_000;

/// How often idle sessions are looked for.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn check_source_size(width: u32, height: u32) -> Result<()> {
    let pixels = u64::from(width) * u64::from(height);
    if width > MAX_SOURCE_SIDE || height > MAX_SOURCE_SIDE || pixels > MAX_SOURCE_PIXELS {
        return Err(GenerationError::InvalidRequest(format!(
            "image is {width}x{height}; at most {MAX_SOURCE_SIDE}px per side and {MAX_SOURCE_PIXELS} pixels are accepted"
        )));
    }
    Ok(())
}

/// Reads the header only, so oversized images are refused before any decode.
fn source_dimensions(source: &ImagePayload) -> Result<(u32, u32)> {
    let (width, height) = source.dimensions()?;
    check_source_size(width, height)?;
    Ok((width, height))
}

/// Drops every session not touched since `cutoff` and cancels its work.
pub fn evict_idle(store: &SessionStore, cutoff: DateTime<Utc>) -> usize {
    let mut sessions = store.write();
    let before = sessions.len();
    sessions.retain(|id, session| {
        let keep = session.updated_at >= cutoff;
        if !keep {
            session.shutdown();
            tracing::debug!(session = %id, "Evicting idle session");
        }
        keep
    });
    before - sessions.len()
}

/// Evicts sessions idle for longer than `ttl` until `cancel` fires.
pub async fn sweep_idle(store: SessionStore, ttl: Duration, every: Duration, cancel: CancellationToken) {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
    tracing::info!(ttl_secs = ttl.num_seconds(), interval_secs = every.as_secs(), "Idle session sweeper started");

    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Idle session sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                let evicted = evict_idle(&store, Utc::now() - ttl);
                if evicted > 0 {
                    tracing::info!(evicted, "🧹 Evicted idle sessions");
                }
            }
        }
    }
}

/// Generated images by angle. Front anchors every other entry.
#[derive(Debug, Clone, Default)]
pub struct ViewSet {
    views: BTreeMap<ViewAngle, ImagePayload>,
}

impl ViewSet {
    pub fn get(&self, angle: ViewAngle) -> Option<&ImagePayload> {
        self.views.get(&angle)
    }

    pub fn front(&self) -> Option<&ImagePayload> {
        self.get(ViewAngle::Front)
    }

    pub fn insert(&mut self, angle: ViewAngle, image: ImagePayload) -> Result<()> {
        if angle.is_derived() && self.front().is_none() {
            return Err(GenerationError::PreconditionViolation(format!(
                "{angle} view requires a front result"
            )));
        }
        self.views.insert(angle, image);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.views.clear();
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ViewAngle, &ImagePayload)> {
        self.views.iter().map(|(a, i)| (*a, i))
    }
}

#[derive(Debug, Clone)]
pub enum AnalysisState {
    Pending,
    Ready(FaceAnalysis),
    Unavailable,
}

/// Everything needed to analyze the current upload.
#[derive(Debug, Clone)]
pub struct AnalysisTicket {
    pub source_epoch: u64,
    pub source: ImagePayload,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct FrontTicket {
    pub epoch: u64,
    pub request: GenerationRequest,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct AngleTicket {
    pub epoch: u64,
    pub angle: ViewAngle,
    pub identity: ImagePayload,
    pub front: ImagePayload,
    pub style_prompt: String,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct MaskTicket {
    pub source_epoch: u64,
    pub source: ImagePayload,
    pub width: u32,
    pub height: u32,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    source: ImagePayload,
    width: u32,
    height: u32,
    analysis: AnalysisState,
    mask: MaskLayer,
    reference: Option<ImagePayload>,
    views: ViewSet,
    style_prompt: Option<String>,
    generating: BTreeSet<ViewAngle>,
    /// Bumped on every new upload.
    source_epoch: u64,
    /// Bumped on every new upload and every new base generation.
    base_epoch: u64,
    source_cancel: CancellationToken,
    base_cancel: CancellationToken,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(source: ImagePayload) -> Result<Self> {
        let (width, height) = source_dimensions(&source)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            source,
            width,
            height,
            analysis: AnalysisState::Pending,
            mask: MaskLayer::new(width, height),
            reference: None,
            views: ViewSet::default(),
            style_prompt: None,
            generating: BTreeSet::new(),
            source_epoch: 0,
            base_epoch: 0,
            source_cancel: CancellationToken::new(),
            base_cancel: CancellationToken::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn source(&self) -> &ImagePayload {
        &self.source
    }

    pub fn views(&self) -> &ViewSet {
        &self.views
    }

    pub fn analysis(&self) -> &AnalysisState {
        &self.analysis
    }

    pub fn mask(&self) -> &MaskLayer {
        &self.mask
    }

    pub fn mask_mut(&mut self) -> &mut MaskLayer {
        self.touch();
        &mut self.mask
    }

    pub fn style_prompt(&self) -> Option<&str> {
        self.style_prompt.as_deref()
    }

    pub fn is_generating(&self, angle: ViewAngle) -> bool {
        self.generating.contains(&angle)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// A new upload invalidates everything derived from the old one,
    /// including in-flight analysis, generation and mask detection.
    pub fn replace_source(&mut self, source: ImagePayload) -> Result<()> {
        let (width, height) = source_dimensions(&source)?;
        self.source_cancel.cancel();
        self.base_cancel.cancel();
        self.source_cancel = CancellationToken::new();
        self.base_cancel = CancellationToken::new();
        self.source_epoch += 1;
        self.base_epoch += 1;
        self.source = source;
        self.width = width;
        self.height = height;
        self.analysis = AnalysisState::Pending;
        self.mask = MaskLayer::new(width, height);
        self.views.clear();
        self.generating.clear();
        self.style_prompt = None;
        self.last_error = None;
        self.touch();
        Ok(())
    }

    pub fn set_reference(&mut self, reference: Option<ImagePayload>) {
        self.reference = reference;
        self.touch();
    }

    pub fn begin_analysis(&self) -> AnalysisTicket {
        AnalysisTicket {
            source_epoch: self.source_epoch,
            source: self.source.clone(),
            cancel: self.source_cancel.child_token(),
        }
    }

    /// Returns false when the upload changed while analysis ran.
    pub fn finish_analysis(&mut self, ticket: &AnalysisTicket, result: Option<FaceAnalysis>) -> bool {
        if ticket.source_epoch != self.source_epoch {
            return false;
        }
        self.analysis = match result {
            Some(analysis) => AnalysisState::Ready(analysis),
            None => AnalysisState::Unavailable,
        };
        self.touch();
        true
    }

    /// Starts a new base generation: previous views are dropped and any
    /// angle still in flight for them is cancelled.
    pub fn begin_front(&mut self, style_prompt: &str, use_reference: bool) -> Result<FrontTicket> {
        let mask = if self.mask.is_set() { Some(self.mask.export()?) } else { None };
        let reference = if use_reference { self.reference.clone() } else { None };
        if use_reference && reference.is_none() {
            return Err(GenerationError::InvalidRequest("no reference image has been uploaded".into()));
        }
        let request = GenerationRequest::new(self.source.clone(), style_prompt, mask, reference)?;

        self.base_cancel.cancel();
        self.base_cancel = self.source_cancel.child_token();
        self.base_epoch += 1;
        self.views.clear();
        self.generating.clear();
        self.generating.insert(ViewAngle::Front);
        self.last_error = None;
        self.touch();

        Ok(FrontTicket { epoch: self.base_epoch, request, cancel: self.base_cancel.clone() })
    }

    pub fn commit_front(&mut self, ticket: &FrontTicket, image: ImagePayload) -> Result<()> {
        if ticket.epoch != self.base_epoch {
            return Err(GenerationError::Superseded);
        }
        self.generating.remove(&ViewAngle::Front);
        self.views.insert(ViewAngle::Front, image)?;
        self.style_prompt = Some(ticket.request.style_prompt.clone());
        self.touch();
        Ok(())
    }

    /// Records a failed base generation. Leaves no partial views behind.
    pub fn fail_front(&mut self, ticket: &FrontTicket, err: &GenerationError) {
        if ticket.epoch != self.base_epoch {
            return;
        }
        self.generating.remove(&ViewAngle::Front);
        self.views.clear();
        self.last_error = Some(err.user_message(None));
        self.touch();
    }

    pub fn begin_angle(&mut self, angle: ViewAngle) -> Result<AngleTicket> {
        if !angle.is_derived() {
            return Err(GenerationError::PreconditionViolation(
                "the front view is produced by a base generation".into(),
            ));
        }
        let (front, style_prompt) = match (self.views.front(), &self.style_prompt) {
            (Some(front), Some(prompt)) => (front.clone(), prompt.clone()),
            _ => {
                return Err(GenerationError::PreconditionViolation(format!(
                    "{angle} view requested before a front result exists"
                )))
            }
        };
        if !self.generating.insert(angle) {
            return Err(GenerationError::AngleBusy(angle));
        }
        self.last_error = None;
        self.touch();
        Ok(AngleTicket {
            epoch: self.base_epoch,
            angle,
            identity: self.source.clone(),
            front,
            style_prompt,
            cancel: self.base_cancel.child_token(),
        })
    }

    /// Stores one angle. A result for an older base generation is dropped.
    pub fn commit_angle(&mut self, ticket: &AngleTicket, image: ImagePayload) -> Result<()> {
        if ticket.epoch != self.base_epoch {
            return Err(GenerationError::Superseded);
        }
        self.generating.remove(&ticket.angle);
        self.views.insert(ticket.angle, image)?;
        tracing::debug!(angle = %ticket.angle, stored = self.views.len(), "Angle view stored");
        self.touch();
        Ok(())
    }

    pub fn fail_angle(&mut self, ticket: &AngleTicket, err: &GenerationError) {
        if ticket.epoch != self.base_epoch {
            return;
        }
        self.generating.remove(&ticket.angle);
        self.last_error = Some(err.user_message(Some(ticket.angle)));
        self.touch();
    }

    pub fn begin_mask_detection(&self) -> MaskTicket {
        MaskTicket {
            source_epoch: self.source_epoch,
            source: self.source.clone(),
            width: self.width,
            height: self.height,
            cancel: self.source_cancel.child_token(),
        }
    }

    /// Replaces manual paint with the detected mask.
    pub fn commit_mask(&mut self, ticket: &MaskTicket, mask: MaskLayer) -> Result<()> {
        if ticket.source_epoch != self.source_epoch {
            return Err(GenerationError::Superseded);
        }
        self.mask = mask;
        self.touch();
        Ok(())
    }

    /// Back to a clean idle state after an error: no views, no error.
    pub fn reset(&mut self) {
        if !self.views.is_empty() {
            tracing::debug!(session = %self.id, "Discarding generated views");
        }
        self.base_cancel.cancel();
        self.base_cancel = self.source_cancel.child_token();
        self.base_epoch += 1;
        self.views.clear();
        self.generating.clear();
        self.style_prompt = None;
        self.last_error = None;
        self.touch();
    }

    /// Cancels everything still running for this session.
    pub fn shutdown(&self) {
        self.source_cancel.cancel();
        self.base_cancel.cancel();
    }

    pub fn view(&self) -> SessionView {
        let (analysis_status, analysis) = match self.analysis() {
            AnalysisState::Pending => (AnalysisStatus::Pending, None),
            AnalysisState::Ready(a) => (AnalysisStatus::Ready, Some(a.clone())),
            AnalysisState::Unavailable => (AnalysisStatus::Unavailable, None),
        };
        SessionView {
            id: self.id,
            analysis_status,
            analysis,
            style_prompt: self.style_prompt().map(str::to_owned),
            views: self.views().iter().map(|(a, img)| (a, img.to_data_url())).collect(),
            generating: ViewAngle::ALL.into_iter().filter(|a| self.is_generating(*a)).collect(),
            has_mask: self.mask().is_set(),
            has_reference: self.reference.is_some(),
            last_error: self.last_error().map(str::to_owned),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::{Point, Tool};
    use crate::testing::png;

    fn session() -> Session {
        Session::new(png(64, 48, [10, 20, 30])).unwrap()
    }

    fn result(tag: u8) -> ImagePayload {
        ImagePayload::new("image/png", vec![tag])
    }

    #[test]
    fn new_session_reads_dimensions() {
        let s = session();
        assert_eq!((s.mask().width(), s.mask().height()), (64, 48));
        assert!(matches!(s.analysis(), AnalysisState::Pending));
        assert!(s.views().is_empty());
    }

    #[test]
    fn derived_view_requires_front() {
        let mut views = ViewSet::default();
        assert!(views.insert(ViewAngle::Left, result(1)).is_err());
        views.insert(ViewAngle::Front, result(0)).unwrap();
        views.insert(ViewAngle::Left, result(1)).unwrap();
        assert_eq!(views.len(), 2);
    }

    #[test]
    fn angle_before_front_is_rejected() {
        let mut s = session();
        assert!(matches!(s.begin_angle(ViewAngle::Left), Err(GenerationError::PreconditionViolation(_))));
        assert!(matches!(s.begin_angle(ViewAngle::Front), Err(GenerationError::PreconditionViolation(_))));
    }

    #[test]
    fn front_then_angle_flow() {
        let mut s = session();
        let front = s.begin_front("Buzz cut", false).unwrap();
        assert!(s.is_generating(ViewAngle::Front));
        assert!(front.request.mask.is_none());
        s.commit_front(&front, result(0)).unwrap();
        assert_eq!(s.style_prompt(), Some("Buzz cut"));

        let left = s.begin_angle(ViewAngle::Left).unwrap();
        assert_eq!(left.identity, *s.source());
        assert_eq!(left.front, result(0));
        assert!(matches!(s.begin_angle(ViewAngle::Left), Err(GenerationError::AngleBusy(ViewAngle::Left))));
        let right = s.begin_angle(ViewAngle::Right).unwrap();

        s.commit_angle(&right, result(2)).unwrap();
        s.commit_angle(&left, result(1)).unwrap();
        assert_eq!(s.views().len(), 3);
        assert_eq!(s.views().front(), Some(&result(0)));
        assert!(!s.is_generating(ViewAngle::Left));
    }

    #[test]
    fn new_base_generation_discards_stale_angles() {
        let mut s = session();
        let first = s.begin_front("Bob", false).unwrap();
        s.commit_front(&first, result(0)).unwrap();
        let back = s.begin_angle(ViewAngle::Back).unwrap();

        let second = s.begin_front("Mullet", false).unwrap();
        assert!(back.cancel.is_cancelled());
        assert!(first.cancel.is_cancelled());
        assert!(s.views().is_empty());

        assert!(matches!(s.commit_angle(&back, result(9)), Err(GenerationError::Superseded)));
        assert!(matches!(s.commit_front(&first, result(8)), Err(GenerationError::Superseded)));
        s.commit_front(&second, result(1)).unwrap();
        assert_eq!(s.views().len(), 1);
        assert_eq!(s.style_prompt(), Some("Mullet"));
    }

    #[test]
    fn failed_front_leaves_clean_state() {
        let mut s = session();
        let ticket = s.begin_front("Afro", false).unwrap();
        s.fail_front(&ticket, &GenerationError::from_upstream(429, ""));
        assert!(s.views().is_empty());
        assert!(!s.is_generating(ViewAngle::Front));
        assert!(s.last_error().unwrap().contains("Quota"));
        s.reset();
        assert!(s.last_error().is_none());
    }

    #[test]
    fn failed_angle_keeps_other_views() {
        let mut s = session();
        let front = s.begin_front("Bob", false).unwrap();
        s.commit_front(&front, result(0)).unwrap();
        let left = s.begin_angle(ViewAngle::Left).unwrap();
        s.fail_angle(&left, &GenerationError::EmptyModelResponse);
        assert_eq!(s.views().len(), 1);
        assert_eq!(s.last_error(), Some("Failed to generate Left view. Please try again."));
        assert!(s.begin_angle(ViewAngle::Left).is_ok());
    }

    #[test]
    fn painted_mask_is_exported_into_request() {
        let mut s = session();
        s.mask_mut().paint_stroke(&[Point { x: 30.0, y: 10.0 }], Tool::Brush, 100.0).unwrap();
        let ticket = s.begin_front("Pixie", false).unwrap();
        let mask = ticket.request.mask.expect("mask exported");
        assert_eq!(mask.media_type, "image/png");
        assert_eq!(mask.dimensions().unwrap(), (64, 48));

        s.mask_mut().clear();
        assert!(s.begin_front("Pixie", false).unwrap().request.mask.is_none());
    }

    #[test]
    fn reference_must_exist_when_requested() {
        let mut s = session();
        assert!(matches!(s.begin_front("", true), Err(GenerationError::InvalidRequest(_))));
        s.set_reference(Some(png(8, 8, [200, 0, 0])));
        let ticket = s.begin_front("", true).unwrap();
        assert_eq!(ticket.request.style_prompt, crate::compose::REFERENCE_ONLY_PROMPT);
    }

    #[test]
    fn new_upload_invalidates_analysis_and_mask_detection() {
        let mut s = session();
        let analysis = s.begin_analysis();
        let mask = s.begin_mask_detection();
        s.replace_source(png(32, 32, [0, 0, 0])).unwrap();
        assert!(analysis.cancel.is_cancelled());
        assert!(!s.finish_analysis(&analysis, None));
        assert!(matches!(s.analysis(), AnalysisState::Pending));
        assert!(matches!(
            s.commit_mask(&mask, MaskLayer::new(64, 48)),
            Err(GenerationError::Superseded)
        ));
        assert_eq!(s.mask().width(), 32);
    }

    #[test]
    fn oversized_uploads_are_rejected() {
        let err = Session::new(png(MAX_SOURCE_SIDE + 1, 1, [0, 0, 0])).unwrap_err();
        assert!(matches!(err, GenerationError::InvalidRequest(_)), "{err:?}");

        let mut s = session();
        assert!(matches!(
            s.replace_source(png(1, MAX_SOURCE_SIDE + 1, [0, 0, 0])),
            Err(GenerationError::InvalidRequest(_))
        ));
        assert_eq!(s.mask().width(), 64);

        assert!(check_source_size(4032, 3024).is_ok());
        assert!(check_source_size(MAX_SOURCE_SIDE, 4882).is_ok());
        assert!(check_source_size(7000, 7000).is_err());
    }

    #[test]
    fn webp_selfie_is_accepted() {
        let source = crate::testing::encoded(40, 30, [120, 90, 60], image::ImageFormat::WebP);
        let s = Session::new(source).unwrap();
        assert_eq!((s.mask().width(), s.mask().height()), (40, 30));
        assert_eq!(s.source().media_type, "image/webp");
    }

    fn store_with(sessions: Vec<Session>) -> SessionStore {
        Arc::new(RwLock::new(sessions.into_iter().map(|s| (s.id, s)).collect()))
    }

    #[test]
    fn eviction_drops_only_idle_sessions() {
        let mut idle = session();
        idle.updated_at = Utc::now() - chrono::Duration::hours(2);
        let idle_id = idle.id;
        let idle_cancel = idle.begin_analysis().cancel;
        let active = session();
        let active_id = active.id;
        let store = store_with(vec![idle, active]);

        assert_eq!(evict_idle(&store, Utc::now() - chrono::Duration::hours(1)), 1);
        assert!(idle_cancel.is_cancelled());
        assert!(!store.read().contains_key(&idle_id));
        assert!(store.read().contains_key(&active_id));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_and_stops_on_cancel() {
        let mut idle = session();
        idle.updated_at = Utc::now() - chrono::Duration::hours(2);
        let store = store_with(vec![idle, session()]);
        let cancel = CancellationToken::new();
        let sweeper = tokio::spawn(sweep_idle(
            store.clone(),
            Duration::from_secs(1800),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.read().len(), 1);

        cancel.cancel();
        sweeper.await.unwrap();
    }
}
