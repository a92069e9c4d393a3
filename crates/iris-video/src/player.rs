//! Player facade and bus-driven state machine.
//!
//! A [`Player`] owns one decode pipeline at a time. Control operations
//! record intent and nudge the pipeline toward it; the actual state
//! transitions arrive asynchronously as bus messages, which are handled
//! here on the host event-loop thread. When hardware decode poisons the
//! pipeline the whole graph is rebuilt with software decoders and the
//! recorded intent is re-applied once the new graph settles.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::dmabuf::FrameFormat;
use crate::gpu::GpuContext;
use crate::host::{EventLoop, TextureSink};
use crate::notifier::Notifier;
use crate::pipeline::{self, PipelineGraph};
use crate::video::{Barcode, BufferingState, PlaybackIntent, PlayerError, VideoInfo};

/// Container hint forwarded by the control surface. The decoder
/// autodetects regardless; the hint is kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatHint {
    Hls,
    MpegDash,
    SmoothStreaming,
    Other,
}

/// What the player decodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// The local camera, through the barcode-scanning pipeline.
    Camera,
    /// Anything uridecodebin accepts: `file://`, `http(s)://`, `rtsp://`.
    Uri {
        uri: String,
        /// Extra HTTP headers, applied when the resolved source supports
        /// them.
        headers: Vec<(String, String)>,
        format_hint: Option<FormatHint>,
    },
}

impl MediaSource {
    /// URI source without headers or container hint.
    pub fn uri(uri: impl Into<String>) -> Self {
        MediaSource::Uri {
            uri: uri.into(),
            headers: Vec::new(),
            format_hint: None,
        }
    }

    /// Bundled asset, resolved against the host's asset root directory
    /// into a `file://` source.
    pub fn asset(asset_root: impl AsRef<Path>, asset: impl AsRef<Path>) -> Self {
        let path = asset_root.as_ref().join(asset);
        Self::uri(format!("file://{}", path.display()))
    }
}

/// Accumulates geometry until the full video info can be published.
/// Resolution and frame rate may be learned in separate callbacks.
#[derive(Debug, Default, Clone, Copy)]
struct PendingVideoInfo {
    width: u32,
    height: u32,
    fps: f64,
    has_resolution: bool,
    has_fps: bool,
}

impl PendingVideoInfo {
    fn set_resolution(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.has_resolution = true;
    }

    fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
        self.has_fps = true;
    }

    fn complete(&self) -> Option<(u32, u32, f64)> {
        (self.has_resolution && self.has_fps).then_some((self.width, self.height, self.fps))
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

struct PlayerState {
    graph: Option<PipelineGraph>,
    desired: PlaybackIntent,
    /// The current incarnation was built with software decoders.
    forcing_sw_decode: bool,
    /// A fallback rebuild is in flight; state changes wait for ASYNC_DONE.
    falling_back: bool,
    pending_info: PendingVideoInfo,
    /// Video info was already published for this incarnation.
    info_sent: bool,
    volume: f64,
}

pub(crate) struct PlayerShared {
    state: Mutex<PlayerState>,
    weak_self: Weak<PlayerShared>,
    pub(crate) source: MediaSource,
    pub(crate) event_loop: Arc<dyn EventLoop>,
    pub(crate) texture: Arc<dyn TextureSink>,
    pub(crate) gpu: Option<Arc<GpuContext>>,
    video_info: Notifier<VideoInfo>,
    buffering: Notifier<BufferingState>,
    errors: Notifier<PlayerError>,
    barcodes: Notifier<Barcode>,
}

/// Handle to one live player.
///
/// The host owns it on the event-loop thread; decode and render work
/// happens on pipeline threads and reaches the host only through the
/// texture sink and the notifiers. Dropping the player (or calling
/// [`Player::close`]) tears everything down and must happen on the
/// event-loop thread, where the bus watch is cancelled.
pub struct Player {
    shared: Arc<PlayerShared>,
}

impl Player {
    /// Creates the player shell. Notifiers and the texture binding exist
    /// after this; no pipeline does until [`Player::initialize`].
    pub fn new(
        source: MediaSource,
        texture: Arc<dyn TextureSink>,
        event_loop: Arc<dyn EventLoop>,
        gpu: Option<Arc<GpuContext>>,
    ) -> Self {
        match &source {
            MediaSource::Camera => info!(texture_id = texture.texture_id(), "creating camera player"),
            MediaSource::Uri { uri, .. } => {
                info!(%uri, texture_id = texture.texture_id(), "creating uri player");
            }
        }
        let shared = Arc::new_cyclic(|weak| PlayerShared {
            state: Mutex::new(PlayerState {
                graph: None,
                desired: PlaybackIntent::default(),
                forcing_sw_decode: false,
                falling_back: false,
                pending_info: PendingVideoInfo::default(),
                info_sent: false,
                volume: 1.0,
            }),
            weak_self: weak.clone(),
            source,
            event_loop,
            texture,
            gpu,
            video_info: Notifier::value(),
            buffering: Notifier::value(),
            errors: Notifier::change(),
            barcodes: Notifier::change(),
        });
        Self { shared }
    }

    /// Builds the decode graph, registers its bus with the event loop and
    /// starts converging toward the recorded playback intent.
    pub fn initialize(&self) -> Result<(), PlayerError> {
        self.shared.rebuild_pipeline(false)?;
        self.shared.apply_playback_state()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.state.lock().graph.is_some()
    }

    pub fn source(&self) -> &MediaSource {
        &self.shared.source
    }

    pub fn play(&self) -> Result<(), PlayerError> {
        self.shared.state.lock().desired = PlaybackIntent::Playing;
        self.shared.apply_playback_state()
    }

    pub fn pause(&self) -> Result<(), PlayerError> {
        self.shared.state.lock().desired = PlaybackIntent::Paused;
        self.shared.apply_playback_state()
    }

    /// Seeks to `position`. With `nearest_keyframe` the pipeline snaps to
    /// the closest keyframe, trading exactness for speed.
    pub fn seek_to(&self, position: Duration, nearest_keyframe: bool) -> Result<(), PlayerError> {
        let pipeline = self
            .pipeline_handle()
            .ok_or_else(|| PlayerError::Unsupported("seek before initialize".to_string()))?;
        let target = gst::ClockTime::try_from(position)
            .map_err(|_| PlayerError::Seek("position overflows stream time".to_string()))?;
        let flags = gst::SeekFlags::FLUSH
            | if nearest_keyframe {
                gst::SeekFlags::KEY_UNIT
            } else {
                gst::SeekFlags::ACCURATE
            };
        debug!(?position, nearest_keyframe, "seeking");
        pipeline
            .seek_simple(flags, target)
            .map_err(|e| PlayerError::Seek(format!("to {position:?}: {e}")))
    }

    /// Keyframe-snapping seek, for scrubbing.
    pub fn fast_seek(&self, position: Duration) -> Result<(), PlayerError> {
        self.seek_to(position, true)
    }

    /// Advances exactly one frame while paused.
    pub fn step_forward(&self) -> Result<(), PlayerError> {
        let pipeline = self
            .pipeline_handle()
            .ok_or_else(|| PlayerError::Unsupported("step before initialize".to_string()))?;
        let step = gst::event::Step::new(gst::format::Buffers::ONE, 1.0, true, false);
        if !pipeline.send_event(step) {
            return Err(PlayerError::Seek("frame step rejected by pipeline".to_string()));
        }
        Ok(())
    }

    /// Steps one frame back by seeking against the known frame rate.
    pub fn step_backward(&self) -> Result<(), PlayerError> {
        let fps = self
            .shared
            .video_info
            .current()
            .map(|info| info.fps)
            .unwrap_or(0.0);
        if fps <= 0.0 {
            return Err(PlayerError::Unsupported(
                "frame rate unknown, cannot step backward".to_string(),
            ));
        }
        let position = self
            .position()
            .ok_or_else(|| PlayerError::Seek("position query failed".to_string()))?;
        let frame = Duration::from_secs_f64(1.0 / fps);
        self.seek_to(position.saturating_sub(frame), false)
    }

    /// Stores the requested volume and applies it where the graph carries
    /// a volume element. Camera and video-only graphs just remember it.
    pub fn set_volume(&self, volume: f64) -> Result<(), PlayerError> {
        let volume = volume.clamp(0.0, 1.0);
        let element = {
            let mut state = self.shared.state.lock();
            state.volume = volume;
            state
                .graph
                .as_ref()
                .and_then(|graph| graph.pipeline.by_name("volume"))
        };
        match element {
            Some(element) => element.set_property("volume", volume),
            None => debug!(volume, "no volume element in graph, value stored"),
        }
        Ok(())
    }

    /// Current playback position, `None` until the pipeline can answer.
    pub fn position(&self) -> Option<Duration> {
        let pipeline = self.pipeline_handle()?;
        pipeline
            .query_position::<gst::ClockTime>()
            .map(|t| Duration::from_nanos(t.nseconds()))
    }

    /// Import descriptor negotiated for the current caps, `None` before
    /// negotiation or for formats that stay CPU-mapped.
    pub fn frame_format(&self) -> Option<FrameFormat> {
        self.shared
            .state
            .lock()
            .graph
            .as_ref()
            .and_then(|graph| graph.sink.current_format())
    }

    /// Identifier of the texture this player renders into.
    pub fn texture_id(&self) -> i64 {
        self.shared.texture.texture_id()
    }

    /// Geometry and duration, published at most once per pipeline
    /// incarnation, before the first frame reaches the texture sink.
    /// Callbacks run on the decoder's streaming thread or the event-loop
    /// thread, whichever completes the info first.
    pub fn video_info(&self) -> Notifier<VideoInfo> {
        self.shared.video_info.clone()
    }

    /// Buffering snapshots, re-queried on every buffering bus message.
    /// Callbacks run on the host event-loop thread.
    pub fn buffering(&self) -> Notifier<BufferingState> {
        self.shared.buffering.clone()
    }

    /// Unrecoverable pipeline errors. Callbacks run on the host
    /// event-loop thread.
    pub fn errors(&self) -> Notifier<PlayerError> {
        self.shared.errors.clone()
    }

    /// Barcodes detected in the camera stream. Callbacks run on the host
    /// event-loop thread.
    pub fn barcodes(&self) -> Notifier<Barcode> {
        self.shared.barcodes.clone()
    }

    /// Tears the player down: notifiers close first so no callback fires
    /// into a dying pipeline, then the graph stops and the bus watch is
    /// cancelled. Idempotent; dropping the player does the same.
    pub fn close(&self) {
        self.shared.shutdown();
    }

    fn pipeline_handle(&self) -> Option<gst::Pipeline> {
        self.shared
            .state
            .lock()
            .graph
            .as_ref()
            .map(|graph| graph.pipeline.clone())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Player")
            .field("source", &self.shared.source)
            .field("initialized", &state.graph.is_some())
            .field("desired", &state.desired)
            .field("software_decode", &state.forcing_sw_decode)
            .finish()
    }
}

impl PlayerShared {
    /// Replaces the pipeline with a freshly built incarnation. Teardown of
    /// the previous graph happens outside the state lock.
    fn rebuild_pipeline(&self, force_sw: bool) -> Result<(), PlayerError> {
        let Some(this) = self.weak_self.upgrade() else {
            return Err(PlayerError::Construction("player is shutting down".to_string()));
        };
        let previous = { self.state.lock().graph.take() };
        drop(previous);

        let graph = pipeline::build(&this, force_sw)?;
        let pipeline_handle = graph.pipeline.clone();
        let volume = {
            let mut state = self.state.lock();
            state.forcing_sw_decode = force_sw;
            state.pending_info.reset();
            state.info_sent = false;
            state.graph = Some(graph);
            state.volume
        };

        // The graph is registered before the async PAUSED move so bus and
        // caps callbacks always find it.
        if let Err(e) = pipeline_handle.set_state(gst::State::Paused) {
            let graph = { self.state.lock().graph.take() };
            drop(graph);
            return Err(PlayerError::StateChange(format!("initial PAUSED refused: {e}")));
        }
        if (volume - 1.0).abs() > f64::EPSILON {
            if let Some(element) = pipeline_handle.by_name("volume") {
                element.set_property("volume", volume);
            }
        }
        Ok(())
    }

    /// Converges the pipeline toward the recorded intent. No-op while the
    /// software fallback rebuild is in flight or before initialize.
    pub(crate) fn apply_playback_state(&self) -> Result<(), PlayerError> {
        let (pipeline, desired) = {
            let state = self.state.lock();
            if state.falling_back {
                trace!("fallback in flight, deferring state change");
                return Ok(());
            }
            let Some(graph) = state.graph.as_ref() else {
                return Ok(());
            };
            let desired = match state.desired {
                PlaybackIntent::Playing => gst::State::Playing,
                PlaybackIntent::Paused => gst::State::Paused,
            };
            (graph.pipeline.clone(), desired)
        };

        let (result, current, pending) = pipeline.state(gst::ClockTime::ZERO);
        if result.is_err() {
            return Err(PlayerError::StateChange(
                "pipeline is in the failure state".to_string(),
            ));
        }
        if pending == gst::State::VoidPending && current == desired {
            trace!(?desired, "already in the desired state");
            return Ok(());
        }
        // A pending async change gets overridden: last writer wins.
        pipeline
            .set_state(desired)
            .map(|_| ())
            .map_err(|e| PlayerError::StateChange(format!("set_state({desired:?}): {e}")))
    }

    /// Caps resolved on the sink pad; runs on the decoder's streaming
    /// thread. Publishing from here keeps geometry ahead of the first
    /// frame delivery.
    pub(crate) fn note_caps(&self, width: u32, height: u32, fps: f64) {
        {
            let mut state = self.state.lock();
            state.pending_info.set_resolution(width, height);
            state.pending_info.set_fps(fps);
        }
        self.maybe_send_info();
    }

    /// Publishes the completed video info at most once per incarnation.
    fn maybe_send_info(&self) {
        let (pipeline, width, height, fps) = {
            let mut state = self.state.lock();
            if state.info_sent {
                return;
            }
            let Some((width, height, fps)) = state.pending_info.complete() else {
                return;
            };
            state.info_sent = true;
            let pipeline = state.graph.as_ref().map(|graph| graph.pipeline.clone());
            (pipeline, width, height, fps)
        };
        let duration = pipeline
            .and_then(|p| p.query_duration::<gst::ClockTime>())
            .map(|t| Duration::from_nanos(t.nseconds()));
        let info = VideoInfo { width, height, fps, duration };
        debug!(?info, "video info complete");
        self.video_info.notify(info);
    }

    pub(crate) fn on_bus_message(&self, message: &gst::Message) {
        use gst::MessageView;

        match message.view() {
            MessageView::Error(err) => {
                self.on_bus_error(&err.error(), err.debug().map(|d| d.to_string()));
            }
            MessageView::Warning(warning) => {
                warn!("pipeline warning: {} ({:?})", warning.error(), warning.debug());
            }
            MessageView::Info(msg) => {
                info!("pipeline info: {}", msg.error());
            }
            MessageView::Buffering(_) => self.on_bus_buffering(),
            MessageView::StateChanged(change) => {
                if self.message_is_from_pipeline(message) {
                    let current = change.current();
                    trace!(from = ?change.old(), to = ?current, "pipeline state changed");
                    if matches!(current, gst::State::Paused | gst::State::Playing) {
                        self.maybe_send_info();
                    }
                }
            }
            MessageView::AsyncDone(_) => {
                if self.message_is_from_pipeline(message) {
                    self.on_async_done();
                }
            }
            MessageView::Latency(_) => {
                if let Some(pipeline) = self.current_pipeline() {
                    if let Err(e) = pipeline.recalculate_latency() {
                        warn!("latency recalculation failed: {e}");
                    }
                }
            }
            MessageView::RequestState(request) => {
                let requested = request.requested_state();
                debug!(?requested, "element requested a pipeline state");
                if let Some(pipeline) = self.current_pipeline() {
                    if let Err(e) = pipeline.set_state(requested) {
                        warn!("requested state {requested:?} refused: {e}");
                    }
                }
            }
            MessageView::Eos(_) => {
                info!("end of stream reached");
            }
            MessageView::Application(_) => self.on_application_message(message),
            MessageView::Element(_) => self.on_element_message(message),
            _ => trace!(message = ?message.type_(), "unhandled bus message"),
        }
    }

    /// Decoder errors: the known hardware-decode poison triggers the
    /// software fallback, anything else is published as unrecoverable.
    fn on_bus_error(&self, error: &glib::Error, debug_info: Option<String>) {
        error!(?debug_info, "pipeline error: {error}");
        let should_fall_back = {
            let state = self.state.lock();
            state.graph.is_some() && !state.forcing_sw_decode && pipeline::is_hw_decode_poison(error)
        };
        if should_fall_back {
            self.fall_back_to_software_decode();
            return;
        }
        let message = match debug_info {
            Some(debug_info) => format!("{error} ({debug_info})"),
            None => error.to_string(),
        };
        self.errors.notify(PlayerError::Playback(message));
    }

    /// Hardware decode produced nothing; rebuild with software decoders
    /// and re-apply the intent once ASYNC_DONE reports the graph settled.
    fn fall_back_to_software_decode(&self) {
        warn!("hardware decode produced no frames, rebuilding with software decoders");
        self.state.lock().falling_back = true;
        if let Err(e) = self.rebuild_pipeline(true) {
            error!("software decode fallback failed: {e}");
            self.state.lock().falling_back = false;
            self.errors.notify(PlayerError::Playback(format!(
                "hardware decode failed and the software fallback did not come up: {e}"
            )));
        }
    }

    fn on_async_done(&self) {
        let was_falling_back = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.falling_back, false)
        };
        if !was_falling_back {
            trace!("async state change settled");
            return;
        }
        info!("software decode pipeline settled, re-applying playback state");
        if let Err(e) = self.apply_playback_state() {
            warn!("could not re-apply playback state after fallback: {e}");
        }
    }

    fn on_bus_buffering(&self) {
        let Some(pipeline) = self.current_pipeline() else {
            return;
        };
        match pipeline::query_buffering(&pipeline) {
            Some(snapshot) => {
                trace!(percent = snapshot.percent, "buffering update");
                self.buffering.notify(snapshot);
            }
            None => trace!("buffering query failed, keeping previous state"),
        }
    }

    fn on_application_message(&self, message: &gst::Message) {
        let Some(structure) = message.structure() else {
            return;
        };
        if structure.name().as_str() == pipeline::APPSINK_EOS_MESSAGE {
            // Relayed by the sink's streaming thread; the pipeline's own
            // EOS follows on the bus for seekable sources.
            info!("sink reported end of stream");
        } else {
            trace!(name = structure.name().as_str(), "unhandled application message");
        }
    }

    fn on_element_message(&self, message: &gst::Message) {
        let Some(structure) = message.structure() else {
            return;
        };
        if structure.name().as_str() != "barcode" {
            trace!(name = structure.name().as_str(), "unhandled element message");
            return;
        }
        let payload = match structure.get::<String>("symbol") {
            Ok(payload) => payload,
            Err(e) => {
                warn!("barcode message without symbol: {e}");
                return;
            }
        };
        let symbology = structure.get::<String>("type").unwrap_or_default();
        let quality = structure.get::<i32>("quality").unwrap_or(0);
        debug!(%symbology, quality, "barcode detected");
        self.barcodes.notify(Barcode { symbology, payload, quality });
    }

    fn message_is_from_pipeline(&self, message: &gst::Message) -> bool {
        let state = self.state.lock();
        let Some(graph) = state.graph.as_ref() else {
            return false;
        };
        match message.src() {
            Some(src) => *src == *graph.pipeline.upcast_ref::<gst::Object>(),
            None => false,
        }
    }

    fn current_pipeline(&self) -> Option<gst::Pipeline> {
        self.state
            .lock()
            .graph
            .as_ref()
            .map(|graph| graph.pipeline.clone())
    }

    fn shutdown(&self) {
        debug!("shutting player down");
        self.video_info.close();
        self.buffering.close();
        self.errors.close();
        self.barcodes.close();
        let graph = { self.state.lock().graph.take() };
        drop(graph);
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::gpu::VideoFrame;
    use crate::host::{IoInterest, IoWatch};
    use crate::notifier::ListenerAction;

    struct NullSink;

    impl TextureSink for NullSink {
        fn texture_id(&self) -> i64 {
            7
        }

        fn push_frame(&self, _frame: VideoFrame) {}
    }

    struct NullLoop;

    impl EventLoop for NullLoop {
        fn add_io(
            &self,
            _fd: RawFd,
            _interest: IoInterest,
            _ready: Box<dyn FnMut() + Send>,
        ) -> Result<IoWatch, PlayerError> {
            Ok(IoWatch::new(|| {}))
        }
    }

    fn test_player(source: MediaSource) -> Player {
        Player::new(source, Arc::new(NullSink), Arc::new(NullLoop), None)
    }

    #[test]
    fn pending_info_completes_only_with_both_halves() {
        let mut pending = PendingVideoInfo::default();
        assert_eq!(pending.complete(), None);

        pending.set_resolution(1920, 1080);
        assert_eq!(pending.complete(), None);

        pending.set_fps(30.0);
        assert_eq!(pending.complete(), Some((1920, 1080, 30.0)));

        pending.reset();
        assert_eq!(pending.complete(), None);
    }

    #[test]
    fn uri_helper_defaults_to_no_headers_or_hint() {
        let source = MediaSource::uri("https://example.com/a.m3u8");
        let MediaSource::Uri { uri, headers, format_hint } = source else {
            panic!("expected uri source");
        };
        assert_eq!(uri, "https://example.com/a.m3u8");
        assert!(headers.is_empty());
        assert_eq!(format_hint, None);
    }

    #[test]
    fn asset_helper_resolves_against_the_asset_root() {
        let source = MediaSource::asset("/opt/app/assets", "videos/intro.mp4");
        assert_eq!(
            source,
            MediaSource::uri("file:///opt/app/assets/videos/intro.mp4")
        );
    }

    #[test]
    fn control_surface_before_initialize() {
        let player = test_player(MediaSource::Camera);
        assert!(!player.is_initialized());
        assert_eq!(player.texture_id(), 7);
        assert_eq!(player.position(), None);
        assert_eq!(player.frame_format(), None);

        // Intent is recorded even without a pipeline.
        player.play().unwrap();
        player.pause().unwrap();
        player.set_volume(3.5).unwrap();

        assert!(matches!(
            player.seek_to(Duration::from_secs(1), false),
            Err(PlayerError::Unsupported(_))
        ));
        assert!(matches!(player.step_forward(), Err(PlayerError::Unsupported(_))));
        assert!(matches!(player.step_backward(), Err(PlayerError::Unsupported(_))));

        player.close();
        player.close();
    }

    #[test]
    fn video_info_publishes_exactly_once_per_incarnation() {
        let player = test_player(MediaSource::Camera);
        let published = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&published);
        let _handle = player.video_info().listen(move |_info| {
            counter.fetch_add(1, Ordering::SeqCst);
            ListenerAction::Keep
        });

        player.shared.note_caps(640, 480, 30.0);
        player.shared.note_caps(640, 480, 30.0);

        assert_eq!(published.load(Ordering::SeqCst), 1);
        let info = player.video_info().current().unwrap();
        assert_eq!((info.width, info.height), (640, 480));
        assert_eq!(info.fps, 30.0);
        assert_eq!(info.duration, None);
    }

    #[test]
    fn barcode_messages_reach_the_notifier() {
        gst::init().unwrap();
        let player = test_player(MediaSource::Camera);
        let seen: Arc<Mutex<Vec<Barcode>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _handle = player.barcodes().listen(move |code| {
            sink.lock().push(code.clone());
            ListenerAction::Keep
        });

        let structure = gst::Structure::builder("barcode")
            .field("type", "QR-Code")
            .field("symbol", "https://example.com/scan")
            .field("quality", 42i32)
            .build();
        let message = gst::message::Element::builder(structure).build();
        player.shared.on_bus_message(&message);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].symbology, "QR-Code");
        assert_eq!(seen[0].payload, "https://example.com/scan");
        assert_eq!(seen[0].quality, 42);
    }

    #[test]
    fn hw_decode_poison_rebuilds_with_software_decoders() {
        gst::init().unwrap();
        if gst::ElementFactory::find("uridecodebin").is_none()
            || gst::ElementFactory::find("videoconvert").is_none()
            || gst::ElementFactory::find("appsink").is_none()
        {
            return;
        }
        let player = test_player(MediaSource::uri("file:///nonexistent/clip.mp4"));
        if player.initialize().is_err() {
            return;
        }
        assert!(format!("{player:?}").contains("software_decode: false"));

        let poison = gst::message::Error::builder(
            gst::StreamError::Decode,
            pipeline::HW_DECODE_POISON_MESSAGE,
        )
        .build();
        player.shared.on_bus_message(&poison);

        // The graph was rebuilt with software decoders forced.
        assert!(player.is_initialized());
        assert!(format!("{player:?}").contains("software_decode: true"));

        // State requests during the fallback window are recorded, not
        // applied; the settled signal replays them.
        player.play().unwrap();
        let pipeline = {
            let state = player.shared.state.lock();
            state.graph.as_ref().map(|graph| graph.pipeline.clone())
        };
        if let Some(pipeline) = pipeline {
            let done = gst::message::AsyncDone::builder().src(&pipeline).build();
            player.shared.on_bus_message(&done);
        }
        player.close();
    }

    #[test]
    fn non_poison_errors_reach_the_error_notifier() {
        gst::init().unwrap();
        let player = test_player(MediaSource::Camera);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _handle = player.errors().listen(move |error| {
            sink.lock().push(error.clone());
            ListenerAction::Keep
        });

        // Without a graph there is nothing to fall back to; the error is
        // published as unrecoverable.
        let message =
            gst::message::Error::builder(gst::StreamError::Failed, "internal data stream error")
                .build();
        player.shared.on_bus_message(&message);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], PlayerError::Playback(_)));
    }

    #[test]
    fn unrelated_element_messages_are_ignored() {
        gst::init().unwrap();
        let player = test_player(MediaSource::Camera);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _handle = player.barcodes().listen(move |_code| {
            counter.fetch_add(1, Ordering::SeqCst);
            ListenerAction::Keep
        });

        let structure = gst::Structure::builder("level").field("rms", -21.0f64).build();
        let message = gst::message::Element::builder(structure).build();
        player.shared.on_bus_message(&message);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
