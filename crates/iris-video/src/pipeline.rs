//! Decode graph construction and streaming-side wiring.
//!
//! Builds the camera and URI pipelines, installs the sink pad probes
//! (metadata advertisement, caps resolution) and the appsink callbacks
//! that hand decoded samples to the GPU import path, and registers the
//! pipeline bus with the host event loop. Bus messages themselves are
//! handled by the player's state machine; everything here only gets them
//! onto the event-loop thread.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::dmabuf::{self, FrameFormat, MappedFrame};
use crate::gpu::{self, GpuContext, VideoFrame};
use crate::host::{IoInterest, IoWatch, TextureSink};
use crate::player::{FormatHint, MediaSource, PlayerShared};
use crate::video::{BufferingMode, BufferingRange, BufferingState, PlayerError};

/// Camera graph: libcamera capture, barcode scanning and I420 conversion
/// into the appsink.
pub(crate) const CAMERA_PIPELINE: &str = "libcamerasrc ! queue ! videoconvert ! zbar name=zbar \
     ! video/x-raw,framerate=0/1 ! videoconvert ! video/x-raw,format=I420 \
     ! appsink sync=true name=\"camerasink\"";

/// Structure name of the application message the sink's EOS callback posts
/// instead of touching player state from the streaming thread.
pub(crate) const APPSINK_EOS_MESSAGE: &str = "appsink-eos";

/// Error message hardware decoders emit when they produced nothing; the
/// one decode failure the software fallback recovers from.
pub(crate) const HW_DECODE_POISON_MESSAGE: &str = "No valid frames decoded before end of stream";

const SINK_MAX_LATENESS_NS: i64 = 20_000_000;
const SINK_MAX_BUFFERS: u32 = 2;

/// Raw formats the sink accepts; each has a DRM fourcc mapping in
/// [`crate::dmabuf`].
const SINK_FORMATS: [gst_video::VideoFormat; 6] = [
    gst_video::VideoFormat::I420,
    gst_video::VideoFormat::Yv12,
    gst_video::VideoFormat::Y42b,
    gst_video::VideoFormat::Nv12,
    gst_video::VideoFormat::Nv21,
    gst_video::VideoFormat::Yuy2,
];

/// State of one pipeline incarnation shared with the streaming threads.
pub(crate) struct SinkShared {
    /// Import descriptor for the current caps; `None` before negotiation
    /// or when the format has no DRM mapping.
    format: Mutex<Option<FrameFormat>>,
    /// Negotiated stream layout, used to slice planes out of buffers.
    video_info: Mutex<Option<gst_video::VideoInfo>>,
    /// Set once the first GPU import failure was logged this incarnation.
    import_warned: AtomicBool,
}

impl SinkShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            format: Mutex::new(None),
            video_info: Mutex::new(None),
            import_warned: AtomicBool::new(false),
        })
    }

    pub(crate) fn current_format(&self) -> Option<FrameFormat> {
        *self.format.lock()
    }
}

/// One pipeline incarnation: the graph, its sink wiring and the bus
/// registration. Dropping it cancels the bus watch first, then drives the
/// graph to NULL, so no callback can observe a dying pipeline.
pub(crate) struct PipelineGraph {
    pub(crate) pipeline: gst::Pipeline,
    pub(crate) sink: Arc<SinkShared>,
    pub(crate) software_decode: bool,
    bus: gst::Bus,
    watch: Option<IoWatch>,
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        self.watch.take();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("stopping pipeline failed: {e}");
        }
    }
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("software_decode", &self.software_decode)
            .field("bus", &self.bus.name())
            .finish()
    }
}

/// Builds a pipeline for the player's source and wires sink callbacks,
/// probes and the bus watch. The graph is left in NULL; the caller stores
/// it and then starts the async move to PAUSED.
pub(crate) fn build(
    shared: &Arc<PlayerShared>,
    force_sw: bool,
) -> Result<PipelineGraph, PlayerError> {
    let (pipeline, appsink) = match &shared.source {
        MediaSource::Camera => build_camera_graph()?,
        MediaSource::Uri { uri, headers, format_hint } => {
            build_uri_graph(uri, headers, *format_hint, force_sw)?
        }
    };

    let sink = SinkShared::new();
    wire_probes(shared, &appsink, &sink)?;
    wire_sink_callbacks(&appsink, &sink, shared.gpu.clone(), Arc::clone(&shared.texture));

    let bus = pipeline
        .bus()
        .ok_or_else(|| PlayerError::Construction("pipeline has no bus".to_string()))?;
    let watch = register_bus_watch(shared, &bus)?;

    Ok(PipelineGraph {
        pipeline,
        sink,
        software_decode: force_sw,
        bus,
        watch: Some(watch),
    })
}

fn build_camera_graph() -> Result<(gst::Pipeline, gst_app::AppSink), PlayerError> {
    debug!(description = CAMERA_PIPELINE, "building camera pipeline");
    let element = gst::parse::launch(CAMERA_PIPELINE)
        .map_err(|e| PlayerError::Construction(format!("camera pipeline parse: {e}")))?;
    let pipeline = element
        .downcast::<gst::Pipeline>()
        .map_err(|_| PlayerError::Construction("camera description is not a pipeline".to_string()))?;
    let sink = pipeline
        .by_name("camerasink")
        .ok_or_else(|| PlayerError::Construction("camerasink missing from pipeline".to_string()))?;
    let appsink = sink
        .downcast::<gst_app::AppSink>()
        .map_err(|_| PlayerError::Construction("camerasink is not an appsink".to_string()))?;

    appsink.set_max_buffers(SINK_MAX_BUFFERS);
    appsink.set_drop(false);
    appsink.set_property("max-lateness", SINK_MAX_LATENESS_NS);
    appsink.set_property("qos", true);

    Ok((pipeline, appsink))
}

fn build_uri_graph(
    uri: &str,
    headers: &[(String, String)],
    format_hint: Option<FormatHint>,
    force_sw: bool,
) -> Result<(gst::Pipeline, gst_app::AppSink), PlayerError> {
    debug!(uri, force_sw, ?format_hint, "building uri pipeline");

    let pipeline = gst::Pipeline::new();
    let decodebin = gst::ElementFactory::make("uridecodebin")
        .name("source")
        .property("uri", uri)
        .property("force-sw-decoders", force_sw)
        .build()
        .map_err(|e| PlayerError::Construction(format!("failed to create uridecodebin: {e}")))?;
    let convert = gst::ElementFactory::make("videoconvert")
        .name("convert")
        .build()
        .map_err(|e| PlayerError::Construction(format!("failed to create videoconvert: {e}")))?;

    let appsink = gst_app::AppSink::builder()
        .name("videosink")
        .caps(
            &gst_video::VideoCapsBuilder::new()
                .format_list(SINK_FORMATS)
                .build(),
        )
        .max_buffers(SINK_MAX_BUFFERS)
        .drop(false)
        .sync(true)
        .qos(true)
        .max_lateness(SINK_MAX_LATENESS_NS)
        .build();

    if !headers.is_empty() {
        attach_http_headers(&decodebin, headers.to_vec());
    }

    pipeline
        .add_many([&decodebin, &convert, appsink.upcast_ref()])
        .map_err(|e| PlayerError::Construction(format!("failed to assemble pipeline: {e}")))?;
    convert
        .link(&appsink)
        .map_err(|e| PlayerError::Construction(format!("failed to link converter to sink: {e}")))?;

    // Decoded pads appear asynchronously; take the first video pad and
    // ignore everything else (audio is not handled here).
    let convert_weak = convert.downgrade();
    decodebin.connect_pad_added(move |_, pad| {
        let Some(convert) = convert_weak.upgrade() else {
            return;
        };
        let caps = match pad.current_caps() {
            Some(caps) => caps,
            None => pad.query_caps(None),
        };
        let is_video = caps
            .structure(0)
            .map(|s| s.name().starts_with("video/"))
            .unwrap_or(false);
        if !is_video {
            trace!("ignoring non-video pad");
            return;
        }
        let Some(sink_pad) = convert.static_pad("sink") else {
            return;
        };
        if sink_pad.is_linked() {
            trace!("video branch already linked, ignoring extra pad");
            return;
        }
        if let Err(e) = pad.link(&sink_pad) {
            warn!("failed to link decoded video pad: {e:?}");
        }
    });

    Ok((pipeline, appsink))
}

/// Forwards HTTP headers to the source element once uridecodebin creates
/// it. Sources without an `extra-headers` property (files, rtsp) skip.
fn attach_http_headers(decodebin: &gst::Element, headers: Vec<(String, String)>) {
    decodebin.connect("source-setup", false, move |values| {
        let source = match values.get(1).map(|v| v.get::<gst::Element>()) {
            Some(Ok(source)) => source,
            _ => return None,
        };
        if source.find_property("extra-headers").is_none() {
            debug!("source has no extra-headers property, headers not applied");
            return None;
        }
        let mut structure = gst::Structure::new_empty("extra-headers");
        for (name, value) in &headers {
            structure.set(name.as_str(), value);
        }
        source.set_property("extra-headers", &structure);
        None
    });
}

fn wire_probes(
    shared: &Arc<PlayerShared>,
    appsink: &gst_app::AppSink,
    sink: &Arc<SinkShared>,
) -> Result<(), PlayerError> {
    let pad = appsink
        .static_pad("sink")
        .ok_or_else(|| PlayerError::Construction("appsink has no sink pad".to_string()))?;

    // Advertise VideoMeta on allocation queries so DMA-aware decoders
    // attach per-frame layout instead of copying into tight buffers.
    pad.add_probe(gst::PadProbeType::QUERY_DOWNSTREAM, |_, info| {
        if let Some(gst::PadProbeData::Query(query)) = info.data.as_mut() {
            if let gst::QueryViewMut::Allocation(allocation) = query.view_mut() {
                allocation.add_allocation_meta::<gst_video::VideoMeta>(None);
                return gst::PadProbeReturn::Handled;
            }
        }
        gst::PadProbeReturn::Ok
    })
    .ok_or_else(|| PlayerError::Construction("failed to install allocation probe".to_string()))?;

    // Resolve geometry and import format from the caps event. Runs on the
    // streaming thread, upstream of any buffer reaching the sink.
    let weak = Arc::downgrade(shared);
    let sink_shared = Arc::clone(sink);
    pad.add_probe(gst::PadProbeType::EVENT_DOWNSTREAM, move |_, info| {
        if let Some(gst::PadProbeData::Event(event)) = info.data.as_ref() {
            if let gst::EventView::Caps(caps_event) = event.view() {
                handle_caps_event(caps_event.caps(), &sink_shared, &weak);
            }
        }
        gst::PadProbeReturn::Ok
    })
    .ok_or_else(|| PlayerError::Construction("failed to install caps probe".to_string()))?;

    Ok(())
}

fn handle_caps_event(caps: &gst::CapsRef, sink: &SinkShared, player: &Weak<PlayerShared>) {
    let info = match gst_video::VideoInfo::from_caps(caps) {
        Ok(info) => info,
        Err(e) => {
            warn!("sink caps did not parse as video: {e}");
            return;
        }
    };

    let fps = {
        let fps = info.fps();
        if fps.denom() > 0 && fps.numer() > 0 {
            f64::from(fps.numer()) / f64::from(fps.denom())
        } else {
            0.0
        }
    };
    let (width, height) = (info.width(), info.height());

    *sink.format.lock() = FrameFormat::from_video_info(&info, caps);
    *sink.video_info.lock() = Some(info);
    debug!(width, height, fps, "sink caps resolved");

    // Publishing geometry from here keeps the guarantee that consumers
    // know it before the first frame lands in the sink callbacks.
    if let Some(player) = player.upgrade() {
        player.note_caps(width, height, fps);
    }
}

/// Everything the sample callbacks may touch. Streaming threads never see
/// the player itself.
struct FrameChain {
    sink: Arc<SinkShared>,
    gpu: Option<Arc<GpuContext>>,
    texture: Arc<dyn TextureSink>,
}

impl Clone for FrameChain {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            gpu: self.gpu.clone(),
            texture: Arc::clone(&self.texture),
        }
    }
}

impl FrameChain {
    fn deliver(&self, appsink: &gst_app::AppSink, preroll: bool) {
        let sample = if preroll {
            appsink.try_pull_preroll(gst::ClockTime::ZERO)
        } else {
            appsink.try_pull_sample(gst::ClockTime::ZERO)
        };
        // Spurious wakeups happen while flushing; nothing to deliver.
        let Some(sample) = sample else { return };
        if let Some(frame) = self.convert(sample) {
            self.texture.push_frame(frame);
        }
    }

    fn convert(&self, sample: gst::Sample) -> Option<VideoFrame> {
        let Some(info) = self.sink.video_info.lock().clone() else {
            trace!("sample before caps resolution, dropping");
            return None;
        };
        let pts = sample
            .buffer()
            .and_then(|b| b.pts())
            .map(|t| Duration::from_nanos(t.nseconds()));

        if let (Some(format), Some(gpu)) = (self.sink.current_format(), self.gpu.as_ref()) {
            if gpu.supports_dmabuf_import() {
                if let Some(planes) = sample
                    .buffer()
                    .and_then(|buffer| dmabuf::extract_planes(buffer, &info))
                {
                    let keep_alive: Arc<dyn Any + Send + Sync> = Arc::new(sample.clone());
                    // SAFETY: the planes were extracted against `info` from
                    // this very sample, and the frame holds the sample until
                    // release, keeping the dmabuf memory valid.
                    match unsafe { gpu::import_planes(gpu, planes, &format, keep_alive, pts) } {
                        Ok(frame) => return Some(VideoFrame::Gpu(frame)),
                        Err(e) => {
                            if !self.sink.import_warned.swap(true, Ordering::SeqCst) {
                                warn!("GPU import failed, continuing with CPU hand-off: {e}");
                            }
                        }
                    }
                }
            }
        }

        let buffer = sample.buffer_owned()?;
        MappedFrame::new(buffer, &info).map(VideoFrame::Mapped)
    }
}

fn wire_sink_callbacks(
    appsink: &gst_app::AppSink,
    sink: &Arc<SinkShared>,
    gpu: Option<Arc<GpuContext>>,
    texture: Arc<dyn TextureSink>,
) {
    let chain = FrameChain { sink: Arc::clone(sink), gpu, texture };
    let preroll_chain = chain.clone();

    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .eos(|appsink| {
                // Streaming thread: relay through the bus instead of
                // touching player state.
                let structure = gst::Structure::new_empty(APPSINK_EOS_MESSAGE);
                let message = gst::message::Application::builder(structure)
                    .src(appsink)
                    .build();
                if appsink.post_message(message).is_err() {
                    warn!("appsink EOS arrived after bus teardown");
                }
            })
            .new_preroll(move |appsink| {
                preroll_chain.deliver(appsink, true);
                Ok(gst::FlowSuccess::Ok)
            })
            .new_sample(move |appsink| {
                chain.deliver(appsink, false);
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
}

fn register_bus_watch(shared: &Arc<PlayerShared>, bus: &gst::Bus) -> Result<IoWatch, PlayerError> {
    let fd = bus.pollfd();
    let weak = Arc::downgrade(shared);
    let bus_clone = bus.clone();
    shared.event_loop.add_io(
        fd,
        IoInterest::Readable,
        Box::new(move || {
            // Drain everything that is queued; the fd stays level-triggered
            // readable until the bus is empty.
            while let Some(message) = bus_clone.pop() {
                match weak.upgrade() {
                    Some(player) => player.on_bus_message(&message),
                    None => return,
                }
            }
        }),
    )
}

/// True for the one decoder error the software-decode fallback recovers
/// from; everything else is terminal for the pipeline instance.
pub(crate) fn is_hw_decode_poison(error: &glib::Error) -> bool {
    error.matches(gst::StreamError::Decode) && error.message() == HW_DECODE_POISON_MESSAGE
}

fn map_buffering_mode(mode: gst::BufferingMode) -> BufferingMode {
    match mode {
        gst::BufferingMode::Stream => BufferingMode::Stream,
        gst::BufferingMode::Download => BufferingMode::Download,
        gst::BufferingMode::Timeshift => BufferingMode::Timeshift,
        gst::BufferingMode::Live => BufferingMode::Live,
        other => {
            debug!(mode = ?other, "unknown buffering mode reported as stream");
            BufferingMode::Stream
        }
    }
}

/// Re-queries buffering progress after a buffering bus message. `None`
/// when the pipeline cannot answer (torn down or live without buffering).
pub(crate) fn query_buffering(pipeline: &gst::Pipeline) -> Option<BufferingState> {
    let mut query = gst::query::Buffering::new(gst::Format::Time);
    if !pipeline.query(&mut query) {
        return None;
    }

    let (_busy, percent) = query.percent();
    let (mode, avg_in, avg_out, time_left_ms) = query.stats();
    let ranges = query
        .ranges()
        .into_iter()
        .filter_map(|(start, stop)| match (start, stop) {
            (
                gst::GenericFormattedValue::Time(Some(start)),
                gst::GenericFormattedValue::Time(Some(stop)),
            ) => Some(BufferingRange {
                start_ms: start.mseconds() as i64,
                stop_ms: stop.mseconds() as i64,
            }),
            _ => None,
        })
        .collect();

    Some(BufferingState::new(
        map_buffering_mode(mode),
        percent,
        avg_in,
        avg_out,
        time_left_ms,
        ranges,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        gst::init().unwrap();
    }

    #[test]
    fn decode_poison_needs_domain_code_and_message() {
        init();
        let poison = glib::Error::new(gst::StreamError::Decode, HW_DECODE_POISON_MESSAGE);
        assert!(is_hw_decode_poison(&poison));

        let wrong_message = glib::Error::new(gst::StreamError::Decode, "Decoding error");
        assert!(!is_hw_decode_poison(&wrong_message));

        let wrong_code = glib::Error::new(gst::StreamError::Format, HW_DECODE_POISON_MESSAGE);
        assert!(!is_hw_decode_poison(&wrong_code));

        let wrong_domain = glib::Error::new(gst::CoreError::Failed, HW_DECODE_POISON_MESSAGE);
        assert!(!is_hw_decode_poison(&wrong_domain));
    }

    #[test]
    fn buffering_modes_map_one_to_one() {
        init();
        assert_eq!(map_buffering_mode(gst::BufferingMode::Stream), BufferingMode::Stream);
        assert_eq!(map_buffering_mode(gst::BufferingMode::Download), BufferingMode::Download);
        assert_eq!(
            map_buffering_mode(gst::BufferingMode::Timeshift),
            BufferingMode::Timeshift
        );
        assert_eq!(map_buffering_mode(gst::BufferingMode::Live), BufferingMode::Live);
    }

    #[test]
    fn camera_description_carries_scanner_and_named_sink() {
        assert!(CAMERA_PIPELINE.contains("libcamerasrc"));
        assert!(CAMERA_PIPELINE.contains("zbar name=zbar"));
        assert!(CAMERA_PIPELINE.contains("appsink sync=true name=\"camerasink\""));
        assert!(CAMERA_PIPELINE.contains("format=I420"));
    }

    #[test]
    fn camera_graph_resolves_its_sink() {
        init();
        // Needs the camera and scanner plugins; skip where absent.
        if gst::ElementFactory::find("libcamerasrc").is_none()
            || gst::ElementFactory::find("zbar").is_none()
        {
            return;
        }
        let (pipeline, appsink) = build_camera_graph().unwrap();
        assert_eq!(appsink.name(), "camerasink");
        assert!(pipeline.by_name("zbar").is_some());
    }

    #[test]
    fn uri_graph_forces_software_decoders_on_request() {
        init();
        if gst::ElementFactory::find("uridecodebin").is_none()
            || gst::ElementFactory::find("videoconvert").is_none()
            || gst::ElementFactory::find("appsink").is_none()
        {
            return;
        }
        let (pipeline, appsink) =
            build_uri_graph("file:///nonexistent.mp4", &[], None, true).unwrap();
        assert_eq!(appsink.name(), "videosink");

        let decodebin = pipeline.by_name("source").unwrap();
        assert!(decodebin.property::<bool>("force-sw-decoders"));

        let caps = appsink.caps().unwrap();
        let structure = caps.structure(0).unwrap();
        assert_eq!(structure.name().as_str(), "video/x-raw");
    }
}
