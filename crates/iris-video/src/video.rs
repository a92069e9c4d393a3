//! Core value types shared across the player: errors, video geometry,
//! buffering snapshots and scan results.
//!
//! Everything here is plain data. The types cross thread boundaries inside
//! notifier payloads, so they are all `Clone + Send`.

use std::time::Duration;

/// Errors surfaced by player construction and control operations.
///
/// Runtime pipeline errors that arrive asynchronously (bus errors that are
/// not recovered by the software-decode fallback) are published through the
/// player's error notifier as [`PlayerError::Playback`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerError {
    /// Building the decode graph or one of its elements failed
    Construction(String),
    /// The pipeline refused a state change (I/O-class failure)
    StateChange(String),
    /// Seek or step operation failed
    Seek(String),
    /// Registering the bus file descriptor with the host event loop failed
    EventLoop(String),
    /// The operation needs information the pipeline has not produced yet
    Unsupported(String),
    /// Unrecoverable runtime error reported by the running pipeline
    Playback(String),
}

impl std::fmt::Display for PlayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerError::Construction(msg) => write!(f, "pipeline construction failed: {msg}"),
            PlayerError::StateChange(msg) => write!(f, "playback state change failed: {msg}"),
            PlayerError::Seek(msg) => write!(f, "seek failed: {msg}"),
            PlayerError::EventLoop(msg) => write!(f, "event loop registration failed: {msg}"),
            PlayerError::Unsupported(msg) => write!(f, "unsupported operation: {msg}"),
            PlayerError::Playback(msg) => write!(f, "playback error: {msg}"),
        }
    }
}

impl std::error::Error for PlayerError {}

/// Negotiated video geometry, published once per pipeline incarnation when
/// both resolution and frame rate are known.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// Frames per second. `0.0` for variable-rate sources such as cameras.
    pub fps: f64,
    /// Total duration for seekable sources, `None` for live ones.
    pub duration: Option<Duration>,
}

/// How the pipeline buffers incoming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingMode {
    /// Small in-memory queue
    Stream,
    /// Progressive download to local storage
    Download,
    /// Ringbuffer with timeshift capability
    Timeshift,
    /// Live source, no buffering possible
    Live,
}

/// One already-buffered (or live-window) region, in stream time.
///
/// Millisecond fields so the value survives an RPC boundary unchanged.
/// `-1` marks an endpoint the pipeline could not express in time format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingRange {
    pub start_ms: i64,
    pub stop_ms: i64,
}

/// Snapshot of the pipeline's buffering activity, re-queried on every
/// buffering bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferingState {
    pub mode: BufferingMode,
    /// Fill level, clamped to `0..=100`.
    pub percent: i32,
    /// Average input rate in bytes per second, `-1` if unknown.
    pub avg_in: i32,
    /// Average output rate in bytes per second, `-1` if unknown.
    pub avg_out: i32,
    /// Estimated milliseconds of buffering ahead; `0` when not buffering.
    pub time_left_ms: i64,
    pub ranges: Vec<BufferingRange>,
}

impl BufferingState {
    pub fn new(
        mode: BufferingMode,
        percent: i32,
        avg_in: i32,
        avg_out: i32,
        time_left_ms: i64,
        ranges: Vec<BufferingRange>,
    ) -> Self {
        Self {
            mode,
            percent: percent.clamp(0, 100),
            avg_in,
            avg_out,
            time_left_ms: time_left_ms.max(0),
            ranges,
        }
    }

    /// True while the pipeline expects more buffering before playback can
    /// resume.
    pub fn is_buffering(&self) -> bool {
        self.time_left_ms != 0
    }
}

/// A barcode detected in the camera stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barcode {
    /// Symbology name as reported by the detector, e.g. `"QR-Code"`.
    pub symbology: String,
    /// Decoded payload.
    pub payload: String,
    /// Detector confidence, higher is better.
    pub quality: i32,
}

/// The playback state the user last asked for.
///
/// The pipeline converges on this asynchronously; bus messages report when
/// it actually arrives there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackIntent {
    #[default]
    Paused,
    Playing,
}
