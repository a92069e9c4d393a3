//! iris-video: camera and network video decode for embedded displays,
//! with zero-copy GPU frame hand-off.
//!
//! The crate drives GStreamer decode graphs on behalf of a host event
//! loop. Decoded frames leave the pipeline as dmabuf planes and are
//! imported into wgpu textures without a CPU copy where the Vulkan
//! backend supports it; everything else arrives CPU-mapped. Playback
//! state, buffering progress, pipeline errors and camera barcode scans
//! are published through thread-safe notifiers.
//!
//! # Example
//!
//! ```ignore
//! use iris_video::{ListenerAction, MediaSource, Player};
//!
//! // The host supplies the texture binding, its event loop and an
//! // optional shared GPU import context.
//! let player = Player::new(MediaSource::uri(url), texture, event_loop, Some(gpu));
//! player.initialize()?;
//!
//! let _guard = player.video_info().listen(|info| {
//!     println!("{}x{} @ {} fps", info.width, info.height, info.fps);
//!     ListenerAction::Keep
//! });
//! player.play()?;
//! ```
//!
//! GStreamer must be initialized (`gstreamer::init()`) before the first
//! pipeline is built.

#![deny(clippy::disallowed_methods)]

pub mod dmabuf;
pub mod gpu;
pub mod host;
pub mod notifier;
pub mod video;

mod pipeline;
mod player;

// Re-export the player surface for convenience
pub use dmabuf::{ColorMatrix, DmaBufPlanes, FrameFormat, MappedFrame, PlaneLayout};
pub use gpu::{
    FrameDescriptor, FrameTransform, GpuContext, GpuFrame, GpuPlane, ImportError, PlaneDesc,
    VideoFrame,
};
pub use host::{EventLoop, IoInterest, IoWatch, TextureSink};
pub use notifier::{ListenerAction, ListenerHandle, Notifier};
pub use player::{FormatHint, MediaSource, Player};
pub use video::{
    Barcode, BufferingMode, BufferingRange, BufferingState, PlaybackIntent, PlayerError, VideoInfo,
};
