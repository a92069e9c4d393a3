//! Integration seams toward the embedding host.
//!
//! The host owns the main event loop and the display-side texture registry;
//! the player only talks to them through the traits here. [`EventLoop`]
//! drives bus polling via file-descriptor readiness, [`TextureSink`] accepts
//! decoded frames for presentation.

use std::os::unix::io::RawFd;

use crate::gpu::VideoFrame;
use crate::video::PlayerError;

/// Readiness conditions a watch can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoInterest {
    Readable,
    Writable,
    ReadableWritable,
}

/// Host main loop, as far as the player needs it: file-descriptor watches
/// whose callbacks run on the loop thread.
///
/// Bus messages are drained exclusively from such a callback, which is what
/// lets the pipeline state machine treat itself as single-threaded.
pub trait EventLoop: Send + Sync {
    /// Registers `fd`. `ready` is invoked on the loop thread every time the
    /// requested readiness is signalled, until the returned watch is
    /// cancelled or dropped.
    fn add_io(
        &self,
        fd: RawFd,
        interest: IoInterest,
        ready: Box<dyn FnMut() + Send>,
    ) -> Result<IoWatch, PlayerError>;
}

/// Active fd registration. Cancelling (or dropping) the watch deregisters
/// the descriptor; after that the ready callback never runs again.
///
/// Cancellation must happen on the loop thread. Deregistering while the
/// loop is polling the descriptor from another thread is a data race in
/// most hosts.
pub struct IoWatch {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl IoWatch {
    /// Wraps the host-specific deregistration action.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    /// Deregisters the descriptor now. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for IoWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for IoWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoWatch")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Display-side consumer of decoded frames.
///
/// `push_frame` is called from decode streaming threads at whatever rate the
/// pipeline produces; implementations schedule presentation themselves and
/// release the frame when done with it.
pub trait TextureSink: Send + Sync {
    /// Stable texture id the host hands to its display layer.
    fn texture_id(&self) -> i64;

    /// Takes ownership of one decoded frame.
    fn push_frame(&self, frame: VideoFrame);
}
