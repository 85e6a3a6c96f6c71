//! Stream, capture and event state for the emulated backend.

use std::thread::ThreadId;
use std::time::Instant;

use gpuexec_core::handle::{ContextHandle, GraphHandle, GraphNodeHandle};

use crate::driver::CaptureMode;

pub(super) struct StreamState {
    pub ctx: ContextHandle,
    pub capture: Option<Capture>,
}

/// An in-progress capture. Captured work is chained: each node depends on
/// the one captured before it.
pub(super) struct Capture {
    pub mode: CaptureMode,
    pub thread: ThreadId,
    pub graph: GraphHandle,
    pub last_node: Option<GraphNodeHandle>,
    pub invalidated: bool,
}

impl Capture {
    /// Whether a potentially unsafe call on `thread` conflicts with this
    /// capture.
    pub(super) fn forbids_unsafe_calls_from(&self, thread: ThreadId) -> bool {
        match self.mode {
            CaptureMode::Global => true,
            CaptureMode::ThreadLocal => self.thread == thread,
            CaptureMode::Relaxed => false,
        }
    }
}

pub(super) struct EventState {
    pub timing: bool,
    pub recorded_at: Option<Instant>,
}
