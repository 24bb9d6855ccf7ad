//! Completion handling, serialized against device halt.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::traits::{Completion, CompletionCallback};

#[derive(Debug)]
struct DispatchState {
    halted: bool,
    frames: u64,
}

/// Receives completion notifications from the camera.
///
/// The dispatcher lock is shared with the halt step of shutdown: a completion
/// is either handled entirely before the device halts or dropped after it.
#[derive(Debug)]
pub struct CompletionDispatcher {
    state: Mutex<DispatchState>,
}

impl Default for CompletionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionDispatcher {
    /// Create a dispatcher that accepts completions.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(DispatchState {
                halted: false,
                frames: 0,
            }),
        }
    }

    /// Handle one completed request.
    pub fn on_complete(&self, completion: &Completion) {
        let mut state = self.state.lock();
        if state.halted {
            debug!(request = %completion.request, "dropping completion after halt");
            return;
        }

        state.frames += 1;
        // Pixel delivery to a connected consumer would go here.
        debug!(
            request = %completion.request,
            buffer = %completion.buffer,
            sequence = completion.sequence,
            bytes_used = completion.bytes_used,
            "Frame processed"
        );
    }

    /// Run the device halt while holding the completion lock.
    ///
    /// Completions arriving after this returns are dropped.
    pub fn halt_with<R, F: FnOnce() -> R>(&self, halt: F) -> R {
        let mut state = self.state.lock();
        state.halted = true;
        halt()
    }

    /// Whether [`CompletionDispatcher::halt_with`] has run.
    pub fn is_halted(&self) -> bool {
        self.state.lock().halted
    }

    /// Number of frames handled so far.
    pub fn frames_handled(&self) -> u64 {
        self.state.lock().frames
    }

    /// Callback to register with the camera.
    pub fn callback(self: &Arc<Self>) -> CompletionCallback {
        let dispatcher = Arc::clone(self);
        Arc::new(move |completion: &Completion| dispatcher.on_complete(completion))
    }
}
