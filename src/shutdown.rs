//! Signal-driven teardown.
//!
//! Signals are only observed here; the teardown itself runs on the normal
//! execution path once [`ShutdownSignals::recv`] returns.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{info, warn};

use crate::buffers::{MemoryMap, UnmapReport};
use crate::session::CaptureSession;
use crate::traits::CameraManager;

/// Listeners for the termination signals.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    /// Install SIGINT and SIGTERM listeners. Must be called within a tokio
    /// runtime context.
    ///
    /// From this point on the signals no longer kill the process: they are
    /// held until [`ShutdownSignals::recv`] observes them.
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next termination signal and return its number.
    pub async fn recv(&mut self) -> i32 {
        tokio::select! {
            _ = self.interrupt.recv() => libc::SIGINT,
            _ = self.terminate.recv() => libc::SIGTERM,
        }
    }
}

/// Summary of a completed teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Process exit status: the signal number, or the setup failure status.
    pub exit_code: i32,
    /// Result of releasing the buffer mappings.
    pub unmapped: UnmapReport,
}

/// Runs the teardown sequence exactly once.
#[derive(Debug, Default)]
pub struct ShutdownController {
    done: AtomicBool,
}

impl ShutdownController {
    /// Create a controller that has not run yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Whether the teardown has already run.
    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Tear the capture pipeline down.
    ///
    /// Disconnects the completion callback, halts the device under the
    /// completion lock, releases the camera, stops the manager and unmaps every
    /// buffer, in that order. Failures are logged and never stop the sequence.
    /// Returns `None` if the teardown already ran.
    pub fn shutdown<M: CameraManager, P: MemoryMap>(
        &self,
        session: &mut CaptureSession<M, P>,
        exit_code: i32,
    ) -> Option<ShutdownReport> {
        if self
            .done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("shutdown already ran");
            return None;
        }

        info!(exit_code, "shutting down");
        session.stop();

        let unmapped = session.release_mappings();
        if unmapped.failed > 0 {
            warn!(
                released = unmapped.released,
                failed = unmapped.failed,
                "some buffer mappings could not be released"
            );
        }
        info!(released = unmapped.released, "shutdown complete");

        Some(ShutdownReport {
            exit_code,
            unmapped,
        })
    }
}
