//! Setup, gate and teardown sequence driven by the binary.

use std::future::Future;

use tracing::{error, info};

use crate::buffers::MemoryMap;
use crate::gate::{ConnectionGate, GateError};
use crate::session::CaptureSession;
use crate::shutdown::ShutdownController;
use crate::traits::{CameraManager, Result, Size};

/// Exit status for setup and network failures.
pub const SETUP_FAILURE: i32 = 1;

fn setup<M: CameraManager, P: MemoryMap>(
    session: &mut CaptureSession<M, P>,
    size: Size,
) -> Result<usize> {
    session.acquire()?;
    session.configure(size)?;
    session.allocate_and_bind()?;
    session.start()
}

/// Bring capture up, then serve the gate until `shutdown` yields a signal
/// number.
///
/// The gate is only bound once capture is running. Teardown runs exactly once
/// on every path. Returns the process exit status: the signal number, or
/// [`SETUP_FAILURE`].
pub async fn run<M, P, S>(
    session: &mut CaptureSession<M, P>,
    size: Size,
    gate: ConnectionGate,
    shutdown: S,
) -> i32
where
    M: CameraManager + Send,
    M::Camera: Send,
    P: MemoryMap + Send,
    S: Future<Output = i32> + Send,
{
    let controller = ShutdownController::new();

    match setup(session, size) {
        Ok(queued) => info!(queued, "capture started"),
        Err(err) => {
            error!("{err}");
            controller.shutdown(session, SETUP_FAILURE);
            return SETUP_FAILURE;
        }
    }

    let code = match gate.listen() {
        Ok(pending) => {
            tokio::select! {
                signum = shutdown => {
                    info!(signum, "signal received");
                    signum
                }
                served = async {
                    pending.accept().await?.hold().await;
                    Ok::<(), GateError>(())
                } => {
                    if let Err(err) = served {
                        error!("{err}");
                    }
                    SETUP_FAILURE
                }
            }
        }
        Err(err) => {
            error!("{err}");
            SETUP_FAILURE
        }
    };

    controller.shutdown(session, code);
    code
}
