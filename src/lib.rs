//! Pi-Cam-Stream: camera frame capture for Raspberry Pi
//!
//! This library drives a camera through a trait-based capture boundary, maps
//! its frame buffers, counts completed frames, and tears everything down
//! exactly once on a signal. The V4L2 backend is used on real hardware and a
//! mock backend in tests.

pub mod app;
pub mod buffers;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod gate;
pub mod session;
pub mod shutdown;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use buffers::{BufferMapper, MemoryMap, SystemMapper};
pub use config::Config;
pub use device::{V4l2Camera, V4l2Manager};
pub use dispatch::CompletionDispatcher;
pub use gate::{ConnectionGate, GateError};
pub use session::{BindOutcome, BindReport, CaptureSession, SessionState};
pub use shutdown::{ShutdownController, ShutdownReport, ShutdownSignals};
pub use traits::{Camera, CameraError, CameraManager, FourCC, Size, StreamConfig};
