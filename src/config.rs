//! Compiled-in runtime settings.

use crate::gate::DEFAULT_PORT;
use crate::traits::Size;

/// Frame size requested from the camera.
pub const DEFAULT_SIZE: Size = Size::new(1024, 768);

/// Default `tracing` directive, extended by `RUST_LOG`.
pub const DEFAULT_LOG_DIRECTIVE: &str = "pi_cam_stream=info";

/// Settings of the streaming binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Frame size to request; the device may adjust it.
    pub size: Size,
    /// TCP port of the connection gate.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE,
            port: DEFAULT_PORT,
        }
    }
}
