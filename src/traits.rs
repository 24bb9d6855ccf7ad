//! Core traits and types for the camera subsystem boundary.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Pixel format representation (e.g., YUYV).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");

    /// Little-endian `u32` code as used by V4L2 `pixelformat` fields.
    #[must_use]
    pub const fn code(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Inverse of [`FourCC::code`].
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        Self(code.to_le_bytes())
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl Size {
    /// Create a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Intended use of a stream, used when generating a default configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// Continuous capture for recording or streaming.
    VideoRecording,
}

/// Negotiable stream configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Frame dimensions.
    pub size: Size,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line.
    pub stride: u32,
    /// Total frame size in bytes.
    pub frame_size: u32,
    /// Number of buffers to allocate for the stream.
    pub buffer_count: u32,
}

impl StreamConfig {
    /// Create a configuration for a packed 4:2:2 stream.
    #[must_use]
    pub const fn new(size: Size, fourcc: FourCC, buffer_count: u32) -> Self {
        let stride = size.width * 2; // YUYV is 2 bytes per pixel
        Self {
            size,
            fourcc,
            stride,
            frame_size: stride * size.height,
            buffer_count,
        }
    }

    /// Same configuration with a different frame size; stride and frame size
    /// are recomputed.
    #[must_use]
    pub const fn with_size(&self, size: Size) -> Self {
        Self::new(size, self.fourcc, self.buffer_count)
    }
}

impl fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.size, self.fourcc)
    }
}

/// Result of validating a [`StreamConfig`] against the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    /// Accepted unchanged.
    Valid,
    /// Accepted after the device altered it in place.
    Adjusted,
    /// Rejected.
    Invalid,
}

/// One plane of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    /// File descriptor of the memory backing the plane.
    pub fd: RawFd,
    /// Offset of the plane inside the memory behind `fd`.
    pub offset: u32,
    /// Plane length in bytes.
    pub length: u32,
}

impl Plane {
    /// Sentinel offset reported for planes the device could not place.
    pub const INVALID_OFFSET: u32 = u32::MAX;
}

/// Identity of a device-allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Identity of a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

/// Device-allocated frame buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Buffer identity.
    pub id: BufferId,
    /// Planes making up the buffer.
    pub planes: Vec<Plane>,
}

/// A unit of work binding one buffer to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request identity.
    pub id: RequestId,
    /// Buffer bound to the request, if any.
    pub buffer: Option<BufferId>,
}

impl Request {
    /// Create an empty request.
    #[must_use]
    pub const fn new(id: RequestId) -> Self {
        Self { id, buffer: None }
    }
}

/// Notification that a request has been filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// The completed request.
    pub request: RequestId,
    /// Buffer holding the frame.
    pub buffer: BufferId,
    /// Frame sequence number.
    pub sequence: u32,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
}

/// Callback invoked by the camera for every completed request.
pub type CompletionCallback = Arc<dyn Fn(&Completion) + Send + Sync>;

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The manager enumerated no cameras.
    #[error("no cameras available")]
    NoCamerasAvailable,
    /// An enumerated camera could not be looked up.
    #[error("failed to find camera {0}")]
    CameraNotFound(String),
    /// Exclusive access was refused.
    #[error("failed to acquire camera: {0}")]
    AcquireFailed(String),
    /// The camera produced no configuration for the requested role.
    #[error("failed to generate configuration")]
    ConfigGenerationFailed,
    /// Validation rejected the configuration.
    #[error("invalid stream configuration {0}")]
    InvalidConfiguration(StreamConfig),
    /// The device refused to apply a validated configuration.
    #[error("failed to configure streams: {0}")]
    ApplyConfigurationFailed(String),
    /// Buffer allocation failed.
    #[error("failed to allocate buffers: {0}")]
    AllocationFailed(String),
    /// The camera could not create a request for a buffer.
    #[error("can't create request for {0}")]
    RequestCreationFailed(BufferId),
    /// The buffer planes violate the mapping preconditions.
    #[error("invalid plane layout for {buffer}: {reason}")]
    InvalidPlaneLayout {
        /// Offending buffer.
        buffer: BufferId,
        /// What was wrong with it.
        reason: String,
    },
    /// The buffer already has a live mapping.
    #[error("{0} is already mapped")]
    AlreadyMapped(BufferId),
    /// The memory-map call failed.
    #[error("mmap failed: {0}")]
    MapFailed(#[source] std::io::Error),
    /// The buffer could not be bound to a request.
    #[error("can't set buffer for request: {0}")]
    BufferBindFailed(String),
    /// The device refused to start streaming.
    #[error("failed to start camera: {0}")]
    StartFailed(String),
    /// The device refused to stop streaming.
    #[error("failed to stop camera: {0}")]
    StopFailed(String),
    /// A request could not be queued.
    #[error("failed to queue request: {0}")]
    QueueFailed(String),
    /// The camera handle has already been released.
    #[error("camera {0} has been released")]
    DeviceClosed(String),
    /// Operation called out of order.
    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Entry point into the camera subsystem.
pub trait CameraManager {
    /// Camera type handed out by the manager.
    type Camera: Camera;

    /// Start the manager and enumerate devices.
    fn start(&mut self) -> Result<()>;

    /// Ids of the cameras found by [`CameraManager::start`], in preference order.
    fn cameras(&self) -> Vec<String>;

    /// Look up a camera by id.
    fn get(&self, id: &str) -> Option<Self::Camera>;

    /// Stop the manager. Cameras must be released first.
    fn stop(&mut self);
}

/// Abstraction over a single capture device.
///
/// Fallible operations report the matching [`CameraError`] variant
/// (`AcquireFailed`, `ApplyConfigurationFailed`, `StartFailed`, ...).
pub trait Camera {
    /// Device identifier.
    fn id(&self) -> &str;

    /// Take exclusive access to the device.
    fn acquire(&mut self) -> Result<()>;

    /// Give up exclusive access and close the device.
    fn release(&mut self) -> Result<()>;

    /// Produce a default configuration for the given role.
    fn generate_configuration(&self, role: StreamRole) -> Option<StreamConfig>;

    /// Check a configuration, adjusting it in place when the device needs to.
    fn validate(&self, config: &mut StreamConfig) -> ConfigStatus;

    /// Apply a validated configuration.
    fn configure(&mut self, config: &StreamConfig) -> Result<()>;

    /// Allocate `buffer_count` buffers of the applied configuration.
    fn allocate(&mut self) -> Result<Vec<FrameBuffer>>;

    /// Create an empty request.
    fn create_request(&mut self) -> Option<Request>;

    /// Bind a buffer into a request.
    fn add_buffer(&mut self, request: &mut Request, buffer: &FrameBuffer) -> Result<()>;

    /// Register the completion callback, replacing any previous one.
    fn connect(&mut self, callback: CompletionCallback);

    /// Drop the completion callback. No new notifications start afterwards.
    fn disconnect(&mut self);

    /// Start streaming.
    fn start(&mut self) -> Result<()>;

    /// Stop streaming.
    fn stop(&mut self) -> Result<()>;

    /// Hand a bound request to the device.
    fn queue_request(&mut self, request: &Request) -> Result<()>;
}
