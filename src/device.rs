//! V4L2 camera backend using the v4l crate.
//!
//! Buffers are allocated with `VIDIOC_REQBUFS` and exported as DMA-buf file
//! descriptors, so every buffer reaches the session as a single-plane
//! [`FrameBuffer`] that it maps itself. Exclusive access is the V4L2 record
//! priority, which only one open file handle can hold at a time.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::memory::Memory;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_exportbuffer, v4l2_format, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    BufferId, Camera, CameraError, CameraManager, Completion, CompletionCallback, ConfigStatus,
    FourCC, FrameBuffer, Plane, Request, RequestId, Result, Size, StreamConfig, StreamRole,
};

const V4L2_PRIORITY_DEFAULT: u32 = 2;
const V4L2_PRIORITY_RECORD: u32 = 3;
const DEFAULT_BUFFER_COUNT: u32 = 4;
const POLL_TIMEOUT_MS: libc::c_int = 100;

/// Issue a V4L2 ioctl whose argument is `arg`.
fn ioctl<T>(fd: RawFd, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    // SAFETY: every caller pairs `request` with its matching argument struct.
    unsafe { v4l2::ioctl(fd, request, (arg as *mut T).cast()) }
}

fn zeroed<T>() -> T {
    // SAFETY: only used for the plain-data V4L2 ioctl structs, for which all
    // zero bytes is a valid value.
    unsafe { mem::zeroed() }
}

/// Replace `config` with what the driver negotiated.
///
/// Any difference, including stride or frame size alone, is an adjustment.
fn settle(config: &mut StreamConfig, negotiated: StreamConfig) -> ConfigStatus {
    if *config == negotiated {
        return ConfigStatus::Valid;
    }
    *config = negotiated;
    ConfigStatus::Adjusted
}

/// Enumerates V4L2 capture devices.
#[derive(Debug, Default)]
pub struct V4l2Manager {
    allowed: Option<Vec<PathBuf>>,
    nodes: Vec<PathBuf>,
}

impl V4l2Manager {
    /// Create a manager; devices are enumerated by [`CameraManager::start`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allowed: None,
            nodes: Vec::new(),
        }
    }

    /// Create a manager that only reports the given device nodes.
    #[must_use]
    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            allowed: Some(paths.into_iter().map(Into::into).collect()),
            nodes: Vec::new(),
        }
    }

    fn is_allowed(&self, path: &Path) -> bool {
        match &self.allowed {
            Some(allowed) => allowed.iter().any(|p| p == path),
            None => true,
        }
    }
}

impl CameraManager for V4l2Manager {
    type Camera = V4l2Camera;

    fn start(&mut self) -> Result<()> {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(v4l::context::Node::index);

        let usable: Vec<PathBuf> = nodes
            .iter()
            .filter(|node| self.is_allowed(node.path()))
            .filter(|node| {
                let caps = Device::with_path(node.path()).and_then(|dev| dev.query_caps());
                match caps {
                    Ok(caps) => {
                        let usable = caps
                            .capabilities
                            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                            && caps
                                .capabilities
                                .contains(v4l::capability::Flags::STREAMING);
                        debug!(path = %node.path().display(), card = %caps.card, usable, "found video node");
                        usable
                    }
                    Err(err) => {
                        debug!(path = %node.path().display(), error = %err, "skipping video node");
                        false
                    }
                }
            })
            .map(|node| node.path().to_path_buf())
            .collect();
        self.nodes = usable;
        Ok(())
    }

    fn cameras(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect()
    }

    fn get(&self, id: &str) -> Option<Self::Camera> {
        match Device::with_path(id) {
            Ok(device) => Some(V4l2Camera::new(id, device)),
            Err(err) => {
                warn!(camera = id, error = %err, "failed to open camera");
                None
            }
        }
    }

    fn stop(&mut self) {
        self.nodes.clear();
    }
}

#[derive(Default)]
struct Shared {
    callback: Option<CompletionCallback>,
    pending: HashMap<u32, RequestId>,
}

/// V4L2 capture device.
pub struct V4l2Camera {
    id: String,
    device: Option<Device>,
    config: Option<StreamConfig>,
    allocated: u32,
    exported: Vec<OwnedFd>,
    next_request: u64,
    shared: Arc<Mutex<Shared>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4l2Camera {
    fn new(id: &str, device: Device) -> Self {
        Self {
            id: id.to_owned(),
            device: Some(device),
            config: None,
            allocated: 0,
            exported: Vec::new(),
            next_request: 0,
            shared: Arc::new(Mutex::new(Shared::default())),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn fd(&self) -> Result<RawFd> {
        self.device
            .as_ref()
            .map(|device| device.handle().fd())
            .ok_or_else(|| CameraError::DeviceClosed(self.id.clone()))
    }

    fn halt_worker(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(camera = %self.id, "capture thread panicked");
            }
        }
    }

    fn export_buffer(&mut self, fd: RawFd, index: u32) -> FrameBuffer {
        let id = BufferId(index);

        let mut buf: v4l2_buffer = zeroed();
        buf.index = index;
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        if let Err(err) = ioctl(fd, vidioc::VIDIOC_QUERYBUF, &mut buf) {
            warn!(buffer = %id, error = %err, "VIDIOC_QUERYBUF failed");
            return FrameBuffer { id, planes: Vec::new() };
        }

        let mut export: v4l2_exportbuffer = zeroed();
        export.type_ = Type::VideoCapture as u32;
        export.index = index;
        #[allow(clippy::cast_sign_loss)]
        let flags = (libc::O_RDONLY | libc::O_CLOEXEC) as u32;
        export.flags = flags;
        let plane_fd = match ioctl(fd, vidioc::VIDIOC_EXPBUF, &mut export) {
            Ok(()) => {
                // SAFETY: EXPBUF returned a fresh descriptor that nothing else owns.
                self.exported.push(unsafe { OwnedFd::from_raw_fd(export.fd) });
                export.fd
            }
            Err(err) => {
                warn!(buffer = %id, error = %err, "VIDIOC_EXPBUF failed");
                -1
            }
        };

        FrameBuffer {
            id,
            planes: vec![Plane {
                fd: plane_fd,
                offset: 0,
                length: buf.length,
            }],
        }
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.halt_worker();
    }
}

impl Camera for V4l2Camera {
    fn id(&self) -> &str {
        &self.id
    }

    fn acquire(&mut self) -> Result<()> {
        let fd = self.fd()?;
        let mut priority = V4L2_PRIORITY_RECORD;
        ioctl(fd, vidioc::VIDIOC_S_PRIORITY, &mut priority)
            .map_err(|err| CameraError::AcquireFailed(format!("{}: {err}", self.id)))
    }

    fn release(&mut self) -> Result<()> {
        self.halt_worker();
        let fd = self.fd()?;

        let mut priority = V4L2_PRIORITY_DEFAULT;
        let result = ioctl(fd, vidioc::VIDIOC_S_PRIORITY, &mut priority);

        self.shared.lock().callback = None;
        self.exported.clear();
        self.device = None;
        result.map_err(CameraError::Io)
    }

    fn generate_configuration(&self, role: StreamRole) -> Option<StreamConfig> {
        let device = self.device.as_ref()?;
        let format = device
            .format()
            .map_err(|err| warn!(camera = %self.id, error = %err, "failed to query format"))
            .ok()?;
        debug!(camera = %self.id, ?role, "generated configuration from current format");

        Some(StreamConfig {
            size: Size::new(format.width, format.height),
            fourcc: FourCC::from(format.fourcc),
            stride: format.stride,
            frame_size: format.size,
            buffer_count: DEFAULT_BUFFER_COUNT,
        })
    }

    fn validate(&self, config: &mut StreamConfig) -> ConfigStatus {
        let Ok(fd) = self.fd() else {
            return ConfigStatus::Invalid;
        };

        let mut format: v4l2_format = zeroed();
        format.type_ = Type::VideoCapture as u32;
        format.fmt.pix.width = config.size.width;
        format.fmt.pix.height = config.size.height;
        format.fmt.pix.pixelformat = config.fourcc.code();

        if let Err(err) = ioctl(fd, vidioc::VIDIOC_TRY_FMT, &mut format) {
            warn!(camera = %self.id, error = %err, "VIDIOC_TRY_FMT failed");
            return ConfigStatus::Invalid;
        }
        // SAFETY: the driver fills `pix` for a video capture TRY_FMT.
        let pix = unsafe { format.fmt.pix };
        if pix.width == 0 || pix.height == 0 {
            return ConfigStatus::Invalid;
        }

        settle(
            config,
            StreamConfig {
                size: Size::new(pix.width, pix.height),
                fourcc: FourCC::from_code(pix.pixelformat),
                stride: pix.bytesperline,
                frame_size: pix.sizeimage,
                buffer_count: config.buffer_count,
            },
        )
    }

    fn configure(&mut self, config: &StreamConfig) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| CameraError::DeviceClosed(self.id.clone()))?;

        let requested = v4l::Format::new(config.size.width, config.size.height, config.fourcc.into());
        let applied = device
            .set_format(&requested)
            .map_err(|err| CameraError::ApplyConfigurationFailed(err.to_string()))?;

        let applied_size = Size::new(applied.width, applied.height);
        if applied_size != config.size || FourCC::from(applied.fourcc) != config.fourcc {
            return Err(CameraError::ApplyConfigurationFailed(format!(
                "driver applied {applied_size}-{} instead of {config}",
                FourCC::from(applied.fourcc)
            )));
        }

        self.config = Some(StreamConfig {
            stride: applied.stride,
            frame_size: applied.size,
            ..config.clone()
        });
        Ok(())
    }

    fn allocate(&mut self) -> Result<Vec<FrameBuffer>> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| CameraError::AllocationFailed("camera is not configured".to_owned()))?;
        let fd = self.fd()?;

        let mut request: v4l2_requestbuffers = zeroed();
        request.count = config.buffer_count;
        request.type_ = Type::VideoCapture as u32;
        request.memory = Memory::Mmap as u32;
        ioctl(fd, vidioc::VIDIOC_REQBUFS, &mut request)
            .map_err(|err| CameraError::AllocationFailed(err.to_string()))?;

        self.exported.clear();
        self.allocated = request.count;
        debug!(camera = %self.id, requested = config.buffer_count, allocated = request.count, "buffers allocated");

        Ok((0..request.count)
            .map(|index| self.export_buffer(fd, index))
            .collect())
    }

    fn create_request(&mut self) -> Option<Request> {
        self.device.as_ref()?;
        let id = RequestId(self.next_request);
        self.next_request += 1;
        Some(Request::new(id))
    }

    fn add_buffer(&mut self, request: &mut Request, buffer: &FrameBuffer) -> Result<()> {
        if buffer.id.0 >= self.allocated {
            return Err(CameraError::BufferBindFailed(format!(
                "{} was not allocated by {}",
                buffer.id, self.id
            )));
        }
        if request.buffer.is_some() {
            return Err(CameraError::BufferBindFailed(format!(
                "{} already has a buffer",
                request.id
            )));
        }
        request.buffer = Some(buffer.id);
        Ok(())
    }

    fn connect(&mut self, callback: CompletionCallback) {
        self.shared.lock().callback = Some(callback);
    }

    fn disconnect(&mut self) {
        self.shared.lock().callback = None;
    }

    fn start(&mut self) -> Result<()> {
        let fd = self.fd()?;
        let mut kind = Type::VideoCapture as libc::c_int;
        ioctl(fd, vidioc::VIDIOC_STREAMON, &mut kind)
            .map_err(|err| CameraError::StartFailed(err.to_string()))?;

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("v4l2-capture".to_owned())
            .spawn(move || capture_loop(fd, &running, &shared));

        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                let mut kind = Type::VideoCapture as libc::c_int;
                if let Err(off) = ioctl(fd, vidioc::VIDIOC_STREAMOFF, &mut kind) {
                    warn!(camera = %self.id, error = %off, "VIDIOC_STREAMOFF failed");
                }
                Err(CameraError::StartFailed(err.to_string()))
            }
        }
    }

    /// The capture thread is only told to exit here; it is joined by
    /// [`Camera::release`], since it may be waiting on a completion callback.
    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let fd = self.fd()?;
        let mut kind = Type::VideoCapture as libc::c_int;
        let result = ioctl(fd, vidioc::VIDIOC_STREAMOFF, &mut kind);
        self.shared.lock().pending.clear();
        result.map_err(|err| CameraError::StopFailed(err.to_string()))
    }

    fn queue_request(&mut self, request: &Request) -> Result<()> {
        let fd = self.fd()?;
        let buffer = request
            .buffer
            .ok_or_else(|| CameraError::QueueFailed(format!("{} has no buffer", request.id)))?;

        let mut shared = self.shared.lock();
        if shared.pending.contains_key(&buffer.0) {
            return Err(CameraError::QueueFailed(format!("{buffer} is already queued")));
        }

        let mut buf: v4l2_buffer = zeroed();
        buf.index = buffer.0;
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        ioctl(fd, vidioc::VIDIOC_QBUF, &mut buf)
            .map_err(|err| CameraError::QueueFailed(err.to_string()))?;

        shared.pending.insert(buffer.0, request.id);
        Ok(())
    }
}

/// Dequeue filled buffers and report them until `running` is cleared.
///
/// Completed requests are not queued again.
fn capture_loop(fd: RawFd, running: &AtomicBool, shared: &Mutex<Shared>) {
    while running.load(Ordering::Acquire) {
        let mut poll_fd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `poll_fd` is a valid array of one element.
        let ready = unsafe { libc::poll(&mut poll_fd, 1, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %err, "poll failed, stopping capture thread");
            break;
        }
        if ready == 0 {
            continue;
        }
        if poll_fd.revents & libc::POLLIN == 0 {
            // POLLERR while nothing is queued; back off instead of spinning.
            thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS.unsigned_abs().into()));
            continue;
        }

        let mut buf: v4l2_buffer = zeroed();
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        match ioctl(fd, vidioc::VIDIOC_DQBUF, &mut buf) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                warn!(error = %err, "VIDIOC_DQBUF failed");
                continue;
            }
        }

        let (request, callback) = {
            let mut shared = shared.lock();
            (shared.pending.remove(&buf.index), shared.callback.clone())
        };
        let (Some(request), Some(callback)) = (request, callback) else {
            debug!(index = buf.index, "dropping dequeued buffer");
            continue;
        };

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = buf.timestamp.tv_sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000);

        callback(&Completion {
            request,
            buffer: BufferId(buf.index),
            sequence: buf.sequence,
            bytes_used: buf.bytesused,
            timestamp: Duration::new(secs, nanos),
        });
    }
}
