//! Mock camera subsystem and memory mapper for testing without hardware.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffers::MemoryMap;
use crate::traits::{
    BufferId, Camera, CameraError, CameraManager, Completion, CompletionCallback, ConfigStatus,
    FourCC, FrameBuffer, Plane, Request, RequestId, Result, Size, StreamConfig, StreamRole,
};

/// How the mock camera answers validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Accept every configuration unchanged.
    Accept,
    /// Force the given size, reporting `Adjusted` when it differs.
    AdjustTo(Size),
    /// Reject every configuration.
    Reject,
}

/// Calls observed by the mock camera subsystem, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Manager started.
    ManagerStarted,
    /// Manager stopped.
    ManagerStopped,
    /// Camera acquired.
    Acquired,
    /// Camera released.
    Released,
    /// Configuration applied.
    Configured(StreamConfig),
    /// Buffers allocated.
    Allocated(usize),
    /// Completion callback connected.
    Connected,
    /// Completion callback disconnected.
    Disconnected,
    /// Streaming started.
    Started,
    /// Streaming stopped.
    Stopped,
    /// Request queued.
    Queued(RequestId),
}

#[derive(Debug)]
struct Behavior {
    cameras: usize,
    missing_camera: bool,
    busy: bool,
    no_configuration: bool,
    validation: Validation,
    configure_failure: bool,
    split_fd: HashSet<u32>,
    request_failures: HashSet<usize>,
    bind_failures: HashSet<u32>,
    start_failure: bool,
    stop_failure: bool,
    queue_failures: HashSet<usize>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            cameras: 1,
            missing_camera: false,
            busy: false,
            no_configuration: false,
            validation: Validation::Accept,
            configure_failure: false,
            split_fd: HashSet::new(),
            request_failures: HashSet::new(),
            bind_failures: HashSet::new(),
            start_failure: false,
            stop_failure: false,
            queue_failures: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct MockShared {
    behavior: Behavior,
    events: Vec<Event>,
    callback: Option<CompletionCallback>,
    streaming: bool,
    config: Option<StreamConfig>,
    requests_created: usize,
    queue_calls: usize,
    next_request: u64,
    bound: HashMap<RequestId, BufferId>,
    queued: Vec<RequestId>,
    sequence: u32,
}

/// Mock camera manager handing out [`MockCamera`]s.
pub struct MockManager {
    shared: Arc<Mutex<MockShared>>,
}

impl Default for MockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MockManager {
    /// One camera that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(MockShared::default())),
        }
    }

    fn with<F: FnOnce(&mut Behavior)>(self, change: F) -> Self {
        change(&mut self.shared.lock().behavior);
        self
    }

    /// Number of cameras enumerated.
    #[must_use]
    pub fn with_cameras(self, count: usize) -> Self {
        self.with(|b| b.cameras = count)
    }

    /// Enumerate a camera that cannot be looked up.
    #[must_use]
    pub fn with_missing_camera(self) -> Self {
        self.with(|b| b.missing_camera = true)
    }

    /// Refuse acquisition as if another process held the camera.
    #[must_use]
    pub fn with_busy(self) -> Self {
        self.with(|b| b.busy = true)
    }

    /// Produce no configuration.
    #[must_use]
    pub fn with_no_configuration(self) -> Self {
        self.with(|b| b.no_configuration = true)
    }

    /// Validation behaviour.
    #[must_use]
    pub fn with_validation(self, validation: Validation) -> Self {
        self.with(|b| b.validation = validation)
    }

    /// Refuse to apply configurations.
    #[must_use]
    pub fn with_configure_failure(self) -> Self {
        self.with(|b| b.configure_failure = true)
    }

    /// Give the second plane of a buffer its own file descriptor.
    #[must_use]
    pub fn with_split_fd_buffer(self, buffer: u32) -> Self {
        self.with(|b| {
            b.split_fd.insert(buffer);
        })
    }

    /// Fail the nth `create_request` call (0-based).
    #[must_use]
    pub fn with_request_failure(self, nth: usize) -> Self {
        self.with(|b| {
            b.request_failures.insert(nth);
        })
    }

    /// Refuse to bind a buffer.
    #[must_use]
    pub fn with_bind_failure(self, buffer: u32) -> Self {
        self.with(|b| {
            b.bind_failures.insert(buffer);
        })
    }

    /// Refuse to start streaming.
    #[must_use]
    pub fn with_start_failure(self) -> Self {
        self.with(|b| b.start_failure = true)
    }

    /// Report an error when stopping (the device still stops).
    #[must_use]
    pub fn with_stop_failure(self) -> Self {
        self.with(|b| b.stop_failure = true)
    }

    /// Fail the nth `queue_request` call (0-based).
    #[must_use]
    pub fn with_queue_failure(self, nth: usize) -> Self {
        self.with(|b| {
            b.queue_failures.insert(nth);
        })
    }

    /// Handle for inspecting calls and driving completions.
    #[must_use]
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl CameraManager for MockManager {
    type Camera = MockCamera;

    fn start(&mut self) -> Result<()> {
        self.shared.lock().events.push(Event::ManagerStarted);
        Ok(())
    }

    fn cameras(&self) -> Vec<String> {
        let count = self.shared.lock().behavior.cameras;
        (0..count).map(|i| format!("mock:{i}")).collect()
    }

    fn get(&self, id: &str) -> Option<Self::Camera> {
        if self.shared.lock().behavior.missing_camera {
            return None;
        }
        Some(MockCamera {
            id: id.to_owned(),
            shared: Arc::clone(&self.shared),
        })
    }

    fn stop(&mut self) {
        self.shared.lock().events.push(Event::ManagerStopped);
    }
}

/// Mock capture device.
pub struct MockCamera {
    id: String,
    shared: Arc<Mutex<MockShared>>,
}

impl Camera for MockCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn acquire(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.behavior.busy {
            return Err(CameraError::AcquireFailed(
                "device or resource busy".to_owned(),
            ));
        }
        shared.events.push(Event::Acquired);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.callback = None;
        shared.events.push(Event::Released);
        Ok(())
    }

    fn generate_configuration(&self, _role: StreamRole) -> Option<StreamConfig> {
        if self.shared.lock().behavior.no_configuration {
            return None;
        }
        Some(StreamConfig::new(Size::new(640, 480), FourCC::YUYV, 4))
    }

    fn validate(&self, config: &mut StreamConfig) -> ConfigStatus {
        match self.shared.lock().behavior.validation {
            Validation::Accept => ConfigStatus::Valid,
            Validation::AdjustTo(size) if size != config.size => {
                *config = config.with_size(size);
                ConfigStatus::Adjusted
            }
            Validation::AdjustTo(_) => ConfigStatus::Valid,
            Validation::Reject => ConfigStatus::Invalid,
        }
    }

    fn configure(&mut self, config: &StreamConfig) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.behavior.configure_failure {
            return Err(CameraError::ApplyConfigurationFailed(
                "device rejected configuration".to_owned(),
            ));
        }
        shared.config = Some(config.clone());
        shared.events.push(Event::Configured(config.clone()));
        Ok(())
    }

    fn allocate(&mut self) -> Result<Vec<FrameBuffer>> {
        let mut shared = self.shared.lock();
        let config = shared
            .config
            .clone()
            .ok_or_else(|| CameraError::AllocationFailed("not configured".to_owned()))?;

        let half = config.frame_size / 2;
        let buffers: Vec<_> = (0..config.buffer_count)
            .map(|index| {
                let fd = 100 + RawFd::try_from(index).unwrap_or(0);
                let second_fd = if shared.behavior.split_fd.contains(&index) {
                    fd + 100
                } else {
                    fd
                };
                FrameBuffer {
                    id: BufferId(index),
                    planes: vec![
                        Plane {
                            fd,
                            offset: 0,
                            length: half,
                        },
                        Plane {
                            fd: second_fd,
                            offset: half,
                            length: config.frame_size - half,
                        },
                    ],
                }
            })
            .collect();

        shared.events.push(Event::Allocated(buffers.len()));
        Ok(buffers)
    }

    fn create_request(&mut self) -> Option<Request> {
        let mut shared = self.shared.lock();
        let nth = shared.requests_created;
        shared.requests_created += 1;
        if shared.behavior.request_failures.contains(&nth) {
            return None;
        }
        let id = RequestId(shared.next_request);
        shared.next_request += 1;
        Some(Request::new(id))
    }

    fn add_buffer(&mut self, request: &mut Request, buffer: &FrameBuffer) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.behavior.bind_failures.contains(&buffer.id.0) {
            return Err(CameraError::BufferBindFailed(
                "buffer does not belong to stream".to_owned(),
            ));
        }
        if request.buffer.is_some() {
            return Err(CameraError::BufferBindFailed(
                "request already has a buffer".to_owned(),
            ));
        }
        request.buffer = Some(buffer.id);
        shared.bound.insert(request.id, buffer.id);
        Ok(())
    }

    fn connect(&mut self, callback: CompletionCallback) {
        let mut shared = self.shared.lock();
        shared.callback = Some(callback);
        shared.events.push(Event::Connected);
    }

    fn disconnect(&mut self) {
        let mut shared = self.shared.lock();
        shared.callback = None;
        shared.events.push(Event::Disconnected);
    }

    fn start(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.behavior.start_failure {
            return Err(CameraError::StartFailed(
                "device refused to start".to_owned(),
            ));
        }
        shared.streaming = true;
        shared.events.push(Event::Started);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.streaming = false;
        shared.events.push(Event::Stopped);
        if shared.behavior.stop_failure {
            return Err(CameraError::StopFailed(
                "timeout waiting for device".to_owned(),
            ));
        }
        Ok(())
    }

    fn queue_request(&mut self, request: &Request) -> Result<()> {
        let mut shared = self.shared.lock();
        let nth = shared.queue_calls;
        shared.queue_calls += 1;
        if shared.behavior.queue_failures.contains(&nth) {
            return Err(CameraError::QueueFailed("queue full".to_owned()));
        }
        shared.queued.push(request.id);
        shared.events.push(Event::Queued(request.id));
        Ok(())
    }
}

/// Test-side view of the mock camera subsystem.
pub struct MockHandle {
    shared: Arc<Mutex<MockShared>>,
}

impl MockHandle {
    /// Calls observed so far.
    pub fn events(&self) -> Vec<Event> {
        self.shared.lock().events.clone()
    }

    /// Requests queued so far.
    pub fn queued(&self) -> Vec<RequestId> {
        self.shared.lock().queued.clone()
    }

    /// The currently connected callback.
    pub fn callback(&self) -> Option<CompletionCallback> {
        self.shared.lock().callback.clone()
    }

    /// Build the completion the camera would deliver for a request.
    pub fn completion_for(&self, request: RequestId) -> Completion {
        let mut shared = self.shared.lock();
        let sequence = shared.sequence;
        shared.sequence += 1;
        let buffer = shared.bound.get(&request).copied().unwrap_or(BufferId(0));
        let bytes_used = shared.config.as_ref().map_or(0, |c| c.frame_size);
        Completion {
            request,
            buffer,
            sequence,
            bytes_used,
            timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
        }
    }

    /// Deliver a completion for a queued request, as the device would.
    ///
    /// Returns `false` when nothing was delivered: the camera is not
    /// streaming, no callback is connected or the request was never queued.
    pub fn complete(&self, request: RequestId) -> bool {
        let callback = {
            let shared = self.shared.lock();
            if !shared.streaming || !shared.queued.contains(&request) {
                return false;
            }
            match shared.callback.clone() {
                Some(callback) => callback,
                None => return false,
            }
        };
        let completion = self.completion_for(request);
        callback(&completion);
        true
    }
}

/// Calls observed by [`FakeMapper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapCall {
    /// A map call that succeeded.
    Map {
        /// Mapped descriptor.
        fd: RawFd,
        /// Mapped length.
        length: usize,
        /// Address handed out.
        address: usize,
    },
    /// An unmap call, successful or not.
    Unmap {
        /// Address released.
        address: usize,
        /// Length released.
        length: usize,
    },
}

#[derive(Debug, Default)]
struct FakeMapperState {
    calls: Vec<MapCall>,
    next_address: usize,
    fail_map: HashSet<RawFd>,
    fail_unmap: HashSet<usize>,
}

/// Recording [`MemoryMap`] handing out fake addresses.
#[derive(Debug, Clone, Default)]
pub struct FakeMapper {
    state: Arc<Mutex<FakeMapperState>>,
}

impl FakeMapper {
    /// A mapper on which every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail mapping of a descriptor with `ENOMEM`.
    #[must_use]
    pub fn fail_map_for(self, fd: RawFd) -> Self {
        self.state.lock().fail_map.insert(fd);
        self
    }

    /// Fail unmapping of an address with `EINVAL`.
    pub fn fail_unmap_at(&self, address: usize) {
        self.state.lock().fail_unmap.insert(address);
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<MapCall> {
        self.state.lock().calls.clone()
    }

    /// `(fd, length)` of every successful map.
    pub fn mapped_lengths(&self) -> Vec<(RawFd, usize)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MapCall::Map { fd, length, .. } => Some((*fd, *length)),
                MapCall::Unmap { .. } => None,
            })
            .collect()
    }

    /// Addresses passed to unmap, in call order.
    pub fn unmapped_addresses(&self) -> Vec<usize> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MapCall::Unmap { address, .. } => Some(*address),
                MapCall::Map { .. } => None,
            })
            .collect()
    }

    /// Whether every mapping was unmapped exactly once with its own length.
    pub fn is_bijective(&self) -> bool {
        let state = self.state.lock();
        let mapped: HashMap<usize, usize> = state
            .calls
            .iter()
            .filter_map(|call| match call {
                MapCall::Map {
                    address, length, ..
                } => Some((*address, *length)),
                MapCall::Unmap { .. } => None,
            })
            .collect();

        let mut seen = HashSet::new();
        for call in &state.calls {
            if let MapCall::Unmap { address, length } = call {
                if mapped.get(address) != Some(length) || !seen.insert(*address) {
                    return false;
                }
            }
        }
        seen.len() == mapped.len()
    }
}

impl MemoryMap for FakeMapper {
    fn map(&mut self, fd: RawFd, length: usize) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.fail_map.contains(&fd) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        state.next_address += 1;
        let address = 0x1000_0000 + state.next_address * 0x100_0000;
        state.calls.push(MapCall::Map {
            fd,
            length,
            address,
        });
        Ok(address)
    }

    fn unmap(&mut self, address: usize, length: usize) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MapCall::Unmap { address, length });
        if state.fail_unmap.contains(&address) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_manager_enumeration() {
        let mut manager = MockManager::new().with_cameras(2);
        manager.start().expect("start should succeed");
        assert_eq!(manager.cameras(), vec!["mock:0", "mock:1"]);
        let camera = manager.get("mock:1").expect("camera should exist");
        assert_eq!(camera.id(), "mock:1");
    }

    #[test]
    fn test_mock_validation_adjusts_in_place() {
        let manager = MockManager::new().with_validation(Validation::AdjustTo(Size::new(320, 240)));
        let camera = manager.get("mock:0").expect("camera should exist");
        let mut config = StreamConfig::new(Size::new(640, 480), FourCC::YUYV, 4);
        assert_eq!(camera.validate(&mut config), ConfigStatus::Adjusted);
        assert_eq!(config.size, Size::new(320, 240));
        assert_eq!(camera.validate(&mut config), ConfigStatus::Valid);
    }

    #[test]
    fn test_mock_allocate_planes_share_fd() {
        let manager = MockManager::new();
        let mut camera = manager.get("mock:0").expect("camera should exist");
        let config = StreamConfig::new(Size::new(64, 64), FourCC::YUYV, 2);
        camera.configure(&config).expect("configure should succeed");
        let buffers = camera.allocate().expect("allocate should succeed");
        assert_eq!(buffers.len(), 2);
        for buffer in &buffers {
            let fds: HashSet<_> = buffer.planes.iter().map(|p| p.fd).collect();
            assert_eq!(fds.len(), 1);
            let total: u32 = buffer.planes.iter().map(|p| p.length).sum();
            assert_eq!(total, config.frame_size);
        }
    }

    #[test]
    fn test_fake_mapper_bijection_detects_double_unmap() {
        let mut fake = FakeMapper::new();
        let address = fake.map(3, 16).expect("map should succeed");
        assert!(!fake.is_bijective());
        fake.unmap(address, 16).expect("unmap should succeed");
        assert!(fake.is_bijective());
        fake.unmap(address, 16).expect("unmap should succeed");
        assert!(!fake.is_bijective());
    }
}
