//! Capture session: acquisition, negotiation, buffer binding and streaming.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::buffers::{plane_layout, BufferMapper, MemoryMap, UnmapReport};
use crate::dispatch::CompletionDispatcher;
use crate::traits::{
    BufferId, Camera, CameraError, CameraManager, ConfigStatus, FrameBuffer, Request, RequestId,
    Result, Size, StreamConfig, StreamRole,
};

/// Lifecycle of a [`CaptureSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing acquired yet.
    Uninitialized,
    /// Camera exclusively held.
    Acquired,
    /// Stream configuration applied.
    Configured,
    /// Buffers allocated, mapped and bound to requests.
    BuffersBound,
    /// Device streaming, requests queued.
    Running,
    /// Torn down.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Acquired => "acquired",
            Self::Configured => "configured",
            Self::BuffersBound => "buffers-bound",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What happened to one allocated buffer during binding.
#[derive(Debug)]
pub enum BindOutcome {
    /// The buffer is mapped and bound into this request.
    Bound(RequestId),
    /// The buffer was abandoned.
    Skipped(CameraError),
}

/// Result of [`CaptureSession::allocate_and_bind`].
#[derive(Debug)]
pub struct BindReport {
    /// Buffers asked for by the configuration.
    pub requested: u32,
    /// Per-buffer outcome, in allocation order.
    pub outcomes: Vec<(BufferId, BindOutcome)>,
}

impl BindReport {
    /// Buffers the device actually allocated.
    pub fn allocated(&self) -> usize {
        self.outcomes.len()
    }

    /// Buffers bound into a request.
    pub fn bound(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, BindOutcome::Bound(_)))
            .count()
    }

    /// Whether fewer requests were built than buffers requested.
    pub fn is_degraded(&self) -> bool {
        u32::try_from(self.bound()).is_ok_and(|bound| bound < self.requested)
    }
}

/// Owns the camera, its requests and the buffer mappings.
pub struct CaptureSession<M: CameraManager, P> {
    manager: M,
    manager_started: bool,
    camera: Option<M::Camera>,
    config: Option<StreamConfig>,
    requests: Vec<Request>,
    queued: HashSet<RequestId>,
    mapper: BufferMapper<P>,
    dispatcher: Arc<CompletionDispatcher>,
    state: SessionState,
}

impl<M: CameraManager, P: MemoryMap> CaptureSession<M, P> {
    /// Create a session over a camera manager and a memory mapper.
    pub fn new(manager: M, mapper: P) -> Self {
        Self {
            manager,
            manager_started: false,
            camera: None,
            config: None,
            requests: Vec::new(),
            queued: HashSet::new(),
            mapper: BufferMapper::new(mapper),
            dispatcher: Arc::new(CompletionDispatcher::new()),
            state: SessionState::Uninitialized,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated configuration, once configured.
    pub const fn config(&self) -> Option<&StreamConfig> {
        self.config.as_ref()
    }

    /// Requests built by [`CaptureSession::allocate_and_bind`].
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// Number of requests handed to the device.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Buffer mapping table.
    pub const fn mapper(&self) -> &BufferMapper<P> {
        &self.mapper
    }

    /// Completion dispatcher shared with the camera.
    pub const fn dispatcher(&self) -> &Arc<CompletionDispatcher> {
        &self.dispatcher
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CameraError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn camera_mut(&mut self, operation: &'static str) -> Result<&mut M::Camera> {
        let state = self.state;
        self.camera
            .as_mut()
            .ok_or(CameraError::InvalidState { operation, state })
    }

    /// Start the manager and take exclusive hold of the first camera.
    pub fn acquire(&mut self) -> Result<()> {
        self.expect_state(SessionState::Uninitialized, "acquire")?;

        self.manager.start()?;
        self.manager_started = true;

        let ids = self.manager.cameras();
        let id = ids.first().ok_or(CameraError::NoCamerasAvailable)?;
        let mut camera = self
            .manager
            .get(id)
            .ok_or_else(|| CameraError::CameraNotFound(id.clone()))?;
        camera.acquire()?;

        info!(camera = camera.id(), "acquired camera");
        self.camera = Some(camera);
        self.state = SessionState::Acquired;
        Ok(())
    }

    /// Negotiate and apply a recording configuration of the requested size.
    ///
    /// Returns the configuration actually applied, which differs from the
    /// request when the device adjusted it.
    pub fn configure(&mut self, requested: Size) -> Result<StreamConfig> {
        self.expect_state(SessionState::Acquired, "configure")?;
        let camera = self.camera_mut("configure")?;

        let generated = camera
            .generate_configuration(StreamRole::VideoRecording)
            .ok_or(CameraError::ConfigGenerationFailed)?;
        let selected = generated.with_size(requested);
        let mut config = selected.clone();

        match camera.validate(&mut config) {
            ConfigStatus::Valid => {}
            ConfigStatus::Adjusted => {
                info!("stream configuration adjusted from \"{selected}\" to \"{config}\"");
            }
            ConfigStatus::Invalid => return Err(CameraError::InvalidConfiguration(selected)),
        }

        camera.configure(&config)?;
        info!("camera \"{}\" configured with {config} stream", camera.id());

        self.config = Some(config.clone());
        self.state = SessionState::Configured;
        Ok(config)
    }

    /// Allocate buffers and build one request per buffer.
    ///
    /// Failures are per buffer: the buffer is skipped, recorded in the report
    /// and the remaining buffers are still bound.
    pub fn allocate_and_bind(&mut self) -> Result<BindReport> {
        self.expect_state(SessionState::Configured, "allocate_and_bind")?;
        let config = self
            .config
            .clone()
            .ok_or(CameraError::InvalidState {
                operation: "allocate_and_bind",
                state: self.state,
            })?;

        let buffers = self.camera_mut("allocate_and_bind")?.allocate()?;

        let mut outcomes = Vec::with_capacity(buffers.len());
        for buffer in &buffers {
            let outcome = match self.bind_buffer(buffer, &config) {
                Ok(request) => {
                    let id = request.id;
                    self.requests.push(request);
                    BindOutcome::Bound(id)
                }
                Err(err) => {
                    warn!(buffer = %buffer.id, error = %err, "skipping buffer");
                    BindOutcome::Skipped(err)
                }
            };
            outcomes.push((buffer.id, outcome));
        }

        let report = BindReport {
            requested: config.buffer_count,
            outcomes,
        };
        if report.is_degraded() {
            warn!(
                requested = report.requested,
                allocated = report.allocated(),
                bound = report.bound(),
                "running with fewer buffers than requested"
            );
        } else {
            info!(bound = report.bound(), "buffers bound");
        }

        self.state = SessionState::BuffersBound;
        Ok(report)
    }

    fn bind_buffer(&mut self, buffer: &FrameBuffer, config: &StreamConfig) -> Result<Request> {
        let camera = self.camera_mut("allocate_and_bind")?;
        let mut request = camera
            .create_request()
            .ok_or(CameraError::RequestCreationFailed(buffer.id))?;

        let (_, length) = plane_layout(buffer)?;
        let needed = usize::try_from(config.frame_size).unwrap_or(usize::MAX);
        if length < needed {
            return Err(CameraError::InvalidPlaneLayout {
                buffer: buffer.id,
                reason: format!("{length} bytes cannot hold a {config} frame of {needed} bytes"),
            });
        }

        self.mapper.map(buffer)?;

        let camera = self.camera_mut("allocate_and_bind")?;
        camera.add_buffer(&mut request, buffer)?;
        Ok(request)
    }

    /// Connect the completion callback, start the device and queue every
    /// bound request.
    ///
    /// A request that fails to queue is logged and left out. Returns the number
    /// of requests queued.
    pub fn start(&mut self) -> Result<usize> {
        self.expect_state(SessionState::BuffersBound, "start")?;
        let callback = self.dispatcher.callback();
        let camera = self
            .camera
            .as_mut()
            .ok_or(CameraError::InvalidState {
                operation: "start",
                state: self.state,
            })?;

        camera.connect(callback);
        camera.start()?;
        self.state = SessionState::Running;

        for request in &self.requests {
            if self.queued.contains(&request.id) {
                warn!(request = %request.id, "request already queued");
                continue;
            }
            match camera.queue_request(request) {
                Ok(()) => {
                    self.queued.insert(request.id);
                }
                Err(err) => error!(request = %request.id, error = %err, "failed to queue request"),
            }
        }

        info!(queued = self.queued.len(), "camera started");
        Ok(self.queued.len())
    }

    /// Disconnect the completion callback, halt the device, release it and
    /// stop the manager.
    ///
    /// Every step is best-effort. Safe to call from any state, and a second
    /// call does nothing.
    pub fn stop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }

        if let Some(mut camera) = self.camera.take() {
            camera.disconnect();

            if self.state == SessionState::Running {
                let halted = self.dispatcher.halt_with(|| camera.stop());
                if let Err(err) = halted {
                    error!(error = %err, "failed to stop camera");
                }
            } else {
                self.dispatcher.halt_with(|| ());
            }

            if let Err(err) = camera.release() {
                error!(error = %err, "failed to release camera");
            }
            info!(camera = camera.id(), "camera released");
        }

        if self.manager_started {
            self.manager.stop();
            self.manager_started = false;
        }

        self.queued.clear();
        self.state = SessionState::Stopped;
    }

    /// Release every buffer mapping.
    pub fn release_mappings(&mut self) -> UnmapReport {
        self.mapper.unmap_all()
    }
}
