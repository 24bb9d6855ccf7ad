//! Memory-mapping of device frame buffers.
//!
//! [`BufferMapper`] owns the table of live mappings. Every buffer is mapped at
//! most once during setup and released exactly once by [`BufferMapper::unmap_all`].

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use tracing::{debug, error};

use crate::traits::{BufferId, CameraError, FrameBuffer, Plane, Result};

/// Map/unmap primitive used by [`BufferMapper`].
pub trait MemoryMap {
    /// Map `length` bytes of `fd` read-only and shared. Returns the address.
    fn map(&mut self, fd: RawFd, length: usize) -> io::Result<usize>;

    /// Release a mapping returned by [`MemoryMap::map`].
    fn unmap(&mut self, address: usize, length: usize) -> io::Result<()>;
}

/// [`MemoryMap`] backed by the `mmap`/`munmap` system calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMapper;

#[allow(unsafe_code)]
impl MemoryMap for SystemMapper {
    fn map(&mut self, fd: RawFd, length: usize) -> io::Result<usize> {
        // SAFETY: a fresh shared read-only mapping chosen by the kernel; no
        // existing memory is aliased.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr as usize)
    }

    fn unmap(&mut self, address: usize, length: usize) -> io::Result<()> {
        // SAFETY: `address`/`length` come from a successful `map` and the table
        // hands each pair out for release only once.
        let ret = unsafe { libc::munmap(address as *mut libc::c_void, length) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// A live mapping of one frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    /// Start address of the mapping.
    pub address: usize,
    /// Mapped length in bytes.
    pub length: usize,
}

/// Outcome of [`BufferMapper::unmap_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnmapReport {
    /// Mappings released successfully.
    pub released: usize,
    /// Mappings whose release failed.
    pub failed: usize,
}

/// Check the plane invariants of a buffer.
///
/// All planes must have a real offset and share one valid file descriptor.
/// Returns that descriptor and the length to map, `max(offset + length)`.
pub fn plane_layout(buffer: &FrameBuffer) -> Result<(RawFd, usize)> {
    let invalid = |reason: &str| CameraError::InvalidPlaneLayout {
        buffer: buffer.id,
        reason: reason.to_owned(),
    };

    let mut fd = None;
    let mut length = 0usize;
    for plane in &buffer.planes {
        if plane.offset == Plane::INVALID_OFFSET {
            return Err(invalid("invalid offset"));
        }
        if plane.fd < 0 {
            return Err(invalid("file descriptor is not valid"));
        }
        match fd {
            None => fd = Some(plane.fd),
            Some(first) if first != plane.fd => {
                return Err(invalid("plane file descriptors differ"));
            }
            Some(_) => {}
        }
        let end = u64::from(plane.offset) + u64::from(plane.length);
        let end = usize::try_from(end).map_err(|_| invalid("plane end overflows"))?;
        length = length.max(end);
    }

    let fd = fd.ok_or_else(|| invalid("buffer has no planes"))?;
    if length == 0 {
        return Err(invalid("buffer is empty"));
    }
    Ok((fd, length))
}

/// Tracks the mapping of every frame buffer for later release.
#[derive(Debug)]
pub struct BufferMapper<M> {
    mapper: M,
    regions: HashMap<BufferId, MappedRegion>,
}

impl<M: MemoryMap> BufferMapper<M> {
    /// Create an empty mapper.
    pub fn new(mapper: M) -> Self {
        Self {
            mapper,
            regions: HashMap::new(),
        }
    }

    /// Map a buffer and record the mapping.
    pub fn map(&mut self, buffer: &FrameBuffer) -> Result<MappedRegion> {
        if self.regions.contains_key(&buffer.id) {
            return Err(CameraError::AlreadyMapped(buffer.id));
        }

        let (fd, length) = plane_layout(buffer)?;
        let address = self
            .mapper
            .map(fd, length)
            .map_err(CameraError::MapFailed)?;

        let region = MappedRegion { address, length };
        self.regions.insert(buffer.id, region);
        debug!(buffer = %buffer.id, fd, length, "mapped frame buffer");
        Ok(region)
    }

    /// Mapping recorded for a buffer.
    pub fn region(&self, id: BufferId) -> Option<MappedRegion> {
        self.regions.get(&id).copied()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether no mapping is live.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The underlying map/unmap primitive.
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Release every recorded mapping.
    ///
    /// A failed unmap is logged and does not stop the remaining releases. The
    /// table is drained either way, so a second call does nothing.
    pub fn unmap_all(&mut self) -> UnmapReport {
        let mut report = UnmapReport::default();
        let mut regions: Vec<_> = self.regions.drain().collect();
        regions.sort_by_key(|(id, _)| *id);

        for (id, region) in regions {
            match self.mapper.unmap(region.address, region.length) {
                Ok(()) => {
                    debug!(buffer = %id, length = region.length, "unmapped frame buffer");
                    report.released += 1;
                }
                Err(err) => {
                    error!(buffer = %id, error = %err, "munmap failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
