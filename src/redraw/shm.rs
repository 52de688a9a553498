//! Shared-memory backing store
//!
//! Every drawable is an ARGB8888 buffer in an anonymous `memfd`, mapped into
//! the process with `memmap2`. The descriptor can be handed to the server as
//! is. Zero-sized requests fail.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd};

use log::{trace, warn};
use memmap2::{MmapMut, MmapOptions};

use super::{BufferType, FrameToken, RenderBackend, Size, SurfaceId};
use crate::error::{Result, ToolkitError};

const BYTES_PER_PIXEL: i32 = 4;

/// One mapped ARGB8888 buffer
pub struct ShmBuffer {
    file: File,
    map: MmapMut,
    size: Size,
    stride: i32,
}

impl ShmBuffer {
    fn allocate(surface: SurfaceId, size: Size) -> Result<Self> {
        let unavailable = || ToolkitError::DrawableUnavailable {
            surface,
            width: size.width,
            height: size.height,
        };
        if size.is_empty() {
            return Err(unavailable());
        }

        let stride = size.width.checked_mul(BYTES_PER_PIXEL).ok_or_else(unavailable)?;
        let len = stride.checked_mul(size.height).ok_or_else(unavailable)? as usize;

        let name = CString::new("toykit-shm").map_err(|_| unavailable())?;
        // SAFETY: `name` is a valid C string for the duration of the call.
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            warn!("memfd_create failed: {}", err);
            return Err(unavailable());
        }
        // SAFETY: memfd_create returned a fresh descriptor nobody owns.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(len as u64).map_err(|e| {
            warn!("Could not size a {} byte buffer: {}", len, e);
            unavailable()
        })?;

        // SAFETY: the memfd is private to this buffer and sized above.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(|e| {
            warn!("Could not map a {} byte buffer: {}", len, e);
            unavailable()
        })?;

        Ok(Self {
            file,
            map,
            size,
            stride,
        })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn stride(&self) -> i32 {
        self.stride
    }

    pub fn pixels(&self) -> &[u8] {
        &self.map
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Fills the whole buffer with one ARGB color
    pub fn fill(&mut self, argb: u32) {
        let bytes = argb.to_ne_bytes();
        for pixel in self.map.chunks_exact_mut(BYTES_PER_PIXEL as usize) {
            pixel.copy_from_slice(&bytes);
        }
    }
}

impl fmt::Debug for ShmBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmBuffer")
            .field("size", &self.size)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

impl AsFd for ShmBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Software backend keeping the last committed buffer per surface
#[derive(Default)]
pub struct ShmBackend {
    committed: HashMap<SurfaceId, ShmBuffer>,
    frames: Vec<FrameToken>,
}

impl ShmBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self, surface: SurfaceId) -> Option<&ShmBuffer> {
        self.committed.get(&surface)
    }

    /// Acknowledgments requested since the last call
    pub fn take_frame_requests(&mut self) -> Vec<FrameToken> {
        std::mem::take(&mut self.frames)
    }
}

impl RenderBackend for ShmBackend {
    type Drawable = ShmBuffer;

    fn buffer_type(&self) -> BufferType {
        BufferType::Shm
    }

    fn acquire_drawable(&mut self, surface: SurfaceId, size: Size) -> Result<ShmBuffer> {
        ShmBuffer::allocate(surface, size)
    }

    fn request_frame(&mut self, frame: FrameToken) {
        self.frames.push(frame);
    }

    fn present(&mut self, surface: SurfaceId, drawable: ShmBuffer) -> Size {
        let size = drawable.size;
        trace!("shm buffer {}x{} committed for {:?}", size.width, size.height, surface);
        self.committed.insert(surface, drawable);
        size
    }
}
