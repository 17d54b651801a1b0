//! The per-buffer descriptor shared across processes.
//!
//! A [`BufferHandle`] is created by the allocator, passed by value to
//! consumer processes, and registered in each of them before use. Which
//! memory backend sits behind it is fixed at allocation time and expressed
//! as one [`Backing`] variant carrying exactly the fields that backend
//! needs.

use crate::error::{Error, Result};
use crate::memory::{IonClient, MemHandle, SecureId};
use crate::usage::{LockState, Usage};
use std::os::unix::io::RawFd;

/// Magic value stamped into every valid handle.
pub const HANDLE_MAGIC: u32 = 0x0314_1592;

/// Memory backend of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Display framebuffer, mapped by the display subsystem.
    Framebuffer,
    /// Window of the reserved physically-contiguous region, reached through
    /// the shared device node.
    ReservedRegion {
        /// Descriptor the allocator exported for the buffer.
        fd: RawFd,
        /// Byte offset of the buffer inside its mapping window.
        offset: usize,
        /// Physical address of the buffer.
        paddr: u64,
    },
    /// Secure-id shared memory.
    SharedMemory {
        /// Cross-process identifier.
        secure_id: SecureId,
        /// Reference held by the registering process.
        mem_handle: Option<MemHandle>,
    },
    /// Shared-memory client buffer, also published under a secure id.
    Ion {
        /// Buffer descriptor. Borrowed, never closed, by register and unlock.
        fd: RawFd,
        /// Byte offset of the buffer inside the mapping.
        offset: usize,
        /// Cross-process identifier.
        secure_id: SecureId,
        /// Client context created while mapping.
        client: Option<IonClient>,
        /// Secure-id reference held by the registering process.
        mem_handle: Option<MemHandle>,
    },
    /// Plain mappable descriptor.
    GenericFd {
        /// Buffer descriptor. Borrowed, never closed, by register.
        fd: RawFd,
        /// Byte offset of the buffer inside the descriptor.
        offset: usize,
        /// Descriptor is directly backed and cannot be registered.
        direct: bool,
    },
}

impl Backing {
    /// Short backend name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Backing::Framebuffer => "framebuffer",
            Backing::ReservedRegion { .. } => "reserved-region",
            Backing::SharedMemory { .. } => "shared-memory",
            Backing::Ion { .. } => "ion",
            Backing::GenericFd { .. } => "generic-fd",
        }
    }

    /// Secure id, for backings that publish one.
    pub fn secure_id(&self) -> Option<SecureId> {
        match self {
            Backing::SharedMemory { secure_id, .. } | Backing::Ion { secure_id, .. } => {
                Some(*secure_id)
            }
            _ => None,
        }
    }

    /// Buffer descriptor, for fd-based backings.
    pub fn fd(&self) -> Option<RawFd> {
        match self {
            Backing::ReservedRegion { fd, .. }
            | Backing::Ion { fd, .. }
            | Backing::GenericFd { fd, .. } => Some(*fd),
            _ => None,
        }
    }

    /// In-buffer byte offset.
    pub fn offset(&self) -> usize {
        match self {
            Backing::ReservedRegion { offset, .. }
            | Backing::Ion { offset, .. }
            | Backing::GenericFd { offset, .. } => *offset,
            _ => 0,
        }
    }
}

/// How widely a buffer is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Sharing {
    /// Used by one consumer at a time.
    #[default]
    Process,
    /// Graphics buffer in flight between producer and consumer processes;
    /// unregistration is deferred.
    GraphicBuffer,
}

/// Buffer descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    /// Must equal [`HANDLE_MAGIC`].
    pub magic: u32,
    /// Memory backend.
    pub backing: Backing,
    /// Cross-process sharing mode.
    pub sharing: Sharing,
    /// Total size in bytes.
    pub size: usize,
    /// Base address in the owning process, 0 when not mapped.
    pub base: usize,
    /// Lock state bits.
    pub lock_state: LockState,
    /// Process holding the write lock.
    pub write_owner: u32,
    /// Process that registered (and may unmap) the handle.
    pub pid: u32,
    /// Pixel format code.
    pub format: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel.
    pub bpp: u32,
    /// Row stride in bytes.
    pub stride: u32,
    /// Usage the buffer was allocated with.
    pub usage: Usage,
    /// Producer usage (adapter API).
    pub producer_usage: u64,
    /// Consumer usage (adapter API).
    pub consumer_usage: u64,
    /// Offset from luma to the first chroma plane.
    pub uoffset: usize,
    /// Offset from the first to the second chroma plane.
    pub voffset: usize,
    /// Backing-store identifier.
    pub backing_store: u64,
}

impl BufferHandle {
    /// A fresh, unregistered handle.
    pub fn new(backing: Backing, size: usize) -> Self {
        Self {
            magic: HANDLE_MAGIC,
            backing,
            sharing: Sharing::Process,
            size,
            base: 0,
            lock_state: LockState::empty(),
            write_owner: 0,
            pid: 0,
            format: 0,
            width: 0,
            height: 0,
            bpp: 0,
            stride: 0,
            usage: Usage::empty(),
            producer_usage: 0,
            consumer_usage: 0,
            uoffset: 0,
            voffset: 0,
            backing_store: 0,
        }
    }

    /// Framebuffer handle already mapped at `base` by the display.
    pub fn framebuffer(base: usize, size: usize) -> Self {
        Self {
            base,
            ..Self::new(Backing::Framebuffer, size)
        }
    }

    /// Secure-id shared-memory handle.
    pub fn shared_memory(secure_id: SecureId, size: usize) -> Self {
        Self::new(
            Backing::SharedMemory {
                secure_id,
                mem_handle: None,
            },
            size,
        )
    }

    /// Reserved-region handle.
    pub fn reserved_region(fd: RawFd, paddr: u64, offset: usize, size: usize) -> Self {
        Self::new(Backing::ReservedRegion { fd, offset, paddr }, size)
    }

    /// Shared-memory client handle.
    ///
    /// `fd` must stay open, and refer to the same buffer, for as long as the
    /// handle is registered or locked. Registration and unlock borrow it
    /// without taking ownership.
    pub fn ion(fd: RawFd, secure_id: SecureId, offset: usize, size: usize) -> Self {
        Self::new(
            Backing::Ion {
                fd,
                offset,
                secure_id,
                client: None,
                mem_handle: None,
            },
            size,
        )
    }

    /// Plain descriptor handle.
    ///
    /// `fd` must stay open until registration has mapped it. The mapping
    /// does not depend on it afterwards.
    pub fn generic_fd(fd: RawFd, offset: usize, size: usize) -> Self {
        Self::new(
            Backing::GenericFd {
                fd,
                offset,
                direct: false,
            },
            size,
        )
    }

    /// Set width, height, row stride (bytes) and pixel format.
    pub fn with_geometry(mut self, width: u32, height: u32, stride: u32, format: i32) -> Self {
        self.width = width;
        self.height = height;
        self.stride = stride;
        self.format = format;
        self
    }

    /// Set chroma plane offsets.
    pub fn with_planes(mut self, uoffset: usize, voffset: usize) -> Self {
        self.uoffset = uoffset;
        self.voffset = voffset;
        self
    }

    /// Set the sharing mode.
    pub fn with_sharing(mut self, sharing: Sharing) -> Self {
        self.sharing = sharing;
        self
    }

    /// Set the allocation usage.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Set the backing-store identifier.
    pub fn with_backing_store(mut self, backing_store: u64) -> Self {
        self.backing_store = backing_store;
        self
    }

    /// Structural validation.
    pub fn validate(&self) -> Result<()> {
        if self.magic != HANDLE_MAGIC {
            return Err(Error::InvalidHandle(format!(
                "bad magic: expected {:#x}, got {:#x}",
                HANDLE_MAGIC, self.magic
            )));
        }
        if let Some(fd) = self.backing.fd() {
            if fd < 0 {
                return Err(Error::InvalidHandle(format!(
                    "{} handle carries invalid fd {fd}",
                    self.backing.name()
                )));
            }
        }
        if let Backing::ReservedRegion { offset, paddr, .. } = self.backing {
            if (offset as u64) > paddr {
                return Err(Error::InvalidHandle(format!(
                    "offset {offset:#x} exceeds physical address {paddr:#x}"
                )));
            }
        }
        Ok(())
    }

    /// True while mapped in the owning process.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.base != 0
    }

    /// Secure id, if the backing publishes one.
    #[inline]
    pub fn secure_id(&self) -> Option<SecureId> {
        self.backing.secure_id()
    }

    /// Identity under which lock rectangles are tracked.
    ///
    /// Only secure-id shared-memory buffers are flushed by rectangle.
    pub fn tracked_id(&self) -> Option<SecureId> {
        match self.backing {
            Backing::SharedMemory { secure_id, .. } => Some(secure_id),
            _ => None,
        }
    }

    /// Physical addresses of the luma and chroma planes.
    ///
    /// Only reserved-region buffers have a physical address.
    pub fn physical_planes(&self) -> Option<[u64; 3]> {
        match self.backing {
            Backing::ReservedRegion { paddr, .. } => {
                let u = paddr + self.uoffset as u64;
                Some([paddr, u, u + self.voffset as u64])
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_handle_is_unmapped() {
        let handle = BufferHandle::shared_memory(42, 4096);
        assert!(handle.validate().is_ok());
        assert!(!handle.is_mapped());
        assert_eq!(handle.secure_id(), Some(42));
        assert_eq!(handle.tracked_id(), Some(42));
        assert_eq!(handle.lock_state, LockState::empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut handle = BufferHandle::generic_fd(3, 0, 4096);
        handle.magic = 0xdead_beef;
        assert!(matches!(handle.validate(), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_negative_fd_rejected() {
        let handle = BufferHandle::ion(-1, 7, 0, 4096);
        assert!(matches!(handle.validate(), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_offset_beyond_paddr_rejected() {
        let handle = BufferHandle::reserved_region(3, 0x100, 0x200, 4096);
        assert!(handle.validate().is_err());
    }

    #[test]
    fn test_ion_is_not_rect_tracked() {
        let handle = BufferHandle::ion(5, 9, 0, 4096);
        assert_eq!(handle.secure_id(), Some(9));
        assert_eq!(handle.tracked_id(), None);
    }

    #[test]
    fn test_physical_planes() {
        let handle = BufferHandle::reserved_region(3, 0x4000_0000, 0x1000, 0x3000)
            .with_planes(0x1000, 0x400);
        assert_eq!(
            handle.physical_planes(),
            Some([0x4000_0000, 0x4000_1000, 0x4000_1400])
        );
        assert_eq!(BufferHandle::shared_memory(1, 16).physical_planes(), None);
    }

    #[test]
    fn test_clone_is_independent() {
        let original = BufferHandle::shared_memory(3, 4096).with_sharing(Sharing::GraphicBuffer);
        let mut copy = original.clone();
        copy.base = 0x1000;
        assert_eq!(original.base, 0);
        assert_eq!(copy.sharing, Sharing::GraphicBuffer);
    }
}
