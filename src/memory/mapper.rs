//! Backend-dispatching map/unmap of a handle's memory.
//!
//! | Backing          | Map                                              | Unmap                          |
//! |------------------|--------------------------------------------------|--------------------------------|
//! | framebuffer      | nothing, existing base returned                  | base cleared                   |
//! | reserved region  | fixed window of the device node at `paddr - offset`, base = window + offset | window released |
//! | ion              | client created, `fd` mapped for `size`, base = map + offset | mapping released, client destroyed |
//! | generic fd       | `fd` mapped from 0 for `size + offset`, base = map + offset | same span released |
//!
//! Secure-id shared memory is mapped by the subsystem during registration,
//! not here.
//!
//! The generic-fd path never maps at a nonzero file offset: some allocators
//! reject it, so the whole prefix is mapped and skipped.

use crate::error::{Error, Result};
use crate::handle::{Backing, BufferHandle};
use crate::memory::IonDriver;
use rustix::fd::BorrowedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// What a map or unmap call may need besides the handle.
pub struct MapContext<'a> {
    /// Open reserved-region device node.
    pub device_fd: Option<BorrowedFd<'a>>,
    /// Shared-memory client driver.
    pub ion: &'a dyn IonDriver,
    /// Bytes mapped per reserved-region buffer.
    pub reserved_region_size: usize,
}

/// Map `handle` into this process and store the base address.
pub fn map(handle: &mut BufferHandle, ctx: &MapContext<'_>) -> Result<usize> {
    let size = handle.size;
    match &mut handle.backing {
        Backing::Framebuffer => {}
        Backing::ReservedRegion { fd, offset, paddr } => {
            let device_fd = ctx.device_fd.ok_or_else(|| {
                Error::BackendUnavailable("reserved-region device node is not open".into())
            })?;
            let window = *paddr - *offset as u64;
            // SAFETY: a fresh mapping at a kernel-chosen address aliases no
            // existing Rust memory.
            let ptr = unsafe {
                rustix::mm::mmap(
                    std::ptr::null_mut(),
                    ctx.reserved_region_size,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::SHARED,
                    device_fd,
                    window,
                )
            }
            .map_err(|errno| {
                tracing::error!(fd = *fd, %errno, "could not mmap reserved region");
                Error::MappingFailed {
                    backing: "reserved-region",
                    fd: *fd,
                    source: errno,
                }
            })?;
            handle.base = ptr as usize + *offset;
        }
        Backing::Ion {
            fd, offset, client, ..
        } => {
            let new_client = ctx.ion.create_client().map_err(|errno| {
                Error::BackendUnavailable(format!("could not create ion client: {errno}"))
            })?;
            // SAFETY: `BufferHandle::ion` requires the descriptor to stay
            // open while the handle is registered or locked.
            let buffer_fd = unsafe { BorrowedFd::borrow_raw(*fd) };
            let ptr = match ctx.ion.map(buffer_fd, size, 0) {
                Ok(ptr) => ptr,
                Err(errno) => {
                    tracing::error!(fd = *fd, %errno, "could not ion_map");
                    ctx.ion.destroy_client(new_client);
                    return Err(Error::MappingFailed {
                        backing: "ion",
                        fd: *fd,
                        source: errno,
                    });
                }
            };
            *client = Some(new_client);
            handle.base = ptr.as_ptr() as usize + *offset;
        }
        Backing::GenericFd { fd, offset, .. } => {
            // SAFETY: `BufferHandle::generic_fd` requires the descriptor to
            // stay open until it is mapped here.
            let buffer_fd = unsafe { BorrowedFd::borrow_raw(*fd) };
            // SAFETY: as for the reserved-region window.
            let ptr = unsafe {
                rustix::mm::mmap(
                    std::ptr::null_mut(),
                    size + *offset,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::SHARED,
                    buffer_fd,
                    0,
                )
            }
            .map_err(|errno| {
                tracing::error!(fd = *fd, %errno, "could not mmap");
                Error::MappingFailed {
                    backing: "generic-fd",
                    fd: *fd,
                    source: errno,
                }
            })?;
            handle.base = ptr as usize + *offset;
        }
        Backing::SharedMemory { .. } => {
            return Err(Error::NotSupported(
                "shared-memory buffers are mapped by the subsystem".into(),
            ));
        }
    }
    Ok(handle.base)
}

/// Release the mapping of `handle` and clear its base.
///
/// Failures are logged, never returned: the base is zeroed regardless.
pub fn unmap(handle: &mut BufferHandle, ctx: &MapContext<'_>) {
    let base = handle.base;
    let size = handle.size;
    match &mut handle.backing {
        Backing::Framebuffer | Backing::SharedMemory { .. } => {}
        _ if base == 0 => {}
        Backing::ReservedRegion { offset, .. } => {
            let window = base - *offset;
            // SAFETY: `window` and the region size are exactly what `map`
            // returned, and `base` is zeroed below so it is unmapped once.
            if let Err(errno) =
                unsafe { rustix::mm::munmap(window as *mut _, ctx.reserved_region_size) }
            {
                tracing::error!(%errno, "could not unmap reserved region");
            }
        }
        Backing::Ion { offset, client, .. } => {
            if let Some(addr) = NonNull::new((base - *offset) as *mut u8) {
                if let Err(errno) = ctx.ion.unmap(addr, size) {
                    tracing::error!(%errno, "could not ion_unmap");
                }
            }
            if let Some(client) = client.take() {
                ctx.ion.destroy_client(client);
            }
        }
        Backing::GenericFd { offset, .. } => {
            let start = base - *offset;
            // SAFETY: as for the reserved-region window.
            if let Err(errno) = unsafe { rustix::mm::munmap(start as *mut _, size + *offset) } {
                tracing::error!(%errno, "could not unmap");
            }
        }
    }
    handle.base = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EmulatedIon;
    use rustix::fd::{AsFd, AsRawFd, OwnedFd};

    fn memfd(size: u64) -> OwnedFd {
        let fd = rustix::fs::memfd_create("test_mapper", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, size).unwrap();
        fd
    }

    fn ctx<'a>(ion: &'a EmulatedIon, device_fd: Option<BorrowedFd<'a>>) -> MapContext<'a> {
        MapContext {
            device_fd,
            ion,
            reserved_region_size: 16 * 1024,
        }
    }

    #[test]
    fn test_framebuffer_keeps_base() {
        let ion = EmulatedIon::new();
        let mut handle = BufferHandle::framebuffer(0x7000_0000, 4096);
        assert_eq!(map(&mut handle, &ctx(&ion, None)).unwrap(), 0x7000_0000);
    }

    #[test]
    fn test_generic_fd_maps_from_zero_and_adds_offset() {
        let fd = memfd(8192);
        unsafe {
            let whole = rustix::mm::mmap(
                std::ptr::null_mut(),
                8192,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .unwrap()
            .cast::<u8>();
            *whole.add(4096) = 0xAB;
            rustix::mm::munmap(whole.cast(), 8192).unwrap();
        }

        let ion = EmulatedIon::new();
        let mut handle = BufferHandle::generic_fd(fd.as_raw_fd(), 4096, 4096);
        let base = map(&mut handle, &ctx(&ion, None)).unwrap();
        assert_ne!(base, 0);
        assert_eq!(unsafe { *(base as *const u8) }, 0xAB);

        unmap(&mut handle, &ctx(&ion, None));
        assert_eq!(handle.base, 0);
    }

    #[test]
    fn test_generic_fd_bad_descriptor_is_mapping_failure() {
        let ion = EmulatedIon::new();
        let mut handle = BufferHandle::generic_fd(987_654, 0, 4096);
        let err = map(&mut handle, &ctx(&ion, None)).unwrap_err();
        assert!(matches!(
            err,
            Error::MappingFailed {
                backing: "generic-fd",
                fd: 987_654,
                ..
            }
        ));
        assert_eq!(handle.base, 0);
    }

    #[test]
    fn test_reserved_region_window() {
        let node = memfd(128 * 1024);
        let ion = EmulatedIon::new();
        // Buffer at physical 0x1_2000 sits 0x2000 into a window starting at
        // file offset 0x1_0000.
        let mut handle = BufferHandle::reserved_region(5, 0x1_2000, 0x2000, 0x1000);
        let base = map(&mut handle, &ctx(&ion, Some(node.as_fd()))).unwrap();
        unsafe { *(base as *mut u8) = 0x5A };

        let check = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                128 * 1024,
                ProtFlags::READ,
                MapFlags::SHARED,
                &node,
                0,
            )
            .unwrap()
            .cast::<u8>()
        };
        assert_eq!(unsafe { *check.add(0x1_2000) }, 0x5A);
        unsafe { rustix::mm::munmap(check.cast(), 128 * 1024).unwrap() };

        unmap(&mut handle, &ctx(&ion, Some(node.as_fd())));
        assert_eq!(handle.base, 0);
    }

    #[test]
    fn test_reserved_region_without_node() {
        let ion = EmulatedIon::new();
        let mut handle = BufferHandle::reserved_region(5, 0x1000, 0, 0x1000);
        assert!(matches!(
            map(&mut handle, &ctx(&ion, None)),
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_ion_client_lifecycle() {
        let fd = memfd(4096);
        let ion = EmulatedIon::new();
        let mut handle = BufferHandle::ion(fd.as_raw_fd(), 11, 0, 4096);

        map(&mut handle, &ctx(&ion, None)).unwrap();
        assert_eq!(ion.live_clients(), 1);
        assert_eq!(ion.live_mappings(), 1);

        unmap(&mut handle, &ctx(&ion, None));
        assert_eq!(ion.live_clients(), 0);
        assert_eq!(ion.live_mappings(), 0);
        assert!(matches!(handle.backing, Backing::Ion { client: None, .. }));
    }

    #[test]
    fn test_ion_map_failure_destroys_client() {
        let ion = EmulatedIon::new();
        let mut handle = BufferHandle::ion(987_655, 11, 0, 4096);
        assert!(map(&mut handle, &ctx(&ion, None)).is_err());
        assert_eq!(ion.live_clients(), 0);
    }

    #[test]
    fn test_unmap_clears_base_even_when_unmapped() {
        let ion = EmulatedIon::new();
        let mut handle = BufferHandle::generic_fd(3, 0, 4096);
        unmap(&mut handle, &ctx(&ion, None));
        assert_eq!(handle.base, 0);
    }

    #[test]
    fn test_shared_memory_not_mapped_here() {
        let ion = EmulatedIon::new();
        let mut handle = BufferHandle::shared_memory(1, 4096);
        assert!(matches!(
            map(&mut handle, &ctx(&ion, None)),
            Err(Error::NotSupported(_))
        ));
    }
}
