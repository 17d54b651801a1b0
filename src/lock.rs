//! CPU lock/unlock and cache maintenance.
//!
//! `lock` hands out the mapped address (or the three plane addresses of a
//! planar buffer) and, for secure-id shared memory, records the locked
//! rectangle. `unlock` makes CPU writes visible to hardware:
//!
//! - shared memory: clean the recorded rows, or clean and invalidate the
//!   whole mapping when no rectangle is known or partial flush is off
//! - ion: two-way device/CPU sync over the whole buffer
//! - reserved region: physical-range flush on the device node

use crate::error::{Error, Result};
use crate::handle::{Backing, BufferHandle};
use crate::memory::{IonSyncFlags, SyncOp, SyncRange, flush_range};
use crate::observability::{instrument_buffer, trace_cache_sync};
use crate::registry::Registry;
use crate::usage::{LockState, Usage};
use rustix::fd::{AsFd, BorrowedFd};

/// Sub-rectangle of a buffer, in pixels and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    /// Left edge.
    pub left: u32,
    /// Top row.
    pub top: u32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

impl Rect {
    /// A rectangle at (`left`, `top`) of `width` x `height`.
    pub const fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// Address handed out by a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockedAddress {
    /// Base of the mapping.
    Base(usize),
    /// Luma, first chroma and second chroma plane addresses.
    Planes([usize; 3]),
}

impl LockedAddress {
    /// Address of the first (or only) plane.
    pub fn base(&self) -> usize {
        match self {
            LockedAddress::Base(base) => *base,
            LockedAddress::Planes(planes) => planes[0],
        }
    }
}

/// Lock `handle` for the CPU access in `usage`.
///
/// Returns `None` when `usage` asks for neither CPU access nor plane
/// addresses.
pub fn lock(
    registry: &Registry,
    handle: &mut BufferHandle,
    usage: Usage,
    rect: Rect,
) -> Result<Option<LockedAddress>> {
    handle.validate()?;
    let _span = instrument_buffer("lock", handle);

    if let Some(id) = handle.tracked_id() {
        let stride = handle.stride;
        let updated = registry.tracker().update_first(id, |r| {
            r.left = rect.left;
            r.top = rect.top;
            r.width = rect.width;
            r.height = rect.height;
            r.stride = stride;
            r.locked = true;
        });
        if !updated {
            tracing::warn!(secure_id = id, "no dirty rect for locked buffer");
        }
    }

    if usage.wants_cpu_write() {
        handle.lock_state |= LockState::WRITE;
        handle.write_owner = registry.pid();
    } else if usage.intersects(Usage::SW_READ_MASK) {
        let readers = handle.lock_state.readers().saturating_add(1);
        handle.lock_state = handle.lock_state.with_readers(readers);
    }

    let base = handle.base;
    if usage.wants_planes() {
        let u = base + handle.uoffset;
        return Ok(Some(LockedAddress::Planes([base, u, u + handle.voffset])));
    }
    if usage.wants_cpu_access() {
        return Ok(Some(LockedAddress::Base(base)));
    }
    Ok(None)
}

/// Unlock `handle` and push CPU writes out to memory.
pub fn unlock(registry: &Registry, handle: &mut BufferHandle) -> Result<()> {
    handle.validate()?;
    let _span = instrument_buffer("unlock", handle);

    if handle.lock_state.contains(LockState::WRITE) {
        handle.lock_state -= LockState::WRITE;
        handle.write_owner = 0;
    } else if handle.lock_state.readers() > 0 {
        let readers = handle.lock_state.readers() - 1;
        handle.lock_state = handle.lock_state.with_readers(readers);
    }

    match handle.backing {
        Backing::SharedMemory {
            secure_id,
            mem_handle,
        } => {
            let mem_handle = mem_handle.ok_or_else(|| {
                Error::InvalidHandle(format!("secure id {secure_id} is not registered"))
            })?;
            let rect = registry.tracker().find(secure_id);
            match rect {
                Some(rect) if registry.config().partial_flush => {
                    let range = SyncRange {
                        addr: handle.base + rect.byte_offset(),
                        len: rect.byte_len(),
                    };
                    registry
                        .subsystem()
                        .cpu_sync(mem_handle, SyncOp::Clean, Some(range));
                    trace_cache_sync(handle, "clean", range.addr, range.len);
                }
                _ => {
                    if rect.is_none() {
                        tracing::warn!(secure_id, "no dirty rect, flushing whole buffer");
                    }
                    registry
                        .subsystem()
                        .cpu_sync(mem_handle, SyncOp::CleanAndInvalidate, None);
                    trace_cache_sync(handle, "clean-invalidate", handle.base, handle.size);
                }
            }
        }
        Backing::Ion { fd, offset, client, .. } => {
            let client = client.ok_or_else(|| {
                Error::InvalidHandle("ion buffer is not registered".into())
            })?;
            // SAFETY: `BufferHandle::ion` requires the descriptor to stay open
            // while the handle is registered or locked.
            let buffer_fd = unsafe { BorrowedFd::borrow_raw(fd) };
            registry
                .ion()
                .sync(
                    client,
                    buffer_fd,
                    IonSyncFlags::DEV_TO_RW | IonSyncFlags::SYNC_FOR_DEV,
                    handle.size,
                    offset,
                )
                .map_err(|errno| {
                    tracing::error!(fd, %errno, "ion sync failed");
                    Error::FlushFailed(format!("ion sync of fd {fd}: {errno}"))
                })?;
            trace_cache_sync(handle, "ion-sync", offset, handle.size);
        }
        Backing::ReservedRegion { paddr, .. } => {
            let device_fd = registry.device_fd().ok_or_else(|| {
                tracing::error!(paddr, "no device node for physical flush");
                Error::FlushFailed("reserved-region device node is not open".into())
            })?;
            flush_range(device_fd.as_fd(), paddr, handle.size)?;
            trace_cache_sync(handle, "physical", paddr as usize, handle.size);
        }
        Backing::Framebuffer | Backing::GenericFd { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory::{EmulatedIon, EmulatedSubsystem, SyncRecord};
    use rustix::fd::{AsRawFd, OwnedFd};
    use std::sync::Arc;

    fn setup(config: Config) -> (Arc<EmulatedSubsystem>, Arc<EmulatedIon>, Registry) {
        let ump = Arc::new(EmulatedSubsystem::new());
        let ion = Arc::new(EmulatedIon::new());
        let registry = Registry::new(config, ump.clone(), ion.clone());
        (ump, ion, registry)
    }

    fn registered(registry: &Registry, ump: &EmulatedSubsystem, id: u32) -> BufferHandle {
        ump.allocate_with_id(id, 64 * 1024).unwrap();
        let mut handle = BufferHandle::shared_memory(id, 64 * 1024).with_geometry(64, 64, 256, 1);
        registry.register(&mut handle).unwrap();
        handle
    }

    #[test]
    fn test_read_lock_returns_base_and_records_rect() {
        let (ump, _ion, registry) = setup(Config::default());
        let mut handle = registered(&registry, &ump, 42);

        let addr = lock(&registry, &mut handle, Usage::SW_READ_OFTEN, Rect::new(0, 0, 64, 64))
            .unwrap();
        assert_eq!(addr, Some(LockedAddress::Base(handle.base)));
        assert_eq!(handle.lock_state.readers(), 1);

        let rect = registry.tracker().find(42).unwrap();
        assert!(rect.locked);
        assert_eq!((rect.left, rect.top, rect.width, rect.height), (0, 0, 64, 64));
    }

    #[test]
    fn test_unlock_cleans_locked_rows() {
        let (ump, _ion, registry) = setup(Config::default());
        let mut handle = registered(&registry, &ump, 42);

        lock(&registry, &mut handle, Usage::SW_WRITE_OFTEN, Rect::new(0, 4, 64, 8)).unwrap();
        assert!(handle.lock_state.contains(LockState::WRITE));
        assert_eq!(handle.write_owner, registry.pid());

        unlock(&registry, &mut handle).unwrap();
        assert!(!handle.lock_state.is_locked());
        let syncs = ump.syncs();
        assert_eq!(syncs.len(), 1);
        let SyncRecord { op, range, .. } = syncs[0];
        assert_eq!(op, SyncOp::Clean);
        let range = range.unwrap();
        assert_eq!(range.addr, handle.base + 4 * 256);
        assert_eq!(range.len, 8 * 256);
    }

    #[test]
    fn test_unlock_without_rect_falls_back_to_full_clean() {
        let (ump, _ion, registry) = setup(Config::default());
        let mut handle = registered(&registry, &ump, 46);
        assert!(registry.tracker().release(46));

        unlock(&registry, &mut handle).unwrap();
        let syncs = ump.syncs();
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].op, SyncOp::CleanAndInvalidate);
        assert_eq!(syncs[0].range, None);
    }

    #[test]
    fn test_unlock_without_partial_flush_cleans_everything() {
        let (ump, _ion, registry) = setup(Config::default().with_partial_flush(false));
        let mut handle = registered(&registry, &ump, 43);

        lock(&registry, &mut handle, Usage::SW_WRITE_RARELY, Rect::new(0, 0, 8, 8)).unwrap();
        unlock(&registry, &mut handle).unwrap();
        let syncs = ump.syncs();
        assert_eq!(syncs[0].op, SyncOp::CleanAndInvalidate);
        assert_eq!(syncs[0].range, None);
    }

    #[test]
    fn test_planar_lock() {
        let (ump, _ion, registry) = setup(Config::default());
        let mut handle = registered(&registry, &ump, 44);
        handle.uoffset = 0x1000;
        handle.voffset = 0x400;

        let addr = lock(
            &registry,
            &mut handle,
            Usage::SW_READ_RARELY | Usage::YUV_ADDR,
            Rect::new(0, 0, 64, 64),
        )
        .unwrap();
        let base = handle.base;
        assert_eq!(
            addr,
            Some(LockedAddress::Planes([base, base + 0x1000, base + 0x1400]))
        );
    }

    #[test]
    fn test_hardware_only_lock_has_no_address() {
        let (ump, _ion, registry) = setup(Config::default());
        let mut handle = registered(&registry, &ump, 45);
        let addr = lock(&registry, &mut handle, Usage::HW_TEXTURE, Rect::default()).unwrap();
        assert_eq!(addr, None);
        assert!(!handle.lock_state.is_locked());
    }

    #[test]
    fn test_unlock_unregistered_shared_memory() {
        let (_ump, _ion, registry) = setup(Config::default());
        let mut handle = BufferHandle::shared_memory(1, 4096);
        assert!(matches!(
            unlock(&registry, &mut handle),
            Err(Error::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_ion_unlock_syncs_whole_buffer() {
        let (ump, ion, registry) = setup(Config::default());
        let fd: OwnedFd =
            rustix::fs::memfd_create("test_lock", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, 8192).unwrap();
        ump.allocate_with_id(50, 8192).unwrap();
        let mut handle = BufferHandle::ion(fd.as_raw_fd(), 50, 0, 8192);
        registry.register(&mut handle).unwrap();

        unlock(&registry, &mut handle).unwrap();
        let syncs = ion.syncs();
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].flags, IonSyncFlags::DEV_TO_RW | IonSyncFlags::SYNC_FOR_DEV);
        assert_eq!(syncs[0].size, 8192);
        assert_eq!(syncs[0].fd, fd.as_raw_fd());

        registry.unregister(&mut handle).unwrap();
    }

    #[test]
    fn test_reserved_region_unlock_without_node() {
        let (_ump, _ion, registry) = setup(Config::default());
        let mut handle = BufferHandle::reserved_region(3, 0x4000_0000, 0, 4096);
        assert!(matches!(
            unlock(&registry, &mut handle),
            Err(Error::FlushFailed(_))
        ));
    }

    #[test]
    fn test_generic_fd_unlock_is_noop() {
        let (_ump, _ion, registry) = setup(Config::default());
        let mut handle = BufferHandle::generic_fd(3, 0, 4096);
        handle.lock_state = LockState::WRITE;
        unlock(&registry, &mut handle).unwrap();
        assert!(!handle.lock_state.is_locked());
    }
}
