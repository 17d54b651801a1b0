//! Shared-memory client backend (ION-like).
//!
//! Buffers are plain dma-buf style file descriptors. Mapping goes through a
//! per-buffer client context, and cache maintenance is a two-way
//! device/CPU sync over `(size, offset)`.

use bitflags::bitflags;
use rustix::fd::BorrowedFd;
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use std::collections::HashSet;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Client context handed out by an [`IonDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IonClient(u32);

impl IonClient {
    /// Wrap a raw client value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw client value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Direction flags for [`IonDriver::sync`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IonSyncFlags: u32 {
        /// Device wrote, CPU will write.
        const DEV_TO_WRITE = 0x0000_0001;
        /// Device and CPU both read and write.
        const DEV_TO_RW = 0x0000_0002;
        /// Make CPU writes visible to the device.
        const SYNC_FOR_DEV = 0x0001_0000;
        /// Make device writes visible to the CPU.
        const SYNC_FOR_CPU = 0x0002_0000;
    }
}

/// Capability surface of the shared-memory client.
pub trait IonDriver: Send + Sync {
    /// Create a client context.
    fn create_client(&self) -> Result<IonClient, Errno>;

    /// Destroy a client context.
    fn destroy_client(&self, client: IonClient);

    /// Map `size` bytes of `fd` starting at `offset`.
    fn map(&self, fd: BorrowedFd<'_>, size: usize, offset: u64) -> Result<NonNull<u8>, Errno>;

    /// Unmap a region returned by [`map`](Self::map).
    fn unmap(&self, addr: NonNull<u8>, size: usize) -> Result<(), Errno>;

    /// Synchronize `size` bytes at `offset` of `fd` between device and CPU.
    fn sync(
        &self,
        client: IonClient,
        fd: BorrowedFd<'_>,
        flags: IonSyncFlags,
        size: usize,
        offset: usize,
    ) -> Result<(), Errno>;
}

/// One sync request observed by [`EmulatedIon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IonSyncRecord {
    /// Client the sync was issued through.
    pub client: IonClient,
    /// Buffer fd.
    pub fd: RawFd,
    /// Direction flags.
    pub flags: IonSyncFlags,
    /// Length in bytes.
    pub size: usize,
    /// Offset into the buffer.
    pub offset: usize,
}

#[derive(Default)]
struct IonState {
    next_client: u32,
    clients: HashSet<IonClient>,
    mappings: usize,
    syncs: Vec<IonSyncRecord>,
}

/// Client implementation that maps descriptors directly with `mmap`.
///
/// Sync requests are validated against live clients and recorded.
#[derive(Default)]
pub struct EmulatedIon {
    state: Mutex<IonState>,
}

impl EmulatedIon {
    /// Create a driver with no clients.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, IonState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clients created and not yet destroyed.
    pub fn live_clients(&self) -> usize {
        self.state().clients.len()
    }

    /// Mappings created and not yet unmapped.
    pub fn live_mappings(&self) -> usize {
        self.state().mappings
    }

    /// Sync requests recorded so far.
    pub fn syncs(&self) -> Vec<IonSyncRecord> {
        self.state().syncs.clone()
    }
}

impl IonDriver for EmulatedIon {
    fn create_client(&self) -> Result<IonClient, Errno> {
        let mut state = self.state();
        state.next_client += 1;
        let client = IonClient(state.next_client);
        state.clients.insert(client);
        Ok(client)
    }

    fn destroy_client(&self, client: IonClient) {
        if !self.state().clients.remove(&client) {
            tracing::warn!(client = client.raw(), "destroying unknown client");
        }
    }

    fn map(&self, fd: BorrowedFd<'_>, size: usize, offset: u64) -> Result<NonNull<u8>, Errno> {
        // SAFETY: a fresh mapping at a kernel-chosen address aliases no
        // existing Rust memory.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                offset,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(Errno::NOMEM)?;
        self.state().mappings += 1;
        Ok(ptr)
    }

    fn unmap(&self, addr: NonNull<u8>, size: usize) -> Result<(), Errno> {
        // SAFETY: callers pass back an address and size returned by `map`.
        unsafe { rustix::mm::munmap(addr.as_ptr().cast(), size)? };
        let mut state = self.state();
        state.mappings = state.mappings.saturating_sub(1);
        Ok(())
    }

    fn sync(
        &self,
        client: IonClient,
        fd: BorrowedFd<'_>,
        flags: IonSyncFlags,
        size: usize,
        offset: usize,
    ) -> Result<(), Errno> {
        let mut state = self.state();
        if !state.clients.contains(&client) {
            return Err(Errno::BADF);
        }
        state.syncs.push(IonSyncRecord {
            client,
            fd: fd.as_raw_fd(),
            flags,
            size,
            offset,
        });
        Ok(())
    }
}

impl std::fmt::Debug for EmulatedIon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("EmulatedIon")
            .field("clients", &state.clients.len())
            .field("mappings", &state.mappings)
            .finish()
    }
}
