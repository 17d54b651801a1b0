//! Secure-id shared-memory subsystem (UMP-like).
//!
//! A buffer allocated through the subsystem is identified across processes
//! by its [`SecureId`]. Each process that wants to touch the memory creates
//! its own reference from the id, maps it, and releases both when done. The
//! kernel side keeps the allocation alive while any reference exists.

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::collections::HashMap;
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Opaque cross-process identifier of a shared-memory allocation.
pub type SecureId = u32;

/// Process-local reference to a subsystem allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemHandle(u64);

impl MemHandle {
    /// Wrap a raw reference value handed out by a subsystem.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw reference value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// CPU cache maintenance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOp {
    /// Write dirty CPU cache lines back to memory.
    Clean,
    /// Write back, then drop cached lines.
    CleanAndInvalidate,
}

/// Byte range a cache operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncRange {
    /// Start address in this process.
    pub addr: usize,
    /// Length in bytes.
    pub len: usize,
}

impl SyncRange {
    /// Exclusive end address.
    pub fn end(&self) -> usize {
        self.addr + self.len
    }
}

/// Capability surface of the secure-id subsystem.
///
/// Implementations must be callable from any thread. `open` is invoked at
/// most once per [`Gralloc`](crate::Gralloc) context.
pub trait SharedMemorySubsystem: Send + Sync {
    /// Open the subsystem for this process.
    fn open(&self) -> Result<()>;

    /// Create a local reference from a secure id.
    fn create_from_secure_id(&self, id: SecureId) -> Option<MemHandle>;

    /// Map the referenced memory, returning its base address.
    fn mapped_pointer(&self, handle: MemHandle) -> Option<NonNull<u8>>;

    /// Drop the mapping obtained through [`mapped_pointer`](Self::mapped_pointer).
    fn release_mapped_pointer(&self, handle: MemHandle);

    /// Drop the reference.
    fn release_reference(&self, handle: MemHandle);

    /// Run a cache operation over `range`, or over the whole allocation when
    /// `range` is `None`.
    fn cpu_sync(&self, handle: MemHandle, op: SyncOp, range: Option<SyncRange>);
}

/// One cache operation observed by [`EmulatedSubsystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRecord {
    /// Reference the operation was issued on.
    pub handle: MemHandle,
    /// Allocation behind the reference.
    pub secure_id: SecureId,
    /// Operation.
    pub op: SyncOp,
    /// Range, `None` for whole-allocation operations.
    pub range: Option<SyncRange>,
}

struct Allocation {
    fd: OwnedFd,
    size: usize,
}

struct Reference {
    secure_id: SecureId,
    mapping: Option<usize>,
}

struct EmulatedState {
    opens: usize,
    next_id: SecureId,
    next_handle: u64,
    allocations: HashMap<SecureId, Allocation>,
    references: HashMap<MemHandle, Reference>,
    syncs: Vec<SyncRecord>,
}

/// Subsystem implementation backed by memfd allocations.
///
/// Every allocation is a memfd keyed by secure id; each reference gets its
/// own `MAP_SHARED` mapping, so two references to the same id see the same
/// pages. Cache operations are recorded rather than executed.
pub struct EmulatedSubsystem {
    available: bool,
    state: Mutex<EmulatedState>,
}

impl EmulatedSubsystem {
    /// Create an empty subsystem.
    pub fn new() -> Self {
        Self {
            available: true,
            state: Mutex::new(EmulatedState {
                opens: 0,
                next_id: 1,
                next_handle: 1,
                allocations: HashMap::new(),
                references: HashMap::new(),
                syncs: Vec::new(),
            }),
        }
    }

    /// A subsystem whose `open` always fails.
    pub fn unavailable() -> Self {
        let mut subsystem = Self::new();
        subsystem.available = false;
        subsystem
    }

    fn state(&self) -> MutexGuard<'_, EmulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `size` bytes under a fresh secure id.
    pub fn allocate(&self, size: usize) -> Result<SecureId> {
        let id = {
            let mut state = self.state();
            while state.allocations.contains_key(&state.next_id) {
                state.next_id += 1;
            }
            state.next_id
        };
        self.allocate_with_id(id, size)?;
        Ok(id)
    }

    /// Allocate `size` bytes under a caller-chosen secure id.
    pub fn allocate_with_id(&self, id: SecureId, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("size must be greater than 0".into()));
        }
        let name = CString::new(format!("ump-{id}"))
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&name, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        let mut state = self.state();
        if state.allocations.contains_key(&id) {
            return Err(Error::InvalidArgument(format!("secure id {id} already allocated")));
        }
        state.allocations.insert(id, Allocation { fd, size });
        if state.next_id <= id {
            state.next_id = id + 1;
        }
        Ok(())
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    /// Live references to `id`.
    pub fn live_references(&self, id: SecureId) -> usize {
        self.state()
            .references
            .values()
            .filter(|r| r.secure_id == id)
            .count()
    }

    /// Live mappings across all references.
    pub fn live_mappings(&self) -> usize {
        self.state()
            .references
            .values()
            .filter(|r| r.mapping.is_some())
            .count()
    }

    /// Cache operations recorded so far.
    pub fn syncs(&self) -> Vec<SyncRecord> {
        self.state().syncs.clone()
    }
}

impl Default for EmulatedSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMemorySubsystem for EmulatedSubsystem {
    fn open(&self) -> Result<()> {
        if !self.available {
            return Err(Error::BackendUnavailable(
                "shared-memory subsystem not present".into(),
            ));
        }
        self.state().opens += 1;
        Ok(())
    }

    fn create_from_secure_id(&self, id: SecureId) -> Option<MemHandle> {
        let mut state = self.state();
        if !state.allocations.contains_key(&id) {
            return None;
        }
        let handle = MemHandle(state.next_handle);
        state.next_handle += 1;
        state.references.insert(
            handle,
            Reference {
                secure_id: id,
                mapping: None,
            },
        );
        Some(handle)
    }

    fn mapped_pointer(&self, handle: MemHandle) -> Option<NonNull<u8>> {
        let mut state = self.state();
        let secure_id = state.references.get(&handle)?.secure_id;
        if let Some(addr) = state.references.get(&handle)?.mapping {
            return NonNull::new(addr as *mut u8);
        }

        let alloc = state.allocations.get(&secure_id)?;
        // SAFETY: a fresh mapping at a kernel-chosen address aliases no
        // existing Rust memory.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                alloc.size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &alloc.fd,
                0,
            )
        };
        let ptr = match ptr {
            Ok(ptr) => NonNull::new(ptr.cast::<u8>())?,
            Err(errno) => {
                tracing::error!(secure_id, %errno, "emulated subsystem mmap failed");
                return None;
            }
        };
        if let Some(reference) = state.references.get_mut(&handle) {
            reference.mapping = Some(ptr.as_ptr() as usize);
        }
        Some(ptr)
    }

    fn release_mapped_pointer(&self, handle: MemHandle) {
        let mut state = self.state();
        let Some(reference) = state.references.get(&handle) else {
            return;
        };
        let secure_id = reference.secure_id;
        let Some(addr) = reference.mapping else {
            return;
        };
        let Some(size) = state.allocations.get(&secure_id).map(|a| a.size) else {
            return;
        };
        // SAFETY: `addr` and `size` describe the reference's own mapping,
        // which is forgotten right after.
        unsafe {
            let _ = rustix::mm::munmap(addr as *mut _, size);
        }
        if let Some(reference) = state.references.get_mut(&handle) {
            reference.mapping = None;
        }
    }

    fn release_reference(&self, handle: MemHandle) {
        let mut state = self.state();
        if let Some(reference) = state.references.remove(&handle) {
            if let (Some(addr), Some(alloc)) = (
                reference.mapping,
                state.allocations.get(&reference.secure_id),
            ) {
                // SAFETY: the reference owned this mapping and is gone.
                unsafe {
                    let _ = rustix::mm::munmap(addr as *mut _, alloc.size);
                }
            }
        }
    }

    fn cpu_sync(&self, handle: MemHandle, op: SyncOp, range: Option<SyncRange>) {
        let mut state = self.state();
        let Some(secure_id) = state.references.get(&handle).map(|r| r.secure_id) else {
            tracing::warn!(handle = handle.raw(), "cache sync on released reference");
            return;
        };
        state.syncs.push(SyncRecord {
            handle,
            secure_id,
            op,
            range,
        });
    }
}

impl Drop for EmulatedSubsystem {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for reference in state.references.values() {
            if let (Some(addr), Some(alloc)) =
                (reference.mapping, state.allocations.get(&reference.secure_id))
            {
                // SAFETY: the reference owned this mapping and dies with the subsystem.
                unsafe {
                    let _ = rustix::mm::munmap(addr as *mut _, alloc.size);
                }
            }
        }
    }
}

impl std::fmt::Debug for EmulatedSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("EmulatedSubsystem")
            .field("available", &self.available)
            .field("opens", &state.opens)
            .field("allocations", &state.allocations.len())
            .field("references", &state.references.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_secure_id_has_no_reference() {
        let ump = EmulatedSubsystem::new();
        assert!(ump.create_from_secure_id(99).is_none());
    }

    #[test]
    fn test_references_share_pages() {
        let ump = EmulatedSubsystem::new();
        let id = ump.allocate(4096).unwrap();

        let a = ump.create_from_secure_id(id).unwrap();
        let b = ump.create_from_secure_id(id).unwrap();
        assert_ne!(a, b);
        assert_eq!(ump.live_references(id), 2);

        let pa = ump.mapped_pointer(a).unwrap();
        let pb = ump.mapped_pointer(b).unwrap();
        unsafe {
            *pa.as_ptr().add(10) = 42;
            assert_eq!(*pb.as_ptr().add(10), 42);
        }

        ump.release_mapped_pointer(a);
        ump.release_reference(a);
        ump.release_reference(b);
        assert_eq!(ump.live_references(id), 0);
        assert_eq!(ump.live_mappings(), 0);
    }

    #[test]
    fn test_mapped_pointer_is_stable_per_reference() {
        let ump = EmulatedSubsystem::new();
        let id = ump.allocate(8192).unwrap();
        let h = ump.create_from_secure_id(id).unwrap();
        let first = ump.mapped_pointer(h).unwrap();
        let second = ump.mapped_pointer(h).unwrap();
        assert_eq!(first, second);
        assert_eq!(ump.live_mappings(), 1);
    }

    #[test]
    fn test_allocate_with_duplicate_id_fails() {
        let ump = EmulatedSubsystem::new();
        ump.allocate_with_id(42, 4096).unwrap();
        assert!(ump.allocate_with_id(42, 4096).is_err());
        // Fresh ids skip past explicit ones.
        assert_eq!(ump.allocate(4096).unwrap(), 43);
    }

    #[test]
    fn test_unavailable_open_fails() {
        let ump = EmulatedSubsystem::unavailable();
        let err = ump.open().unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert_eq!(ump.open_count(), 0);
    }

    #[test]
    fn test_sync_is_recorded() {
        let ump = EmulatedSubsystem::new();
        let id = ump.allocate(4096).unwrap();
        let h = ump.create_from_secure_id(id).unwrap();
        let range = SyncRange { addr: 0x1000, len: 256 };
        ump.cpu_sync(h, SyncOp::Clean, Some(range));

        let syncs = ump.syncs();
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].secure_id, id);
        assert_eq!(syncs[0].op, SyncOp::Clean);
        assert_eq!(syncs[0].range.unwrap().end(), 0x1100);
    }
}
