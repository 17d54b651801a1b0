//! Registration and unregistration of buffer handles.
//!
//! Registering a handle acquires this process's reference to the buffer's
//! memory and maps it; unregistering releases both. Per backend:
//!
//! | Backing          | Register                                          | Unregister                          |
//! |------------------|---------------------------------------------------|-------------------------------------|
//! | framebuffer      | nothing (implicitly registered)                   | nothing                             |
//! | shared memory    | open subsystem once, reference from secure id, map | release mapping and reference      |
//! | reserved region  | open device node (ref-counted), map window        | unmap, close node after last buffer |
//! | ion              | map through client, reference from secure id      | release reference, unmap, destroy client |
//! | generic fd       | map (`direct` descriptors are not supported)      | unmap                               |
//!
//! Registration and unregistration of handles in one process are serialized
//! by a single lock, which also guards the one-time subsystem open and the
//! device node reference count.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handle::{Backing, BufferHandle};
use crate::memory::mapper::{self, MapContext};
use crate::memory::{DeviceNode, IonDriver, SharedMemorySubsystem};
use crate::observability::instrument_buffer;
use crate::tracker::{DirtyRect, RectTracker};
use crate::usage::LockState;
use rustix::fd::{AsFd, OwnedFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Snapshot of per-process backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleStats {
    /// Shared-memory subsystem has been opened.
    pub subsystem_open: bool,
    /// Reserved-region device node is currently open.
    pub device_node_open: bool,
    /// Registered reserved-region buffers holding the node.
    pub device_node_refs: usize,
    /// Times the node has been opened.
    pub device_node_opens: u64,
}

struct RegistryState {
    subsystem_open: bool,
    device_node: DeviceNode,
}

/// The registration engine.
pub struct Registry {
    config: Config,
    pid: u32,
    state: Mutex<RegistryState>,
    tracker: RectTracker,
    subsystem: Arc<dyn SharedMemorySubsystem>,
    ion: Arc<dyn IonDriver>,
}

impl Registry {
    /// Create an engine for the current process.
    pub fn new(
        config: Config,
        subsystem: Arc<dyn SharedMemorySubsystem>,
        ion: Arc<dyn IonDriver>,
    ) -> Self {
        Self::with_pid(config, subsystem, ion, std::process::id())
    }

    /// Create an engine acting as process `pid`.
    pub fn with_pid(
        config: Config,
        subsystem: Arc<dyn SharedMemorySubsystem>,
        ion: Arc<dyn IonDriver>,
        pid: u32,
    ) -> Self {
        let device_node = DeviceNode::new(config.device_node.clone());
        Self {
            config,
            pid,
            state: Mutex::new(RegistryState {
                subsystem_open: false,
                device_node,
            }),
            tracker: RectTracker::new(),
            subsystem,
            ion,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process id this engine registers handles for.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Dirty-rectangle tracker.
    pub fn tracker(&self) -> &RectTracker {
        &self.tracker
    }

    pub(crate) fn subsystem(&self) -> &dyn SharedMemorySubsystem {
        self.subsystem.as_ref()
    }

    pub(crate) fn ion(&self) -> &dyn IonDriver {
        self.ion.as_ref()
    }

    /// The reserved-region device node, if open.
    pub(crate) fn device_fd(&self) -> Option<Arc<OwnedFd>> {
        self.state().device_node.current()
    }

    /// Backend state counters.
    pub fn stats(&self) -> ModuleStats {
        let state = self.state();
        ModuleStats {
            subsystem_open: state.subsystem_open,
            device_node_open: state.device_node.is_open(),
            device_node_refs: state.device_node.refs(),
            device_node_opens: state.device_node.opens(),
        }
    }

    fn ensure_subsystem_open(&self, state: &mut RegistryState) -> Result<()> {
        if !state.subsystem_open {
            self.subsystem.open().map_err(|e| {
                tracing::error!(error = %e, "failed to open shared-memory subsystem");
                match e {
                    Error::BackendUnavailable(_) => e,
                    other => Error::BackendUnavailable(other.to_string()),
                }
            })?;
            state.subsystem_open = true;
        }
        Ok(())
    }

    /// Register `handle` in this process.
    pub fn register(&self, handle: &mut BufferHandle) -> Result<()> {
        if let Err(e) = handle.validate() {
            tracing::error!(error = %e, "registering invalid buffer");
            return Err(e);
        }
        let _span = instrument_buffer("register", handle);

        if matches!(handle.backing, Backing::Framebuffer) {
            return Ok(());
        }

        if let Some(id) = handle.tracked_id() {
            tracing::debug!(secure_id = id, count = self.tracker.count(id), "tracking dirty rect");
            self.tracker.insert_last(DirtyRect::new(id, handle.stride));
        }

        let result = self.register_backing(handle);
        if result.is_err() {
            if let Some(id) = handle.tracked_id() {
                self.tracker.release_inserted(id);
            }
        }
        result
    }

    fn register_backing(&self, handle: &mut BufferHandle) -> Result<()> {
        match handle.backing {
            Backing::Framebuffer => Ok(()),
            Backing::SharedMemory { .. } => self.register_shared_memory(handle),
            Backing::ReservedRegion { .. } => self.register_reserved_region(handle),
            Backing::Ion { .. } => self.register_ion(handle),
            Backing::GenericFd { direct: true, .. } => {
                tracing::error!("registering directly backed descriptor not supported");
                Err(Error::NotSupported(
                    "registering directly backed descriptors".into(),
                ))
            }
            Backing::GenericFd { .. } => {
                let _state = self.state();
                self.map(handle, None)?;
                handle.pid = self.pid;
                Ok(())
            }
        }
    }

    fn register_shared_memory(&self, handle: &mut BufferHandle) -> Result<()> {
        let Backing::SharedMemory { secure_id, .. } = handle.backing else {
            return Ok(());
        };
        let mut state = self.state();
        self.ensure_subsystem_open(&mut state)?;
        handle.pid = self.pid;

        let Some(mem_handle) = self.subsystem.create_from_secure_id(secure_id) else {
            tracing::error!(secure_id, "failed to create shared-memory reference");
            return Err(Error::RegistrationFailed(format!(
                "no reference for secure id {secure_id}"
            )));
        };
        let Some(ptr) = self.subsystem.mapped_pointer(mem_handle) else {
            tracing::error!(secure_id, "failed to map shared-memory reference");
            self.subsystem.release_reference(mem_handle);
            return Err(Error::RegistrationFailed(format!(
                "could not map secure id {secure_id}"
            )));
        };

        if let Backing::SharedMemory { mem_handle: slot, .. } = &mut handle.backing {
            *slot = Some(mem_handle);
        }
        handle.base = ptr.as_ptr() as usize;
        handle.lock_state = LockState::MAPPED;
        handle.write_owner = 0;
        tracing::debug!(secure_id, handle = mem_handle.raw(), "shared-memory buffer registered");
        Ok(())
    }

    fn register_reserved_region(&self, handle: &mut BufferHandle) -> Result<()> {
        let mut state = self.state();
        let device_fd = state.device_node.acquire()?;
        if let Err(e) = self.map(handle, Some(&device_fd)) {
            drop(device_fd);
            state.device_node.release();
            return Err(e);
        }
        handle.pid = self.pid;
        Ok(())
    }

    fn register_ion(&self, handle: &mut BufferHandle) -> Result<()> {
        let Backing::Ion { secure_id, .. } = handle.backing else {
            return Ok(());
        };
        self.map(handle, None)?;

        let mut state = self.state();
        let acquired = self.ensure_subsystem_open(&mut state).and_then(|()| {
            let mem_handle = self.subsystem.create_from_secure_id(secure_id).ok_or_else(|| {
                tracing::error!(secure_id, "failed to create shared-memory reference");
                Error::RegistrationFailed(format!("no reference for secure id {secure_id}"))
            })?;
            if self.subsystem.mapped_pointer(mem_handle).is_none() {
                tracing::error!(secure_id, "failed to map shared-memory reference");
                self.subsystem.release_reference(mem_handle);
                return Err(Error::RegistrationFailed(format!(
                    "could not map secure id {secure_id}"
                )));
            }
            Ok(mem_handle)
        });

        match acquired {
            Ok(mem_handle) => {
                if let Backing::Ion { mem_handle: slot, .. } = &mut handle.backing {
                    *slot = Some(mem_handle);
                }
                handle.pid = self.pid;
                handle.lock_state = LockState::MAPPED;
                handle.write_owner = 0;
                Ok(())
            }
            Err(e) => {
                self.unmap(handle, None);
                Err(e)
            }
        }
    }

    /// Unregister `handle` from this process.
    ///
    /// A handle registered by another process is left untouched.
    pub fn unregister(&self, handle: &mut BufferHandle) -> Result<()> {
        if let Err(e) = handle.validate() {
            tracing::error!(error = %e, "unregistering invalid buffer");
            return Err(e);
        }
        let _span = instrument_buffer("unregister", handle);

        if let Some(id) = handle.tracked_id() {
            if !self.tracker.release(id) {
                tracing::error!(secure_id = id, "dirty rect release error");
            }
        }
        if handle.lock_state.is_locked() {
            tracing::error!(
                lock_state = handle.lock_state.bits(),
                "unregistering buffer that is still locked"
            );
        }

        if handle.pid != self.pid {
            tracing::debug!(
                owner = handle.pid,
                pid = self.pid,
                "buffer not registered by this process, skipping unmap"
            );
            return Ok(());
        }

        let mut state = self.state();
        match handle.backing {
            Backing::Framebuffer => {}
            Backing::SharedMemory { mem_handle, secure_id } => match mem_handle {
                Some(mem_handle) => {
                    self.subsystem.release_mapped_pointer(mem_handle);
                    handle.base = 0;
                    self.subsystem.release_reference(mem_handle);
                    if let Backing::SharedMemory { mem_handle: slot, .. } = &mut handle.backing {
                        *slot = None;
                    }
                    handle.lock_state = LockState::empty();
                    handle.write_owner = 0;
                }
                None => {
                    tracing::debug!(secure_id, "no shared-memory reference held, skipped");
                }
            },
            Backing::ReservedRegion { .. } => {
                if handle.is_mapped() {
                    let device_fd = state.device_node.current();
                    self.unmap(handle, device_fd.as_ref());
                    drop(device_fd);
                    state.device_node.release();
                }
                handle.lock_state = LockState::empty();
                handle.write_owner = 0;
            }
            Backing::Ion { mem_handle, .. } => {
                if let Some(mem_handle) = mem_handle {
                    self.subsystem.release_mapped_pointer(mem_handle);
                    self.subsystem.release_reference(mem_handle);
                }
                self.unmap(handle, None);
                if let Backing::Ion { mem_handle: slot, .. } = &mut handle.backing {
                    *slot = None;
                }
                handle.lock_state = LockState::empty();
                handle.write_owner = 0;
            }
            Backing::GenericFd { direct: true, .. } => {
                tracing::error!("unregistering directly backed descriptor not supported");
                return Err(Error::NotSupported(
                    "unregistering directly backed descriptors".into(),
                ));
            }
            Backing::GenericFd { .. } => {
                self.unmap(handle, None);
                handle.lock_state = LockState::empty();
                handle.write_owner = 0;
            }
        }
        Ok(())
    }

    fn map_context<'a>(&'a self, device_fd: Option<&'a Arc<OwnedFd>>) -> MapContext<'a> {
        MapContext {
            device_fd: device_fd.map(|fd| fd.as_fd()),
            ion: self.ion.as_ref(),
            reserved_region_size: self.config.reserved_region_size,
        }
    }

    fn map(&self, handle: &mut BufferHandle, device_fd: Option<&Arc<OwnedFd>>) -> Result<usize> {
        mapper::map(handle, &self.map_context(device_fd))
    }

    fn unmap(&self, handle: &mut BufferHandle, device_fd: Option<&Arc<OwnedFd>>) {
        mapper::unmap(handle, &self.map_context(device_fd))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("pid", &self.pid)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
