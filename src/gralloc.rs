//! The per-process buffer module.
//!
//! [`Gralloc`] owns everything that used to be process-wide state: the
//! registration lock and its backends, the dirty-rectangle tracker and the
//! deferred-release worker. Create one per process and share it.
//!
//! # Example
//!
//! ```rust,ignore
//! use exynos_gralloc::prelude::*;
//!
//! let gralloc = Gralloc::new(Config::from_env(), subsystem, ion)?;
//! gralloc.register_buffer(&mut handle)?;
//! let addr = gralloc.lock(&mut handle, Usage::SW_WRITE_OFTEN, Rect::new(0, 0, 64, 64))?;
//! // ... write pixels ...
//! gralloc.unlock(&mut handle)?;
//! gralloc.unregister_buffer(&mut handle)?;
//! ```

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handle::{BufferHandle, Sharing};
use crate::lock::{self, LockedAddress, Rect};
use crate::memory::{IonDriver, SharedMemorySubsystem};
use crate::module::{self, DeviceFactory, HwDevice, ModuleInfo};
use crate::perform::{self, PerformReply, PerformRequest};
use crate::registry::{ModuleStats, Registry};
use crate::release::{ReleaseWorker, Unregistration};
use crate::tracker::RectTracker;
use crate::usage::Usage;
use std::sync::Arc;

/// Buffer registration, locking and release for one process.
pub struct Gralloc {
    registry: Arc<Registry>,
    releaser: ReleaseWorker,
    devices: Option<Arc<dyn DeviceFactory>>,
}

impl Gralloc {
    /// Create the module and start its release worker.
    pub fn new(
        config: Config,
        subsystem: Arc<dyn SharedMemorySubsystem>,
        ion: Arc<dyn IonDriver>,
    ) -> Result<Self> {
        Self::from_registry(Arc::new(Registry::new(config, subsystem, ion)))
    }

    /// Create the module around an existing registration engine.
    pub fn from_registry(registry: Arc<Registry>) -> Result<Self> {
        let delay = registry.config().release_delay;
        let releaser = ReleaseWorker::spawn(Arc::clone(&registry), delay)?;
        tracing::debug!(pid = registry.pid(), ?delay, "gralloc module ready");
        Ok(Self {
            registry,
            releaser,
            devices: None,
        })
    }

    /// Use `factory` to build devices for [`open_device`](Self::open_device).
    pub fn with_device_factory(mut self, factory: Arc<dyn DeviceFactory>) -> Self {
        self.devices = Some(factory);
        self
    }

    /// Module identity.
    pub fn info(&self) -> ModuleInfo {
        module::MODULE_INFO
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        self.registry.config()
    }

    /// Open the device called `name`.
    pub fn open_device(&self, name: &str) -> Result<Box<dyn HwDevice>> {
        match &self.devices {
            Some(factory) => module::open_device(factory.as_ref(), name),
            None => {
                module::DeviceKind::from_name(name)?;
                Err(Error::NotSupported(format!(
                    "no device factory installed for {name:?}"
                )))
            }
        }
    }

    /// Register `handle` in this process.
    pub fn register_buffer(&self, handle: &mut BufferHandle) -> Result<()> {
        self.registry.register(handle)
    }

    /// Unregister `handle` from this process.
    ///
    /// Graphics buffers are released on the worker after the release delay;
    /// `handle` itself is left as is and the returned ticket receives the
    /// torn-down copy.
    pub fn unregister_buffer(&self, handle: &mut BufferHandle) -> Result<Unregistration> {
        if handle.sharing == Sharing::GraphicBuffer {
            handle.validate()?;
            tracing::debug!(
                secure_id = handle.secure_id(),
                delay = ?self.releaser.delay(),
                "deferring graphics buffer release"
            );
            let ticket = self.releaser.schedule(handle.clone())?;
            return Ok(Unregistration::Deferred(ticket));
        }
        self.registry.unregister(handle)?;
        Ok(Unregistration::Completed)
    }

    /// Lock `handle` for CPU access.
    pub fn lock(
        &self,
        handle: &mut BufferHandle,
        usage: Usage,
        rect: Rect,
    ) -> Result<Option<LockedAddress>> {
        lock::lock(&self.registry, handle, usage, rect)
    }

    /// Unlock `handle` and flush CPU writes.
    pub fn unlock(&self, handle: &mut BufferHandle) -> Result<()> {
        lock::unlock(&self.registry, handle)
    }

    /// Run a side-channel operation given as a raw code and arguments.
    pub fn perform(
        &self,
        code: i32,
        args: &[u64],
        handle: Option<&mut BufferHandle>,
    ) -> Result<PerformReply> {
        let request = PerformRequest::decode(code, args)?;
        perform::perform(request, handle)
    }

    /// Physical plane addresses of a reserved-region buffer.
    pub fn physical_planes(&self, handle: &BufferHandle) -> Result<[u64; 3]> {
        handle.validate()?;
        handle.physical_planes().ok_or_else(|| {
            Error::NotSupported(format!(
                "{} buffers have no physical address",
                handle.backing.name()
            ))
        })
    }

    /// Dirty-rectangle tracker.
    pub fn tracker(&self) -> &RectTracker {
        self.registry.tracker()
    }

    /// Backend state counters.
    pub fn stats(&self) -> ModuleStats {
        self.registry.stats()
    }

    /// Deferred releases not yet completed.
    pub fn pending_releases(&self) -> usize {
        self.releaser.pending()
    }

    /// The registration engine.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl std::fmt::Debug for Gralloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gralloc")
            .field("registry", &self.registry)
            .field("releaser", &self.releaser)
            .field("devices", &self.devices.is_some())
            .finish()
    }
}
