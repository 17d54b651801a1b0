//! # exynos-gralloc
//!
//! Cross-process graphics buffer lifecycle for Exynos memory backends.
//!
//! A buffer is described by a [`BufferHandle`](handle::BufferHandle) that is
//! passed by value between processes. Each process registers the handle to
//! map the buffer, locks it for CPU access, unlocks it to push CPU writes out
//! of the caches, and unregisters it when done.
//!
//! ## Features
//!
//! - **Four mappable backends**: secure-id shared memory, shared-memory
//!   client buffers, reserved-region windows and plain descriptors
//! - **Rectangle-scoped cache clean**: unlock cleans only the rows last locked
//! - **Deferred release**: graphics buffers in flight between processes are
//!   torn down on a worker after a grace delay
//! - **No hidden statics**: all per-process state lives in a [`Gralloc`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use exynos_gralloc::prelude::*;
//! use exynos_gralloc::memory::{EmulatedIon, EmulatedSubsystem};
//! use std::sync::Arc;
//!
//! let gralloc = Gralloc::new(
//!     Config::from_env(),
//!     Arc::new(EmulatedSubsystem::new()),
//!     Arc::new(EmulatedIon::new()),
//! )?;
//!
//! gralloc.register_buffer(&mut handle)?;
//! gralloc.lock(&mut handle, Usage::SW_WRITE_OFTEN, Rect::new(0, 0, 64, 64))?;
//! gralloc.unlock(&mut handle)?;
//! gralloc.unregister_buffer(&mut handle)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod gralloc;
pub mod handle;
pub mod lock;
pub mod memory;
pub mod module;
pub mod observability;
pub mod perform;
pub mod registry;
pub mod release;
pub mod tracker;
pub mod usage;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::gralloc::Gralloc;
    pub use crate::handle::{Backing, BufferHandle, Sharing};
    pub use crate::lock::{LockedAddress, Rect};
    pub use crate::perform::{PerformReply, PerformRequest};
    pub use crate::registry::ModuleStats;
    pub use crate::release::{ReleaseTicket, Unregistration};
    pub use crate::usage::{LockState, Usage};
}

pub use error::{Error, Result};
pub use gralloc::Gralloc;
