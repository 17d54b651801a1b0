//! Memory backends behind a buffer handle.
//!
//! This module holds everything that turns a handle's backing description
//! into bytes addressable by this process:
//!
//! - [`SharedMemorySubsystem`]: opaque secure-id subsystem (UMP-like)
//! - [`IonDriver`]: opaque shared-memory client (ION-like)
//! - [`DeviceNode`]: ref-counted reserved-region device node and its
//!   physical-range cache flush
//! - [`mapper`]: backend-dispatching map/unmap
//!
//! The subsystem and client are consumed as capabilities; the memfd-backed
//! [`EmulatedSubsystem`] and [`EmulatedIon`] implement them on a plain Linux
//! host.

mod device_node;
mod ion;
pub mod mapper;
mod subsystem;

pub use device_node::{DeviceNode, FLUSH_OPCODE, FlushRange, flush_range};
pub use ion::{EmulatedIon, IonClient, IonDriver, IonSyncFlags, IonSyncRecord};
pub use subsystem::{
    EmulatedSubsystem, MemHandle, SecureId, SharedMemorySubsystem, SyncOp, SyncRange, SyncRecord,
};
