//! Auxiliary per-buffer metadata queries keyed by numeric operation code.

use crate::error::{Error, Result};
use crate::handle::BufferHandle;

/// Report the minor API version of the underlying module.
pub const GET_REAL_MODULE_API_VERSION_MINOR: i32 = 10000;
/// Set producer and consumer usage.
pub const SET_USAGES: i32 = 10001;
/// Width and height.
pub const GET_DIMENSIONS: i32 = 10002;
/// Pixel format.
pub const GET_FORMAT: i32 = 10003;
/// Producer usage.
pub const GET_PRODUCER_USAGE: i32 = 10004;
/// Consumer usage.
pub const GET_CONSUMER_USAGE: i32 = 10005;
/// Backing-store identifier.
pub const GET_BACKING_STORE: i32 = 10006;
/// Number of flexible-layout planes.
pub const GET_NUM_FLEX_PLANES: i32 = 10007;
/// Stride in pixels.
pub const GET_STRIDE: i32 = 10009;

/// Flexible-layout plane count reported for every buffer.
pub const NUM_FLEX_PLANES: u32 = 4;

/// A decoded side-channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformRequest {
    /// Minor API version.
    RealModuleApiVersionMinor,
    /// Overwrite the usage pair.
    SetUsages {
        /// Producer usage.
        producer: u64,
        /// Consumer usage.
        consumer: u64,
    },
    /// Width and height.
    Dimensions,
    /// Pixel format.
    Format,
    /// Producer usage.
    ProducerUsage,
    /// Consumer usage.
    ConsumerUsage,
    /// Backing-store identifier.
    BackingStore,
    /// Flexible-layout plane count.
    NumFlexPlanes,
    /// Stride in pixels.
    Stride,
}

impl PerformRequest {
    /// Decode an operation code and its scalar arguments.
    ///
    /// Unknown codes are logged and rejected with [`Error::NotSupported`].
    pub fn decode(code: i32, args: &[u64]) -> Result<Self> {
        let request = match code {
            GET_REAL_MODULE_API_VERSION_MINOR => PerformRequest::RealModuleApiVersionMinor,
            SET_USAGES => match *args {
                [producer, consumer, ..] => PerformRequest::SetUsages { producer, consumer },
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "SET_USAGES takes 2 arguments, got {}",
                        args.len()
                    )));
                }
            },
            GET_DIMENSIONS => PerformRequest::Dimensions,
            GET_FORMAT => PerformRequest::Format,
            GET_PRODUCER_USAGE => PerformRequest::ProducerUsage,
            GET_CONSUMER_USAGE => PerformRequest::ConsumerUsage,
            GET_BACKING_STORE => PerformRequest::BackingStore,
            GET_NUM_FLEX_PLANES => PerformRequest::NumFlexPlanes,
            GET_STRIDE => PerformRequest::Stride,
            other => {
                tracing::error!(code = other, "perform operation not implemented");
                return Err(Error::NotSupported(format!("perform operation {other}")));
            }
        };
        Ok(request)
    }

    /// Operation code.
    pub fn code(&self) -> i32 {
        match self {
            PerformRequest::RealModuleApiVersionMinor => GET_REAL_MODULE_API_VERSION_MINOR,
            PerformRequest::SetUsages { .. } => SET_USAGES,
            PerformRequest::Dimensions => GET_DIMENSIONS,
            PerformRequest::Format => GET_FORMAT,
            PerformRequest::ProducerUsage => GET_PRODUCER_USAGE,
            PerformRequest::ConsumerUsage => GET_CONSUMER_USAGE,
            PerformRequest::BackingStore => GET_BACKING_STORE,
            PerformRequest::NumFlexPlanes => GET_NUM_FLEX_PLANES,
            PerformRequest::Stride => GET_STRIDE,
        }
    }

    /// True if the request reads or writes a buffer.
    pub fn needs_handle(&self) -> bool {
        !matches!(self, PerformRequest::RealModuleApiVersionMinor)
    }
}

/// Result of a side-channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformReply {
    /// Nothing to report.
    Done,
    /// Minor API version.
    Version(i32),
    /// Width and height.
    Dimensions {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
    },
    /// Pixel format.
    Format(i32),
    /// A usage mask.
    Usage(u64),
    /// Backing-store identifier.
    BackingStore(u64),
    /// Plane count.
    NumFlexPlanes(u32),
    /// Stride in pixels.
    Stride(u32),
}

/// Execute `request` against `handle`.
pub fn perform(request: PerformRequest, handle: Option<&mut BufferHandle>) -> Result<PerformReply> {
    let handle = match (request.needs_handle(), handle) {
        (false, _) => return Ok(PerformReply::Version(0)),
        (true, Some(handle)) => handle,
        (true, None) => {
            return Err(Error::InvalidArgument(format!(
                "perform operation {} needs a buffer",
                request.code()
            )));
        }
    };
    handle.validate()?;

    let reply = match request {
        PerformRequest::RealModuleApiVersionMinor => PerformReply::Version(0),
        PerformRequest::SetUsages { producer, consumer } => {
            handle.producer_usage = producer;
            handle.consumer_usage = consumer;
            PerformReply::Done
        }
        PerformRequest::Dimensions => PerformReply::Dimensions {
            width: handle.width,
            height: handle.height,
        },
        PerformRequest::Format => PerformReply::Format(handle.format),
        PerformRequest::ProducerUsage => PerformReply::Usage(handle.producer_usage),
        PerformRequest::ConsumerUsage => PerformReply::Usage(handle.consumer_usage),
        PerformRequest::BackingStore => PerformReply::BackingStore(handle.backing_store),
        PerformRequest::NumFlexPlanes => PerformReply::NumFlexPlanes(NUM_FLEX_PLANES),
        PerformRequest::Stride => PerformReply::Stride(handle.width),
    };
    tracing::trace!(code = request.code(), ?reply, "perform");
    Ok(reply)
}
