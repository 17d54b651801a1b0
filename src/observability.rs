//! Tracing spans and events for buffer operations.

use crate::handle::BufferHandle;
use tracing::{Level, Span, span};

/// Create a span for an operation on a buffer.
///
/// # Example
///
/// ```rust,ignore
/// use exynos_gralloc::observability::span_buffer;
///
/// let span = span_buffer("lock", &handle);
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_buffer(op: &'static str, handle: &BufferHandle) -> Span {
    span!(
        Level::DEBUG,
        "buffer",
        op = op,
        backing = handle.backing.name(),
        secure_id = handle.secure_id(),
        size = handle.size,
        pid = handle.pid
    )
}

/// Enter a buffer span for the rest of the scope.
pub fn instrument_buffer(op: &'static str, handle: &BufferHandle) -> tracing::span::EnteredSpan {
    span_buffer(op, handle).entered()
}

/// Log a completed cache maintenance operation.
#[inline]
pub fn trace_cache_sync(handle: &BufferHandle, kind: &'static str, start: usize, len: usize) {
    tracing::trace!(
        backing = handle.backing.name(),
        kind,
        start,
        len,
        "cache sync"
    );
}
