//! Reserved-region device node.
//!
//! All reserved-region buffers in a process map windows of one shared
//! device node. The node is opened when the first such buffer registers and
//! closed when the last one unregisters. Cache maintenance is a control
//! request carrying a physical address range.

use crate::error::{Error, Result};
use rustix::fd::{BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use rustix::ioctl::{Opcode, Setter, opcode};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Argument of the physical-range cache flush request.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRange {
    /// Physical start address.
    pub start: usize,
    /// Length in bytes.
    pub length: usize,
}

/// `_IOW('M', 203, FlushRange)`: flush CPU caches for a physical range.
pub const FLUSH_OPCODE: Opcode = opcode::write::<FlushRange>(b'M', 203);

/// Issue a physical-range cache flush on the device node.
pub fn flush_range(fd: BorrowedFd<'_>, paddr: u64, length: usize) -> Result<()> {
    let range = FlushRange {
        start: paddr as usize,
        length,
    };
    // SAFETY: FLUSH_OPCODE is a write request whose argument is FlushRange.
    unsafe { rustix::ioctl::ioctl(fd, Setter::<FLUSH_OPCODE, FlushRange>::new(range)) }.map_err(
        |errno| {
            tracing::error!(paddr, length, %errno, "physical range cache flush rejected");
            Error::FlushFailed(format!(
                "flush of {length} bytes at {paddr:#x} rejected: {errno}"
            ))
        },
    )
}

/// Reference-counted handle on the shared device node.
///
/// Not synchronized on its own; it lives inside the registration lock.
#[derive(Debug)]
pub struct DeviceNode {
    path: PathBuf,
    fd: Option<Arc<OwnedFd>>,
    refs: usize,
    opens: u64,
}

impl DeviceNode {
    /// A closed node at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fd: None,
            refs: 0,
            opens: 0,
        }
    }

    /// Path of the node.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take a reference, opening the node if this is the first one.
    pub fn acquire(&mut self) -> Result<Arc<OwnedFd>> {
        let fd = match &self.fd {
            Some(fd) => Arc::clone(fd),
            None => {
                let fd = rustix::fs::open(
                    &self.path,
                    OFlags::RDWR | OFlags::CLOEXEC,
                    Mode::empty(),
                )
                .map_err(|errno| {
                    tracing::error!(path = %self.path.display(), %errno, "device node open error");
                    Error::BackendUnavailable(format!(
                        "{}: {errno}",
                        self.path.display()
                    ))
                })?;
                self.opens += 1;
                tracing::debug!(path = %self.path.display(), "device node opened");
                let fd = Arc::new(fd);
                self.fd = Some(Arc::clone(&fd));
                fd
            }
        };
        self.refs += 1;
        Ok(fd)
    }

    /// Drop a reference, closing the node when none remain.
    pub fn release(&mut self) {
        self.refs = self.refs.saturating_sub(1);
        if self.refs == 0 && self.fd.take().is_some() {
            tracing::debug!(path = %self.path.display(), "device node closed");
        }
    }

    /// The open descriptor, if any buffer holds a reference.
    pub fn current(&self) -> Option<Arc<OwnedFd>> {
        self.fd.clone()
    }

    /// True while the node is open.
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Outstanding references.
    pub fn refs(&self) -> usize {
        self.refs
    }

    /// How many times the node has been opened over this node's lifetime.
    pub fn opens(&self) -> u64 {
        self.opens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fd::AsFd;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_once_close_on_last_release() {
        let file = NamedTempFile::new().unwrap();
        let mut node = DeviceNode::new(file.path());

        let a = node.acquire().unwrap();
        let b = node.acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(node.refs(), 2);
        assert_eq!(node.opens(), 1);

        node.release();
        assert!(node.is_open());
        node.release();
        assert!(!node.is_open());
        assert_eq!(node.refs(), 0);

        node.acquire().unwrap();
        assert_eq!(node.opens(), 2);
    }

    #[test]
    fn test_missing_node_is_backend_unavailable() {
        let mut node = DeviceNode::new("/nonexistent/gralloc-mem");
        let err = node.acquire().unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert_eq!(node.refs(), 0);
    }

    #[test]
    fn test_flush_on_regular_file_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        let mut node = DeviceNode::new(file.path());
        let fd = node.acquire().unwrap();

        let err = flush_range(fd.as_fd(), 0x4000_0000, 4096).unwrap_err();
        assert!(matches!(err, Error::FlushFailed(_)));
    }

    #[test]
    fn test_release_without_acquire_is_harmless() {
        let mut node = DeviceNode::new("/dev/null");
        node.release();
        assert_eq!(node.refs(), 0);
        assert!(!node.is_open());
    }
}
