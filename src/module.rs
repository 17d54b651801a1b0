//! Module identity and device dispatch.
//!
//! The host loader opens devices by name. `"gpu0"` yields the allocator
//! device and `"fb0"` the framebuffer device; both are built by a
//! [`DeviceFactory`] supplied by the embedder. With the `adapter` feature
//! the module also answers to its own id, `"gralloc"`, with the adapter
//! device, and reports the adapter API version.

use crate::error::{Error, Result};
use std::fmt;

/// Allocator device name.
pub const GPU0: &str = "gpu0";
/// Framebuffer device name.
pub const FB0: &str = "fb0";
/// Module id, also the adapter device name.
pub const MODULE_ID: &str = "gralloc";

/// Adapter API version 1.0, encoded as `major << 8 | minor`.
pub const ADAPTER_API_VERSION_1_0: u16 = 0x0100;

/// Static description of the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Module id.
    pub id: &'static str,
    /// Human readable name.
    pub name: &'static str,
    /// Author.
    pub author: &'static str,
    /// Major version, or the adapter API version when advertised.
    pub version_major: u16,
    /// Minor version.
    pub version_minor: u16,
}

/// This module.
pub const MODULE_INFO: ModuleInfo = ModuleInfo {
    id: MODULE_ID,
    name: "Graphics Memory Allocator Module",
    author: "ARM Ltd.",
    version_major: if cfg!(feature = "adapter") {
        ADAPTER_API_VERSION_1_0
    } else {
        1
    },
    version_minor: 0,
};

/// Kind of device the loader asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Buffer allocator.
    Allocator,
    /// Display framebuffer.
    Framebuffer,
    /// Adapter device.
    Adapter,
}

impl DeviceKind {
    /// Resolve a device name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            GPU0 => Ok(DeviceKind::Allocator),
            FB0 => Ok(DeviceKind::Framebuffer),
            MODULE_ID if cfg!(feature = "adapter") => Ok(DeviceKind::Adapter),
            other => Err(Error::InvalidArgument(format!("unknown device {other:?}"))),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Allocator => "allocator",
            DeviceKind::Framebuffer => "framebuffer",
            DeviceKind::Adapter => "adapter",
        })
    }
}

/// An opened device.
pub trait HwDevice: Send + fmt::Debug {
    /// What the device is.
    fn kind(&self) -> DeviceKind;

    /// Close the device.
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Builds the devices this module hands out.
pub trait DeviceFactory: Send + Sync {
    /// Allocator device for `name`.
    fn open_allocator(&self, name: &str) -> Result<Box<dyn HwDevice>>;

    /// Framebuffer device for `name`.
    fn open_framebuffer(&self, name: &str) -> Result<Box<dyn HwDevice>>;

    /// Adapter device for `name`.
    fn open_adapter(&self, name: &str) -> Result<Box<dyn HwDevice>> {
        Err(Error::NotSupported(format!("adapter device {name:?}")))
    }
}

/// Open the device called `name`.
pub fn open_device(factory: &dyn DeviceFactory, name: &str) -> Result<Box<dyn HwDevice>> {
    let kind = DeviceKind::from_name(name).inspect_err(|_| {
        tracing::error!(name, "open of unknown device");
    })?;
    tracing::debug!(name, %kind, "opening device");
    match kind {
        DeviceKind::Allocator => factory.open_allocator(name),
        DeviceKind::Framebuffer => factory.open_framebuffer(name),
        DeviceKind::Adapter => factory.open_adapter(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Stub(DeviceKind);

    impl HwDevice for Stub {
        fn kind(&self) -> DeviceKind {
            self.0
        }
    }

    struct StubFactory;

    impl DeviceFactory for StubFactory {
        fn open_allocator(&self, _name: &str) -> Result<Box<dyn HwDevice>> {
            Ok(Box::new(Stub(DeviceKind::Allocator)))
        }

        fn open_framebuffer(&self, _name: &str) -> Result<Box<dyn HwDevice>> {
            Ok(Box::new(Stub(DeviceKind::Framebuffer)))
        }
    }

    #[test]
    fn test_open_known_devices() {
        let gpu = open_device(&StubFactory, GPU0).unwrap();
        assert_eq!(gpu.kind(), DeviceKind::Allocator);
        gpu.close().unwrap();
        assert_eq!(
            open_device(&StubFactory, FB0).unwrap().kind(),
            DeviceKind::Framebuffer
        );
    }

    #[test]
    fn test_unknown_device_is_invalid() {
        let err = open_device(&StubFactory, "gpu1").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(err.errno(), -rustix::io::Errno::INVAL.raw_os_error());
    }

    #[cfg(not(feature = "adapter"))]
    #[test]
    fn test_module_id_not_a_device() {
        assert!(open_device(&StubFactory, MODULE_ID).is_err());
        assert_eq!(MODULE_INFO.version_major, 1);
    }

    #[cfg(feature = "adapter")]
    #[test]
    fn test_adapter_advertised() {
        assert_eq!(DeviceKind::from_name(MODULE_ID).unwrap(), DeviceKind::Adapter);
        assert_eq!(MODULE_INFO.version_major, ADAPTER_API_VERSION_1_0);
        assert!(matches!(
            open_device(&StubFactory, MODULE_ID),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_module_info() {
        assert_eq!(MODULE_INFO.id, "gralloc");
        assert_eq!(MODULE_INFO.name, "Graphics Memory Allocator Module");
        assert_eq!(MODULE_INFO.version_minor, 0);
    }
}
