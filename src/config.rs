//! Module configuration.
//!
//! Everything that the C module fixed at build time (device node path,
//! reserved region size, partial flush) is a field here, with
//! [`Config::from_env`] as the one place environment variables are read.

use std::path::PathBuf;
use std::time::Duration;

/// Default path of the reserved-memory device node.
pub const DEFAULT_DEVICE_NODE: &str = "/dev/exynos-mem";

/// Size of the FIMC1 reserved region, in KiB.
pub const FIMC1_RESERVED_SIZE_KB: usize = 32 * 1024;

/// Delay before a cross-process shared buffer is actually unregistered.
pub const DEFAULT_RELEASE_DELAY: Duration = Duration::from_millis(1000);

/// Environment variable overriding [`Config::device_node`].
pub const ENV_DEVICE_NODE: &str = "GRALLOC_DEVICE_NODE";
/// Environment variable overriding [`Config::reserved_region_size`] (KiB).
pub const ENV_RESERVED_SIZE_KB: &str = "GRALLOC_RESERVED_SIZE_KB";
/// Environment variable overriding [`Config::release_delay`] (milliseconds).
pub const ENV_RELEASE_DELAY_MS: &str = "GRALLOC_RELEASE_DELAY_MS";
/// Truthy value disables rectangle-scoped flushing.
pub const ENV_DISABLE_PARTIAL_FLUSH: &str = "GRALLOC_DISABLE_PARTIAL_FLUSH";

/// Runtime configuration for a [`Gralloc`](crate::Gralloc) context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Shared device node used by the reserved-region backend.
    pub device_node: PathBuf,
    /// Bytes mapped from the device node for each reserved-region buffer.
    pub reserved_region_size: usize,
    /// How long deferred releases wait before unregistering.
    pub release_delay: Duration,
    /// Clean only the last locked rectangle on unlock instead of the whole
    /// mapping.
    pub partial_flush: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_node: PathBuf::from(DEFAULT_DEVICE_NODE),
            reserved_region_size: FIMC1_RESERVED_SIZE_KB * 1024,
            release_delay: DEFAULT_RELEASE_DELAY,
            partial_flush: true,
        }
    }
}

impl Config {
    /// Defaults overridden by any `GRALLOC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_DEVICE_NODE).filter(|p| !p.trim().is_empty()) {
            config.device_node = PathBuf::from(path.trim());
        }
        if let Some(kb) = lookup(ENV_RESERVED_SIZE_KB).and_then(|raw| positive_u64(&raw)) {
            config.reserved_region_size = kb as usize * 1024;
        }
        if let Some(ms) = lookup(ENV_RELEASE_DELAY_MS).and_then(|raw| positive_u64(&raw)) {
            config.release_delay = Duration::from_millis(ms);
        }
        if lookup(ENV_DISABLE_PARTIAL_FLUSH).is_some_and(|raw| truthy(&raw)) {
            config.partial_flush = false;
        }

        tracing::debug!(
            device_node = %config.device_node.display(),
            reserved_region_size = config.reserved_region_size,
            release_delay_ms = config.release_delay.as_millis() as u64,
            partial_flush = config.partial_flush,
            "gralloc configuration"
        );
        config
    }

    /// Use a different device node for the reserved-region backend.
    pub fn with_device_node(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_node = path.into();
        self
    }

    /// Override the per-buffer reserved-region mapping size in bytes.
    pub fn with_reserved_region_size(mut self, size: usize) -> Self {
        self.reserved_region_size = size;
        self
    }

    /// Override the deferred-release delay.
    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    /// Enable or disable rectangle-scoped flushing.
    pub fn with_partial_flush(mut self, enabled: bool) -> Self {
        self.partial_flush = enabled;
        self
    }
}

/// `1`, `true`, `yes` or `on`, case-insensitive, trimmed.
fn truthy(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes" || normalized == "on"
}

fn positive_u64(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|value| *value > 0)
}
