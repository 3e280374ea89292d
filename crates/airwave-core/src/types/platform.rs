//! Injected description of the host platform.

use serde::{Deserialize, Serialize};

/// Network class reported by the platform probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    #[default]
    Broadband,
    Cellular,
    /// Cellular with poor effective throughput (2G/3G-like).
    Slow,
}

impl NetworkClass {
    /// Cellular-class connections get tighter buffer ceilings and longer retry budgets.
    pub const fn is_cellular_class(self) -> bool {
        matches!(self, Self::Cellular | Self::Slow)
    }

    /// Slow connections unlock the extra stall-recovery strategies.
    pub const fn is_slow(self) -> bool {
        matches!(self, Self::Slow)
    }
}

/// What the host platform can and cannot do. Supplied by an external probe so
/// the engine never sniffs its environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// The runtime silently fails once too many bytes are buffered.
    pub enforces_buffer_ceiling: bool,
    pub network_class: NetworkClass,
    /// An adaptive-streaming client is available.
    pub supports_adaptive: bool,
}

impl PlatformCapabilities {
    pub const fn new(network_class: NetworkClass) -> Self {
        Self {
            enforces_buffer_ceiling: false,
            network_class,
            supports_adaptive: true,
        }
    }

    #[must_use]
    pub const fn constrained(mut self) -> Self {
        self.enforces_buffer_ceiling = true;
        self
    }

    #[must_use]
    pub const fn without_adaptive(mut self) -> Self {
        self.supports_adaptive = false;
        self
    }

    pub const fn is_cellular_class(&self) -> bool {
        self.network_class.is_cellular_class()
    }
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self::new(NetworkClass::Broadband)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_classes() {
        assert!(!NetworkClass::Broadband.is_cellular_class());
        assert!(NetworkClass::Cellular.is_cellular_class());
        assert!(NetworkClass::Slow.is_cellular_class());
        assert!(NetworkClass::Slow.is_slow());
        assert!(!NetworkClass::Cellular.is_slow());
    }

    #[test]
    fn test_builder() {
        let caps = PlatformCapabilities::new(NetworkClass::Cellular)
            .constrained()
            .without_adaptive();
        assert!(caps.enforces_buffer_ceiling);
        assert!(!caps.supports_adaptive);
        assert!(caps.is_cellular_class());
    }
}
