//! Contract versioning.
//!
//! The event contract is versioned as a whole: a major bump means an event
//! name or a required field changed and old clients must be rejected.

use serde::{Deserialize, Serialize};

/// Current contract version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Contract version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Event names or required fields changed.
    pub major: u8,
    /// New optional fields or outbound channels.
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// The value sent in the `connected` frame.
    #[must_use]
    pub const fn wire(&self) -> u8 {
        self.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        assert!(Version::new(1, 0).is_compatible_with(&Version::new(1, 3)));
        assert!(!Version::new(1, 0).is_compatible_with(&Version::new(2, 0)));
    }

    #[test]
    fn test_wire_version() {
        assert_eq!(PROTOCOL_VERSION.wire(), 1);
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
