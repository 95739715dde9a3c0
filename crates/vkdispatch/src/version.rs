//! Vulkan API version gating.

use crate::error::{ComputeError, Result};
use ash::vk;
use std::fmt;

/// A decoded Vulkan version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Decode a version packed with `vk::make_api_version`.
    pub fn from_raw(raw: u32) -> Self {
        Self {
            major: vk::api_version_major(raw),
            minor: vk::api_version_minor(raw),
            patch: vk::api_version_patch(raw),
        }
    }

    /// Pack back into Vulkan's encoding (variant 0).
    pub fn to_raw(self) -> u32 {
        vk::make_api_version(0, self.major, self.minor, self.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Record of a successful compatibility check between the loaded API and the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub loaded: Version,
    pub target: Version,
}

impl VersionInfo {
    /// Compare the loaded version against the target.
    ///
    /// Only major and minor gate the check; patch is informational.
    pub fn new(loaded: u32, target: u32) -> Result<Self> {
        let loaded = Version::from_raw(loaded);
        let target = Version::from_raw(target);

        if loaded.major < target.major
            || (loaded.major == target.major && loaded.minor < target.minor)
        {
            return Err(ComputeError::UnsupportedVersion { loaded, target });
        }

        Ok(Self { loaded, target })
    }
}
