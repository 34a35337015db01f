use serde::{Deserialize, Serialize};
use std::fmt;

/// Memory location class of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// Pageable host memory
    Host,
    /// Page-locked host memory used to stage host/device copies
    HostPinned,
    /// Memory of the accelerator with the given ordinal
    Device(u32),
}

impl Location {
    pub fn is_device(&self) -> bool {
        matches!(self, Location::Device(_))
    }

    pub fn is_host(&self) -> bool {
        !self.is_device()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => write!(f, "host"),
            Location::HostPinned => write!(f, "host-pinned"),
            Location::Device(ordinal) => write!(f, "device({ordinal})"),
        }
    }
}
