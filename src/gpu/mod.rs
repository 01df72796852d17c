#[cfg(test)]
pub mod mockgpu;
#[cfg(feature = "nvidia")]
mod nvidia;
pub mod realgpu;

// Low-level API to the telemetry backend for the cards installed on the node.

use crate::error::BackendError;

use std::fmt;
use std::sync::Arc;

// Cards are addressed by a zero-based index; indices are densely packed in 0..device_count().  The
// index is only stable for the lifetime of a backend connection.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ComputeMode {
    Default,
    ExclusiveThread,
    Prohibited,
    ExclusiveProcess,
    Unknown,
}

impl fmt::Display for ComputeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComputeMode::Default => "Default",
            ComputeMode::ExclusiveThread => "ExclusiveThread",
            ComputeMode::Prohibited => "Prohibited",
            ComputeMode::ExclusiveProcess => "ExclusiveProcess",
            ComputeMode::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

// Static (run-invariant) card information, used for diagnostics only.

#[derive(PartialEq, Clone, Debug)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub bus_id: String,
    pub compute_mode: ComputeMode,
    pub power_management: bool,
}

// Trait representing an initialized connection to the backend.  It is shared between the session
// and any running samplers, hence Send + Sync.
//
// Units are the backend's: milliwatts for power, millijoules for energy.  Once `shutdown()` has
// succeeded every method, including `shutdown()`, returns Err(BackendError::Uninitialized).
pub trait Gpu: Send + Sync {
    fn device_count(&self) -> Result<u32, BackendError>;

    // Static information about the card at `index`.  Implementations may assume the index has been
    // checked against device_count().
    fn device_info(&self, index: u32) -> Result<DeviceInfo, BackendError>;

    // Instantaneous power draw of the card and its associated circuitry, in mW.
    fn power_usage_mw(&self, index: u32) -> Result<u32, BackendError>;

    // Energy consumed since the driver was last loaded, in mJ.
    fn total_energy_mj(&self, index: u32) -> Result<u64, BackendError>;

    // Whether the card's power management mode is enabled.  When it is not, power readings are
    // meaningless.
    fn power_management_enabled(&self, index: u32) -> Result<bool, BackendError>;

    fn shutdown(&self) -> Result<(), BackendError>;
}

// Connect to the backend.  Calling init() twice without shutting down the first connection is not
// supported.
pub trait GpuAPI {
    fn init(&self) -> Result<Arc<dyn Gpu>, BackendError>;
}
