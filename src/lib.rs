// GPU power and energy sampling around a measured region of code.
//
// An application (or the `gpupower measure` wrapper) starts a `monitor::Monitor` before the region
// and stops it after; in between a background sampler appends timestamped power or energy readings
// for one GPU to a per-rank, per-device text file.

pub mod analyze;
pub mod command;
pub mod config;
pub mod error;
pub mod gpu;
pub mod interrupt;
pub mod monitor;
pub mod sampler;
pub mod session;
pub mod sink;
pub mod time;
