use crate::error::BackendError;
use crate::gpu::{Gpu, GpuAPI};

#[cfg(feature = "nvidia")]
use crate::gpu::nvidia;

use std::sync::Arc;

pub struct RealGpu {}

impl RealGpu {
    pub fn new() -> RealGpu {
        RealGpu {}
    }
}

impl Default for RealGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuAPI for RealGpu {
    #[cfg(feature = "nvidia")]
    fn init(&self) -> Result<Arc<dyn Gpu>, BackendError> {
        Ok(Arc::new(nvidia::NvidiaGpu::init()?))
    }

    // Built without any backend: behave as if the vendor library were not installed.
    #[cfg(not(feature = "nvidia"))]
    fn init(&self) -> Result<Arc<dyn Gpu>, BackendError> {
        Err(BackendError::LibraryNotFound)
    }
}
