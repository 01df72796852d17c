// NVML backend, through the nvml-wrapper crate.
//
// A `Device` from nvml-wrapper borrows the `Nvml` instance, which does not fit an object that is
// shared with sampler threads and shut down explicitly.  Instead the library handle lives behind a
// lock and devices are looked up by index for every call; nvmlDeviceGetHandleByIndex is cheap.

use crate::error::BackendError;
use crate::gpu::{self, ComputeMode, DeviceInfo};

use std::sync::RwLock;

use nvml_wrapper::enum_wrappers::device::ComputeMode as NvmlComputeMode;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};

pub struct NvidiaGpu {
    // None after shutdown.
    nvml: RwLock<Option<Nvml>>,
}

impl NvidiaGpu {
    pub fn init() -> Result<NvidiaGpu, BackendError> {
        let nvml = Nvml::init().map_err(backend_error)?;
        log::debug!("NVML initialized");
        Ok(NvidiaGpu {
            nvml: RwLock::new(Some(nvml)),
        })
    }

    fn with_device<T>(
        &self,
        index: u32,
        f: impl FnOnce(&Device) -> Result<T, NvmlError>,
    ) -> Result<T, BackendError> {
        let guard = self.nvml.read().map_err(|_| BackendError::Unknown)?;
        let nvml = guard.as_ref().ok_or(BackendError::Uninitialized)?;
        let device = nvml.device_by_index(index).map_err(backend_error)?;
        f(&device).map_err(backend_error)
    }
}

impl gpu::Gpu for NvidiaGpu {
    fn device_count(&self) -> Result<u32, BackendError> {
        let guard = self.nvml.read().map_err(|_| BackendError::Unknown)?;
        let nvml = guard.as_ref().ok_or(BackendError::Uninitialized)?;
        nvml.device_count().map_err(backend_error)
    }

    fn device_info(&self, index: u32) -> Result<DeviceInfo, BackendError> {
        self.with_device(index, |device| {
            let name = device.name()?;
            let bus_id = device.pci_info()?.bus_id;
            let compute_mode = match device.compute_mode()? {
                NvmlComputeMode::Default => ComputeMode::Default,
                NvmlComputeMode::ExclusiveThread => ComputeMode::ExclusiveThread,
                NvmlComputeMode::Prohibited => ComputeMode::Prohibited,
                NvmlComputeMode::ExclusiveProcess => ComputeMode::ExclusiveProcess,
                #[allow(unreachable_patterns)]
                _ => ComputeMode::Unknown,
            };
            let power_management = device.is_power_management_algo_active()?;
            Ok(DeviceInfo {
                index,
                name,
                bus_id,
                compute_mode,
                power_management,
            })
        })
    }

    fn power_usage_mw(&self, index: u32) -> Result<u32, BackendError> {
        self.with_device(index, |device| device.power_usage())
    }

    fn total_energy_mj(&self, index: u32) -> Result<u64, BackendError> {
        self.with_device(index, |device| device.total_energy_consumption())
    }

    fn power_management_enabled(&self, index: u32) -> Result<bool, BackendError> {
        self.with_device(index, |device| device.is_power_management_algo_active())
    }

    fn shutdown(&self) -> Result<(), BackendError> {
        let mut guard = self.nvml.write().map_err(|_| BackendError::Unknown)?;
        match guard.take() {
            Some(nvml) => {
                nvml.shutdown().map_err(backend_error)?;
                log::debug!("NVML shut down");
                Ok(())
            }
            None => Err(BackendError::Uninitialized),
        }
    }
}

// The wrapper adds a number of errors of its own (symbol loading, string conversion and the like);
// those are collapsed into the nearest NVML code.
fn backend_error(e: NvmlError) -> BackendError {
    log::debug!("NVML error: {e}");
    match e {
        NvmlError::Uninitialized => BackendError::Uninitialized,
        NvmlError::InvalidArg => BackendError::InvalidArgument,
        NvmlError::NotSupported => BackendError::NotSupported,
        NvmlError::NoPermission => BackendError::NoPermission,
        NvmlError::AlreadyInitialized => BackendError::AlreadyInitialized,
        NvmlError::NotFound => BackendError::NotFound,
        NvmlError::InsufficientSize(_) => BackendError::InsufficientSize,
        NvmlError::InsufficientPower => BackendError::InsufficientPower,
        NvmlError::DriverNotLoaded => BackendError::DriverNotLoaded,
        NvmlError::Timeout => BackendError::Timeout,
        NvmlError::IrqIssue => BackendError::IrqIssue,
        NvmlError::LibraryNotFound | NvmlError::LibloadingError(_) => {
            BackendError::LibraryNotFound
        }
        NvmlError::FunctionNotFound | NvmlError::FailedToLoadSymbol(_) => {
            BackendError::FunctionNotFound
        }
        NvmlError::CorruptedInfoROM => BackendError::CorruptedInfoRom,
        NvmlError::GpuLost => BackendError::GpuLost,
        NvmlError::ResetRequired => BackendError::ResetRequired,
        NvmlError::OperatingSystem => BackendError::OperatingSystem,
        NvmlError::LibRmVersionMismatch => BackendError::VersionMismatch,
        NvmlError::InUse => BackendError::InUse,
        NvmlError::InsufficientMemory => BackendError::InsufficientMemory,
        NvmlError::NoData => BackendError::NoData,
        // The wrapper has no variant for NVML_ERROR_INSUFFICIENT_RESOURCES, it arrives as Unknown.
        _ => BackendError::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Gpu;

    #[test]
    fn test_error_mapping() {
        assert!(backend_error(NvmlError::NotFound) == BackendError::NotFound);
        assert!(backend_error(NvmlError::InsufficientSize(None)) == BackendError::InsufficientSize);
        assert!(backend_error(NvmlError::Unknown) == BackendError::Unknown);
        assert!(backend_error(NvmlError::NoData) == BackendError::NoData);
        assert!(backend_error(NvmlError::InsufficientMemory) == BackendError::InsufficientMemory);
        assert!(
            backend_error(NvmlError::FailedToLoadSymbol("x".to_string()))
                == BackendError::FunctionNotFound
        );
    }

    #[ignore = "NO GPU"]
    #[test]
    fn test_nvml_session() {
        let gpu = NvidiaGpu::init().expect("NVML initialization");
        let n = gpu.device_count().expect("Device count");
        for i in 0..n {
            let info = gpu.device_info(i).expect("Device info");
            assert!(info.index == i);
            assert!(!info.name.is_empty());
        }
        gpu.shutdown().expect("Shutdown");
        assert!(gpu.device_count() == Err(BackendError::Uninitialized));
        assert!(gpu.shutdown() == Err(BackendError::Uninitialized));
    }
}
