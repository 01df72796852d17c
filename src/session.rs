// The device session owns the connection to the telemetry backend: it is initialized once,
// resolves device handles, and is shut down once.  Samplers borrow the connection from the session
// for the duration of a run.

use crate::config::DiagnosticPolicy;
use crate::error::BackendError;
use crate::gpu::{DeviceInfo, Gpu, GpuAPI};

use std::sync::Arc;

// Opaque reference to one card.  Only `DeviceSession::resolve_handle()` creates these, so a handle
// always names an index that was valid when it was resolved.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceHandle {
    index: u32,
}

impl DeviceHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

pub struct DeviceSession {
    gpu: Option<Arc<dyn Gpu>>,
}

impl DeviceSession {
    pub fn initialize(api: &dyn GpuAPI) -> Result<DeviceSession, BackendError> {
        let gpu = api.init()?;
        Ok(DeviceSession { gpu: Some(gpu) })
    }

    fn gpu(&self) -> Result<&Arc<dyn Gpu>, BackendError> {
        self.gpu.as_ref().ok_or(BackendError::Uninitialized)
    }

    // The connection shared with samplers.  Fails once the session has been shut down.
    pub(crate) fn backend(&self) -> Result<Arc<dyn Gpu>, BackendError> {
        self.gpu().cloned()
    }

    pub fn device_count(&self) -> Result<u32, BackendError> {
        self.gpu()?.device_count()
    }

    // The backend itself reports an out-of-range index as an invalid argument; we want NotFound.
    pub fn resolve_handle(&self, index: u32) -> Result<DeviceHandle, BackendError> {
        let count = self.device_count()?;
        if index >= count {
            log::debug!("Device {index} requested but only {count} present");
            return Err(BackendError::NotFound);
        }
        Ok(DeviceHandle { index })
    }

    pub fn describe_device(&self, handle: DeviceHandle) -> Result<DeviceInfo, BackendError> {
        self.gpu()?.device_info(handle.index)
    }

    // Describe every device.  Failures to count or resolve devices are always fatal; failures to
    // describe a resolved device are handled per `policy`, and such devices are left out of the
    // result unless the policy is Fatal.
    pub fn enumerate(&self, policy: DiagnosticPolicy) -> Result<Vec<DeviceInfo>, BackendError> {
        let count = self.device_count()?;
        let mut result = vec![];
        for i in 0..count {
            let handle = self.resolve_handle(i)?;
            match self.describe_device(handle) {
                Ok(info) => {
                    log::debug!(
                        "Device {i}, name = {}, bus = {}, compute mode = {}, power management = {}",
                        info.name,
                        info.bus_id,
                        info.compute_mode,
                        if info.power_management { "on" } else { "off" },
                    );
                    result.push(info);
                }
                Err(e) => match policy {
                    DiagnosticPolicy::Fatal => return Err(e),
                    DiagnosticPolicy::Warn => {
                        log::warn!("Could not describe device {i}: {e}");
                    }
                    DiagnosticPolicy::Ignore => {
                        log::debug!("Could not describe device {i}: {e}");
                    }
                },
            }
        }
        Ok(result)
    }

    // After shutdown every query fails with Uninitialized, and so does a second shutdown.
    pub fn shutdown(&mut self) -> Result<(), BackendError> {
        match self.gpu.take() {
            Some(gpu) => gpu.shutdown(),
            None => Err(BackendError::Uninitialized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::mockgpu::{MockCard, MockGpuAPI};

    fn three_cards() -> MockGpuAPI {
        MockGpuAPI::new(vec![
            MockCard::new("Tesla V100"),
            MockCard::new("Tesla V100"),
            MockCard::new("Tesla V100"),
        ])
    }

    #[test]
    fn test_resolve_all_devices() {
        let api = three_cards();
        let session = DeviceSession::initialize(&api).unwrap();
        let n = session.device_count().unwrap();
        assert!(n == 3);
        for i in 0..n {
            let h = session.resolve_handle(i).unwrap();
            assert!(h.index() == i);
            let info = session.describe_device(h).unwrap();
            assert!(info.index == i);
            assert!(info.name == "Tesla V100");
        }
    }

    #[test]
    fn test_resolve_out_of_range() {
        let api = three_cards();
        let session = DeviceSession::initialize(&api).unwrap();
        let n = session.device_count().unwrap();
        assert!(session.resolve_handle(n) == Err(BackendError::NotFound));
        assert!(session.resolve_handle(u32::MAX) == Err(BackendError::NotFound));
    }

    #[test]
    fn test_initialize_fails() {
        let api = MockGpuAPI::failing(BackendError::DriverNotLoaded);
        assert!(matches!(
            DeviceSession::initialize(&api),
            Err(BackendError::DriverNotLoaded)
        ));
    }

    #[test]
    fn test_shutdown_twice() {
        let api = three_cards();
        let mut session = DeviceSession::initialize(&api).unwrap();
        assert!(session.shutdown().is_ok());
        assert!(api.gpu().is_shut_down());
        assert!(session.device_count() == Err(BackendError::Uninitialized));
        assert!(session.resolve_handle(0) == Err(BackendError::Uninitialized));
        assert!(session.shutdown() == Err(BackendError::Uninitialized));
    }

    #[test]
    fn test_enumerate_policies() {
        let mut broken = MockCard::new("A100");
        broken.info_fails = Some(BackendError::NoPermission);
        let api = MockGpuAPI::new(vec![MockCard::new("A100"), broken, MockCard::new("A100")]);
        let session = DeviceSession::initialize(&api).unwrap();

        let infos = session.enumerate(DiagnosticPolicy::Warn).unwrap();
        assert!(infos.len() == 2);
        assert!(infos[0].index == 0);
        assert!(infos[1].index == 2);

        let infos = session.enumerate(DiagnosticPolicy::Ignore).unwrap();
        assert!(infos.len() == 2);

        assert!(session.enumerate(DiagnosticPolicy::Fatal) == Err(BackendError::NoPermission));
    }
}
