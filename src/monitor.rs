// The start/stop pair an instrumented application calls around the region it wants measured.
//
// Each process (MPI rank) owns one Monitor.  Rank 0 additionally enumerates and describes all the
// devices, which is only of diagnostic value; every rank resolves its own device and runs its own
// sampler into its own file.

use crate::config::Settings;
use crate::error::Result;
use crate::gpu::GpuAPI;
use crate::sampler::Sampler;
use crate::session::DeviceSession;

use std::path::{Path, PathBuf};

pub struct Monitor {
    session: DeviceSession,
    sampler: Sampler,
}

impl Monitor {
    // Returns once the first sample has been written.  On failure anything already acquired is
    // released again.
    pub fn start(api: &dyn GpuAPI, rank: u32, device: u32, settings: &Settings) -> Result<Monitor> {
        crate::sampler::validate(settings.mode, settings.interval)?;
        let mut session = DeviceSession::initialize(api)?;
        match Self::start_sampler(&session, rank, device, settings) {
            Ok(sampler) => Ok(Monitor { session, sampler }),
            Err(e) => {
                if let Err(e) = session.shutdown() {
                    log::warn!("Backend shutdown after failed start: {e}");
                }
                Err(e)
            }
        }
    }

    fn start_sampler(
        session: &DeviceSession,
        rank: u32,
        device: u32,
        settings: &Settings,
    ) -> Result<Sampler> {
        if rank == 0 {
            let devices = session.enumerate(settings.diagnostics)?;
            log::info!("{} device(s) described", devices.len());
        }
        let handle = session.resolve_handle(device)?;
        Sampler::start(session, handle, rank, settings)
    }

    pub fn path(&self) -> &Path {
        self.sampler.path()
    }

    // Drain the sampler, then release the backend.  The backend is released even if the sampler
    // failed, and the sampler's error is the one reported.
    pub fn stop(self) -> Result<PathBuf> {
        let Monitor {
            mut session,
            sampler,
        } = self;
        let sampled = sampler.stop();
        let released = session.shutdown();
        let path = sampled?;
        released?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, Error};
    use crate::gpu::mockgpu::{MockCard, MockGpuAPI};
    use crate::sampler::SampleMode;

    use std::time::Duration;

    fn settings(dir: &Path) -> Settings {
        Settings {
            interval: Duration::from_millis(10),
            directory: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockGpuAPI::new(vec![MockCard::new("V100"), MockCard::new("V100")]);
        let m = Monitor::start(&api, 3, 1, &settings(dir.path())).unwrap();
        assert!(m.path() == dir.path().join("power_usage_rank3_gpu1.txt"));
        std::thread::sleep(Duration::from_millis(30));
        let path = m.stop().unwrap();
        assert!(api.gpu().is_shut_down());
        assert!(std::fs::read_to_string(path).unwrap().lines().count() >= 2);
    }

    #[test]
    fn test_failed_sampler_still_releases_backend() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockGpuAPI::new(vec![MockCard::new("V100")]);
        api.gpu().fail_after(2);
        let m = Monitor::start(&api, 0, 0, &settings(dir.path())).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!api.gpu().is_shut_down());
        assert!(matches!(
            m.stop(),
            Err(Error::Backend(BackendError::GpuLost))
        ));
        assert!(api.gpu().is_shut_down());
        let path = dir.path().join("power_usage_rank0_gpu0.txt");
        assert!(std::fs::read_to_string(path).unwrap().lines().count() == 2);
    }

    #[test]
    fn test_energy_run() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockGpuAPI::new(vec![MockCard::new("V100")]);
        let s = Settings {
            mode: SampleMode::Energy,
            interval: Duration::ZERO,
            ..settings(dir.path())
        };
        let m = Monitor::start(&api, 0, 0, &s).unwrap();
        let path = m.stop().unwrap();
        assert!(path == dir.path().join("gpu_usage_rank0_gpu0.txt"));
        assert!(std::fs::read_to_string(path).unwrap().lines().count() == 2);
    }

    #[test]
    fn test_bad_device_releases_backend() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockGpuAPI::new(vec![MockCard::new("V100")]);
        assert!(matches!(
            Monitor::start(&api, 1, 1, &settings(dir.path())),
            Err(Error::Backend(BackendError::NotFound))
        ));
        assert!(api.gpu().is_shut_down());
    }

    #[test]
    fn test_config_error_before_backend() {
        let dir = tempfile::tempdir().unwrap();
        let api = MockGpuAPI::new(vec![MockCard::new("V100")]);
        let s = Settings {
            mode: SampleMode::Energy,
            ..settings(dir.path())
        };
        assert!(matches!(
            Monitor::start(&api, 0, 0, &s),
            Err(Error::Config(_))
        ));
        assert!(api.gpu().calls() == 0);
    }

    #[test]
    fn test_fatal_diagnostics_on_rank0_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut card = MockCard::new("V100");
        card.info_fails = Some(BackendError::NoPermission);
        let api = MockGpuAPI::new(vec![card]);
        let s = Settings {
            diagnostics: crate::config::DiagnosticPolicy::Fatal,
            ..settings(dir.path())
        };
        assert!(matches!(
            Monitor::start(&api, 0, 0, &s),
            Err(Error::Backend(BackendError::NoPermission))
        ));
        // Other ranks don't describe devices.
        let m = Monitor::start(&api, 1, 0, &s).unwrap();
        m.stop().unwrap();
    }
}
