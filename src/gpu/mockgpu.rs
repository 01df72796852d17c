// Scriptable stand-in for the backend, for tests.

use crate::error::BackendError;
use crate::gpu::{ComputeMode, DeviceInfo, Gpu, GpuAPI};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct MockCard {
    pub name: String,
    pub power_management: bool,
    // Successive power readings in mW; the last one repeats.
    pub power_mw: Vec<u32>,
    // Energy counter in mJ, advanced by `energy_step_mj` on every read.
    pub energy_mj: u64,
    pub energy_step_mj: u64,
    pub info_fails: Option<BackendError>,
}

impl MockCard {
    pub fn new(name: &str) -> MockCard {
        MockCard {
            name: name.to_string(),
            power_management: true,
            power_mw: vec![125000],
            energy_mj: 4500000,
            energy_step_mj: 1000,
            info_fails: None,
        }
    }
}

pub struct MockGpuAPI {
    gpu: Arc<MockGpu>,
    init_fails: Option<BackendError>,
}

impl MockGpuAPI {
    pub fn new(cards: Vec<MockCard>) -> MockGpuAPI {
        MockGpuAPI {
            gpu: Arc::new(MockGpu::new(cards)),
            init_fails: None,
        }
    }

    pub fn failing(e: BackendError) -> MockGpuAPI {
        MockGpuAPI {
            gpu: Arc::new(MockGpu::new(vec![])),
            init_fails: Some(e),
        }
    }

    // The backend handed out by init(), for inspecting call counts.
    pub fn gpu(&self) -> Arc<MockGpu> {
        self.gpu.clone()
    }
}

impl GpuAPI for MockGpuAPI {
    fn init(&self) -> Result<Arc<dyn Gpu>, BackendError> {
        if let Some(e) = self.init_fails {
            return Err(e);
        }
        self.gpu.calls.fetch_add(1, Ordering::SeqCst);
        // Initializing again after a shutdown is allowed.
        self.gpu.shut_down.store(false, Ordering::SeqCst);
        Ok(self.gpu.clone())
    }
}

pub struct MockGpu {
    cards: Vec<MockCard>,
    reads: Mutex<Vec<usize>>,
    energy: Mutex<Vec<u64>>,
    // After this many successful sample reads, reads fail with GpuLost.
    fail_after: Mutex<Option<usize>>,
    shut_down: AtomicBool,
    calls: AtomicUsize,
}

impl MockGpu {
    fn new(cards: Vec<MockCard>) -> MockGpu {
        let reads = vec![0; cards.len()];
        let energy = cards.iter().map(|c| c.energy_mj).collect();
        MockGpu {
            cards,
            reads: Mutex::new(reads),
            energy: Mutex::new(energy),
            fail_after: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    // Number of backend calls made so far, including init().
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.shut_down.load(Ordering::SeqCst) {
            Err(BackendError::Uninitialized)
        } else {
            Ok(())
        }
    }

    fn card(&self, index: u32) -> Result<&MockCard, BackendError> {
        self.cards
            .get(index as usize)
            .ok_or(BackendError::InvalidArgument)
    }

    fn count_read(&self, index: u32) -> Result<usize, BackendError> {
        let mut reads = self.reads.lock().unwrap();
        let n = reads[index as usize];
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if reads.iter().sum::<usize>() >= limit {
                return Err(BackendError::GpuLost);
            }
        }
        reads[index as usize] += 1;
        Ok(n)
    }
}

impl Gpu for MockGpu {
    fn device_count(&self) -> Result<u32, BackendError> {
        self.enter()?;
        Ok(self.cards.len() as u32)
    }

    fn device_info(&self, index: u32) -> Result<DeviceInfo, BackendError> {
        self.enter()?;
        let card = self.card(index)?;
        if let Some(e) = card.info_fails {
            return Err(e);
        }
        Ok(DeviceInfo {
            index,
            name: card.name.clone(),
            bus_id: format!("00000000:{:02X}:00.0", index + 1),
            compute_mode: ComputeMode::Default,
            power_management: card.power_management,
        })
    }

    fn power_usage_mw(&self, index: u32) -> Result<u32, BackendError> {
        self.enter()?;
        let card = self.card(index)?;
        let n = self.count_read(index)?;
        let k = n.min(card.power_mw.len() - 1);
        Ok(card.power_mw[k])
    }

    fn total_energy_mj(&self, index: u32) -> Result<u64, BackendError> {
        self.enter()?;
        let card = self.card(index)?;
        self.count_read(index)?;
        let mut energy = self.energy.lock().unwrap();
        let e = energy[index as usize];
        energy[index as usize] += card.energy_step_mj;
        Ok(e)
    }

    fn power_management_enabled(&self, index: u32) -> Result<bool, BackendError> {
        self.enter()?;
        Ok(self.card(index)?.power_management)
    }

    fn shutdown(&self) -> Result<(), BackendError> {
        self.enter()?;
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}
