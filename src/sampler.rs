// THREADS AND SYNCHRONIZATION
//
// A sampler is one background thread bound to one device, writing to one output file.  The caller
// and the sampler thread synchronize at exactly two points:
//
// - Readiness: start() blocks until the thread has written and flushed its first sample.  The
//   thread signals this on a one-shot channel.  If the first sample fails the thread exits with the
//   error instead, the channel disconnects, and start() collects the error from join().
//
// - Drain: stop() disconnects the stop channel and joins the thread.  The thread only looks at the
//   stop channel between complete sample cycles, so a backend read and its file write are never
//   split.  The output file is owned by the thread while it runs and is handed back through join(),
//   so after stop() has returned nothing can write to it.
//
// The thread waits on the stop channel with a timeout until the next sample point, so stop() takes
// effect immediately rather than after up to one interval.  Sample points are start + k*interval;
// after a slow read the thread skips to the next point in the future rather than bursting.
//
// Backend failures while sampling are fatal to the run: the thread stops sampling and the error is
// reported from stop().  There is no retry.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::gpu::Gpu;
use crate::session::{DeviceHandle, DeviceSession};
use crate::sink::{self, LineFormat, OutputSink, Sample};
use crate::time::Clock;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::{channel, select};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SampleMode {
    // Instantaneous power in W, sampled every interval.
    Power,
    // Energy since driver load in J, sampled once at start (and optionally once at stop).
    Energy,
}

impl fmt::Display for SampleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SampleMode::Power => "power",
            SampleMode::Energy => "energy",
        })
    }
}

// States only move forward, in this order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum SamplerState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

struct SharedState(AtomicU8);

impl SharedState {
    fn new() -> SharedState {
        SharedState(AtomicU8::new(SamplerState::Idle as u8))
    }

    fn advance(&self, to: SamplerState) {
        self.0.fetch_max(to as u8, Ordering::SeqCst);
    }

    fn get(&self) -> SamplerState {
        match self.0.load(Ordering::SeqCst) {
            0 => SamplerState::Idle,
            1 => SamplerState::Running,
            2 => SamplerState::Draining,
            _ => SamplerState::Stopped,
        }
    }
}

// Energy mode is collect-once and takes no interval; power mode needs one.  Checked before anything
// touches the backend or the file system.
pub fn validate(mode: SampleMode, interval: Duration) -> Result<()> {
    match mode {
        SampleMode::Energy if !interval.is_zero() => Err(Error::Config(format!(
            "energy mode samples once and requires a zero interval, not {}us",
            interval.as_micros()
        ))),
        SampleMode::Power if interval.is_zero() => Err(Error::Config(
            "power mode requires a non-zero interval".to_string(),
        )),
        _ => Ok(()),
    }
}

// Everything needed to take one sample.  Cloned into the thread; stop() keeps a copy for the final
// sample.
#[derive(Clone)]
struct Probe {
    gpu: Arc<dyn Gpu>,
    index: u32,
    mode: SampleMode,
    power_management: bool,
    clock: Clock,
}

impl Probe {
    fn read(&self) -> Result<Sample> {
        let timestamp_ms = self.clock.now_ms();
        let value = if !self.power_management {
            0.0
        } else {
            match self.mode {
                SampleMode::Power => sink::milli_to_unit(self.gpu.power_usage_mw(self.index)? as u64),
                SampleMode::Energy => sink::milli_to_unit(self.gpu.total_energy_mj(self.index)?),
            }
        };
        Ok(Sample {
            timestamp_ms,
            value,
        })
    }

    fn sample_into(&self, sink: &mut OutputSink) -> Result<()> {
        let sample = self.read()?;
        sink.append(&sample)
    }
}

pub struct Sampler {
    device: DeviceHandle,
    path: PathBuf,
    interval: Duration,
    collect_at_end: bool,
    probe: Probe,
    state: Arc<SharedState>,
    // Dropping the sender is the stop signal.
    stop_tx: Option<channel::Sender<()>>,
    worker: Option<thread::JoinHandle<Result<OutputSink>>>,
}

impl Sampler {
    // Start sampling `device` into the file for run `rank`.  Returns once the first sample is in
    // the file.
    pub fn start(
        session: &DeviceSession,
        device: DeviceHandle,
        rank: u32,
        settings: &Settings,
    ) -> Result<Sampler> {
        validate(settings.mode, settings.interval)?;

        let gpu = session.backend()?;
        let index = device.index();
        let power_management = gpu.power_management_enabled(index)?;
        if !power_management {
            log::warn!("Power management is disabled on device {index}, recording zeroes");
        }

        let format = if settings.mode == SampleMode::Power && !settings.timestamps {
            LineFormat::Legacy
        } else {
            LineFormat::Timestamped
        };
        let path = sink::output_path(&settings.directory, &settings.prefix(), rank, index);
        let sink = OutputSink::open(&path, format)?;

        let probe = Probe {
            gpu,
            index,
            mode: settings.mode,
            power_management,
            clock: Clock::new(),
        };
        let state = Arc::new(SharedState::new());
        let (ready_tx, ready_rx) = channel::bounded(1);
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);

        let worker = {
            let probe = probe.clone();
            let state = state.clone();
            let interval = settings.interval;
            thread::Builder::new()
                .name(format!("sampler-gpu{index}"))
                .spawn(move || sampling_loop(probe, sink, interval, ready_tx, stop_rx, &state))
                .map_err(|e| Error::Thread(format!("could not spawn sampler: {e}")))?
        };

        // Readiness barrier.
        if ready_rx.recv().is_err() {
            state.advance(SamplerState::Stopped);
            return match worker.join() {
                Ok(Err(e)) => Err(e),
                Ok(Ok(_)) => Err(Error::Thread("sampler exited before its first sample".to_string())),
                Err(_) => Err(Error::Thread("sampler panicked".to_string())),
            };
        }
        state.advance(SamplerState::Running);
        log::debug!(
            "Sampling {} on device {index} every {}us into {}",
            settings.mode,
            settings.interval.as_micros(),
            path.display()
        );

        Ok(Sampler {
            device,
            path,
            interval: settings.interval,
            collect_at_end: settings.collect_at_end,
            probe,
            state,
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        })
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SamplerState {
        self.state.get()
    }

    // Stop sampling and close the file.  Blocks until the thread has exited; when this returns no
    // more samples will be written.  Returns the path of the output file, or the first error the
    // run hit.
    pub fn stop(mut self) -> Result<PathBuf> {
        let result = self.drain();
        self.state.advance(SamplerState::Stopped);
        result
    }

    fn drain(&mut self) -> Result<PathBuf> {
        drop(self.stop_tx.take());
        let worker = self
            .worker
            .take()
            .ok_or_else(|| Error::Thread("sampler already stopped".to_string()))?;
        let joined = worker.join();
        self.state.advance(SamplerState::Draining);
        let mut sink = match joined {
            Ok(result) => result?,
            Err(_) => return Err(Error::Thread("sampler panicked".to_string())),
        };
        if self.interval.is_zero() && self.collect_at_end {
            self.probe.sample_into(&mut sink)?;
        }
        let path = sink.close()?;
        log::debug!("Sampler for device {} stopped", self.device.index());
        Ok(path)
    }
}

// A sampler that goes out of scope is stopped the same way, but errors can only be logged.
impl Drop for Sampler {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.drain() {
                log::error!("Sampler for device {}: {e}", self.device.index());
            }
            self.state.advance(SamplerState::Stopped);
        }
    }
}

fn sampling_loop(
    probe: Probe,
    mut sink: OutputSink,
    interval: Duration,
    ready_tx: channel::Sender<()>,
    stop_rx: channel::Receiver<()>,
    state: &SharedState,
) -> Result<OutputSink> {
    let start = Instant::now();
    probe.sample_into(&mut sink)?;
    // The receiver is waiting in start() and the channel has room, this can't fail.
    let _ = ready_tx.send(());
    drop(ready_tx);

    if interval.is_zero() {
        state.advance(SamplerState::Draining);
        return Ok(sink);
    }

    let mut next = start + interval;
    let result = loop {
        let timeout = next.saturating_duration_since(Instant::now());
        select! {
            recv(stop_rx) -> _ => break Ok(()),
            default(timeout) => {}
        }
        if let Err(e) = probe.sample_into(&mut sink) {
            log::error!("Sampling device {} failed: {e}", probe.index);
            break Err(e);
        }
        next = next_sample_point(next, Instant::now(), interval);
    };
    state.advance(SamplerState::Draining);
    result.map(|_| sink)
}

// The first point of the schedule after `prev` that is still ahead of `now`.  Points that were
// missed because a read was slow are skipped, not made up.
fn next_sample_point(prev: Instant, now: Instant, interval: Duration) -> Instant {
    let next = prev + interval;
    if next > now {
        return next;
    }
    let missed = (now - next).as_nanos() / interval.as_nanos() + 1;
    let skip = missed * interval.as_nanos();
    next + Duration::from_nanos(u64::try_from(skip).unwrap_or(u64::MAX))
}
