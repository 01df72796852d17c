use std::time::Instant;

// Wall-clock time in milliseconds since the epoch, from clock_gettime(CLOCK_REALTIME).  Panic on
// errors, there should never be any.

pub fn unix_now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
        panic!("clock_gettime");
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

// Sample timestamps.  The wall clock can step backwards (NTP) but timestamps from one sampler must
// never decrease, so the clock reads the wall time once and then advances monotonically from it.
// Timestamps from different samplers remain roughly comparable, which the post-processing needs
// when several ranks are measured together.

#[derive(Clone, Copy, Debug)]
pub struct Clock {
    epoch_ms: u64,
    origin: Instant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            epoch_ms: unix_now_ms(),
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
pub fn test_clock_monotonic() {
    let c = Clock::new();
    let a = c.now_ms();
    std::thread::sleep(std::time::Duration::from_millis(20));
    let b = c.now_ms();
    assert!(b >= a + 20);
    // Sanity: after 2020-01-01.
    assert!(a > 1_577_836_800_000);
}
