use std::sync::atomic::{AtomicBool, Ordering};

// Signal handling for open-ended measurements.
//
// When `measure` runs without a command or a duration it samples until the job is told to go away.
// The interesting signals are SIGTERM and SIGHUP (sent by the batch system or job control, often
// followed by SIGKILL if not honored quickly) and SIGINT (keyboard, during development).  All three
// set a flag; the measuring loop polls is_interrupted() and then stops the monitor normally so the
// output file is complete.
//
// A measured command gets the same signals from the terminal or batch system and exits by itself;
// the handler only keeps gpupower alive long enough to drain after it.

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn gpupower_signal_handler(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

pub fn handle_interruptions() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = gpupower_signal_handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        for sig in [libc::SIGTERM, libc::SIGHUP, libc::SIGINT] {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    }
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

#[test]
pub fn test_interrupt_flag() {
    handle_interruptions();
    assert!(!is_interrupted());
    unsafe {
        libc::raise(libc::SIGHUP);
    }
    assert!(is_interrupted());
    INTERRUPTED.store(false, Ordering::Relaxed);
}
