//! Time sources used throughout the daemon.
//!
//! Bucketing and pull scheduling run on the elapsed-realtime clock,
//! which keeps counting across device suspend. Wall time is only used
//! to stamp events for upload and to program the host pull alarm.

pub const NS_PER_SEC: i64 = 1_000_000_000;
pub const NS_PER_MS: i64 = 1_000_000;

/// Nanoseconds since boot, including time spent in suspend.
pub fn elapsed_realtime_ns() -> i64 {
    clock_gettime_ns(libc::CLOCK_BOOTTIME)
}

/// Wall-clock nanoseconds since the Unix epoch. May jump.
pub fn wall_clock_ns() -> i64 {
    clock_gettime_ns(libc::CLOCK_REALTIME)
}

fn clock_gettime_ns(clock_id: libc::clockid_t) -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime` is thread-safe and does not require any
    // Rust-side invariants besides a valid pointer.
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } == 0 {
        (ts.tv_sec as i64)
            .saturating_mul(NS_PER_SEC)
            .saturating_add(ts.tv_nsec as i64)
    } else {
        0
    }
}

/// Truncates a nanosecond timestamp to milliseconds.
pub fn ns_to_millis(ns: i64) -> i64 {
    ns / NS_PER_MS
}
