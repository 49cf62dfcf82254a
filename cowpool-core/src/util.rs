// vim: tw=80

use std::{
    sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    time::Instant,
};

use lazy_static::lazy_static;

/// Divide, rounding up
pub fn div_roundup(dividend: u64, divisor: u64) -> u64 {
    (dividend + divisor - 1) / divisor
}

/// Is `x` aligned to a `1 << shift` boundary?
pub fn is_shift_aligned(x: u64, shift: u8) -> bool {
    x & ((1 << shift) - 1) == 0
}

/// Runtime-adjustable knobs, the moral equivalent of the original's module
/// parameters.  All defaults match the source they were taken from.
pub struct Tunables {
    /// Maximum seconds of delta per txg before the sync thread fires anyway
    pub txg_timeout: AtomicU64,
    /// Administratively disable cache flushes on every leaf
    pub nocacheflush: AtomicBool,
    /// Ticks to delay each rebuild I/O when the vdev is busy
    pub vdev_scan_delay: AtomicI64,
    /// Idle window, in ticks, used to decide whether a vdev is busy
    pub vdev_scan_idle: AtomicI64,
    /// Cap on in-flight rebuild bytes, standing in for the page cache limit
    pub rebuild_mem_limit: AtomicU64,
    /// When set, failed recoverable invariants abort instead of logging
    pub strict_asserts: AtomicBool,
}

lazy_static! {
    pub static ref TUNABLES: Tunables = Tunables {
        txg_timeout: AtomicU64::new(5),
        nocacheflush: AtomicBool::new(false),
        vdev_scan_delay: AtomicI64::new(64),
        vdev_scan_idle: AtomicI64::new(512),
        rebuild_mem_limit: AtomicU64::new(64 << 20),
        strict_asserts: AtomicBool::new(false),
    };
    static ref BOOT: Instant = Instant::now();
}

/// Clock ticks per second
pub const HZ: i64 = 100;

/// Coarse monotonic tick counter, counted from process start
pub fn lbolt() -> i64 {
    let e = BOOT.elapsed();
    e.as_secs() as i64 * HZ + i64::from(e.subsec_millis()) * HZ / 1000
}

/// Block the calling thread for `ticks` clock ticks
pub fn delay(ticks: i64) {
    if ticks > 0 {
        let ms = (ticks * 1000 / HZ) as u64;
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}

#[doc(hidden)]
pub fn panic_recover_impl(args: std::fmt::Arguments<'_>) {
    if TUNABLES.strict_asserts.load(Ordering::Relaxed) {
        panic!("{args}");
    } else {
        tracing::error!("recoverable invariant failure: {args}");
    }
}

/// A "cannot happen" that the pool can limp past when it does.  Logs and
/// continues, unless `strict_asserts` is set, in which case it panics.
#[macro_export]
macro_rules! panic_recover {
    ($($arg:tt)*) => {
        $crate::util::panic_recover_impl(format_args!($($arg)*))
    };
}

// LCOV_EXCL_STOP
