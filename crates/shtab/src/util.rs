//! Small helpers shared across the crate.

use shtab_util::status::{Result, Status};

/// Round `n` up to a multiple of `align` (a power of two).
#[inline]
pub fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Whether `n` is aligned to `align` (a power of two).
#[inline]
pub fn is_aligned(n: usize, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    n & (align - 1) == 0
}

/// Ceiling of log2, used to map an allocation size to its slab class.
#[inline]
pub fn ceil_log2(n: usize) -> u32 {
    debug_assert!(n > 0);
    usize::BITS - (n - 1).leading_zeros()
}

/// Monotonic clock reading in microseconds.
///
/// The collector stores these readings in shared memory to calibrate its
/// per-step budgets, so the value must be process-independent; only a
/// monotonic system clock qualifies.
pub fn monotonic_usec() -> Result<i64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer for clock_gettime.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return Err(Status::Sys {
            call: "clock_gettime",
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        });
    }
    Ok(ts.tv_sec as i64 * 1_000_000 + ts.tv_nsec as i64 / 1_000)
}
