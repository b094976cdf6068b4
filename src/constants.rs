//! Engine-wide constants and limits.
//!
//! # Design Decisions
//!
//! Size constants use `u32` instead of `usize` for portability and to prevent
//! truncation on 32-bit systems.
//!
//! All invariants verified at compile time via `const` assertions.

// Compile-time proof that u32 -> usize is safe on this platform.
const _: () = assert!(
    size_of::<usize>() >= size_of::<u32>(),
    "Platform must have at least 32-bit addressing"
);

/// Sector size for disk I/O alignment. Direct I/O (no buffering, write
/// through) requires buffers, lengths, and offsets aligned to this.
/// Must be power of two for bitwise alignment.
pub const SECTOR_SIZE: u32 = 4096;

/// Kernel completion entries harvested per flush cycle. Bounds the stack
/// array handed to the completion port and the per-flush drain latency.
pub const IO_ENTRIES_PER_FLUSH: usize = 64;

/// Timer resolution: the completion port wait is parameterized in
/// milliseconds, so deadlines round to this granularity.
pub const NS_PER_MS: u64 = 1_000_000;

/// Upper bound for a single in-flight transfer. On-wire and kernel byte
/// counts are `u32`; larger buffers are clamped at submission.
pub const BUFFER_LIMIT_MAX: usize = u32::MAX as usize;

// =============================================================================
// Compile-time design integrity assertions
// =============================================================================

const _: () = assert!(SECTOR_SIZE > 0);
const _: () = assert!(
    SECTOR_SIZE.is_power_of_two(),
    "Sector size must be power of two for alignment arithmetic"
);

const _: () = assert!(IO_ENTRIES_PER_FLUSH > 0);
const _: () = assert!(
    IO_ENTRIES_PER_FLUSH <= 1024,
    "Per-flush harvest is stack-allocated; keep it bounded"
);

const _: () = assert!(NS_PER_MS == 1_000_000);

// =============================================================================
// Helper functions
// =============================================================================

/// Rounds up to next [`SECTOR_SIZE`] multiple. Idempotent for aligned inputs.
///
/// # Panics
/// Panics on overflow.
///
/// # Examples
/// ```
/// # use squall::constants::*;
/// assert_eq!(sector_ceil(0), 0);
/// assert_eq!(sector_ceil(1), SECTOR_SIZE as u64);
/// assert_eq!(sector_ceil(SECTOR_SIZE as u64), SECTOR_SIZE as u64);
/// assert_eq!(sector_ceil(SECTOR_SIZE as u64 + 1), SECTOR_SIZE as u64 * 2);
/// ```
#[inline]
pub const fn sector_ceil(n: u64) -> u64 {
    const _: () = assert!(SECTOR_SIZE.is_power_of_two());

    let mask = (SECTOR_SIZE - 1) as u64;

    assert!(n <= u64::MAX - mask, "sector_ceil overflow");

    let result = (n + mask) & !mask;
    assert!(result.is_multiple_of(SECTOR_SIZE as u64));
    assert!(result >= n);

    result
}

/// Returns true if `n` is a [`SECTOR_SIZE`] multiple.
#[inline]
pub const fn is_sector_aligned(n: u64) -> bool {
    n.is_multiple_of(SECTOR_SIZE as u64)
}
