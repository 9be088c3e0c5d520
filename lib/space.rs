//! Disk footprint of a file, as charged against an allocation.

/// Granularity at which file lengths are rounded up when charged.
pub const BLOCK_SIZE: u64 = 4096;

/// The space a file of `len` bytes consumes on disk.
///
/// Rounds up to the next [`BLOCK_SIZE`] boundary. This approximates real usage without asking the
/// provider about block allocation; indirect blocks and sparse regions are not modelled.
#[must_use]
pub const fn space_consumed(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE).saturating_mul(BLOCK_SIZE)
}

/// [`space_consumed`] as a signed quantity, for delta arithmetic against in-use counters.
#[must_use]
pub fn space_consumed_signed(len: u64) -> i64 {
    i64::try_from(space_consumed(len)).unwrap_or(i64::MAX)
}

/// Signed difference in charged space when a file changes from `old_len` to `new_len` bytes.
#[must_use]
pub fn charge_delta(old_len: u64, new_len: u64) -> i64 {
    space_consumed_signed(new_len) - space_consumed_signed(old_len)
}
