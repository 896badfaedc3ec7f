//! Block I/O weight conversion.

/// Converts a v1 `blkio.weight` (10..=1000) to v2 `io.weight` (1..=10000).
#[must_use]
pub fn weight_from_blkio(weight: u16) -> u32 {
    let weight = u32::from(weight.clamp(10, 1000));
    1 + (weight - 10) * 9999 / 990
}
