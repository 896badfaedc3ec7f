//! Memory controller value conversions.

/// v1 reports "no limit" as a page-aligned value near `i64::MAX`.
const V1_UNLIMITED_FLOOR: i64 = 0x7FFF_FFFF_FFFF_0000;

/// Renders a byte limit, with negative values meaning unlimited.
#[must_use]
pub fn format_limit(bytes: i64) -> String {
    if bytes < 0 {
        "max".to_string()
    } else {
        bytes.to_string()
    }
}

/// Like [`format_limit`], for v1 files that spell unlimited as `-1`.
#[must_use]
pub fn format_limit_v1(bytes: i64) -> String {
    if bytes < 0 {
        "-1".to_string()
    } else {
        bytes.to_string()
    }
}

/// Parses a byte limit; unlimited and zero read as `None`.
#[must_use]
pub fn parse_limit(value: &str) -> Option<i64> {
    let bytes: i64 = value.trim().parse().ok()?;
    (bytes > 0 && bytes < V1_UNLIMITED_FLOOR).then_some(bytes)
}

/// v2 `memory.swap.max` for an OCI memory+swap total.
///
/// v2 limits swap on its own, so the memory share is subtracted.
#[must_use]
pub fn swap_max_v2(swap: i64, limit: i64) -> String {
    if swap < 0 {
        "max".to_string()
    } else {
        swap.saturating_sub(limit).max(0).to_string()
    }
}
