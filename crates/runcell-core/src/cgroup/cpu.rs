//! CPU controller value conversions.

/// Period used when a quota is given without one.
pub const DEFAULT_PERIOD_US: u64 = 100_000;

const MIN_SHARES: u64 = 2;
const MAX_SHARES: u64 = 262_144;

/// Converts v1 `cpu.shares` (2..=262144) to v2 `cpu.weight` (1..=10000).
#[must_use]
pub fn weight_from_shares(shares: u64) -> u64 {
    let shares = shares.clamp(MIN_SHARES, MAX_SHARES);
    1 + ((shares - MIN_SHARES) * 9999) / (MAX_SHARES - MIN_SHARES)
}

/// Renders a `cpu.max` line. A missing or negative quota means unlimited.
#[must_use]
pub fn format_max(quota: Option<i64>, period: Option<u64>) -> String {
    let period = period.unwrap_or(DEFAULT_PERIOD_US);
    match quota {
        Some(q) if q > 0 => format!("{q} {period}"),
        _ => format!("max {period}"),
    }
}

/// Parses a `cpu.max` line into quota and period.
#[must_use]
pub fn parse_max(line: &str) -> (Option<i64>, Option<u64>) {
    let mut parts = line.split_whitespace();
    let quota = parts.next().and_then(|q| q.parse().ok());
    let period = parts.next().and_then(|p| p.parse().ok());
    (quota, period)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_scale_onto_weight_range() {
        assert_eq!(weight_from_shares(2), 1);
        assert_eq!(weight_from_shares(262_144), 10_000);
        assert_eq!(weight_from_shares(1024), 39);
        assert_eq!(weight_from_shares(0), 1);
    }

    #[test]
    fn half_a_cpu_renders_as_quota_and_period() {
        assert_eq!(format_max(Some(50_000), Some(100_000)), "50000 100000");
        assert_eq!(format_max(Some(50_000), None), "50000 100000");
        assert_eq!(format_max(Some(-1), Some(20_000)), "max 20000");
        assert_eq!(format_max(None, None), "max 100000");
    }

    #[test]
    fn cpu_max_parses_back() {
        assert_eq!(parse_max("50000 100000\n"), (Some(50_000), Some(100_000)));
        assert_eq!(parse_max("max 100000"), (None, Some(100_000)));
    }
}
