// crates/tonecut-core/src/helpers/time.rs
//
// Shared time conversions. Public operations speak milliseconds; every
// internal timestamp is a microsecond i64, so the two conversions below are
// the only place the ms/µs boundary exists.

/// Convert milliseconds to microseconds.
pub fn ms_to_us(ms: u64) -> i64 {
    ms as i64 * 1000
}

/// Convert microseconds to milliseconds, rounding to nearest.
///
/// Negative inputs clamp to zero — a rebased output timeline never goes
/// below its own origin.
pub fn us_to_ms(us: i64) -> u64 {
    if us <= 0 {
        return 0;
    }
    ((us + 500) / 1000) as u64
}

/// Format a duration in seconds as a compact human-readable string for
/// diagnostics text.
///
/// | Range    | Format    | Example   |
/// |----------|-----------|-----------|
/// | ≥ 3600 s | `H:MM:SS` | `1:04:35` |
/// | ≥ 60 s   | `M:SS`    | `3:07`    |
/// | < 60 s   | `S.Xs`    | `4.2s`    |
///
/// ```
/// use tonecut_core::helpers::time::format_duration;
/// assert_eq!(format_duration(4.2),    "4.2s");
/// assert_eq!(format_duration(187.0),  "3:07");
/// assert_eq!(format_duration(3875.0), "1:04:35");
/// ```
pub fn format_duration(secs: f64) -> String {
    if secs >= 3600.0 {
        format!(
            "{}:{:02}:{:02}",
            secs as u64 / 3600,
            (secs as u64 % 3600) / 60,
            secs as u64 % 60,
        )
    } else if secs >= 60.0 {
        format!("{}:{:02}", secs as u64 / 60, secs as u64 % 60)
    } else {
        format!("{secs:.1}s")
    }
}
