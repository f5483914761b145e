use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Return the current Unix epoch in seconds.
pub fn now_epoch_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Truncate `input` to at most `max_chars` Unicode characters, stripping
/// control characters and appending `…` when truncated.
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    let clean: String = input.chars().filter(|c| !c.is_control()).collect();
    if clean.chars().count() > max_chars {
        let mut s: String = clean.chars().take(max_chars).collect();
        s.push('…');
        s
    } else {
        clean
    }
}

pub fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Fraction removed going from `before` to `after`, zero when nothing came in.
pub fn reduction_ratio(before: usize, after: usize) -> f64 {
    if before == 0 {
        return 0.0;
    }
    1.0 - (after as f64 / before as f64)
}

#[cfg(test)]
mod tests {
    use super::{reduction_ratio, truncate_with_ellipsis};

    #[test]
    fn truncate_keeps_short_input_and_marks_long_input() {
        assert_eq!(truncate_with_ellipsis("short", 10), "short");
        assert_eq!(truncate_with_ellipsis("abcdefghij", 4), "abcd…");
        assert_eq!(truncate_with_ellipsis("a\nb", 10), "ab");
    }

    #[test]
    fn reduction_ratio_handles_empty_input() {
        assert_eq!(reduction_ratio(0, 0), 0.0);
        assert!((reduction_ratio(10, 8) - 0.2).abs() < 1e-9);
    }
}
