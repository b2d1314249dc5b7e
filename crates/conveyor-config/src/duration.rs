//! Duration strings.

use std::time::Duration;

/// Parse human-friendly durations like "500ms", "30s", "1m", "2h30m".
///
/// Every number needs a unit. Zero-length durations are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.trim().chars().peekable();

    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
            continue;
        }

        let n: u64 = num_buf.parse().ok()?;
        num_buf.clear();
        let unit_ms = match ch {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            'd' => 86_400_000,
            'h' => 3_600_000,
            'm' => 60_000,
            's' => 1_000,
            _ => return None,
        };
        total_ms = total_ms.checked_add(n.checked_mul(unit_ms)?)?;
    }

    if !num_buf.is_empty() || total_ms == 0 {
        return None;
    }

    Some(Duration::from_millis(total_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_valid() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(
            parse_duration("1h30m"),
            Some(Duration::from_secs(3600 + 30 * 60))
        );
    }

    #[test]
    fn parse_duration_invalid() {
        assert_eq!(parse_duration("banana"), None);
        assert_eq!(parse_duration("30"), None);
        assert_eq!(parse_duration("0s"), None);
        assert_eq!(parse_duration(""), None);
    }
}
