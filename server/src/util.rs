use chrono::{DateTime, Duration, Utc};

const EXPIRY_MARGIN_SECS: i64 = 30;

pub fn check_expired(expires_at: DateTime<Utc>) -> bool {
    let now_with_margin = Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS);
    now_with_margin > expires_at
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_expired_margin() {
        assert!(check_expired(Utc::now() + Duration::seconds(10)));
        assert!(!check_expired(Utc::now() + Duration::seconds(120)));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
