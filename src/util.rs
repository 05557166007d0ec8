use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{Error, Result};

/// Shared argument validation for recipe constructors: every recipe path
/// (election path, barrier path, queue path, names path, ...) must be
/// non-empty. Fails synchronously at construction, per the error-handling
/// policy of validating arguments before any Store call is made.
pub fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        Err(Error::InvalidArgument(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

/// Shared validation for counts that must be positive (e.g. a counted
/// barrier's member count).
pub fn require_positive(field: &str, value: u32) -> Result<()> {
    if value == 0 {
        Err(Error::InvalidArgument(format!("{field} must be positive")))
    } else {
        Ok(())
    }
}

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Builds the `<clientId>:<rand9>` unique token a recipe writes as a key's
/// value to prove it (and not some other racer) wrote that key.
pub fn unique_token(client_id: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("{client_id}:{suffix}")
}

/// Formats a FIFO queue sequence number as a fixed-width, lexicographically
/// sortable key suffix.
pub fn format_seq(seq: u64) -> String {
    format!("{seq:016}")
}

/// Formats a priority queue's priority bucket as a fixed-width,
/// lexicographically sortable key segment. Lower numbers sort first.
pub fn format_priority(priority: u32) -> String {
    format!("{priority:05}")
}

/// Randomized CAS retry backoff: uniform in `[0, attempt * base)`.
///
/// `attempt` is 1-based (the delay before the *first* retry uses `attempt == 1`).
pub fn cas_backoff(attempt: u32, base: std::time::Duration) -> std::time::Duration {
    if attempt == 0 {
        return std::time::Duration::ZERO;
    }
    let max_millis = (base.as_millis() as u64).saturating_mul(attempt as u64);
    if max_millis == 0 {
        return std::time::Duration::ZERO;
    }
    let jitter = rand::thread_rng().gen_range(0..max_millis);
    std::time::Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_token_has_client_prefix_and_nine_char_suffix() {
        let token = unique_token("client-0");
        let (prefix, suffix) = token.split_once(':').expect("token has a colon");
        assert_eq!(prefix, "client-0");
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn unique_tokens_are_distinct() {
        let a = unique_token("c");
        let b = unique_token("c");
        assert_ne!(a, b);
    }

    #[test]
    fn format_seq_is_fixed_width_and_sortable() {
        assert_eq!(format_seq(0), "0000000000000000");
        assert_eq!(format_seq(9), "0000000000000009");
        assert!(format_seq(9) < format_seq(10));
        assert!(format_seq(999) < format_seq(1000));
    }

    #[test]
    fn format_priority_is_fixed_width_and_sortable() {
        assert_eq!(format_priority(1), "00001");
        assert_eq!(format_priority(10), "00010");
        assert!(format_priority(1) < format_priority(10));
    }

    #[test]
    fn cas_backoff_zero_attempt_is_zero() {
        assert_eq!(
            cas_backoff(0, std::time::Duration::from_millis(100)),
            std::time::Duration::ZERO
        );
    }

    #[test]
    fn cas_backoff_is_bounded_by_attempt_times_base() {
        let base = std::time::Duration::from_millis(100);
        for attempt in 1..10 {
            let delay = cas_backoff(attempt, base);
            assert!(delay < base * attempt);
        }
    }

    #[test]
    fn require_non_empty_rejects_blank() {
        assert!(require_non_empty("election_path", "").is_err());
        assert!(require_non_empty("election_path", "/election/a").is_ok());
    }

    #[test]
    fn require_positive_rejects_zero() {
        assert!(require_positive("member_count", 0).is_err());
        assert!(require_positive("member_count", 1).is_ok());
    }
}
