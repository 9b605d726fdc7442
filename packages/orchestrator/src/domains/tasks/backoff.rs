//! Retry backoff and state-deadline arithmetic.
//!
//! Pure functions of (retry_count, base, cap) and (state entry time,
//! deadline), so the curves are testable without a store or broker.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Delay before the next attempt: `base * 2^(retry_count - 1)`, capped.
///
/// `retry_count` is the count after the failed attempt was recorded, so the
/// first retry waits `base`, the second `2 * base`, and so on.
pub fn retry_delay(retry_count: i32, base: Duration, cap: Duration) -> Duration {
    let exponent = retry_count.saturating_sub(1).clamp(0, 62) as u32;
    let secs = base
        .as_secs()
        .checked_shl(exponent)
        .unwrap_or(u64::MAX);
    cap.min(Duration::from_secs(secs))
}

/// When a retried task becomes due again.
pub fn next_attempt_at(
    now: DateTime<Utc>,
    retry_count: i32,
    base: Duration,
    cap: Duration,
) -> DateTime<Utc> {
    now + chrono::Duration::from_std(retry_delay(retry_count, base, cap))
        .unwrap_or_else(|_| chrono::Duration::seconds(cap.as_secs() as i64))
}

/// Whether a lease has expired: the row entered its current state at
/// `entered_at` and the state's deadline has passed.
pub fn deadline_exceeded(
    entered_at: DateTime<Utc>,
    deadline: Duration,
    now: DateTime<Utc>,
) -> bool {
    match chrono::Duration::from_std(deadline) {
        Ok(d) => now - entered_at > d,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(60);
    const CAP: Duration = Duration::from_secs(3600);

    #[test]
    fn first_retry_waits_base() {
        assert_eq!(retry_delay(1, BASE, CAP), Duration::from_secs(60));
    }

    #[test]
    fn delay_doubles_per_retry() {
        assert_eq!(retry_delay(2, BASE, CAP), Duration::from_secs(120));
        assert_eq!(retry_delay(3, BASE, CAP), Duration::from_secs(240));
        assert_eq!(retry_delay(4, BASE, CAP), Duration::from_secs(480));
    }

    #[test]
    fn delay_is_capped() {
        assert_eq!(retry_delay(7, BASE, CAP), CAP);
        assert_eq!(retry_delay(100, BASE, CAP), CAP);
    }

    #[test]
    fn zero_retry_count_behaves_like_one() {
        assert_eq!(retry_delay(0, BASE, CAP), Duration::from_secs(60));
    }

    #[test]
    fn huge_retry_counts_do_not_overflow() {
        assert_eq!(retry_delay(i32::MAX, BASE, CAP), CAP);
    }

    #[test]
    fn next_attempt_is_in_the_future() {
        let now = Utc::now();
        let at = next_attempt_at(now, 1, BASE, CAP);
        assert_eq!(at - now, chrono::Duration::seconds(60));
    }

    #[test]
    fn deadline_not_exceeded_within_window() {
        let now = Utc::now();
        let entered = now - chrono::Duration::seconds(30);
        assert!(!deadline_exceeded(entered, Duration::from_secs(60), now));
    }

    #[test]
    fn deadline_exceeded_past_window() {
        let now = Utc::now();
        let entered = now - chrono::Duration::seconds(61);
        assert!(deadline_exceeded(entered, Duration::from_secs(60), now));
    }
}
