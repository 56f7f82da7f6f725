//! Time helpers shared by both endpoints

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds.
///
/// # Panics
/// Panics if the system clock is before the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_millis() as u64
}

/// Current Unix timestamp in seconds.
///
/// # Panics
/// Panics if the system clock is before the Unix epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_secs() as i64
}

/// Milliseconds elapsed since a `now_millis` timestamp.
///
/// Returns 0 for timestamps in the future.
pub fn millis_since(then: u64) -> u64 {
    now_millis().saturating_sub(then)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_positive() {
        assert!(now_millis() > 0);
        assert!(now_secs() > 0);
    }

    #[test]
    fn test_millis_since_future_is_zero() {
        assert_eq!(millis_since(now_millis() + 60_000), 0);
    }

    #[test]
    fn test_millis_since_advances() {
        let then = now_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(millis_since(then) >= 5);
    }
}
