//! Time utilities shared by the psgrid crates.

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since UNIX_EPOCH.
///
/// Used for task start/finish stamps and worker reports. A clock set before
/// the epoch yields 0 rather than panicking.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_current_timestamp_millis() {
        let timestamp1 = current_timestamp_millis();
        thread::sleep(Duration::from_millis(10));
        let timestamp2 = current_timestamp_millis();

        assert!(timestamp2 > timestamp1);
        assert!(timestamp2 - timestamp1 >= 10);
    }
}
