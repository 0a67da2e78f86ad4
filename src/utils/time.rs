//! Small time helpers shared across modules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_millis_is_monotonic_enough() {
        let a = unix_millis();
        let b = unix_millis();
        assert!(b >= a);
        // sanity: after 2020, before 2100
        assert!(a > 1_577_836_800_000);
        assert!(a < 4_102_444_800_000);
    }
}
