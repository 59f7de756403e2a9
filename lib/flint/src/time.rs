use lazy_static::lazy_static;
use std::time::{Instant, SystemTime};

lazy_static! {
    static ref START: Instant = Instant::now();
}

/// Milliseconds elapsed since the first call in this process. Monotonic.
#[inline]
pub fn monotonic_ms() -> u64 {
    START.elapsed().as_millis() as u64
}

/// Seconds elapsed since 1970-01-01.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_ms_does_not_go_backwards() {
        let first = monotonic_ms();
        let second = monotonic_ms();

        assert!(second >= first);
    }

    #[test]
    fn test_timestamp_secs_is_past_2020() {
        assert!(timestamp_secs() > 1_577_836_800);
    }
}
