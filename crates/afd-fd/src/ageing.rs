//! Ageing of failed queue entries.
//!
//! A failed job is pushed back in the queue by raising its msg-number. The
//! first `retry_threshold` retries cost `before_threshold` each; after that
//! the penalty grows with every retry. Class 0 disables ageing.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgeingClass {
    pub retry_threshold: u32,
    pub before_threshold: f64,
    pub after_threshold: f64,
}

const fn class(retry_threshold: u32, before_threshold: f64) -> AgeingClass {
    AgeingClass {
        retry_threshold,
        before_threshold,
        after_threshold: before_threshold * 10.0,
    }
}

pub const AGEING_TABLE: [AgeingClass; 10] = [
    class(0, 0.0),
    class(12, 10_000.0),
    class(10, 20_000.0),
    class(9, 50_000.0),
    class(8, 100_000.0),
    class(7, 200_000.0),
    class(6, 500_000.0),
    class(5, 1_000_000.0),
    class(4, 2_000_000.0),
    class(3, 5_000_000.0),
];

pub fn class_of(ageing: u8) -> AgeingClass {
    AGEING_TABLE[(ageing as usize).min(AGEING_TABLE.len() - 1)]
}

/// Entries at or above this msg-number are not aged any further.
pub fn max_threshold(now: i64) -> f64 {
    now as f64 * 10000.0 * 20.0
}

/// The msg-number of an entry after its `retries`-th failure.
pub fn aged_msg_number(msg_number: f64, retries: u32, ageing: u8, now: i64) -> f64 {
    if msg_number >= max_threshold(now) {
        return msg_number;
    }
    let c = class_of(ageing);
    if retries < c.retry_threshold {
        msg_number + c.before_threshold
    } else {
        msg_number + c.after_threshold * (retries - c.retry_threshold + 1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_before_threshold_is_flat() {
        let n = aged_msg_number(1000.0, 1, 5, 1_000_000);
        assert_eq!(n, 1000.0 + 200_000.0);
    }

    #[test]
    fn test_after_threshold_grows() {
        let c = class_of(9);
        let first = aged_msg_number(0.0, c.retry_threshold, 9, 1_000_000);
        let second = aged_msg_number(0.0, c.retry_threshold + 1, 9, 1_000_000);
        assert_eq!(first, 50_000_000.0);
        assert_eq!(second, 100_000_000.0);
    }

    #[test]
    fn test_class_zero_never_ages() {
        assert_eq!(aged_msg_number(5.0, 0, 0, 1_000_000), 5.0);
        assert_eq!(aged_msg_number(5.0, 40, 0, 1_000_000), 5.0);
    }

    #[test]
    fn test_capped_at_max_threshold() {
        let now = 100;
        let high = max_threshold(now) + 1.0;
        assert_eq!(aged_msg_number(high, 3, 9, now), high);
    }

    #[test]
    fn test_out_of_range_class_clamps() {
        assert_eq!(class_of(42), AGEING_TABLE[9]);
    }
}
