/// Simulation time. Monotonic, non-negative during a run; `TIME_INFINITY`
/// is the sentinel for "no pending work".
pub type Time = f64;

/// Sentinel timestamp that compares greater than every real event time.
pub const TIME_INFINITY: Time = f64::INFINITY;

/// Compare two timestamps with a relative tolerance of one ulp.
///
/// Receive times are produced by repeated additions of deltas on different
/// ranks, so two logically-equal timestamps may differ in the last bit.
pub fn time_equals(lhs: Time, rhs: Time) -> bool {
    if lhs == rhs {
        return true; // also covers both infinite
    }
    let scale = lhs.abs().max(rhs.abs());
    (lhs - rhs).abs() <= scale * f64::EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_near_equality() {
        assert!(time_equals(1.5, 1.5));
        assert!(time_equals(TIME_INFINITY, TIME_INFINITY));
        assert!(time_equals(0.1 + 0.2, 0.3));
        assert!(!time_equals(1.0, 1.0 + 1e-9));
        assert!(!time_equals(1.0, TIME_INFINITY));
    }
}
