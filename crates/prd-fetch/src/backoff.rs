//! Exponential backoff with jitter for the retry queue.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `retry_num` (1-based): `base * 2^(n-1)`,
/// jittered by a uniform factor in `[0.7, 1.2)` and capped at `max`. The
/// jitter keeps a burst of failed transfers from retrying in lockstep.
pub fn retry_delay(retry_num: u32, base: Duration, max: Duration) -> Duration {
    if retry_num == 0 {
        return Duration::ZERO;
    }
    let exp = 2f64.powi(retry_num.saturating_sub(1).min(31) as i32);
    let jitter = rand::thread_rng().gen_range(0.7..1.2);
    let delay = base.mul_f64(exp * jitter);
    delay.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(5);

    #[test]
    fn no_delay_before_first_attempt() {
        assert_eq!(retry_delay(0, BASE, MAX), Duration::ZERO);
    }

    #[test]
    fn delays_stay_inside_jitter_envelope() {
        for n in 1..=6 {
            let nominal = BASE.mul_f64(2f64.powi(n as i32 - 1));
            for _ in 0..50 {
                let d = retry_delay(n, BASE, MAX);
                assert!(d >= nominal.mul_f64(0.7), "retry {n}: {d:?} too short");
                assert!(d < nominal.mul_f64(1.2).min(MAX) + Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn delays_are_capped() {
        for _ in 0..50 {
            assert!(retry_delay(10, BASE, MAX) <= MAX);
            assert!(retry_delay(30, BASE, MAX) <= MAX);
        }
    }

    #[test]
    fn expected_delay_grows_until_the_cap() {
        // the jitter ranges of consecutive retries may overlap, but the
        // lower bound of retry n+1 clears the upper bound of retry n-1
        let lower = |n: u32| BASE.mul_f64(2f64.powi(n as i32 - 1) * 0.7);
        let upper = |n: u32| BASE.mul_f64(2f64.powi(n as i32 - 1) * 1.2);
        for n in 2..=5 {
            assert!(lower(n + 1) > upper(n - 1));
        }
    }
}
