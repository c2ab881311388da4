use std::time::Duration;

/// Attempts beyond this no longer grow the delay
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// `base * 2^(min(n, 6) - 1)`; attempt 0 is treated as attempt 1
pub fn compute_backoff(attempt: u32, base: Duration) -> Duration {
    let n = attempt.clamp(1, MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u32 << (n - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let base = Duration::from_millis(1000);
        let schedule: Vec<u64> = (1..=8)
            .map(|n| compute_backoff(n, base).as_millis() as u64)
            .collect();
        assert_eq!(schedule, vec![1000, 2000, 4000, 8000, 16000, 32000, 32000, 32000]);
    }

    #[test]
    fn test_non_decreasing_and_capped() {
        let base = Duration::from_millis(250);
        let mut previous = Duration::ZERO;
        for n in 0..100 {
            let delay = compute_backoff(n, base);
            assert!(delay >= previous);
            assert!(delay <= compute_backoff(MAX_BACKOFF_EXPONENT, base));
            previous = delay;
        }
    }
}
