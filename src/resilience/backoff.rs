//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Calculate exponential backoff delay with jitter.
///
/// Attempt 1 waits `base_ms`, each further attempt doubles it, capped at `max_ms`.
/// Up to 10% jitter is added on top so devices behind one switch do not reconnect in
/// lockstep.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, 1_000, 30_000), Duration::ZERO);

        let b1 = calculate_backoff(1, 1_000, 30_000);
        assert!(b1 >= Duration::from_millis(1_000) && b1 < Duration::from_millis(1_100));

        let b3 = calculate_backoff(3, 1_000, 30_000);
        assert!(b3 >= Duration::from_millis(4_000) && b3 < Duration::from_millis(4_400));

        let capped = calculate_backoff(40, 1_000, 30_000);
        assert!(capped >= Duration::from_millis(30_000) && capped < Duration::from_millis(33_000));
    }
}
