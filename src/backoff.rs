//! Reconnect backoff shared by the STT and TTS upstream clients (§4.2/§4.3).
//!
//! Full jitter: `delay = min(5000, 300 * 2^attempt) + uniform(0, 200)`,
//! capped at 6 attempts (`attempt` in `0..6`).

use rand::Rng;

pub const MAX_RECONNECT_ATTEMPTS: u32 = 6;
const BASE_MS: u64 = 300;
const BASE_CAP_MS: u64 = 5000;
const JITTER_MAX_MS: u64 = 200;

/// The deterministic part of the backoff: `min(5000, 300 * 2^attempt)`.
pub fn base_delay_ms(attempt: u32) -> u64 {
    BASE_MS.saturating_mul(1u64 << attempt.min(63)).min(BASE_CAP_MS)
}

/// Full delay including uniform jitter in `[0, 200]` ms.
pub fn delay_ms(attempt: u32) -> u64 {
    let jitter = rand::rng().random_range(0..=JITTER_MAX_MS);
    base_delay_ms(attempt) + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_each_attempt() {
        assert_eq!(base_delay_ms(0), 300);
        assert_eq!(base_delay_ms(1), 600);
        assert_eq!(base_delay_ms(2), 1200);
        assert_eq!(base_delay_ms(3), 2400);
        assert_eq!(base_delay_ms(4), 4800);
    }

    #[test]
    fn base_delay_clamps_at_5000() {
        assert_eq!(base_delay_ms(5), 5000);
        assert_eq!(base_delay_ms(10), 5000);
    }

    #[test]
    fn delay_stays_within_bounds_for_each_attempt() {
        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            for _ in 0..50 {
                let d = delay_ms(attempt);
                let base = base_delay_ms(attempt);
                assert!(d >= base, "delay {d} below base {base} at attempt {attempt}");
                assert!(d <= base + 200, "delay {d} above base+200 at attempt {attempt}");
                assert!(d <= 5200, "delay {d} exceeds overall cap");
            }
        }
    }
}
