use rand::Rng;
use std::time::Duration;

/// Returns `base` plus a random offset in `[0, base * spread]`.
///
/// Nodes started at the same moment would otherwise scan in lockstep and race
/// for the same rows on every tick.
pub fn jittered(base: Duration, spread: f64) -> Duration {
    let max_extra_ms = (base.as_millis() as f64 * spread.clamp(0.0, 1.0)) as u64;
    if max_extra_ms == 0 {
        return base;
    }
    let mut rng = rand::thread_rng();
    base + Duration::from_millis(rng.gen_range(0..=max_extra_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_spread() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let d = jittered(base, 0.5);
            assert!(d >= base && d <= Duration::from_millis(150), "{:?}", d);
        }
    }

    #[test]
    fn zero_spread_is_identity() {
        assert_eq!(jittered(Duration::from_millis(40), 0.0), Duration::from_millis(40));
    }
}
