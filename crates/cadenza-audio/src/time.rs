//! Tick arithmetic: microsecond timestamps on a process-wide monotonic epoch.
//!
//! All presentation and system timestamps in the audio core are `Tick`s
//! (microseconds). The epoch is the first observation of the monotonic clock
//! in this process, so ticks are comparable across threads but meaningless
//! across processes.

use once_cell::sync::Lazy;
use std::time::Instant;

/// Microseconds on the process monotonic epoch.
pub type Tick = i64;

/// Ticks per second.
pub const CLOCK_FREQ: Tick = 1_000_000;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Current monotonic time.
pub fn tick_now() -> Tick {
    EPOCH.elapsed().as_micros() as Tick
}

pub const fn tick_from_ms(ms: i64) -> Tick {
    ms * 1_000
}

pub const fn ms_from_tick(tick: Tick) -> i64 {
    tick / 1_000
}

/// Duration of `samples` samples at `rate` Hz.
pub fn tick_from_samples(samples: i64, rate: u32) -> Tick {
    debug_assert!(rate > 0);
    samples * CLOCK_FREQ / rate as i64
}

/// Number of whole samples at `rate` Hz fitting in `tick`.
pub fn samples_from_tick(tick: Tick, rate: u32) -> i64 {
    debug_assert!(rate > 0);
    tick * rate as i64 / CLOCK_FREQ
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_roundtrip_at_common_rates() {
        for rate in [4_000u32, 44_100, 48_000, 96_000, 768_000] {
            let samples = rate as i64; // one second
            assert_eq!(tick_from_samples(samples, rate), CLOCK_FREQ);
            assert_eq!(samples_from_tick(CLOCK_FREQ, rate), samples);
        }
    }

    #[test]
    fn ms_conversions() {
        assert_eq!(tick_from_ms(100), 100_000);
        assert_eq!(ms_from_tick(tick_from_ms(42)), 42);
    }

    #[test]
    fn now_is_monotonic() {
        let a = tick_now();
        let b = tick_now();
        assert!(b >= a);
    }
}
