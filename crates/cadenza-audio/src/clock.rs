//! Master reference clock.
//!
//! The clock maps stream timestamps to system (monotonic) time through an
//! anchor point and reports how far observed playback strays from that
//! mapping. It is shared with the other cores of the player and owns its own
//! lock; callers must not hold the output lock while invoking a method that
//! could re-enter another subsystem.
//!
//! Drift sign convention: **positive = late** (the observed system time of a
//! stream position lies after the predicted one).

use parking_lot::Mutex;

use crate::time::{tick_now, Tick};

#[derive(Debug, Clone, Copy)]
struct Anchor {
    system: Tick,
    stream: Tick,
}

#[derive(Debug)]
struct ClockInner {
    /// Test/simulation time override; `None` follows the monotonic clock.
    manual_now: Option<Tick>,
    anchor: Option<Anchor>,
    /// Playback rate the anchor was established at.
    anchor_rate: f32,
    delay: Tick,
}

#[derive(Debug)]
pub struct MediaClock {
    inner: Mutex<ClockInner>,
}

impl MediaClock {
    /// Clock following the process monotonic time.
    pub fn new() -> MediaClock {
        MediaClock {
            inner: Mutex::new(ClockInner {
                manual_now: None,
                anchor: None,
                anchor_rate: 1.0,
                delay: 0,
            }),
        }
    }

    /// Clock with manually driven time, for simulation and tests.
    pub fn manual(start: Tick) -> MediaClock {
        let clock = MediaClock::new();
        clock.inner.lock().manual_now = Some(start);
        clock
    }

    /// Current time as this clock sees it.
    pub fn now(&self) -> Tick {
        self.inner.lock().manual_now.unwrap_or_else(tick_now)
    }

    /// Advances manual time. No effect on a monotonic clock.
    pub fn advance(&self, delta: Tick) {
        let mut inner = self.inner.lock();
        if let Some(now) = inner.manual_now.as_mut() {
            *now += delta;
        }
    }

    /// Converts a stream timestamp to the system date it should be audible
    /// at. Unanchored clocks schedule for `system_now`.
    pub fn convert_to_system(&self, system_now: Tick, ts: Tick, rate: f32) -> Tick {
        let inner = self.inner.lock();
        match inner.anchor {
            Some(anchor) => {
                anchor.system + scaled(ts - anchor.stream, rate) + inner.delay
            }
            None => system_now + inner.delay,
        }
    }

    /// Feeds an observed (system, stream) point and returns the drift against
    /// the anchored mapping, or `None` when the point (re-)anchors the clock
    /// (first point, after a reset, or across a rate change).
    pub fn update(&self, system_ts: Tick, ts: Tick, rate: f32) -> Option<Tick> {
        let mut inner = self.inner.lock();
        let rate_changed = (inner.anchor_rate - rate).abs() > f32::EPSILON;
        match inner.anchor {
            Some(anchor) if !rate_changed => {
                let predicted = anchor.system + scaled(ts - anchor.stream, rate) + inner.delay;
                Some(system_ts - predicted)
            }
            _ => {
                inner.anchor = Some(Anchor {
                    system: system_ts - inner.delay,
                    stream: ts,
                });
                inner.anchor_rate = rate;
                None
            }
        }
    }

    /// Forgets the anchor; the next update re-establishes the mapping.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.anchor = None;
        inner.anchor_rate = 1.0;
    }

    /// Replaces the extra output delay and returns the difference against the
    /// previous one.
    pub fn set_delay(&self, delay: Tick) -> Tick {
        let mut inner = self.inner.lock();
        let delta = delay - inner.delay;
        inner.delay = delay;
        delta
    }

    pub fn delay(&self) -> Tick {
        self.inner.lock().delay
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Scales a stream interval to system time at the given playback rate.
fn scaled(interval: Tick, rate: f32) -> Tick {
    (interval as f64 / rate as f64).round() as Tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::tick_from_ms;

    #[test]
    fn first_update_anchors_without_drift() {
        let clock = MediaClock::manual(0);
        assert_eq!(clock.update(1_000, 0, 1.0), None);
    }

    #[test]
    fn consistent_points_have_zero_drift() {
        let clock = MediaClock::manual(0);
        let _ = clock.update(10_000, 0, 1.0);
        assert_eq!(clock.update(31_333, 21_333, 1.0), Some(0));
        assert_eq!(clock.update(52_666, 42_666, 1.0), Some(0));
    }

    #[test]
    fn late_points_have_positive_drift() {
        let clock = MediaClock::manual(0);
        let _ = clock.update(0, 0, 1.0);
        assert_eq!(clock.update(25_000, 20_000, 1.0), Some(5_000));
    }

    #[test]
    fn convert_follows_the_anchor() {
        let clock = MediaClock::manual(0);
        let _ = clock.update(5_000, 1_000, 1.0);
        assert_eq!(clock.convert_to_system(0, 2_000, 1.0), 6_000);
    }

    #[test]
    fn convert_scales_with_rate() {
        let clock = MediaClock::manual(0);
        let _ = clock.update(0, 0, 2.0);
        // 40ms of stream time elapses in 20ms of system time at 2x.
        assert_eq!(
            clock.convert_to_system(0, tick_from_ms(40), 2.0),
            tick_from_ms(20)
        );
    }

    #[test]
    fn rate_change_reanchors() {
        let clock = MediaClock::manual(0);
        let _ = clock.update(0, 0, 1.0);
        assert_eq!(clock.update(50_000, 40_000, 2.0), None);
        assert_eq!(clock.update(60_000, 60_000, 2.0), Some(0));
    }

    #[test]
    fn set_delay_returns_delta_and_shifts_conversion() {
        let clock = MediaClock::manual(0);
        let _ = clock.update(0, 0, 1.0);
        let base = clock.convert_to_system(0, 10_000, 1.0);
        assert_eq!(clock.set_delay(tick_from_ms(50)), tick_from_ms(50));
        assert_eq!(
            clock.convert_to_system(0, 10_000, 1.0),
            base + tick_from_ms(50)
        );
        assert_eq!(clock.set_delay(tick_from_ms(20)), -tick_from_ms(30));
    }

    #[test]
    fn reset_forgets_the_anchor() {
        let clock = MediaClock::manual(0);
        let _ = clock.update(0, 0, 1.0);
        clock.reset();
        assert_eq!(clock.update(123, 456, 1.0), None);
    }

    #[test]
    fn manual_time_advances() {
        let clock = MediaClock::manual(100);
        assert_eq!(clock.now(), 100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
    }
}
