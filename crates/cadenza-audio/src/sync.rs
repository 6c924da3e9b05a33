//! Synchronization state and thresholds.
//!
//! Drift sign convention, here and in the stream: **positive = late** (the
//! block would be audible after its intended date), **negative = early**.

use crate::time::{tick_from_ms, Tick};

/// Tolerated lateness before corrective resampling kicks in.
pub const MAX_PTS_DELAY: Tick = tick_from_ms(100);
/// Tolerated earliness before corrective resampling kicks in.
pub const MAX_PTS_ADVANCE: Tick = tick_from_ms(40);

/// Scales a threshold by the playback rate.
pub fn scale_threshold(threshold: Tick, rate: f32) -> Tick {
    (threshold as f64 / rate as f64).round() as Tick
}

/// Corrective resampling direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampling {
    #[default]
    None,
    Up,
    Down,
}

/// Play-thread synchronization state, guarded by the output lock.
#[derive(Debug)]
pub struct SyncState {
    pub resampling: Resampling,
    /// |drift| when resampling engaged; divergence beyond twice this stops
    /// the correction.
    pub start_drift: Tick,
    /// True after start or flush: thresholds are relaxed to zero.
    pub discontinuity: bool,
    /// Delay currently applied to the clock.
    pub delay: Tick,
}

impl SyncState {
    pub fn new() -> SyncState {
        SyncState {
            resampling: Resampling::None,
            start_drift: 0,
            discontinuity: true,
            delay: 0,
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing model fed by the sink, guarded by its own mutex.
///
/// `rate_audio_ts` is set iff a rate change is pending acknowledgement from
/// the sink's timing reports; `system_ts` advances monotonically between
/// flushes.
#[derive(Debug)]
pub struct Timing {
    pub first_pts: Option<Tick>,
    pub last_drift: Option<Tick>,
    pub rate_system_ts: Tick,
    pub rate_audio_ts: Option<Tick>,
    pub system_ts: Option<Tick>,
    pub audio_ts: Option<Tick>,
    pub pause_date: Option<Tick>,
    /// Samples actually handed to the sink, silence included.
    pub played_samples: i64,
    pub rate: f32,
}

impl Timing {
    pub fn new() -> Timing {
        Timing {
            first_pts: None,
            last_drift: None,
            rate_system_ts: 0,
            rate_audio_ts: None,
            system_ts: None,
            audio_ts: None,
            pause_date: None,
            played_samples: 0,
            rate: 1.0,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::new()
    }
}
