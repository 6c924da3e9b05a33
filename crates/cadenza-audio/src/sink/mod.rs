//! Platform audio sink abstraction.
//!
//! A sink is modeled as a capability set: `open`, `play`, `flush` and `close`
//! are mandatory, the rest is optional and queried at stream construction.
//! Whether `can_report_delay` is true selects between sink-latency
//! synchronization and the timing-report interpolation model.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::MediaClock;
use crate::error::AudioError;
use crate::filter::FiltersCfg;
use crate::format::AudioFormat;
use crate::time::Tick;
use crate::Block;

#[cfg(feature = "native")]
pub mod native;

/// A platform audio output.
///
/// All methods take `&self`; implementations manage their own concurrency.
/// `play` may block on the device, and the core never interrupts it: a
/// misbehaving sink manifests as drift and is handled by the sync
/// controller.
pub trait Sink: Send + Sync {
    /// Negotiates an output. `mixer_format` arrives as the stream input
    /// format and leaves as what the device actually consumes;
    /// `filter_format` may be adjusted for codec fallbacks, and
    /// `filters_cfg` carries hints for the chain builder.
    fn open(
        &self,
        mixer_format: &mut AudioFormat,
        profile: i32,
        filter_format: &mut AudioFormat,
        filters_cfg: &mut FiltersCfg,
    ) -> Result<(), AudioError>;

    fn close(&self);

    /// Queues a block for playback at `system_pts`. The date must not be
    /// modified by the sink.
    fn play(&self, block: Block, system_pts: Tick);

    fn flush(&self);

    /// Whether [`delay`](Sink::delay) is implemented.
    fn can_report_delay(&self) -> bool {
        false
    }

    /// Time until a sample written now becomes audible, when known.
    fn delay(&self) -> Option<Tick> {
        None
    }

    fn can_pause(&self) -> bool {
        false
    }

    fn pause(&self, paused: bool, date: Tick) {
        let _ = (paused, date);
    }

    fn can_drain(&self) -> bool {
        false
    }

    /// Starts a native drain; completion arrives through `NotifyDrained`.
    fn drain(&self) {}

    fn can_set_volume(&self) -> bool {
        false
    }

    fn set_volume(&self, volume: f32, mute: bool) {
        let _ = (volume, mute);
    }
}

/// A played block as recorded by [`NullSink`].
#[derive(Debug, Clone)]
pub struct PlayedBlock {
    pub pts: Tick,
    pub system_pts: Tick,
    pub nb_samples: u32,
    pub length: Tick,
    /// True when every byte of the buffer is zero.
    pub silent: bool,
}

#[derive(Debug, Default)]
struct NullSinkState {
    played: Vec<PlayedBlock>,
    flushes: u32,
    pauses: Vec<(bool, Tick)>,
    drains: u32,
    volume: Option<(f32, bool)>,
    open: bool,
}

enum DelayModel {
    /// No latency reporting; timing arrives out of band.
    None,
    /// Fixed, test-adjustable report.
    Scripted(Mutex<Option<Tick>>),
    /// Device-queue emulation: the report is `base` plus whatever has been
    /// queued and not yet played off against the clock.
    Queue {
        base: Tick,
        clock: Arc<MediaClock>,
        buffered_until: Mutex<Option<Tick>>,
    },
}

/// Headless sink: records every interaction and reports a modeled delay.
///
/// Capabilities are chosen at construction so tests and headless players can
/// exercise both synchronization models.
pub struct NullSink {
    state: Mutex<NullSinkState>,
    delay: DelayModel,
    handles_pause: bool,
    handles_drain: bool,
    handles_volume: bool,
    fail_next_open: AtomicBool,
}

impl NullSink {
    fn with_model(
        delay: DelayModel,
        handles_drain: bool,
        handles_volume: bool,
    ) -> Arc<NullSink> {
        Arc::new(NullSink {
            state: Mutex::new(NullSinkState::default()),
            delay,
            handles_pause: true,
            handles_drain,
            handles_volume,
            fail_next_open: AtomicBool::new(false),
        })
    }

    /// Sink with a fixed, adjustable delay report.
    pub fn with_delay(delay: Tick) -> Arc<NullSink> {
        NullSink::with_model(DelayModel::Scripted(Mutex::new(Some(delay))), false, false)
    }

    /// Sink emulating a device queue draining against `clock`.
    pub fn with_queue_model(clock: Arc<MediaClock>, base: Tick) -> Arc<NullSink> {
        NullSink::with_model(
            DelayModel::Queue {
                base,
                clock,
                buffered_until: Mutex::new(None),
            },
            false,
            false,
        )
    }

    /// Sink without latency reporting (timing arrives out of band).
    pub fn without_time_get() -> Arc<NullSink> {
        NullSink::with_model(DelayModel::None, false, false)
    }

    /// Sink with a native drain and device volume control.
    pub fn with_native_drain(delay: Tick) -> Arc<NullSink> {
        NullSink::with_model(DelayModel::Scripted(Mutex::new(Some(delay))), true, true)
    }

    pub fn set_reported_delay(&self, delay: Option<Tick>) {
        if let DelayModel::Scripted(scripted) = &self.delay {
            *scripted.lock() = delay;
        }
    }

    /// Makes the next `open` fail, for restart-failure tests.
    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::Release);
    }

    pub fn played(&self) -> Vec<PlayedBlock> {
        self.state.lock().played.clone()
    }

    pub fn played_count(&self) -> usize {
        self.state.lock().played.len()
    }

    pub fn flush_count(&self) -> u32 {
        self.state.lock().flushes
    }

    pub fn pauses(&self) -> Vec<(bool, Tick)> {
        self.state.lock().pauses.clone()
    }

    pub fn drain_count(&self) -> u32 {
        self.state.lock().drains
    }

    pub fn last_volume(&self) -> Option<(f32, bool)> {
        self.state.lock().volume
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl Sink for NullSink {
    fn open(
        &self,
        mixer_format: &mut AudioFormat,
        _profile: i32,
        _filter_format: &mut AudioFormat,
        _filters_cfg: &mut FiltersCfg,
    ) -> Result<(), AudioError> {
        if self.fail_next_open.swap(false, Ordering::AcqRel) {
            return Err(AudioError::SinkOpenFailed("device unavailable".into()));
        }
        // The null device consumes anything; keep the negotiated format.
        mixer_format.prepare();
        self.state.lock().open = true;
        Ok(())
    }

    fn close(&self) {
        self.state.lock().open = false;
    }

    fn play(&self, block: Block, system_pts: Tick) {
        if let DelayModel::Queue {
            clock,
            buffered_until,
            ..
        } = &self.delay
        {
            let now = clock.now();
            let mut buffered = buffered_until.lock();
            let start = buffered.unwrap_or(now).max(now);
            *buffered = Some(start + block.length);
        }
        let mut state = self.state.lock();
        state.played.push(PlayedBlock {
            pts: block.pts,
            system_pts,
            nb_samples: block.nb_samples,
            length: block.length,
            silent: block.data.iter().all(|b| *b == 0),
        });
    }

    fn flush(&self) {
        if let DelayModel::Queue { buffered_until, .. } = &self.delay {
            *buffered_until.lock() = None;
        }
        self.state.lock().flushes += 1;
    }

    fn can_report_delay(&self) -> bool {
        !matches!(self.delay, DelayModel::None)
    }

    fn delay(&self) -> Option<Tick> {
        match &self.delay {
            DelayModel::None => None,
            DelayModel::Scripted(scripted) => *scripted.lock(),
            DelayModel::Queue {
                base,
                clock,
                buffered_until,
            } => {
                let now = clock.now();
                let queued = buffered_until
                    .lock()
                    .map(|until| (until - now).max(0))
                    .unwrap_or(0);
                Some(base + queued)
            }
        }
    }

    fn can_pause(&self) -> bool {
        self.handles_pause
    }

    fn pause(&self, paused: bool, date: Tick) {
        self.state.lock().pauses.push((paused, date));
    }

    fn can_drain(&self) -> bool {
        self.handles_drain
    }

    fn drain(&self) {
        self.state.lock().drains += 1;
    }

    fn can_set_volume(&self) -> bool {
        self.handles_volume
    }

    fn set_volume(&self, volume: f32, mute: bool) {
        self.state.lock().volume = Some((volume, mute));
    }
}
