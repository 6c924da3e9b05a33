//! Stream orchestrator: lifecycle and hot path of one audio stream.
//!
//! The decoder thread calls [`Stream::play`], [`Stream::flush`] and
//! [`Stream::drain`]; control threads change pause/rate/delay and request
//! restarts; the sink's callback thread reports timing, drain completion and
//! gain. The pipeline state is guarded by the output lock, the timing model
//! by its own mutex, and everything crossing threads without a lock is an
//! atomic.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::block::{Block, BLOCK_FLAG_DISCONTINUITY};
use crate::clock::MediaClock;
use crate::config::AudioConfig;
use crate::error::AudioError;
use crate::filter::{FilterChain, FiltersCfg, ResamplerChain};
use crate::format::AudioFormat;
use crate::lock::{LockLevel, OrderedMutex};
use crate::output::AudioOutput;
use crate::sync::{scale_threshold, Resampling, SyncState, Timing, MAX_PTS_ADVANCE, MAX_PTS_DELAY};
use crate::time::{ms_from_tick, tick_from_samples, Tick};
use crate::volume::{ReplayGainInfo, Volume};

/// Rebuild the filter chain on the next play.
pub const RESTART_FILTERS: u32 = 0x1;
/// Tear down and reopen the sink (implies a filter rebuild).
pub const RESTART_OUTPUT: u32 = 0x2 | RESTART_FILTERS;

/// Sentinel for the drain-deadline atomic.
const TICK_NONE: Tick = i64::MIN;

/// Outcome of a [`Stream::play`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayResult {
    Success,
    /// The output was restarted; the decoder should renegotiate its codec.
    Changed,
    /// The pipeline is unrecoverably broken until a successful restart.
    Failed,
}

/// Parameters for [`AudioOutput::new_stream`].
pub struct StreamConfig {
    pub input_format: AudioFormat,
    /// Codec profile hint forwarded to the sink (pass-through negotiation).
    pub profile: i32,
    pub clock: Arc<MediaClock>,
    pub replay_gain: ReplayGainInfo,
    /// Identifier used in logs.
    pub str_id: Option<String>,
}

/// Pipeline state owned by the play path, guarded by the output lock.
struct Pipeline {
    /// `None` while the output is broken; play refuses until a restart.
    mixer_format: Option<AudioFormat>,
    filter_format: AudioFormat,
    filters_cfg: FiltersCfg,
    filters: Option<FilterChain>,
    resampler: Option<ResamplerChain>,
    sync: SyncState,
}

pub struct Stream {
    output: Arc<AudioOutput>,
    clock: Arc<MediaClock>,
    str_id: Option<String>,
    input_format: AudioFormat,
    profile: i32,
    bitexact: bool,
    volume: Option<Volume>,
    pipeline: OrderedMutex<Pipeline>,
    timing: parking_lot::Mutex<Timing>,
    /// Playback rate requested by the control thread (f32 bits).
    rate_bits: AtomicU32,
    /// Delay requested by the control thread, applied on the next play.
    request_delay: AtomicI64,
    restart: AtomicU32,
    buffers_lost: AtomicU32,
    buffers_played: AtomicU32,
    drained: AtomicBool,
    drain_deadline: AtomicI64,
}

fn build_chains(
    filter_format: &AudioFormat,
    mixer_format: &AudioFormat,
    cfg: &AudioConfig,
    filters_cfg: &FiltersCfg,
) -> Result<(Option<FilterChain>, Option<ResamplerChain>), AudioError> {
    let mut user_filters = cfg.filters.clone();
    if let Some(visual) = &cfg.visual {
        user_filters.push(visual.clone());
    }
    let chain = FilterChain::new(
        filter_format,
        mixer_format,
        &user_filters,
        cfg.time_stretch,
        filters_cfg,
    )?;
    let resampler = if mixer_format.codec.is_linear() {
        match ResamplerChain::new(mixer_format) {
            Ok(chain) => Some(chain),
            Err(e) => {
                debug!("drift correction unavailable: {e}");
                None
            }
        }
    } else {
        None
    };
    Ok((Some(chain), resampler))
}

impl Stream {
    /// Builds a stream against an already-configured output. Use
    /// [`AudioOutput::new_stream`].
    pub(crate) fn new(
        output: Arc<AudioOutput>,
        cfg: StreamConfig,
    ) -> Result<Arc<Stream>, AudioError> {
        cfg.input_format.validate()?;

        let audio_cfg = output.config_snapshot();
        let bitexact = audio_cfg.bitexact;

        let mut mixer_format = cfg.input_format.clone();
        let mut filter_format = cfg.input_format.clone();
        let mut filters_cfg = FiltersCfg::default();
        output.sink().open(
            &mut mixer_format,
            cfg.profile,
            &mut filter_format,
            &mut filters_cfg,
        )?;
        debug!("output {}", mixer_format.describe());

        output.meter().reset(Some(&mixer_format));

        let volume = if bitexact {
            None
        } else if Volume::supports_format(mixer_format.codec) {
            let volume = Volume::new(cfg.replay_gain);
            volume.update_replay_gain(&audio_cfg);
            Some(volume)
        } else {
            warn!(
                "software volume cannot amplify {:?} samples",
                mixer_format.codec
            );
            None
        };

        let (filters, resampler) = if bitexact {
            (None, None)
        } else {
            match build_chains(&filter_format, &mixer_format, &audio_cfg, &filters_cfg) {
                Ok(chains) => chains,
                Err(e) => {
                    output.sink().close();
                    output.meter().reset(None);
                    return Err(e);
                }
            }
        };

        let stream = Arc::new(Stream {
            clock: Arc::clone(&cfg.clock),
            str_id: cfg.str_id,
            input_format: cfg.input_format,
            profile: cfg.profile,
            bitexact,
            volume,
            pipeline: OrderedMutex::new(
                LockLevel::Output,
                Pipeline {
                    mixer_format: Some(mixer_format),
                    filter_format,
                    filters_cfg,
                    filters,
                    resampler,
                    sync: SyncState::new(),
                },
            ),
            timing: parking_lot::Mutex::new(Timing::new()),
            rate_bits: AtomicU32::new(1.0f32.to_bits()),
            request_delay: AtomicI64::new(0),
            restart: AtomicU32::new(0),
            buffers_lost: AtomicU32::new(0),
            buffers_played: AtomicU32::new(0),
            drained: AtomicBool::new(false),
            drain_deadline: AtomicI64::new(TICK_NONE),
            output,
        });
        stream.output.register_stream(&stream);
        Ok(stream)
    }

    pub fn input_format(&self) -> &AudioFormat {
        &self.input_format
    }

    pub fn str_id(&self) -> Option<&str> {
        self.str_id.as_deref()
    }

    fn rate(&self) -> f32 {
        f32::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    /*
     * Control surface
     */

    pub fn change_rate(&self, rate: f32) {
        debug_assert!(rate > 0.0);
        self.rate_bits.store(rate.to_bits(), Ordering::Release);
    }

    pub fn change_delay(&self, delay: Tick) {
        self.request_delay.store(delay, Ordering::Release);
    }

    /// Marks the stream for restart; consumed at the top of the next play so
    /// any state prepared by the writer happens-before the rebuild.
    pub fn request_restart(&self, mode: u32) {
        self.restart.fetch_or(mode, Ordering::Release);
        debug!("restart requested ({mode:#x})");
    }

    pub fn change_pause(&self, paused: bool, date: Tick) {
        let mut p = self.pipeline.lock();
        if p.mixer_format.is_none() {
            return;
        }
        debug!("{}", if paused { "paused" } else { "resumed" });

        {
            let mut timing = self.timing.lock();
            if paused {
                debug_assert!(timing.pause_date.is_none());
                timing.pause_date = Some(date);
            } else if let Some(pause_date) = timing.pause_date.take() {
                // The interpolation model must not charge the pause interval
                // against the clock.
                if let Some(system_ts) = timing.system_ts.as_mut() {
                    *system_ts += date - pause_date;
                }
            }
        }

        let sink = self.output.sink();
        if sink.can_pause() {
            sink.pause(paused, date);
        } else if paused {
            // No native pause: emulated by dropping the buffered audio.
            self.flush_locked(&mut p);
        }

        // Refresh the pending rate point after a resume.
        if !sink.can_report_delay() && !paused {
            let mut timing = self.timing.lock();
            if let Some(rate_audio_ts) = timing.rate_audio_ts {
                timing.rate_system_ts =
                    self.clock.convert_to_system(date, rate_audio_ts, self.rate());
            }
        }
    }

    /*
     * Sink callbacks
     */

    /// Out-of-band timing report from a sink without `delay`.
    /// `audio_ts` is relative to the first played sample.
    pub fn notify_timing(&self, system_ts: Tick, audio_ts: Tick) {
        let mut timing = self.timing.lock();
        let Some(first_pts) = timing.first_pts else {
            // A last point may race the teardown of the stream; once the
            // timing state is reset it carries no usable base.
            return;
        };
        let mut audio_ts = audio_ts + first_pts;

        if let Some(rate_audio_ts) = timing.rate_audio_ts {
            // Points from before the rate change are meaningless now.
            if system_ts < timing.rate_system_ts {
                return;
            }
            audio_ts = rate_audio_ts
                + ((system_ts - timing.rate_system_ts) as f64 * timing.rate as f64) as Tick;
        }

        timing.system_ts = Some(system_ts);
        timing.audio_ts = Some(audio_ts);
        timing.last_drift = self.clock.update(system_ts, audio_ts, timing.rate);
    }

    pub fn notify_drained(&self) {
        self.drained.store(true, Ordering::Relaxed);
    }

    /// Sets the user volume factor of the software amplifier.
    pub fn notify_gain(&self, gain: f32) {
        if let Some(volume) = self.volume.as_ref() {
            volume.set_volume(gain);
        }
    }

    /// Recomputes the replay-gain multiplier after a configuration change.
    pub(crate) fn refresh_replay_gain(&self, cfg: &AudioConfig) {
        if let Some(volume) = self.volume.as_ref() {
            volume.update_replay_gain(cfg);
        }
    }

    /// Returns and resets the (lost, played) buffer counters.
    pub fn get_reset_stats(&self) -> (u32, u32) {
        (
            self.buffers_lost.swap(0, Ordering::Relaxed),
            self.buffers_played.swap(0, Ordering::Relaxed),
        )
    }

    /*
     * Timing helpers
     */

    /// Time until a sample written now becomes audible: the sink's own
    /// report, or the interpolation of the last out-of-band timing point
    /// assuming a unit coefficient between the audio and monotonic clocks
    /// (the interval is small).
    fn get_delay(&self, mixer_rate: u32) -> Option<Tick> {
        let sink = self.output.sink();
        if sink.can_report_delay() {
            return sink.delay();
        }

        let timing = self.timing.lock();
        let system_ts = timing.system_ts?;
        let audio_ts = timing.audio_ts?;
        let first_pts = timing.first_pts?;

        // Every sample pushed through the sink counts: regular blocks,
        // silence and resampler corrections.
        let played_length = tick_from_samples(timing.played_samples, mixer_rate);
        let last_pts = first_pts + played_length;
        let play_date =
            ((last_pts - audio_ts) as f64 / self.rate() as f64) as Tick + system_ts;
        Some(play_date - self.clock.now())
    }

    fn mark_discontinuity(&self, sync: &mut SyncState) {
        sync.discontinuity = true;
        let mut timing = self.timing.lock();
        timing.first_pts = None;
        timing.last_drift = None;
        timing.system_ts = None;
        timing.audio_ts = None;
        timing.pause_date = None;
        timing.played_samples = 0;
    }

    fn stop_resampling(&self, p: &mut Pipeline) {
        p.sync.resampling = Resampling::None;
        if let Some(resampler) = p.resampler.as_mut() {
            resampler.adjust_resampling(0);
        }
    }

    fn reset_locked(&self, p: &mut Pipeline) {
        if p.mixer_format.is_some() {
            self.output.meter().flush();
            if let Some(filters) = p.filters.as_mut() {
                filters.flush();
            }
            if let Some(resampler) = p.resampler.as_mut() {
                resampler.flush();
            }
            self.clock.reset();

            if p.sync.delay > 0 {
                // Drop the positive delay now and re-apply it through a
                // silence insertion on the next play; the master clock gets
                // a chance to resynchronize sooner.
                self.clock.set_delay(0);
                self.request_delay.store(p.sync.delay, Ordering::Release);
                p.sync.delay = 0;
            }
        }

        self.stop_resampling(p);
        {
            let mut timing = self.timing.lock();
            timing.rate_audio_ts = None;
            timing.rate = 1.0;
        }
        self.drained.store(false, Ordering::Relaxed);
        self.drain_deadline.store(TICK_NONE, Ordering::Relaxed);
        self.mark_discontinuity(&mut p.sync);
    }

    fn flush_locked(&self, p: &mut Pipeline) {
        if p.mixer_format.is_some() {
            self.output.sink().flush();
        }
        self.reset_locked(p);
    }

    /// Flushes the sink and fully resets the timing state.
    pub fn flush(&self) {
        debug!("flushed");
        let mut p = self.pipeline.lock();
        self.flush_locked(&mut p);
    }

    /// Synthesizes `length` of silence just before `pts` and plays it.
    /// Zero-length requests are a no-op.
    fn silence_locked(&self, p: &Pipeline, length: Tick, pts: Tick) {
        if length <= 0 {
            return;
        }
        let Some(fmt) = p.mixer_format.as_ref() else {
            return;
        };
        let block = Block::silence(fmt, length, pts);
        if block.nb_samples == 0 {
            return;
        }
        debug!(
            "inserting {} zeroes / {} ms",
            block.nb_samples,
            ms_from_tick(length)
        );

        let system_now = self.clock.now();
        let system_pts = self.clock.convert_to_system(system_now, pts, self.rate());
        // The interpolation model must see the silence too.
        self.timing.lock().played_samples += block.nb_samples as i64;
        self.output.sink().play(block, system_pts);
    }

    /*
     * Drift correction
     */

    /// Acts on a measured drift (positive = late). Returns true when the
    /// current block must be dropped because everything was flushed.
    fn handle_drift(&self, p: &mut Pipeline, mut drift: Tick, audio_ts: Tick) -> bool {
        if self.bitexact {
            return false;
        }
        let rate = self.rate();

        // Way late. Seeking the sink backward is not portable; flushing the
        // buffers is the only safe correction.
        let late_limit = if p.sync.discontinuity {
            0
        } else {
            scale_threshold(3 * MAX_PTS_DELAY, rate)
        };
        if drift > late_limit {
            if p.sync.discontinuity {
                debug!("playback too late ({drift}): flushing buffers");
            } else {
                warn!("playback way too late ({drift}): flushing buffers");
            }
            self.flush_locked(p);
            self.stop_resampling(p);
            return true;
        }

        // Way early, mostly at startup while the buffers are empty: absorb
        // the gap with silence.
        let early_limit = if p.sync.discontinuity {
            0
        } else {
            scale_threshold(3 * MAX_PTS_ADVANCE, rate)
        };
        if drift < -early_limit {
            if !p.sync.discontinuity {
                warn!("playback way too early ({drift}): playing silence");
            }
            self.silence_locked(p, -drift, audio_ts);
            self.stop_resampling(p);
            p.sync.discontinuity = true;
            drift = 0;
        }

        if p.resampler.is_none() {
            return false;
        }

        if drift > MAX_PTS_DELAY && p.sync.resampling != Resampling::Up {
            warn!("playback too late ({drift}): up-sampling");
            p.sync.resampling = Resampling::Up;
            p.sync.start_drift = drift;
        }
        if drift < -MAX_PTS_ADVANCE && p.sync.resampling != Resampling::Down {
            warn!("playback too early ({drift}): down-sampling");
            p.sync.resampling = Resampling::Down;
            p.sync.start_drift = -drift;
        }
        if p.sync.resampling == Resampling::None {
            return false;
        }

        if drift.abs() > 2 * p.sync.start_drift {
            // Ever-increasing drift: resampling is not helping. Cease and
            // hope for the best.
            warn!("timing screwed (drift: {drift} us): stopping resampling");
            self.stop_resampling(p);
            return false;
        }

        // Rate changes must stay slow for the comfort of listeners.
        let mut adjust: i32 = match p.sync.resampling {
            Resampling::Up => 2,
            _ => -2,
        };
        if 2 * drift.abs() <= p.sync.start_drift {
            // Drift reduced below half its initial value: go back the other
            // way.
            adjust = -adjust;
        }
        if let Some(resampler) = p.resampler.as_mut() {
            if !resampler.adjust_resampling(adjust) {
                // Back to nominal: stop resampling.
                p.sync.resampling = Resampling::None;
                debug!("resampling stopped (drift: {drift} us)");
            }
        }
        false
    }

    /// Measures the drift of `block.pts` and lets [`handle_drift`] act on
    /// it. Returns true when the block must be dropped.
    ///
    /// [`handle_drift`]: Stream::handle_drift
    fn synchronize(
        &self,
        p: &mut Pipeline,
        system_now: Tick,
        play_date: Tick,
        dec_pts: Tick,
    ) -> bool {
        let sink = self.output.sink();
        let rate = self.rate();
        let Some(mixer_rate) = p.mixer_format.as_ref().map(|f| f.rate) else {
            return false;
        };

        let drift = if !sink.can_report_delay() {
            let is_drifting = self.timing.lock().last_drift.is_some();
            if !is_drifting {
                // The stream drives the master clock through its timing
                // reports: nothing to correct.
                return false;
            }
            let Some(delay) = self.get_delay(mixer_rate) else {
                return false; // nothing can be done if timing is unknown
            };
            system_now + delay - play_date
        } else {
            let Some(delay) = sink.delay() else {
                return false;
            };
            let mut delay = delay;
            if p.sync.discontinuity {
                // Some sinks cannot start deferred and begin playing
                // immediately, ignoring the start date. Absorb the startup
                // jitter with silence before the first clock update charges
                // it as drift.
                let jitter = play_date - system_now - delay;
                if jitter > 0 {
                    self.silence_locked(p, jitter, dec_pts - delay);
                    match sink.delay() {
                        Some(updated) => delay = updated,
                        None => return false,
                    }
                }
            }
            match self.clock.update(system_now + delay, dec_pts, rate) {
                Some(drift) => drift,
                None => return false, // the point anchored the clock
            }
        };

        self.handle_drift(p, drift, dec_pts)
    }

    /*
     * Restart protocol
     */

    fn check_ready(&self, p: &mut Pipeline) -> PlayResult {
        let restart = self.restart.swap(0, Ordering::Acquire);
        if restart == 0 {
            return if p.mixer_format.is_some() {
                PlayResult::Success
            } else {
                PlayResult::Failed
            };
        }

        let sink = self.output.sink();
        let mut status = PlayResult::Success;

        p.filters = None;
        p.resampler = None;

        if (restart & !RESTART_FILTERS) != 0 {
            debug!("restarting output...");
            if p.mixer_format.is_some() {
                sink.close();
            }
            let mut mixer = self.input_format.clone();
            let mut filter_format = self.input_format.clone();
            let mut filters_cfg = FiltersCfg::default();
            match sink.open(&mut mixer, self.profile, &mut filter_format, &mut filters_cfg) {
                Ok(()) => {
                    p.mixer_format = Some(mixer);
                    p.filter_format = filter_format;
                    p.filters_cfg = filters_cfg;
                }
                Err(e) => {
                    warn!("audio output restart failed: {e}");
                    p.mixer_format = None;
                }
            }
            // A new device may want a different codec; ask the decoder to
            // renegotiate, unless the caller only toggled filters on top.
            if restart == RESTART_OUTPUT {
                status = PlayResult::Changed;
            }
        }

        debug!("restarting filters...");
        p.sync.resampling = Resampling::None;

        if let Some(mixer) = p.mixer_format.clone() {
            if !self.bitexact {
                let audio_cfg = self.output.config_snapshot();
                match build_chains(&p.filter_format, &mixer, &audio_cfg, &p.filters_cfg) {
                    Ok((filters, resampler)) => {
                        p.filters = filters;
                        p.resampler = resampler;
                    }
                    Err(e) => {
                        warn!("filter pipeline rebuild failed: {e}");
                        sink.close();
                        p.mixer_format = None;
                    }
                }
            }
        }

        self.output.meter().reset(p.mixer_format.as_ref());

        if p.mixer_format.is_some() {
            status
        } else {
            PlayResult::Failed
        }
    }

    /*
     * Hot path
     */

    pub fn play(&self, mut block: Block) -> PlayResult {
        block.length =
            tick_from_samples(block.nb_samples as i64, self.input_format.rate);

        let mut p = self.pipeline.lock();

        let ret = self.check_ready(&mut p);
        if ret == PlayResult::Failed {
            // Pipeline is unrecoverably broken.
            self.mark_discontinuity(&mut p.sync);
            self.buffers_lost.fetch_add(1, Ordering::Relaxed);
            return ret;
        }

        if block.has_flag(BLOCK_FLAG_DISCONTINUITY) {
            self.mark_discontinuity(&mut p.sync);
        }

        let rate = self.rate();
        let chain_handles_rate = p.filters.as_ref().is_some_and(|f| f.handles_rate());
        if let Some(filters) = p.filters.as_mut() {
            block = match filters.play(block, rate) {
                Some(block) => block,
                None => {
                    // Buffered or dropped by a stage.
                    self.buffers_lost.fetch_add(1, Ordering::Relaxed);
                    return ret;
                }
            };
        }

        if let Some(volume) = self.volume.as_ref() {
            if let Some(fmt) = p.mixer_format.as_ref() {
                volume.amplify(fmt.codec, &mut block);
            }
        }

        // Apply a pending delay change.
        let request_delay = self.request_delay.load(Ordering::Acquire);
        if request_delay != p.sync.delay {
            p.sync.delay = request_delay;
            let delta = self.clock.set_delay(request_delay);
            if delta > 0 {
                self.silence_locked(&p, delta, block.pts);
            }
        }

        // Drift correction.
        let system_now = self.clock.now();
        let play_date = self.clock.convert_to_system(system_now, block.pts, rate);
        if self.synchronize(&mut p, system_now, play_date, block.pts) {
            // Way too late: the sink was flushed and this block goes with it.
            self.buffers_lost.fetch_add(1, Ordering::Relaxed);
            return ret;
        }

        // Fine rate adjustment.
        if let Some(resampler) = p.resampler.as_mut() {
            if !chain_handles_rate {
                resampler.set_playback_rate(rate);
            }
            block = match resampler.play(block) {
                Some(block) => block,
                None => {
                    self.buffers_lost.fetch_add(1, Ordering::Relaxed);
                    return ret;
                }
            };
        }

        self.output.meter().process(&block, play_date);

        let sink = self.output.sink();
        if !sink.can_report_delay() {
            let mut timing = self.timing.lock();
            if (rate - timing.rate).abs() > f32::EPSILON {
                // First timing point seeing the rate change; later reports
                // are reconstructed against it. Update the clock right away
                // rather than waiting for a report that may come late.
                timing.rate_system_ts = play_date;
                timing.rate_audio_ts = Some(block.pts);
                timing.rate = rate;
                timing.last_drift = self.clock.update(play_date, block.pts, rate);
            }
        }

        {
            let mut timing = self.timing.lock();
            if timing.first_pts.is_none() {
                timing.first_pts = Some(block.pts);
            }
            timing.played_samples += block.nb_samples as i64;
        }

        p.sync.discontinuity = false;
        sink.play(block, play_date);
        self.buffers_played.fetch_add(1, Ordering::Relaxed);
        ret
    }

    /*
     * Drain
     */

    pub fn drain(&self) {
        let mut p = self.pipeline.lock();
        let Some(mixer_rate) = p.mixer_format.as_ref().map(|f| f.rate) else {
            return;
        };
        debug!("draining");

        let sink = self.output.sink();
        if let Some(filters) = p.filters.as_mut() {
            if let Some(block) = filters.drain() {
                let drained = match p.resampler.as_mut() {
                    Some(resampler) => resampler.play(block),
                    None => Some(block),
                };
                if let Some(block) = drained {
                    self.timing.lock().played_samples += block.nb_samples as i64;
                    sink.play(block, self.clock.now());
                }
            }
        }

        if sink.can_drain() {
            debug_assert!(!self.drained.load(Ordering::Relaxed));
            sink.drain();
        } else {
            debug_assert!(self.drain_deadline.load(Ordering::Relaxed) == TICK_NONE);
            let mut deadline = self.clock.now();
            if let Some(delay) = self.get_delay(mixer_rate) {
                deadline += delay;
            }
            self.drain_deadline.store(deadline, Ordering::Relaxed);
        }
    }

    /// Whether all already-submitted samples have been played: the sink's
    /// own notification, or the deadline model otherwise.
    pub fn is_drained(&self) -> bool {
        if self.output.sink().can_drain() {
            self.drained.load(Ordering::Relaxed)
        } else {
            let deadline = self.drain_deadline.load(Ordering::Relaxed);
            deadline != TICK_NONE && self.clock.now() >= deadline
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let mut p = self.pipeline.lock();
        if p.mixer_format.is_some() {
            self.reset_locked(&mut p);
            self.output.meter().reset(None);
            p.filters = None;
            p.resampler = None;
            self.output.sink().close();
            p.mixer_format = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;
    use crate::format::{ChannelMask, Codec};
    use crate::sink::NullSink;
    use crate::sync::Resampling;
    use crate::time::{tick_from_ms, CLOCK_FREQ};

    const RATE: u32 = 48_000;
    const FRAMES: u32 = 1_024;

    fn input_format() -> AudioFormat {
        AudioFormat::new(Codec::F32, RATE, ChannelMask::STEREO, ChannelMask::STEREO).unwrap()
    }

    fn test_config() -> AudioConfig {
        AudioConfig {
            time_stretch: false,
            ..AudioConfig::default()
        }
    }

    fn make_stream(
        sink: Arc<NullSink>,
        clock: Arc<MediaClock>,
        cfg: AudioConfig,
    ) -> (Arc<AudioOutput>, Arc<Stream>) {
        let output = AudioOutput::new(sink, cfg);
        let stream = output
            .new_stream(StreamConfig {
                input_format: input_format(),
                profile: 0,
                clock,
                replay_gain: ReplayGainInfo::default(),
                str_id: Some("test".into()),
            })
            .unwrap();
        (output, stream)
    }

    fn audio_block(index: u32) -> Block {
        let pts = tick_from_samples(index as i64 * FRAMES as i64, RATE);
        let mut block = Block::new(Vec::new(), 0, pts);
        block.set_f32(&vec![0.1f32; FRAMES as usize * 2], 2);
        block
    }

    fn block_step() -> Tick {
        tick_from_samples(FRAMES as i64, RATE)
    }

    /// Scenario: steady play with a constant sink delay; no drift, no
    /// silence, strictly increasing play dates.
    #[test]
    fn steady_play_has_no_correction() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        for i in 0..10 {
            assert_eq!(stream.play(audio_block(i)), PlayResult::Success);
            clock.advance(block_step());
        }

        let played = sink.played();
        assert_eq!(played.len(), 10);
        assert!(played.iter().all(|b| !b.silent));
        assert!(played.windows(2).all(|w| w[0].system_pts < w[1].system_pts));
        assert_eq!(stream.pipeline.lock().sync.resampling, Resampling::None);
        assert_eq!(stream.get_reset_stats(), (0, 10));
    }

    /// Scenario: the clock schedules the first block 400 ms out; the startup
    /// gap is absorbed by one silence insertion and the discontinuity clears
    /// with the block.
    #[test]
    fn early_start_inserts_silence() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), 0);
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        // Anchor the clock so pts 0 is due 400 ms from now.
        let _ = clock.update(tick_from_ms(400), 0, 1.0);

        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);

        let played = sink.played();
        assert_eq!(played.len(), 2);
        assert!(played[0].silent);
        assert_eq!(played[0].length, tick_from_ms(400));
        assert!(!played[1].silent);
        // Silence counts into the played-samples model.
        assert_eq!(
            stream.timing.lock().played_samples,
            played[0].nb_samples as i64 + FRAMES as i64
        );
        // Discontinuity cleared by the successful play.
        assert!(!stream.pipeline.lock().sync.discontinuity);
    }

    /// Scenario: catastrophic lateness flushes the sink, reseeds the timing
    /// state and drops the offending block.
    #[test]
    fn way_late_block_flushes_and_drops() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        // Two clean blocks to clear the discontinuity and anchor the clock.
        for i in 0..2 {
            assert_eq!(stream.play(audio_block(i)), PlayResult::Success);
            clock.advance(block_step());
        }
        assert_eq!(sink.played_count(), 2);

        // The third block shows up a full second late.
        clock.advance(CLOCK_FREQ);
        assert_eq!(stream.play(audio_block(2)), PlayResult::Success);

        assert_eq!(sink.flush_count(), 1);
        assert_eq!(sink.played_count(), 2, "late block must not be replayed");
        let (lost, _) = stream.get_reset_stats();
        assert_eq!(lost, 1);

        let timing = stream.timing.lock();
        assert_eq!(timing.first_pts, None);
        assert_eq!(timing.played_samples, 0);
        drop(timing);
        let p = stream.pipeline.lock();
        assert_eq!(p.sync.resampling, Resampling::None);
        assert!(p.sync.discontinuity);
    }

    /// Scenario: lateness grows by 30 ms per block until it crosses the
    /// tolerance and up-sampling engages, with no flush and no silence.
    #[test]
    fn growing_lateness_engages_upsampling() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_delay(tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        // Anchor with a clean block, then fall behind by an extra 30 ms per
        // block: drifts of 0, 30, 60, 90, 120 ms.
        for i in 0..6 {
            assert_eq!(stream.play(audio_block(i)), PlayResult::Success);
            let lateness = if i == 0 { 0 } else { tick_from_ms(30) };
            clock.advance(block_step() + lateness);
            if i < 5 {
                assert_eq!(stream.pipeline.lock().sync.resampling, Resampling::None);
            }
        }

        let p = stream.pipeline.lock();
        assert_eq!(p.sync.resampling, Resampling::Up);
        assert!(p.sync.start_drift > tick_from_ms(100));
        drop(p);
        assert_eq!(sink.flush_count(), 0);
        assert!(sink.played().iter().all(|b| !b.silent));
    }

    /// The resampling protocol, drift by drift: engage above the tolerance,
    /// ±2 Hz per call, sign flip once the drift has halved, disengage when
    /// the correction returns to nominal, abort on divergence.
    #[test]
    fn resampling_protocol_follows_the_drift() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_delay(tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        let mut p = stream.pipeline.lock();
        p.sync.discontinuity = false;

        // Below the tolerance: nothing happens.
        assert!(!stream.handle_drift(&mut p, tick_from_ms(90), 0));
        assert_eq!(p.sync.resampling, Resampling::None);

        // 120 ms late: up-sampling engages (+2 Hz).
        assert!(!stream.handle_drift(&mut p, tick_from_ms(120), 0));
        assert_eq!(p.sync.resampling, Resampling::Up);
        assert_eq!(p.sync.start_drift, tick_from_ms(120));

        // Still above half the start drift: keep pushing (+2 Hz).
        assert!(!stream.handle_drift(&mut p, tick_from_ms(80), 0));
        assert_eq!(p.sync.resampling, Resampling::Up);

        // Halved: back off (-2 Hz), then once more to nominal.
        assert!(!stream.handle_drift(&mut p, tick_from_ms(50), 0));
        assert_eq!(p.sync.resampling, Resampling::Up);
        assert!(!stream.handle_drift(&mut p, tick_from_ms(40), 0));
        assert_eq!(p.sync.resampling, Resampling::None);

        // Symmetric early side.
        assert!(!stream.handle_drift(&mut p, -tick_from_ms(50), 0));
        assert_eq!(p.sync.resampling, Resampling::Down);
        assert_eq!(p.sync.start_drift, tick_from_ms(50));

        // Divergence beyond twice the start drift aborts the correction.
        assert!(!stream.handle_drift(&mut p, -tick_from_ms(101), 0));
        assert_eq!(p.sync.resampling, Resampling::None);
        drop(p);

        // No flush and no silence along the whole exchange.
        assert_eq!(sink.flush_count(), 0);
        assert_eq!(sink.played_count(), 0);
    }

    /// Scenario: a rate change on a sink without delay reporting records a
    /// rate point; earlier timing reports are dropped and later ones are
    /// rescaled.
    #[test]
    fn rate_change_without_time_get() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::without_time_get();
        let (_output, stream) = make_stream(sink, Arc::clone(&clock), test_config());

        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);
        clock.advance(block_step());

        stream.change_rate(2.0);
        assert_eq!(stream.play(audio_block(1)), PlayResult::Success);

        let (rate_system_ts, rate_audio_ts) = {
            let timing = stream.timing.lock();
            assert_eq!(timing.rate, 2.0);
            (timing.rate_system_ts, timing.rate_audio_ts.unwrap())
        };
        assert_eq!(rate_audio_ts, audio_block(1).pts);

        // A report from before the rate change is dropped.
        stream.notify_timing(rate_system_ts - 1, 0);
        assert_eq!(stream.timing.lock().system_ts, None);

        // A report from after it is rescaled at the new rate.
        let ts = rate_system_ts + tick_from_ms(100);
        stream.notify_timing(ts, 0);
        let timing = stream.timing.lock();
        assert_eq!(timing.system_ts, Some(ts));
        assert_eq!(
            timing.audio_ts,
            Some(rate_audio_ts + 2 * tick_from_ms(100))
        );
    }

    /// Scenario: a filters restart under load rebuilds the chain without
    /// losing the block in flight.
    #[test]
    fn filters_restart_under_load() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);
        clock.advance(block_step());

        stream.request_restart(RESTART_FILTERS);
        assert_eq!(stream.play(audio_block(1)), PlayResult::Success);

        assert_eq!(sink.played_count(), 2);
        assert_eq!(stream.get_reset_stats(), (0, 2));
        assert!(stream.pipeline.lock().filters.is_some());
    }

    #[test]
    fn output_restart_returns_changed() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        stream.request_restart(RESTART_OUTPUT);
        assert_eq!(stream.play(audio_block(0)), PlayResult::Changed);
        assert_eq!(stream.play(audio_block(1)), PlayResult::Success);
    }

    #[test]
    fn failed_output_restart_poisons_the_stream() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        sink.fail_next_open();
        stream.request_restart(RESTART_OUTPUT);
        assert_eq!(stream.play(audio_block(0)), PlayResult::Failed);
        // Still failed until a new restart succeeds.
        assert_eq!(stream.play(audio_block(1)), PlayResult::Failed);
        let (lost, played) = stream.get_reset_stats();
        assert_eq!((lost, played), (2, 0));

        stream.request_restart(RESTART_OUTPUT);
        assert_eq!(stream.play(audio_block(2)), PlayResult::Changed);
    }

    /// Law: zero-length silence is a no-op.
    #[test]
    fn zero_silence_is_a_no_op() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), 0);
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        let p = stream.pipeline.lock();
        stream.silence_locked(&p, 0, 1_000);
        drop(p);

        assert_eq!(sink.played_count(), 0);
        assert_eq!(stream.timing.lock().played_samples, 0);
    }

    /// Law: without a native drain, `is_drained` flips no later than the
    /// reported delay after `drain`.
    #[test]
    fn drain_deadline_model_terminates() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);
        stream.drain();
        assert!(!stream.is_drained());

        // The whole reported delay elapses.
        clock.advance(tick_from_ms(10) + block_step());
        assert!(stream.is_drained());
    }

    #[test]
    fn native_drain_waits_for_notification() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_native_drain(tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);
        stream.drain();
        assert_eq!(sink.drain_count(), 1);
        assert!(!stream.is_drained());
        stream.notify_drained();
        assert!(stream.is_drained());
    }

    /// Law: pausing then resuming advances the interpolation base by exactly
    /// the pause interval, and only when it was set.
    #[test]
    fn pause_invariance() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::without_time_get();
        let (_output, stream) = make_stream(sink, Arc::clone(&clock), test_config());

        // Without a timing point the base stays unset.
        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);
        stream.change_pause(true, 1_000);
        stream.change_pause(false, 3_000);
        assert_eq!(stream.timing.lock().system_ts, None);

        stream.notify_timing(5_000, 0);
        let before = stream.timing.lock().system_ts.unwrap();
        stream.change_pause(true, 10_000);
        stream.change_pause(false, 17_000);
        assert_eq!(stream.timing.lock().system_ts, Some(before + 7_000));
    }

    /// Law: after a flush the timing state is virgin and nothing remains
    /// queued in the chain.
    #[test]
    fn flush_resets_everything() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        for i in 0..3 {
            assert_eq!(stream.play(audio_block(i)), PlayResult::Success);
            clock.advance(block_step());
        }
        stream.flush();

        assert_eq!(sink.flush_count(), 1);
        let timing = stream.timing.lock();
        assert_eq!(timing.first_pts, None);
        assert_eq!(timing.played_samples, 0);
        assert_eq!(timing.rate_audio_ts, None);
        drop(timing);
        let p = stream.pipeline.lock();
        assert_eq!(p.sync.resampling, Resampling::None);
        assert!(p.sync.discontinuity);
    }

    /// A positive delay is applied through silence, and a flush re-schedules
    /// it for the next play.
    #[test]
    fn delay_inserts_silence_and_survives_flush() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), 0);
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        stream.change_delay(tick_from_ms(50));
        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);
        let played = sink.played();
        assert!(played[0].silent);
        assert_eq!(played[0].length, tick_from_ms(50));

        stream.flush();
        assert_eq!(clock.delay(), 0);

        // The delay comes back as silence on the next play.
        clock.advance(block_step());
        assert_eq!(stream.play(audio_block(1)), PlayResult::Success);
        let played = sink.played();
        let last_silent = &played[played.len() - 2];
        assert!(last_silent.silent);
        assert_eq!(last_silent.length, tick_from_ms(50));
    }

    /// A gain of zero makes the next block silent; blocks in flight are not
    /// guaranteed to see it.
    #[test]
    fn gain_change_is_visible_to_the_next_block() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);
        clock.advance(block_step());
        stream.notify_gain(0.0);
        assert_eq!(stream.play(audio_block(1)), PlayResult::Success);

        let played = sink.played();
        assert!(!played[0].silent);
        assert!(played[1].silent);
    }

    #[test]
    fn discontinuity_flag_reseeds_timing() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);
        clock.advance(block_step());
        assert!(stream.timing.lock().first_pts.is_some());

        let mut block = audio_block(1);
        block.set_flag(BLOCK_FLAG_DISCONTINUITY);
        assert_eq!(stream.play(block), PlayResult::Success);
        // first_pts re-seeded from the discontinuous block.
        assert_eq!(
            stream.timing.lock().first_pts,
            Some(audio_block(1).pts)
        );
    }

    #[test]
    fn stale_timing_report_after_reset_is_ignored() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::without_time_get();
        let (_output, stream) = make_stream(sink, Arc::clone(&clock), test_config());

        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);
        stream.flush();
        // The module delivers one last point after the reset.
        stream.notify_timing(1_000, 0);
        assert_eq!(stream.timing.lock().system_ts, None);
    }

    #[test]
    fn pause_is_forwarded_to_a_capable_sink() {
        let clock = Arc::new(MediaClock::manual(0));
        let sink = NullSink::with_queue_model(Arc::clone(&clock), tick_from_ms(10));
        let (_output, stream) = make_stream(Arc::clone(&sink), Arc::clone(&clock), test_config());

        assert_eq!(stream.play(audio_block(0)), PlayResult::Success);
        stream.change_pause(true, 5_000);
        stream.change_pause(false, 9_000);
        assert_eq!(sink.pauses(), vec![(true, 5_000), (false, 9_000)]);
        assert_eq!(sink.flush_count(), 0);
    }
}
