//! Audio meter: fan-out of processed blocks to analysis plug-ins.
//!
//! Plug-ins observe the mixer-format blocks right before they reach the sink.
//! They are in-place: the block flows through unchanged, and a plug-in
//! failure must never drop audio.

use parking_lot::Mutex;

use crate::block::Block;
use crate::format::{AudioFormat, Codec};
use crate::time::Tick;

/// An analysis plug-in attached to the meter.
pub trait MeterPlugin: Send {
    /// Observes a block; `end_date` is the system date at which the last
    /// sample of the block will be audible.
    fn process(&mut self, block: &Block, end_date: Tick);

    /// Re-creates internal state for a new mixer format (`None` while the
    /// output is down).
    fn reset(&mut self, format: Option<&AudioFormat>);

    fn flush(&mut self) {}
}

struct PluginEntry {
    plugin: Box<dyn MeterPlugin>,
    last_date: Option<Tick>,
}

struct MeterInner {
    plugins: Vec<PluginEntry>,
    format: Option<AudioFormat>,
}

/// Shared meter instance; lives on the audio output, not on the stream, so
/// plug-ins survive pipeline rebuilds.
pub struct AudioMeter {
    inner: Mutex<MeterInner>,
}

impl AudioMeter {
    pub fn new() -> AudioMeter {
        AudioMeter {
            inner: Mutex::new(MeterInner {
                plugins: Vec::new(),
                format: None,
            }),
        }
    }

    /// Attaches a plug-in; it is immediately configured with the current
    /// format.
    pub fn add_plugin(&self, mut plugin: Box<dyn MeterPlugin>) {
        let mut inner = self.inner.lock();
        plugin.reset(inner.format.as_ref());
        inner.plugins.push(PluginEntry {
            plugin,
            last_date: None,
        });
    }

    /// Reconfigures every plug-in for a new mixer format.
    pub fn reset(&self, format: Option<&AudioFormat>) {
        let mut inner = self.inner.lock();
        inner.format = format.cloned();
        for entry in &mut inner.plugins {
            entry.last_date = None;
            entry.plugin.reset(format);
        }
    }

    /// Runs every plug-in on the block. `date` is the system date of the
    /// first sample.
    pub fn process(&self, block: &Block, date: Tick) {
        let mut inner = self.inner.lock();
        for entry in &mut inner.plugins {
            let end_date = date + block.length;
            entry.last_date = Some(end_date);
            entry.plugin.process(block, end_date);
        }
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        for entry in &mut inner.plugins {
            entry.plugin.flush();
        }
    }

    pub fn plugin_count(&self) -> usize {
        self.inner.lock().plugins.len()
    }
}

impl Default for AudioMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Block loudness measurement delivered by [`LoudnessMeter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Loudness {
    /// Mean power of the block, dBFS-ish (`-0.691 + 10 log10(ms)`).
    pub momentary: f32,
    /// Largest absolute sample amplitude.
    pub peak: f32,
}

/// Reference meter plug-in: per-block RMS loudness and peak over F32 blocks.
pub struct LoudnessMeter {
    on_loudness: Box<dyn FnMut(Tick, Loudness) + Send>,
    enabled: bool,
}

impl LoudnessMeter {
    pub fn new(on_loudness: impl FnMut(Tick, Loudness) + Send + 'static) -> LoudnessMeter {
        LoudnessMeter {
            on_loudness: Box::new(on_loudness),
            enabled: false,
        }
    }
}

impl MeterPlugin for LoudnessMeter {
    fn process(&mut self, block: &Block, end_date: Tick) {
        if !self.enabled || block.data.is_empty() {
            return;
        }
        let mut sum = 0.0f64;
        let mut peak = 0.0f32;
        let mut count = 0usize;
        for sample in block.as_f32() {
            sum += (sample as f64) * (sample as f64);
            peak = peak.max(sample.abs());
            count += 1;
        }
        if count == 0 {
            return;
        }
        let mean_square = sum / count as f64;
        let momentary = -0.691 + 10.0 * mean_square.max(1e-12).log10() as f32;
        (self.on_loudness)(end_date, Loudness { momentary, peak });
    }

    fn reset(&mut self, format: Option<&AudioFormat>) {
        self.enabled = matches!(format, Some(fmt) if fmt.codec == Codec::F32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AudioFormat, ChannelMask};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn f32_format() -> AudioFormat {
        AudioFormat::new(Codec::F32, 48_000, ChannelMask::STEREO, ChannelMask::STEREO).unwrap()
    }

    struct CountingPlugin {
        processed: Arc<AtomicU32>,
        resets: Arc<AtomicU32>,
        flushes: Arc<AtomicU32>,
    }

    impl MeterPlugin for CountingPlugin {
        fn process(&mut self, _block: &Block, _end_date: Tick) {
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
        fn reset(&mut self, _format: Option<&AudioFormat>) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
        fn flush(&mut self) {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn plugins_see_every_block_unchanged() {
        let meter = AudioMeter::new();
        let processed = Arc::new(AtomicU32::new(0));
        meter.add_plugin(Box::new(CountingPlugin {
            processed: Arc::clone(&processed),
            resets: Arc::new(AtomicU32::new(0)),
            flushes: Arc::new(AtomicU32::new(0)),
        }));

        let mut block = Block::new(Vec::new(), 0, 0);
        block.set_f32(&[0.5, -0.5], 2);
        let before = block.data.clone();
        meter.process(&block, 1_000);
        meter.process(&block, 2_000);

        assert_eq!(processed.load(Ordering::Relaxed), 2);
        assert_eq!(block.data, before);
    }

    #[test]
    fn reset_and_flush_forward_to_plugins() {
        let meter = AudioMeter::new();
        let resets = Arc::new(AtomicU32::new(0));
        let flushes = Arc::new(AtomicU32::new(0));
        meter.add_plugin(Box::new(CountingPlugin {
            processed: Arc::new(AtomicU32::new(0)),
            resets: Arc::clone(&resets),
            flushes: Arc::clone(&flushes),
        }));

        assert_eq!(resets.load(Ordering::Relaxed), 1); // add_plugin configures
        meter.reset(Some(&f32_format()));
        meter.flush();
        assert_eq!(resets.load(Ordering::Relaxed), 2);
        assert_eq!(flushes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn loudness_meter_reports_peak_and_power() {
        let meter = AudioMeter::new();
        meter.reset(Some(&f32_format()));
        let report: Arc<parking_lot::Mutex<Option<Loudness>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let sink = Arc::clone(&report);
        meter.add_plugin(Box::new(LoudnessMeter::new(move |_, loudness| {
            *sink.lock() = Some(loudness);
        })));

        let mut block = Block::new(Vec::new(), 2, 0);
        block.set_f32(&[0.5, -0.5, 0.5, -0.5], 2);
        meter.process(&block, 0);

        let loudness = report.lock().expect("loudness reported");
        assert!((loudness.peak - 0.5).abs() < 1e-6);
        // mean square of ±0.5 is 0.25 -> 10*log10(0.25) ≈ -6.02
        assert!((loudness.momentary - (-0.691 - 6.0206)).abs() < 0.01);
    }

    #[test]
    fn loudness_meter_disabled_without_f32_format() {
        let meter = AudioMeter::new();
        let called = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&called);
        meter.add_plugin(Box::new(LoudnessMeter::new(move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        })));

        let mut block = Block::new(Vec::new(), 2, 0);
        block.set_f32(&[0.5, -0.5], 1);
        meter.process(&block, 0); // no format configured yet
        assert_eq!(called.load(Ordering::Relaxed), 0);
    }
}
