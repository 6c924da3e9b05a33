//! User audio filters: equalizer and time stretch.
//!
//! Effects operate on f32 frames and preserve the stream format. The chain
//! builder inserts a float conversion ahead of them when the decoder delivers
//! integer PCM.

use std::f32::consts::PI;

use crate::block::Block;
use crate::fifo::Date;
use crate::filter::AudioFilter;
use crate::format::{AudioFormat, Codec};
use crate::time::tick_from_samples;

/// Creates a user filter by name, or `None` when the name is unknown or the
/// format unsupported.
pub fn create_user_filter(name: &str, format: &AudioFormat) -> Option<Box<dyn AudioFilter>> {
    if format.codec != Codec::F32 {
        return None;
    }
    match name {
        "equalizer" => Some(Box::new(Equalizer::new(format))),
        _ => None,
    }
}

/// Biquad filter in Direct Form I with per-channel delay lines.
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    /// Per-channel (x[n-1], x[n-2], y[n-1], y[n-2]).
    state: Vec<[f32; 4]>,
}

impl Biquad {
    /// Peaking EQ biquad: boost/cut `gain_db` at `freq_hz` with bandwidth `q`.
    fn peaking_eq(freq_hz: f32, gain_db: f32, q: f32, sample_rate: u32, channels: usize) -> Biquad {
        let a = 10.0f32.powf(gain_db / 40.0);
        let w0 = 2.0 * PI * freq_hz / sample_rate as f32;
        let alpha = w0.sin() / (2.0 * q);

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * w0.cos();
        let b2 = 1.0 - alpha * a;
        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * w0.cos();
        let a2 = 1.0 - alpha / a;

        Biquad {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            state: vec![[0.0; 4]; channels],
        }
    }

    fn process(&mut self, samples: &mut [f32], channels: usize) {
        for frame in samples.chunks_exact_mut(channels) {
            for (c, sample) in frame.iter_mut().enumerate() {
                let s = &mut self.state[c];
                let x = *sample;
                let y = self.b0 * x + self.b1 * s[0] + self.b2 * s[1] - self.a1 * s[2]
                    - self.a2 * s[3];
                s[1] = s[0];
                s[0] = x;
                s[3] = s[2];
                s[2] = y;
                *sample = y;
            }
        }
    }

    fn reset(&mut self) {
        for s in &mut self.state {
            *s = [0.0; 4];
        }
    }
}

/// ISO octave band centers used by the equalizer.
pub const EQ_BANDS: [f32; 10] = [
    31.25, 62.5, 125.0, 250.0, 500.0, 1_000.0, 2_000.0, 4_000.0, 8_000.0, 16_000.0,
];

/// Ten-band peaking equalizer; flat until gains are set.
pub struct Equalizer {
    format: AudioFormat,
    bands: Vec<Biquad>,
    gains: [f32; EQ_BANDS.len()],
}

impl Equalizer {
    pub fn new(format: &AudioFormat) -> Equalizer {
        Equalizer::with_gains(format, [0.0; EQ_BANDS.len()])
    }

    pub fn with_gains(format: &AudioFormat, gains: [f32; EQ_BANDS.len()]) -> Equalizer {
        let channels = format.channel_count();
        let bands = EQ_BANDS
            .iter()
            .zip(gains)
            .filter(|(freq, _)| **freq < format.rate as f32 / 2.0)
            .map(|(freq, gain)| Biquad::peaking_eq(*freq, gain, 0.707, format.rate, channels))
            .collect();
        Equalizer {
            format: format.clone(),
            bands,
            gains,
        }
    }

    pub fn gains(&self) -> &[f32] {
        &self.gains
    }
}

impl AudioFilter for Equalizer {
    fn input_format(&self) -> &AudioFormat {
        &self.format
    }

    fn output_format(&self) -> &AudioFormat {
        &self.format
    }

    fn process(&mut self, mut block: Block) -> Option<Block> {
        let channels = self.format.channel_count();
        let mut samples = block.to_f32_vec();
        for band in &mut self.bands {
            band.process(&mut samples, channels);
        }
        block.set_f32(&samples, channels);
        Some(block)
    }

    fn flush(&mut self) {
        for band in &mut self.bands {
            band.reset();
        }
    }
}

/// Output stride of the time stretcher, in milliseconds.
const STRETCH_STRIDE_MS: u32 = 30;
/// Fraction of the stride cross-faded with the previous one.
const STRETCH_OVERLAP: f32 = 0.2;

/// Pitch-preserving time stretcher (overlap-add).
///
/// Consumes the playback rate: input is read `rate` times faster than output
/// is produced, in fixed strides cross-faded at the seams. At rate 1.0 the
/// stage is a pure pass-through.
pub struct Scaletempo {
    format: AudioFormat,
    channels: usize,
    rate: f32,
    /// Buffered input frames, interleaved.
    queue: Vec<f32>,
    /// Fractional read position into `queue`, in frames.
    input_pos: f64,
    /// Output dating; re-seeded after a flush.
    date: Date,
    stride: usize,
    overlap: usize,
    /// Tail of the previous stride awaiting the next cross-fade.
    prev_tail: Vec<f32>,
    have_prev: bool,
}

impl Scaletempo {
    pub fn new(format: &AudioFormat) -> Scaletempo {
        debug_assert_eq!(format.codec, Codec::F32);
        let channels = format.channel_count();
        let stride = (format.rate * STRETCH_STRIDE_MS / 1_000) as usize;
        let overlap = ((stride as f32 * STRETCH_OVERLAP) as usize).max(1);
        Scaletempo {
            format: format.clone(),
            channels,
            rate: 1.0,
            queue: Vec::new(),
            input_pos: 0.0,
            date: Date::new(format.rate),
            stride,
            overlap,
            prev_tail: vec![0.0; overlap * channels],
            have_prev: false,
        }
    }

    fn queued_frames(&self) -> usize {
        self.queue.len() / self.channels
    }

    /// Copies one stride starting at the integer frame `from`, cross-fading
    /// its head with the saved tail of the previous stride.
    fn emit_stride(&mut self, from: usize, out: &mut Vec<f32>) {
        let ch = self.channels;
        let base = from * ch;
        for i in 0..self.stride {
            if i < self.overlap && self.have_prev {
                let fade = i as f32 / self.overlap as f32;
                for c in 0..ch {
                    let new = self.queue[base + i * ch + c];
                    let old = self.prev_tail[i * ch + c];
                    out.push(old * (1.0 - fade) + new * fade);
                }
            } else {
                out.extend_from_slice(&self.queue[base + i * ch..base + (i + 1) * ch]);
            }
        }
        let tail_base = base + self.stride * ch;
        self.prev_tail
            .copy_from_slice(&self.queue[tail_base..tail_base + self.overlap * ch]);
        self.have_prev = true;
    }
}

impl AudioFilter for Scaletempo {
    fn input_format(&self) -> &AudioFormat {
        &self.format
    }

    fn output_format(&self) -> &AudioFormat {
        &self.format
    }

    fn process(&mut self, mut block: Block) -> Option<Block> {
        if (self.rate - 1.0).abs() < 1e-6 && self.queue.is_empty() {
            // Nothing buffered and nothing to stretch.
            self.date.set(block.pts + block.length);
            return Some(block);
        }

        if self.date.get().is_none() {
            self.date.set(block.pts);
        }
        self.queue.extend(block.as_f32());

        let mut out = Vec::new();
        // A stride consumes stride+overlap frames of lookahead and advances
        // the read position by stride*rate.
        while (self.input_pos.floor() as usize) + self.stride + self.overlap
            <= self.queued_frames()
        {
            let from = self.input_pos.floor() as usize;
            self.emit_stride(from, &mut out);
            self.input_pos += self.stride as f64 * self.rate as f64;
        }

        // Drop consumed frames.
        let consumed = (self.input_pos.floor() as usize).min(self.queued_frames());
        self.queue.drain(..consumed * self.channels);
        self.input_pos -= consumed as f64;

        if out.is_empty() {
            return None; // buffering
        }

        let frames = out.len() / self.channels;
        let pts = self.date.get().unwrap_or(block.pts);
        block.set_f32(&out, self.channels);
        block.pts = pts;
        block.dts = pts;
        block.length = self.date.increment(frames as u32) - pts;
        Some(block)
    }

    fn drain(&mut self) -> Option<Block> {
        if self.queue.is_empty() {
            return None;
        }
        let frames = self.queued_frames();
        let samples = std::mem::take(&mut self.queue);
        self.input_pos = 0.0;
        self.have_prev = false;

        let pts = self.date.get().unwrap_or(0);
        let mut block = Block::new(Vec::new(), 0, pts);
        block.set_f32(&samples, self.channels);
        block.length = if self.date.get().is_some() {
            self.date.increment(frames as u32) - pts
        } else {
            tick_from_samples(frames as i64, self.format.rate)
        };
        Some(block)
    }

    fn flush(&mut self) {
        self.queue.clear();
        self.input_pos = 0.0;
        self.have_prev = false;
        self.date.reset();
    }

    fn handles_rate(&self) -> bool {
        true
    }

    fn set_playback_rate(&mut self, rate: f32) {
        self.rate = rate.max(f32::MIN_POSITIVE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ChannelMask;
    use crate::time::CLOCK_FREQ;

    fn f32_stereo(rate: u32) -> AudioFormat {
        AudioFormat::new(Codec::F32, rate, ChannelMask::STEREO, ChannelMask::STEREO).unwrap()
    }

    fn block_f32(frames: usize, value: f32, pts: i64, rate: u32) -> Block {
        let mut b = Block::new(Vec::new(), 0, pts);
        b.set_f32(&vec![value; frames * 2], 2);
        b.length = tick_from_samples(frames as i64, rate);
        b
    }

    #[test]
    fn flat_equalizer_is_nearly_transparent() {
        let fmt = f32_stereo(48_000);
        let mut eq = Equalizer::new(&fmt);
        let block = block_f32(256, 0.5, 0, 48_000);
        let out = eq.process(block).unwrap();
        for (i, s) in out.to_f32_vec().into_iter().enumerate().skip(8) {
            assert!((s - 0.5).abs() < 0.01, "sample {i} diverged: {s}");
        }
    }

    #[test]
    fn boosted_band_changes_the_signal() {
        let fmt = f32_stereo(48_000);
        let mut gains = [0.0; EQ_BANDS.len()];
        gains[5] = 12.0; // 1 kHz
        let mut eq = Equalizer::with_gains(&fmt, gains);

        // 1 kHz sine at 48 kHz.
        let mut samples = Vec::new();
        for n in 0..4_800 {
            let v = (2.0 * PI * 1_000.0 * n as f32 / 48_000.0).sin() * 0.25;
            samples.push(v);
            samples.push(v);
        }
        let mut block = Block::new(Vec::new(), 0, 0);
        block.set_f32(&samples, 2);
        let out = eq.process(block).unwrap();
        let peak = out.to_f32_vec().iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.5, "boost had no effect: peak {peak}");
    }

    #[test]
    fn bands_above_nyquist_are_skipped() {
        let fmt = AudioFormat::new(
            Codec::F32,
            8_000,
            ChannelMask::STEREO,
            ChannelMask::STEREO,
        )
        .unwrap();
        let eq = Equalizer::new(&fmt);
        assert!(eq.bands.len() < EQ_BANDS.len());
    }

    #[test]
    fn scaletempo_at_unity_is_passthrough() {
        let fmt = f32_stereo(48_000);
        let mut st = Scaletempo::new(&fmt);
        let block = block_f32(1_024, 0.5, 10_000, 48_000);
        let out = st.process(block).unwrap();
        assert_eq!(out.nb_samples, 1_024);
        assert_eq!(out.pts, 10_000);
    }

    #[test]
    fn scaletempo_double_rate_halves_output() {
        let fmt = f32_stereo(48_000);
        let mut st = Scaletempo::new(&fmt);
        st.set_playback_rate(2.0);

        let mut produced = 0u64;
        let mut consumed = 0u64;
        for i in 0..40 {
            let pts = tick_from_samples(consumed as i64, 48_000);
            let block = block_f32(1_024, 0.5, pts, 48_000);
            consumed += 1_024;
            if let Some(out) = st.process(block) {
                produced += out.nb_samples as u64;
            }
            let _ = i;
        }
        let ratio = produced as f64 / consumed as f64;
        assert!((ratio - 0.5).abs() < 0.05, "ratio {ratio}");
    }

    #[test]
    fn scaletempo_output_is_contiguous() {
        let fmt = f32_stereo(48_000);
        let mut st = Scaletempo::new(&fmt);
        st.set_playback_rate(1.5);

        let mut next_pts = None;
        for i in 0..20 {
            let block = block_f32(1_024, 0.25, i * 21_333, 48_000);
            if let Some(out) = st.process(block) {
                if let Some(expected) = next_pts {
                    assert_eq!(out.pts, expected);
                }
                next_pts = Some(out.pts + out.length);
            }
        }
        assert!(next_pts.is_some(), "stretcher never produced output");
    }

    #[test]
    fn scaletempo_drain_empties_the_queue() {
        let fmt = f32_stereo(48_000);
        let mut st = Scaletempo::new(&fmt);
        st.set_playback_rate(2.0);
        let _ = st.process(block_f32(512, 0.5, 0, 48_000));

        let drained = st.drain();
        assert!(drained.is_some() || st.queue.is_empty());
        assert!(st.queue.is_empty());
        assert!(st.drain().is_none());
    }

    #[test]
    fn scaletempo_flush_resets_dating() {
        let fmt = f32_stereo(48_000);
        let mut st = Scaletempo::new(&fmt);
        st.set_playback_rate(1.5);
        let _ = st.process(block_f32(4_096, 0.5, 0, 48_000));
        st.flush();
        assert!(st.queue.is_empty());

        // After a flush the next block re-seeds the date from its own pts.
        let out = st.process(block_f32(4_096, 0.5, CLOCK_FREQ, 48_000));
        if let Some(out) = out {
            assert!(out.pts >= CLOCK_FREQ);
        }
    }

    #[test]
    fn unknown_filter_name_is_rejected() {
        let fmt = f32_stereo(48_000);
        assert!(create_user_filter("equalizer", &fmt).is_some());
        assert!(create_user_filter("does-not-exist", &fmt).is_none());
    }

    #[test]
    fn effects_require_float_input() {
        let fmt = AudioFormat::new(
            Codec::S16,
            48_000,
            ChannelMask::STEREO,
            ChannelMask::STEREO,
        )
        .unwrap();
        assert!(create_user_filter("equalizer", &fmt).is_none());
    }
}
