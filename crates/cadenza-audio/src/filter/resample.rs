//! Rate conversion and the fine-adjustment resampler chain.
//!
//! [`Resample`] is a linear-interpolation stage over f32 frames. Besides the
//! nominal rate conversion it absorbs two dynamic inputs: the playback rate
//! (time compression with pitch shift) and the sync controller's ±Hz
//! corrections.

use log::debug;

use crate::block::Block;
use crate::error::AudioError;
use crate::filter::convert::FormatConvert;
use crate::filter::AudioFilter;
use crate::format::{AudioFormat, Codec};
use crate::time::tick_from_samples;

pub struct Resample {
    input: AudioFormat,
    output: AudioFormat,
    /// Playback rate scaling the effective input rate.
    playback_rate: f32,
    /// Accumulated sync correction in Hz, added to the effective input rate.
    correction: i32,
    /// Read position relative to the current block start, in input frames.
    /// May be negative (reads the kept tail of the previous block).
    phase: f64,
    /// Last frame of the previous block, for cross-block interpolation.
    prev_frame: Vec<f32>,
    primed: bool,
}

impl Resample {
    /// Stage for a nominal rate conversion. Only f32 frames are resampled.
    pub fn try_new(input: &AudioFormat, output: &AudioFormat) -> Option<Resample> {
        if input.codec != Codec::F32 || output.codec != Codec::F32 {
            return None;
        }
        if input.physical_channels != output.physical_channels
            || input.original_channels != output.original_channels
        {
            return None;
        }
        if input.rate == output.rate {
            return None;
        }
        Some(Resample::new(input, output))
    }

    /// Unity-rate stage used by the adjustment chain: passes through until a
    /// correction or playback rate kicks in.
    pub fn identity(format: &AudioFormat) -> Resample {
        Resample::new(format, format)
    }

    fn new(input: &AudioFormat, output: &AudioFormat) -> Resample {
        let channels = input.channel_count();
        Resample {
            input: input.clone(),
            output: output.clone(),
            playback_rate: 1.0,
            correction: 0,
            phase: 0.0,
            prev_frame: vec![0.0; channels],
            primed: false,
        }
    }

    fn effective_input_rate(&self) -> f64 {
        self.input.rate as f64 * self.playback_rate as f64 + self.correction as f64
    }
}

impl AudioFilter for Resample {
    fn input_format(&self) -> &AudioFormat {
        &self.input
    }

    fn output_format(&self) -> &AudioFormat {
        &self.output
    }

    fn process(&mut self, mut block: Block) -> Option<Block> {
        let channels = self.input.channel_count();
        let in_frames = block.nb_samples as usize;
        if in_frames == 0 {
            return Some(block);
        }

        let ratio = self.output.rate as f64 / self.effective_input_rate();
        if (ratio - 1.0).abs() < 1e-9 && !self.primed {
            // Nominal 1:1 with no pending tail: nothing to do.
            return Some(block);
        }

        fn frame_at<'a>(
            idx: i64,
            input: &'a [f32],
            prev: &'a [f32],
            in_frames: usize,
            channels: usize,
        ) -> &'a [f32] {
            if idx < 0 {
                prev
            } else {
                let idx = (idx as usize).min(in_frames - 1);
                &input[idx * channels..idx * channels + channels]
            }
        }

        let input = block.to_f32_vec();
        let step = 1.0 / ratio; // input frames per output frame
        // A resampler may produce slightly more samples than the ideal ratio
        // implies; size for (in + 2) * out / in.
        let capacity = ((in_frames + 2) as f64 * ratio).ceil() as usize;
        let mut output = Vec::with_capacity(capacity * channels);

        let mut pos = self.phase;
        while pos <= in_frames as f64 - 1.0 {
            let i0 = pos.floor() as i64;
            let frac = (pos - i0 as f64) as f32;
            let s0 = frame_at(i0, &input, &self.prev_frame, in_frames, channels);
            let s1 = frame_at(i0 + 1, &input, &self.prev_frame, in_frames, channels);
            for c in 0..channels {
                output.push(s0[c] + (s1[c] - s0[c]) * frac);
            }
            pos += step;
        }
        self.phase = pos - in_frames as f64;
        self.prev_frame
            .copy_from_slice(&input[(in_frames - 1) * channels..]);
        self.primed = true;

        let out_frames = output.len() / channels;
        block.set_f32(&output, channels);
        block.length = tick_from_samples(out_frames as i64, self.output.rate);
        Some(block)
    }

    fn flush(&mut self) {
        self.phase = 0.0;
        self.primed = false;
        self.prev_frame.fill(0.0);
    }

    fn handles_rate(&self) -> bool {
        true
    }

    fn set_playback_rate(&mut self, rate: f32) {
        self.playback_rate = rate.max(f32::MIN_POSITIVE);
    }

    fn is_resampler(&self) -> bool {
        true
    }

    fn adjust_resampling(&mut self, delta: i32) -> bool {
        if delta == 0 {
            // Zero adjustment resets the correction outright.
            self.correction = 0;
            return false;
        }
        self.correction += delta;
        self.correction != 0
    }
}

/// The second, short chain performing fine rate adjustment on mixer-format
/// blocks under the sync controller's command.
pub struct ResamplerChain {
    stages: Vec<Box<dyn AudioFilter>>,
    resampler: usize,
}

impl ResamplerChain {
    /// Builds the adjustment chain for a mixer format. Float mixers get a
    /// bare resampler; integer PCM is staged through f32. Pass-through
    /// formats cannot be resampled.
    pub fn new(mixer: &AudioFormat) -> Result<ResamplerChain, AudioError> {
        if !mixer.codec.is_linear() {
            return Err(AudioError::PipelineBuildFailed(
                "cannot resample a pass-through stream".into(),
            ));
        }

        if mixer.codec == Codec::F32 {
            return Ok(ResamplerChain {
                stages: vec![Box::new(Resample::identity(mixer))],
                resampler: 0,
            });
        }

        let mut float = mixer.clone();
        float.codec = Codec::F32;
        float.prepare();
        let to_float = FormatConvert::try_new(mixer, &float).ok_or_else(|| {
            AudioError::PipelineBuildFailed(format!(
                "no converter for the resampler chain ({})",
                mixer.describe()
            ))
        })?;
        let from_float = FormatConvert::try_new(&float, mixer).ok_or_else(|| {
            AudioError::PipelineBuildFailed(format!(
                "no converter back from the resampler chain ({})",
                mixer.describe()
            ))
        })?;
        Ok(ResamplerChain {
            stages: vec![
                Box::new(to_float),
                Box::new(Resample::identity(&float)),
                Box::new(from_float),
            ],
            resampler: 1,
        })
    }

    pub fn play(&mut self, block: Block) -> Option<Block> {
        let mut block = block;
        for stage in &mut self.stages {
            block = stage.process(block)?;
        }
        if block.nb_samples == 0 {
            return None;
        }
        Some(block)
    }

    /// Accumulates a ±Hz correction; returns whether resampling is still
    /// active afterwards.
    pub fn adjust_resampling(&mut self, delta: i32) -> bool {
        let active = self.stages[self.resampler].adjust_resampling(delta);
        if !active {
            debug!("resampler back to nominal rate");
        }
        active
    }

    pub fn can_resample(&self) -> bool {
        true
    }

    pub fn set_playback_rate(&mut self, rate: f32) {
        self.stages[self.resampler].set_playback_rate(rate);
    }

    pub fn flush(&mut self) {
        for stage in &mut self.stages {
            stage.flush();
        }
    }
}

impl std::fmt::Debug for ResamplerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResamplerChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}
