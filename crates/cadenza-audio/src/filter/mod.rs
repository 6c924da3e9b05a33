//! Filter pipeline: transforming stages between the decoder format and the
//! mixer format.
//!
//! A stage consumes a block and returns the transformed block, or `None` when
//! it buffered or dropped the input. Ownership transfer subsumes the
//! in-place/allocating distinction: an in-place stage returns the block it
//! was given, an allocating one returns a replacement.

use log::{debug, warn};

use crate::block::Block;
use crate::error::AudioError;
use crate::format::{AudioFormat, ChannelMask, Codec, MAX_CHANNELS};

pub mod convert;
pub mod effects;
pub mod pipeline;
pub mod resample;

pub use pipeline::create_pipeline;
pub use resample::ResamplerChain;

/// Hard limit on stages in one chain.
pub const MAX_FILTERS: usize = 16;

/// Hints the sink hands back at open time for building the filter chain.
#[derive(Debug, Clone, Default)]
pub struct FiltersCfg {
    /// The sink believes the listener wears headphones; downmixes soften the
    /// surround contribution.
    pub headphones: bool,
    /// Channel order the device consumes, when it differs from the canonical
    /// WG4 order.
    pub device_channel_order: Option<[ChannelMask; MAX_CHANNELS]>,
}

/// A transforming stage of the pipeline.
pub trait AudioFilter: Send {
    fn input_format(&self) -> &AudioFormat;
    fn output_format(&self) -> &AudioFormat;

    /// Transforms one block. `None` means the stage buffered or dropped it.
    fn process(&mut self, block: Block) -> Option<Block>;

    /// Emits buffered samples at end of stream, once.
    fn drain(&mut self) -> Option<Block> {
        None
    }

    /// Discards buffered samples.
    fn flush(&mut self) {}

    /// Whether this stage consumes the playback rate (time stretch or
    /// resampling).
    fn handles_rate(&self) -> bool {
        false
    }

    fn set_playback_rate(&mut self, rate: f32) {
        let _ = rate;
    }

    /// Whether this stage accepts fine rate corrections from the sync
    /// controller.
    fn is_resampler(&self) -> bool {
        false
    }

    /// Accumulates a correction of `delta` Hz, or resets it when `delta` is
    /// zero; returns whether a correction is still in effect. Only
    /// meaningful on resampler stages.
    fn adjust_resampling(&mut self, delta: i32) -> bool {
        let _ = delta;
        false
    }
}

/// Ordered chain of stages bridging `input_format` to `output_format`.
pub struct FilterChain {
    stages: Vec<Box<dyn AudioFilter>>,
    input_format: AudioFormat,
    output_format: AudioFormat,
    rate_stage: Option<usize>,
    applied_rate: f32,
}

impl FilterChain {
    /// Builds the chain: optional time-stretch first, then the user filters,
    /// then whatever conversions bridge to `output`, then a device-order
    /// permutation when the sink asked for one.
    pub fn new(
        input: &AudioFormat,
        output: &AudioFormat,
        user_filters: &[String],
        time_stretch: bool,
        cfg: &FiltersCfg,
    ) -> Result<FilterChain, AudioError> {
        let mut stages: Vec<Box<dyn AudioFilter>> = Vec::new();
        let mut current = input.clone();

        let wants_effects = (time_stretch || !user_filters.is_empty()) && current.codec.is_linear();

        // Effects run on f32 samples; convert up front when the decoder
        // delivers integer PCM.
        if wants_effects && current.codec != Codec::F32 {
            let mut float = current.clone();
            float.codec = Codec::F32;
            float.prepare();
            let head = create_pipeline(stages.len(), &current, &float, cfg)?;
            stages.extend(head);
            current = float;
        }

        if time_stretch && current.codec == Codec::F32 {
            stages.push(Box::new(effects::Scaletempo::new(&current)));
        }

        for name in user_filters {
            if stages.len() >= MAX_FILTERS {
                debug!("max filters reached ({MAX_FILTERS}), skipping \"{name}\"");
                break;
            }
            match effects::create_user_filter(name, &current) {
                Some(stage) => stages.push(stage),
                None => warn!("cannot find audio filter \"{name}\""),
            }
        }

        let tail = create_pipeline(stages.len(), &current, output, cfg)?;
        stages.extend(tail);

        if let Some(order) = &cfg.device_channel_order {
            if let Some(stage) = convert::Reorder::try_new(output, order) {
                stages.push(Box::new(stage));
            }
        }

        if stages.len() > MAX_FILTERS {
            return Err(AudioError::MaxFiltersExceeded(MAX_FILTERS));
        }

        let rate_stage = stages.iter().position(|s| s.handles_rate());
        Ok(FilterChain {
            stages,
            input_format: input.clone(),
            output_format: output.clone(),
            rate_stage,
            applied_rate: 1.0,
        })
    }

    pub fn input_format(&self) -> &AudioFormat {
        &self.input_format
    }

    pub fn output_format(&self) -> &AudioFormat {
        &self.output_format
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Whether this chain carries a stage that consumes the playback rate.
    pub fn handles_rate(&self) -> bool {
        self.rate_stage.is_some()
    }

    /// Runs the block through every stage. Blocks that end up empty are
    /// consumed and `None` is returned.
    pub fn play(&mut self, block: Block, rate: f32) -> Option<Block> {
        if (rate - self.applied_rate).abs() > f32::EPSILON {
            if let Some(i) = self.rate_stage {
                self.stages[i].set_playback_rate(rate);
            }
            self.applied_rate = rate;
        }

        let mut block = block;
        for stage in &mut self.stages {
            block = stage.process(block)?;
        }
        if block.nb_samples == 0 {
            return None;
        }
        Some(block)
    }

    /// Drains each stage once; the last non-empty result, propagated through
    /// the downstream stages, is returned.
    pub fn drain(&mut self) -> Option<Block> {
        let mut result = None;
        for i in 0..self.stages.len() {
            let Some(drained) = self.stages[i].drain() else {
                continue;
            };
            let mut block = Some(drained);
            for stage in self.stages.iter_mut().skip(i + 1) {
                block = match block {
                    Some(b) => stage.process(b),
                    None => break,
                };
            }
            if let Some(b) = block {
                if b.nb_samples > 0 {
                    result = Some(b);
                }
            }
        }
        result
    }

    pub fn flush(&mut self) {
        for stage in &mut self.stages {
            stage.flush();
        }
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("stages", &self.stages.len())
            .field("input", &self.input_format.describe())
            .field("output", &self.output_format.describe())
            .finish()
    }
}
