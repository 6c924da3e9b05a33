//! Audio blocks: owned contiguous PCM buffers with timing metadata.
//!
//! Blocks are linear: exactly one component owns a block at any time. The
//! pipeline passes them by value; a stage either returns the block (possibly
//! reallocated) or consumes it.

use crate::format::AudioFormat;
use crate::time::{samples_from_tick, Tick};

/// The stream is discontinuous at this block: presentation timestamps are not
/// expected to follow the previous block.
pub const BLOCK_FLAG_DISCONTINUITY: u32 = 0x1;

#[derive(Debug, Clone)]
pub struct Block {
    pub data: Vec<u8>,
    pub pts: Tick,
    pub dts: Tick,
    /// Duration (`nb_samples / rate` in ticks).
    pub length: Tick,
    pub nb_samples: u32,
    pub flags: u32,
}

impl Block {
    pub fn new(data: Vec<u8>, nb_samples: u32, pts: Tick) -> Block {
        Block {
            data,
            pts,
            dts: pts,
            length: 0,
            nb_samples,
            flags: 0,
        }
    }

    /// Zero-filled block of `length` at the rate of `fmt`, stamped at `pts`.
    pub fn silence(fmt: &AudioFormat, length: Tick, pts: Tick) -> Block {
        let frames = samples_from_tick(length, fmt.rate).max(0) as usize;
        let bytes = fmt.bytes_for_samples(frames);
        Block {
            data: vec![0u8; bytes],
            pts,
            dts: pts,
            length,
            nb_samples: frames as u32,
            flags: 0,
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    /// Interprets the buffer as native-endian `f32` samples.
    pub fn as_f32(&self) -> impl Iterator<Item = f32> + '_ {
        self.data
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Applies `f` to every `f32` sample in place.
    pub fn map_f32_in_place(&mut self, mut f: impl FnMut(f32) -> f32) {
        for chunk in self.data.chunks_exact_mut(4) {
            let v = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            chunk.copy_from_slice(&f(v).to_ne_bytes());
        }
    }

    /// Copies the buffer out as `f32` samples.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.as_f32().collect()
    }

    /// Replaces the buffer with `samples`, updating the sample count for
    /// `channels` interleaved channels.
    pub fn set_f32(&mut self, samples: &[f32], channels: usize) {
        debug_assert!(channels > 0);
        self.data.clear();
        self.data.reserve(samples.len() * 4);
        for s in samples {
            self.data.extend_from_slice(&s.to_ne_bytes());
        }
        self.nb_samples = (samples.len() / channels) as u32;
    }
}
