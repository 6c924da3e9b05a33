//! Software volume and replay gain.
//!
//! The control thread computes a replay-gain multiplier and stores it in an
//! atomic; the play thread combines it with the user factor in a single load
//! and amplifies the block in place. There is no guarantee an in-flight block
//! sees a new gain, only that the next one does.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::block::Block;
use crate::config::{AudioConfig, ReplayGainMode};
use crate::format::Codec;

/// Replay-gain data extracted from the container by the upstream decoder.
/// Gains in dB, peaks as linear sample amplitudes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayGainInfo {
    pub track_gain: Option<f32>,
    pub album_gain: Option<f32>,
    pub track_peak: Option<f32>,
    pub album_peak: Option<f32>,
}

/// Per-stream software amplifier state.
#[derive(Debug)]
pub struct Volume {
    /// User volume factor (written by `SetVolume`/`NotifyGain`).
    output_bits: AtomicU32,
    /// Replay-gain multiplier (recomputed on the control thread).
    gain_bits: AtomicU32,
    replay_gain: ReplayGainInfo,
}

impl Volume {
    pub fn new(replay_gain: ReplayGainInfo) -> Volume {
        Volume {
            output_bits: AtomicU32::new(1.0f32.to_bits()),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            replay_gain,
        }
    }

    /// Whether the software amplifier can process this sample coding.
    pub fn supports_format(codec: Codec) -> bool {
        matches!(
            codec,
            Codec::U8 | Codec::S8 | Codec::S16 | Codec::S32 | Codec::F32 | Codec::F64
        )
    }

    pub fn set_volume(&self, factor: f32) {
        self.output_bits
            .store(factor.max(0.0).to_bits(), Ordering::Release);
    }

    pub fn output_factor(&self) -> f32 {
        f32::from_bits(self.output_bits.load(Ordering::Acquire))
    }

    pub fn gain_factor(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Acquire))
    }

    /// Recomputes the replay-gain multiplier from the current configuration.
    pub fn update_replay_gain(&self, cfg: &AudioConfig) {
        let multiplier = replay_gain_multiplier(cfg, &self.replay_gain);
        self.gain_bits
            .store(multiplier.to_bits(), Ordering::Release);
    }

    /// Applies `output_factor * gain_factor` to every sample in place.
    pub fn amplify(&self, codec: Codec, block: &mut Block) {
        let amp = self.output_factor() * self.gain_factor();
        if (amp - 1.0).abs() <= f32::EPSILON {
            return;
        }
        match codec {
            Codec::F32 => {
                for chunk in block.data.chunks_exact_mut(4) {
                    let v = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    chunk.copy_from_slice(&(v * amp).to_ne_bytes());
                }
            }
            Codec::F64 => {
                let amp = amp as f64;
                for chunk in block.data.chunks_exact_mut(8) {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(chunk);
                    let v = f64::from_ne_bytes(bytes);
                    chunk.copy_from_slice(&(v * amp).to_ne_bytes());
                }
            }
            Codec::S16 => {
                for chunk in block.data.chunks_exact_mut(2) {
                    let v = i16::from_ne_bytes([chunk[0], chunk[1]]) as f32 * amp;
                    let v = v.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                    chunk.copy_from_slice(&v.to_ne_bytes());
                }
            }
            Codec::S32 => {
                let amp = amp as f64;
                for chunk in block.data.chunks_exact_mut(4) {
                    let v = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
                        * amp;
                    let v = v.clamp(i32::MIN as f64, i32::MAX as f64) as i32;
                    chunk.copy_from_slice(&v.to_ne_bytes());
                }
            }
            Codec::S8 => {
                for byte in block.data.iter_mut() {
                    let v = (*byte as i8) as f32 * amp;
                    *byte = v.clamp(i8::MIN as f32, i8::MAX as f32) as i8 as u8;
                }
            }
            Codec::U8 => {
                for byte in block.data.iter_mut() {
                    let v = (*byte as f32 - 128.0) * amp + 128.0;
                    *byte = v.clamp(0.0, 255.0) as u8;
                }
            }
            Codec::S24 | Codec::Passthrough(_) => {}
        }
    }
}

/// Selects the replay-gain multiplier:
/// mode with fallback to the other when no data, `gain + preamp` (or the
/// default gain), `10^(gain/20)`, optional peak protection, then the
/// configured linear gain.
pub fn replay_gain_multiplier(cfg: &AudioConfig, rg: &ReplayGainInfo) -> f32 {
    let mut multiplier = match cfg.replay_gain_mode {
        ReplayGainMode::Off => 1.0,
        mode => {
            let track = (rg.track_gain, rg.track_peak);
            let album = (rg.album_gain, rg.album_peak);
            let (gain, peak) = match mode {
                ReplayGainMode::Track => {
                    if track.0.is_none() && album.0.is_some() {
                        album
                    } else {
                        track
                    }
                }
                ReplayGainMode::Album => {
                    if album.0.is_none() && track.0.is_some() {
                        track
                    } else {
                        album
                    }
                }
                ReplayGainMode::Off => unreachable!(),
            };

            let gain_db = match gain {
                Some(g) => g + cfg.replay_gain_preamp,
                None => cfg.replay_gain_default,
            };
            let mut multiplier = 10f32.powf(gain_db / 20.0);

            if cfg.replay_gain_peak_protection {
                if let Some(peak) = peak {
                    if peak > 0.0 && peak * multiplier > 1.0 {
                        multiplier = 1.0 / peak;
                    }
                }
            }
            multiplier
        }
    };
    multiplier *= cfg.gain;
    multiplier
}
