//! Audio output configuration.
//!
//! The core takes a plain config struct instead of reading a variable store;
//! parsing of the user-facing colon-separated filter list happens at the edge
//! with [`parse_filter_list`], and insertion order is a pure function over the
//! parsed vector.

use serde::{Deserialize, Serialize};

/// User volume corresponding to a 1.0 amplification factor.
pub const VOLUME_DEFAULT: u32 = 256;
/// Highest user volume.
pub const VOLUME_MAX: u32 = 512;
/// Default step for relative volume changes.
pub const VOLUME_STEP: u32 = 32;

/// Replay-gain source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplayGainMode {
    /// Replay gain disabled.
    #[default]
    #[serde(rename = "")]
    Off,
    Track,
    Album,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Ordered user filter names inserted between the decoder and the
    /// conversion stages.
    pub filters: Vec<String>,
    /// Visualization module name, when any (kept in the chain position the
    /// filter list dictates; rendering itself is outside the core).
    pub visual: Option<String>,
    pub replay_gain_mode: ReplayGainMode,
    /// dB applied on top of the per-track/album gain.
    pub replay_gain_preamp: f32,
    /// dB applied when the selected mode carries no data.
    pub replay_gain_default: f32,
    pub replay_gain_peak_protection: bool,
    /// Linear gain applied after replay gain.
    pub gain: f32,
    /// Insert a pitch-preserving time-stretch stage first in the chain.
    pub time_stretch: bool,
    pub volume_step: u32,
    pub mute: bool,
    /// User volume, `0..=VOLUME_MAX`; `VOLUME_DEFAULT` is unity.
    pub volume: u32,
    /// Bit-exact output: no software volume, no filter chain.
    pub bitexact: bool,
}

impl Default for AudioConfig {
    fn default() -> AudioConfig {
        AudioConfig {
            filters: Vec::new(),
            visual: None,
            replay_gain_mode: ReplayGainMode::Off,
            replay_gain_preamp: 0.0,
            replay_gain_default: -7.0,
            replay_gain_peak_protection: true,
            gain: 1.0,
            time_stretch: true,
            volume_step: VOLUME_STEP,
            mute: false,
            volume: VOLUME_DEFAULT,
            bitexact: false,
        }
    }
}

/// Rank of a filter name in the user chain; lower ranks come first.
fn filter_rank(name: &str) -> i32 {
    const RANKS: [(&str, i32); 1] = [("equalizer", 0)];
    RANKS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, rank)| *rank)
        .unwrap_or(i32::MAX)
}

/// Inserts `name` before the first filter of strictly greater rank.
/// Returns false when the filter is already present.
pub fn insert_filter(filters: &mut Vec<String>, name: &str) -> bool {
    if name.is_empty() || filters.iter().any(|f| f == name) {
        return false;
    }
    let rank = filter_rank(name);
    let position = filters
        .iter()
        .position(|f| filter_rank(f) > rank)
        .unwrap_or(filters.len());
    filters.insert(position, name.to_string());
    true
}

/// Removes `name`. Returns false when it was not present.
pub fn remove_filter(filters: &mut Vec<String>, name: &str) -> bool {
    let before = filters.len();
    filters.retain(|f| f != name);
    filters.len() != before
}

/// Splits the user-facing colon-separated filter list, dropping empty
/// entries.
pub fn parse_filter_list(list: &str) -> Vec<String> {
    list.split(':')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Joins a filter vector back into the colon-separated form.
pub fn format_filter_list(filters: &[String]) -> String {
    filters.join(":")
}
