//! cadenza-audio — audio output core of the Cadenza media player.
//!
//! The core accepts decoded audio blocks from an upstream decoder, drives
//! them through a conversion/amplification chain, keeps playback in sync
//! with the master reference clock, and hands them to a platform sink.
//!
//! # Architecture
//!
//! ```text
//! decoder ── Stream::play ─▶ FilterChain ─▶ Volume ─▶ sync controller
//!                 │                                        │
//!                 │                              (silence / flush / ±Hz)
//!                 │                                        ▼
//!                 └─ control surface          ResamplerChain ─▶ AudioMeter ─▶ Sink
//! ```
//!
//! Three kinds of threads interact per stream: the decoder thread moves
//! blocks forward (`play`, `flush`, `drain`), control threads reconfigure
//! (pause, rate, delay, volume, filters, restarts), and the sink's callback
//! thread reports timing, drain completion and gain.

pub mod block;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod fifo;
pub mod filter;
pub mod format;
pub mod listeners;
mod lock;
pub mod meter;
pub mod output;
pub mod sink;
pub mod stream;
pub mod sync;
pub mod time;
pub mod volume;

pub use block::{Block, BLOCK_FLAG_DISCONTINUITY};
pub use clock::MediaClock;
pub use config::{AudioConfig, ReplayGainMode, VOLUME_DEFAULT, VOLUME_MAX};
pub use error::AudioError;
pub use format::{AudioFormat, ChannelMask, Codec};
pub use output::AudioOutput;
pub use stream::{PlayResult, Stream, StreamConfig, RESTART_FILTERS, RESTART_OUTPUT};
pub use volume::ReplayGainInfo;
