//! Error type for construction-time failures.
//!
//! Transient play-path incidents (dropped buffers, late flushes, silence
//! insertion) are never surfaced as errors; they are counted and exported
//! through [`Stream::get_reset_stats`](crate::stream::Stream::get_reset_stats).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    /// Channel count or sample rate outside the supported range.
    #[error("invalid audio format: {0}")]
    FormatInvalid(String),

    /// No stage chain can bridge the two formats.
    #[error("cannot build filter pipeline: {0}")]
    PipelineBuildFailed(String),

    /// Pipeline construction would exceed [`MAX_FILTERS`](crate::filter::MAX_FILTERS).
    #[error("maximum number of filters ({0}) reached")]
    MaxFiltersExceeded(usize),

    /// A requested restart could not rebuild the sink or the filter chain.
    #[error("audio output restart failed: {0}")]
    RestartFailed(String),

    /// The sink refused to open with the negotiated format.
    #[error("cannot open audio sink: {0}")]
    SinkOpenFailed(String),
}
