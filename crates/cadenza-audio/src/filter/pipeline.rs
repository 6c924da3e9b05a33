//! Conversion pipeline builder.
//!
//! The builder first looks for a single stage covering the whole transform,
//! then decomposes it into at most three stages. Channel and sample-format
//! changes always happen before the rate change, so downmixed audio goes
//! through the resampler.

use log::debug;

use crate::error::AudioError;
use crate::filter::convert::{FormatConvert, Remix};
use crate::filter::resample::Resample;
use crate::filter::{AudioFilter, FiltersCfg, MAX_FILTERS};
use crate::format::AudioFormat;

/// Locates one stage implementing the full `input` → `output` transform.
fn find_stage(
    input: &AudioFormat,
    output: &AudioFormat,
    cfg: &FiltersCfg,
) -> Option<Box<dyn AudioFilter>> {
    if let Some(stage) = FormatConvert::try_new(input, output) {
        return Some(Box::new(stage));
    }
    if let Some(stage) = Remix::try_new(input, output, cfg.headphones) {
        return Some(Box::new(stage));
    }
    if let Some(stage) = Resample::try_new(input, output) {
        return Some(Box::new(stage));
    }
    None
}

/// Splits a composite conversion in two. Returns the intermediate format and
/// the number of conversions left in the first part (0 when the transform was
/// atomic and cannot be split).
fn split_conversion(input: &AudioFormat, output: &AudioFormat) -> (AudioFormat, usize) {
    let format_change = input.codec != output.codec;
    let rate_change = input.rate != output.rate;
    let channels_change = input.physical_channels != output.physical_channels
        || input.original_channels != output.original_channels;
    let conversions = format_change as usize + rate_change as usize + channels_change as usize;

    if conversions <= 1 {
        return (output.clone(), 0);
    }

    let mut middle = output.clone();
    if conversions == 2 {
        if !format_change || !channels_change {
            // The rate change goes last.
            middle.rate = input.rate;
        } else {
            // No rate change: split between format and channels.
            middle.physical_channels = input.physical_channels;
            middle.original_channels = input.original_channels;
        }
    } else {
        // All three: keep the input rate through the intermediate.
        middle.rate = input.rate;
    }
    middle.prepare();
    (middle, conversions - 1)
}

/// Builds the stage sequence bridging `input` to `output`.
///
/// `existing` counts stages already in the chain; the total may not exceed
/// [`MAX_FILTERS`]. Partially built stages are released on failure.
pub fn create_pipeline(
    existing: usize,
    input: &AudioFormat,
    output: &AudioFormat,
    cfg: &FiltersCfg,
) -> Result<Vec<Box<dyn AudioFilter>>, AudioError> {
    if input.identical_to(output) {
        debug!("no need for any filter");
        return Ok(Vec::new());
    }

    debug!(
        "filter(s) {} -> {}",
        input.describe(),
        output.describe()
    );

    if existing + 1 > MAX_FILTERS {
        return Err(AudioError::MaxFiltersExceeded(MAX_FILTERS));
    }

    if let Some(stage) = find_stage(input, output, cfg) {
        debug!("found a filter for the whole conversion");
        return Ok(vec![stage]);
    }

    // Split the conversion; downmixing comes before resampling.
    let (mut middle, conversions) = split_conversion(input, output);
    if conversions == 0 {
        return Err(AudioError::PipelineBuildFailed(format!(
            "couldn't find a filter for the conversion {} -> {}",
            input.describe(),
            output.describe()
        )));
    }

    let mut first = find_stage(input, &middle, cfg);
    if first.is_none() && conversions == 2 {
        // Try with only one conversion in the first part.
        let (narrower, _) = split_conversion(input, &middle);
        middle = narrower;
        first = find_stage(input, &middle, cfg);
    }
    let Some(first) = first else {
        return Err(AudioError::PipelineBuildFailed(
            "couldn't find a filter for the first part of the conversion".into(),
        ));
    };

    if existing + 2 > MAX_FILTERS {
        return Err(AudioError::MaxFiltersExceeded(MAX_FILTERS));
    }

    if let Some(second) = find_stage(first.output_format(), output, cfg) {
        debug!("found 2 filters for the whole conversion");
        return Ok(vec![first, second]);
    }

    // Split the rest again.
    let first_out = first.output_format().clone();
    let (middle2, conversions2) = split_conversion(&first_out, output);
    if conversions2 == 0 {
        return Err(AudioError::PipelineBuildFailed(
            "couldn't find a filter for the second part of the conversion".into(),
        ));
    }
    if existing + 3 > MAX_FILTERS {
        return Err(AudioError::MaxFiltersExceeded(MAX_FILTERS));
    }

    let second = find_stage(&first_out, &middle2, cfg);
    let third = find_stage(&middle2, output, cfg);
    match (second, third) {
        (Some(second), Some(third)) => {
            debug!("found 3 filters for the whole conversion");
            Ok(vec![first, second, third])
        }
        _ => Err(AudioError::PipelineBuildFailed(
            "couldn't find filters for the second part of the conversion".into(),
        )),
    }
}
