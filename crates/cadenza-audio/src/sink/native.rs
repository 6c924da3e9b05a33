//! cpal-backed platform sink (CoreAudio / ALSA / WASAPI).
//!
//! The sink negotiates an f32 stream at the device rate, queues blocks in a
//! dated FIFO and lets the cpal callback drain it. The reported delay is the
//! queued sample count at the mixer rate, which the sync controller treats as
//! sink latency. cpal streams are not `Send`, so a worker thread owns the
//! stream for the lifetime of the output.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::error::AudioError;
use crate::fifo::Fifo;
use crate::filter::FiltersCfg;
use crate::format::{AudioFormat, ChannelMask, Codec, MAX_RATE, MIN_RATE};
use crate::sink::Sink;
use crate::time::{tick_from_samples, Tick};
use crate::Block;

struct Shared {
    /// Blocks waiting for the device, re-dated for continuity.
    queue: Mutex<Fifo>,
    /// Partial block being consumed by the callback.
    pending: Mutex<Option<(Block, usize)>>,
    queued_samples: AtomicI64,
    rate: AtomicU32,
    channels: AtomicU32,
    stop: AtomicBool,
    paused: AtomicBool,
    volume_bits: AtomicU32,
    mute: AtomicBool,
    failed: AtomicBool,
}

pub struct CpalSink {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CpalSink {
    pub fn new() -> Arc<CpalSink> {
        Arc::new(CpalSink {
            shared: Arc::new(Shared {
                queue: Mutex::new(Fifo::new(48_000)),
                pending: Mutex::new(None),
                queued_samples: AtomicI64::new(0),
                rate: AtomicU32::new(48_000),
                channels: AtomicU32::new(2),
                stop: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                volume_bits: AtomicU32::new(1.0f32.to_bits()),
                mute: AtomicBool::new(false),
                failed: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    fn drop_queue(&self) {
        self.shared.queue.lock().set(None);
        *self.shared.pending.lock() = None;
        self.shared.queued_samples.store(0, Ordering::Release);
    }
}

impl Sink for CpalSink {
    fn open(
        &self,
        mixer_format: &mut AudioFormat,
        _profile: i32,
        _filter_format: &mut AudioFormat,
        _filters_cfg: &mut FiltersCfg,
    ) -> Result<(), AudioError> {
        self.close();

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::SinkOpenFailed("no default output device".into()))?;
        let default_cfg = device
            .default_output_config()
            .map_err(|e| AudioError::SinkOpenFailed(format!("no output config: {e}")))?;

        // Keep the stream rate when the device supports it, otherwise follow
        // the device default.
        let wanted_rate = mixer_format.rate;
        let supports_rate = device
            .supported_output_configs()
            .map(|configs| {
                configs.into_iter().any(|range| {
                    range.sample_format() == cpal::SampleFormat::F32
                        && range.min_sample_rate().0 <= wanted_rate
                        && range.max_sample_rate().0 >= wanted_rate
                })
            })
            .unwrap_or(false);
        let rate = if supports_rate {
            wanted_rate
        } else {
            default_cfg.sample_rate().0.clamp(MIN_RATE, MAX_RATE)
        };
        let channels = (default_cfg.channels() as usize).clamp(1, 8) as u16;

        mixer_format.codec = Codec::F32;
        mixer_format.rate = rate;
        mixer_format.physical_channels = ChannelMask::default_for(channels as usize);
        mixer_format.original_channels = mixer_format.physical_channels;
        mixer_format.prepare();
        info!("opening cpal output: {}", mixer_format.describe());

        let shared = Arc::clone(&self.shared);
        shared.rate.store(rate, Ordering::Release);
        shared.channels.store(channels as u32, Ordering::Release);
        shared.stop.store(false, Ordering::Release);
        shared.failed.store(false, Ordering::Release);
        *shared.queue.lock() = Fifo::new(rate);

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // The cpal stream is not Send; the worker re-acquires the device and
        // owns the stream for the lifetime of the output.
        drop(device);
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("cadenza-audio-out".into())
            .spawn(move || run_output(worker_shared, config))
            .map_err(|e| AudioError::SinkOpenFailed(format!("cannot spawn output thread: {e}")))?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    fn close(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        self.drop_queue();
    }

    fn play(&self, block: Block, _system_pts: Tick) {
        if self.shared.failed.load(Ordering::Acquire) {
            return;
        }
        self.shared
            .queued_samples
            .fetch_add(block.nb_samples as i64, Ordering::AcqRel);
        self.shared.queue.lock().push(block);
    }

    fn flush(&self) {
        self.drop_queue();
    }

    fn can_report_delay(&self) -> bool {
        true
    }

    fn delay(&self) -> Option<Tick> {
        let rate = self.shared.rate.load(Ordering::Acquire);
        let queued = self.shared.queued_samples.load(Ordering::Acquire).max(0);
        Some(tick_from_samples(queued, rate))
    }

    fn can_pause(&self) -> bool {
        true
    }

    fn pause(&self, paused: bool, _date: Tick) {
        self.shared.paused.store(paused, Ordering::Release);
    }

    fn can_set_volume(&self) -> bool {
        true
    }

    fn set_volume(&self, volume: f32, mute: bool) {
        self.shared
            .volume_bits
            .store(volume.max(0.0).to_bits(), Ordering::Release);
        self.shared.mute.store(mute, Ordering::Release);
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker thread: owns the cpal stream until the sink closes.
fn run_output(shared: Arc<Shared>, config: cpal::StreamConfig) {
    let Some(device) = cpal::default_host().default_output_device() else {
        error!("output device disappeared before the stream started");
        shared.failed.store(true, Ordering::Release);
        return;
    };
    let callback_shared = Arc::clone(&shared);
    let err_shared = Arc::clone(&shared);

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            fill_output(&callback_shared, data);
        },
        move |err| {
            error!("audio stream error: {err}");
            err_shared.failed.store(true, Ordering::Release);
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            error!("cannot build output stream: {e}");
            shared.failed.store(true, Ordering::Release);
            return;
        }
    };
    if let Err(e) = stream.play() {
        error!("cannot start output stream: {e}");
        shared.failed.store(true, Ordering::Release);
        return;
    }

    while !shared.stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// cpal callback: drains queued blocks, applies device volume, injects
/// silence on underrun.
fn fill_output(shared: &Shared, data: &mut [f32]) {
    if shared.paused.load(Ordering::Acquire) {
        data.fill(0.0);
        return;
    }

    let volume = if shared.mute.load(Ordering::Acquire) {
        0.0
    } else {
        f32::from_bits(shared.volume_bits.load(Ordering::Acquire))
    };
    let mut written = 0usize;
    let mut consumed_frames = 0i64;
    while written < data.len() {
        let mut pending = shared.pending.lock();
        if pending.is_none() {
            *pending = shared.queue.lock().pop().map(|b| (b, 0));
        }
        let Some((block, offset)) = pending.as_mut() else {
            // Underrun: pad with silence.
            data[written..].fill(0.0);
            break;
        };

        let samples: Vec<f32> = block.as_f32().collect();
        let remaining = samples.len() - *offset;
        let take = remaining.min(data.len() - written);
        for (dst, src) in data[written..written + take]
            .iter_mut()
            .zip(&samples[*offset..*offset + take])
        {
            *dst = *src * volume;
        }
        written += take;
        *offset += take;
        if *offset >= samples.len() {
            // Account whole blocks; a partially drained block stays counted.
            consumed_frames += block.nb_samples as i64;
            *pending = None;
        }
    }

    if consumed_frames > 0 {
        shared
            .queued_samples
            .fetch_sub(consumed_frames, Ordering::AcqRel);
    }

    if written > 0 && written < data.len() {
        warn!("audio output underrun ({} samples)", data.len() - written);
    }
}
