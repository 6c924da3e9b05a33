//! Audio output instance: the sink handle, the user volume interface, the
//! meter and the event listeners.
//!
//! Volume transactions take the volume lock, apply the change (device volume
//! when the sink has one, software amplification otherwise) and notify
//! listeners only after every lock is released.

use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

use crate::config::{insert_filter, remove_filter, AudioConfig, ReplayGainMode, VOLUME_DEFAULT, VOLUME_MAX};
use crate::error::AudioError;
use crate::listeners::ListenerRegistry;
use crate::lock::{LockLevel, OrderedMutex};
use crate::meter::AudioMeter;
use crate::sink::Sink;
use crate::stream::{Stream, StreamConfig, RESTART_FILTERS, RESTART_OUTPUT};

#[derive(Debug, Clone, Copy)]
struct VolumeVar {
    volume: u32,
    mute: bool,
}

pub struct AudioOutput {
    sink: Arc<dyn Sink>,
    config: Mutex<AudioConfig>,
    meter: AudioMeter,
    volume_var: OrderedMutex<VolumeVar>,
    volume_listeners: ListenerRegistry<f32>,
    mute_listeners: ListenerRegistry<bool>,
    device_listeners: ListenerRegistry<String>,
    current: Mutex<Weak<Stream>>,
}

impl AudioOutput {
    pub fn new(sink: Arc<dyn Sink>, config: AudioConfig) -> Arc<AudioOutput> {
        let volume = config.volume.min(VOLUME_MAX);
        let mute = config.mute;
        Arc::new(AudioOutput {
            sink,
            config: Mutex::new(config),
            meter: AudioMeter::new(),
            volume_var: OrderedMutex::new(LockLevel::Volume, VolumeVar { volume, mute }),
            volume_listeners: ListenerRegistry::new(),
            mute_listeners: ListenerRegistry::new(),
            device_listeners: ListenerRegistry::new(),
            current: Mutex::new(Weak::new()),
        })
    }

    /// Creates the stream for a decoded elementary stream and applies the
    /// current volume settings to it.
    pub fn new_stream(self: &Arc<Self>, cfg: StreamConfig) -> Result<Arc<Stream>, AudioError> {
        let stream = Stream::new(Arc::clone(self), cfg)?;
        let (volume, mute) = {
            let var = self.volume_var.lock();
            (var.volume, var.mute)
        };
        self.apply_volume(volume, mute);
        Ok(stream)
    }

    pub(crate) fn sink(&self) -> &dyn Sink {
        &*self.sink
    }

    pub fn meter(&self) -> &AudioMeter {
        &self.meter
    }

    pub(crate) fn config_snapshot(&self) -> AudioConfig {
        self.config.lock().clone()
    }

    pub(crate) fn register_stream(&self, stream: &Arc<Stream>) {
        *self.current.lock() = Arc::downgrade(stream);
    }

    fn current_stream(&self) -> Option<Arc<Stream>> {
        self.current.lock().upgrade()
    }

    /*
     * Volume interface
     */

    fn apply_volume(&self, volume: u32, mute: bool) {
        let factor = volume as f32 / VOLUME_DEFAULT as f32;
        if self.sink.can_set_volume() {
            self.sink.set_volume(factor, mute);
        } else if let Some(stream) = self.current_stream() {
            // Software fallback through the stream amplifier.
            stream.notify_gain(if mute { 0.0 } else { factor });
        }
    }

    pub fn volume(&self) -> u32 {
        self.volume_var.lock().volume
    }

    pub fn is_muted(&self) -> bool {
        self.volume_var.lock().mute
    }

    /// Sets the volume, clamped to `0..=VOLUME_MAX`. The mute state is not
    /// changed. Returns the committed volume.
    pub fn set_volume(&self, volume: u32) -> u32 {
        let (volume, mute) = {
            let mut var = self.volume_var.lock();
            var.volume = volume.min(VOLUME_MAX);
            (var.volume, var.mute)
        };
        self.apply_volume(volume, mute);
        // Listeners run with no core lock held.
        self.volume_listeners
            .notify(volume as f32 / VOLUME_DEFAULT as f32);
        volume
    }

    /// Raises (or lowers) the volume by `steps` times the configured step.
    pub fn volume_up(&self, steps: i32) -> u32 {
        let step = self.config.lock().volume_step as i64;
        let (volume, mute) = {
            let mut var = self.volume_var.lock();
            let next = var.volume as i64 + steps as i64 * step;
            var.volume = next.clamp(0, VOLUME_MAX as i64) as u32;
            (var.volume, var.mute)
        };
        self.apply_volume(volume, mute);
        self.volume_listeners
            .notify(volume as f32 / VOLUME_DEFAULT as f32);
        volume
    }

    /// Sets the mute state. Returns the committed state.
    pub fn set_mute(&self, mute: bool) -> bool {
        let volume = {
            let mut var = self.volume_var.lock();
            var.mute = mute;
            var.volume
        };
        self.apply_volume(volume, mute);
        self.mute_listeners.notify(mute);
        mute
    }

    pub fn toggle_mute(&self) -> bool {
        let (volume, mute) = {
            let mut var = self.volume_var.lock();
            var.mute = !var.mute;
            (var.volume, var.mute)
        };
        self.apply_volume(volume, mute);
        self.mute_listeners.notify(mute);
        mute
    }

    /*
     * Configuration surface
     */

    /// Adds or removes a user filter, keeping the deterministic chain order,
    /// and schedules a filters restart on the live stream. Returns whether
    /// the list changed.
    pub fn enable_filter(&self, name: &str, add: bool) -> bool {
        let changed = {
            let mut config = self.config.lock();
            if add {
                insert_filter(&mut config.filters, name)
            } else {
                remove_filter(&mut config.filters, name)
            }
        };
        if changed {
            debug!(
                "{} audio filter \"{name}\"",
                if add { "enabling" } else { "disabling" }
            );
            if let Some(stream) = self.current_stream() {
                stream.request_restart(RESTART_FILTERS);
            }
        }
        changed
    }

    /// Switches the replay-gain mode and recomputes the live stream's gain.
    pub fn set_replay_gain_mode(&self, mode: ReplayGainMode) {
        let snapshot = {
            let mut config = self.config.lock();
            config.replay_gain_mode = mode;
            config.clone()
        };
        if let Some(stream) = self.current_stream() {
            stream.refresh_replay_gain(&snapshot);
        }
    }

    /// Signals that the output device changed; the live stream restarts its
    /// output on the next play.
    pub fn device_changed(&self, device: &str) {
        debug!("audio device changed to \"{device}\"");
        if let Some(stream) = self.current_stream() {
            stream.request_restart(RESTART_OUTPUT);
        }
        self.device_listeners.notify(device.to_string());
    }

    /*
     * Listeners
     */

    /// Volume listeners receive the committed factor (1.0 = nominal).
    pub fn subscribe_volume(&self) -> crossbeam_channel::Receiver<f32> {
        self.volume_listeners.subscribe()
    }

    pub fn subscribe_mute(&self) -> crossbeam_channel::Receiver<bool> {
        self.mute_listeners.subscribe()
    }

    pub fn subscribe_device(&self) -> crossbeam_channel::Receiver<String> {
        self.device_listeners.subscribe()
    }
}
