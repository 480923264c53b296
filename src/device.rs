//! Recording-device capability consumed by the capture source.
//!
//! A device records into a looping buffer (see [`LoopBuffer`]) and exposes its
//! write position; the consumer pulls samples from a position it tracks itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::ring_buffer::LoopBuffer;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("audio device not found: {0}")]
    NotFound(String),
    #[error("no audio input devices available")]
    NoDevices,
    #[error("audio backend error: {0}")]
    Backend(String),
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
}

/// Shape of a started recording, as actually granted by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recording {
    pub frames: usize,     // Loop buffer capacity in frames
    pub channels: u16,
    pub sample_rate: u32,
}

impl Recording {
    pub fn samples(&self) -> usize {
        self.frames * self.channels as usize
    }
}

pub trait AudioDeviceSource {
    fn devices(&self) -> Vec<String>;

    fn start(
        &mut self,
        device: &str,
        looping: bool,
        duration_secs: u32,
        sample_rate: u32,
    ) -> Result<Recording, DeviceError>;

    fn end(&mut self, device: &str);

    fn is_recording(&self, device: &str) -> bool;

    /// Current write position in frames, in `0..frames`.
    fn position(&mut self, device: &str) -> usize;

    /// Fill `buffer` with interleaved samples starting at frame `from`,
    /// wrapping at the end of the loop buffer. False when nothing can be read.
    fn get_data(&mut self, device: &str, buffer: &mut [f32], from: usize) -> bool;
}

struct MemorySlot {
    buffer: LoopBuffer,
    recording: bool,
}

struct MemoryDeviceState {
    names: Vec<String>,
    channels: u16,
    native_rate: Option<u32>, // None = grant whatever rate is requested
    slots: HashMap<String, MemorySlot>,
}

/// In-memory recording device whose samples are pushed by the host.
///
/// Clones share state, so one clone can be handed to the capture scheduler
/// while another keeps injecting samples from the thread that owns the audio.
#[derive(Clone)]
pub struct MemoryDevice {
    inner: Arc<Mutex<MemoryDeviceState>>,
}

impl MemoryDevice {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_channels(names, 1)
    }

    pub fn with_channels<I, S>(names: I, channels: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Arc::new(Mutex::new(MemoryDeviceState {
                names: names.into_iter().map(Into::into).collect(),
                channels: channels.max(1),
                native_rate: None,
                slots: HashMap::new(),
            })),
        }
    }

    /// Record at `sample_rate` regardless of the rate requested on start.
    pub fn with_native_rate(self, sample_rate: u32) -> Self {
        self.state().native_rate = Some(sample_rate);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryDeviceState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write interleaved samples as if the device had just recorded them.
    /// Returns the number of frames accepted (zero when not recording).
    pub fn inject(&self, device: &str, samples: &[f32]) -> usize {
        let mut state = self.state();
        match state.slots.get_mut(device) {
            Some(slot) if slot.recording => {
                let accepted = slot.buffer.write(samples);
                if slot.buffer.is_stopped() {
                    slot.recording = false;
                }
                accepted
            }
            _ => 0,
        }
    }

    /// Simulate the platform dropping the recording.
    pub fn fail(&self, device: &str) {
        if let Some(slot) = self.state().slots.get_mut(device) {
            slot.recording = false;
        }
    }
}

impl AudioDeviceSource for MemoryDevice {
    fn devices(&self) -> Vec<String> {
        self.state().names.clone()
    }

    fn start(
        &mut self,
        device: &str,
        looping: bool,
        duration_secs: u32,
        sample_rate: u32,
    ) -> Result<Recording, DeviceError> {
        let mut state = self.state();
        if !state.names.iter().any(|n| n == device) {
            return Err(DeviceError::NotFound(device.to_string()));
        }
        let sample_rate = state.native_rate.unwrap_or(sample_rate);
        let frames = duration_secs as usize * sample_rate as usize;
        let channels = state.channels;
        state.slots.insert(
            device.to_string(),
            MemorySlot {
                buffer: LoopBuffer::new(frames, channels as usize, looping),
                recording: true,
            },
        );
        Ok(Recording {
            frames,
            channels,
            sample_rate,
        })
    }

    fn end(&mut self, device: &str) {
        self.state().slots.remove(device);
    }

    fn is_recording(&self, device: &str) -> bool {
        self.state()
            .slots
            .get(device)
            .map(|slot| slot.recording)
            .unwrap_or(false)
    }

    fn position(&mut self, device: &str) -> usize {
        self.state()
            .slots
            .get(device)
            .map(|slot| slot.buffer.position())
            .unwrap_or(0)
    }

    fn get_data(&mut self, device: &str, buffer: &mut [f32], from: usize) -> bool {
        match self.state().slots.get(device) {
            Some(slot) => slot.buffer.read(buffer, from),
            None => false,
        }
    }
}
