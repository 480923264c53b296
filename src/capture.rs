//! Microphone backend on top of cpal.
//!
//! The cpal callback runs on the audio thread and only pushes whole frames
//! into a lock-free ring. The polling thread moves them into the looping
//! device buffer whenever it asks for the write position.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::device::{AudioDeviceSource, DeviceError, Recording};
use crate::pcm;
use crate::ring_buffer::LoopBuffer;

struct ActiveStream {
    _stream: cpal::Stream,
    consumer: HeapCons<f32>,
    buffer: LoopBuffer,
    recording: Arc<AtomicBool>,
    scratch: Vec<f32>,
}

impl ActiveStream {
    fn drain(&mut self) {
        let channels = self.buffer.channels();
        loop {
            let available = self.consumer.occupied_len() / channels * channels;
            if available == 0 || self.buffer.is_stopped() {
                break;
            }
            let take = available.min(self.scratch.len());
            let popped = self.consumer.pop_slice(&mut self.scratch[..take]);
            self.buffer.write(&self.scratch[..popped]);
        }
        if self.buffer.is_stopped() {
            self.recording.store(false, Ordering::Relaxed);
        }
    }
}

/// Input devices of the default cpal host.
pub struct CpalDevice {
    host: cpal::Host,
    streams: HashMap<String, ActiveStream>,
}

impl CpalDevice {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
            streams: HashMap::new(),
        }
    }

    fn find(&self, name: &str) -> Result<cpal::Device, DeviceError> {
        let mut devices = self
            .host
            .input_devices()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        devices
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))
    }

    /// Pick a config at the requested rate, or the device default when no
    /// supported range covers it.
    fn pick_config(device: &cpal::Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat), DeviceError> {
        let wanted = SampleRate(sample_rate);
        if let Ok(ranges) = device.supported_input_configs() {
            let mut matching: Vec<_> = ranges
                .filter(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
                .filter(|r| matches!(r.sample_format(), SampleFormat::F32 | SampleFormat::I16))
                .collect();
            matching.sort_by_key(|r| (r.sample_format() != SampleFormat::F32, r.channels()));
            if let Some(range) = matching.into_iter().next() {
                let config = range.with_sample_rate(wanted);
                return Ok((config.config(), config.sample_format()));
            }
        }

        let config = device
            .default_input_config()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        log::warn!(
            "{} Hz not supported, falling back to {} Hz",
            sample_rate,
            config.sample_rate().0
        );
        Ok((config.config(), config.sample_format()))
    }

    fn build_stream(
        device: &cpal::Device,
        config: &StreamConfig,
        format: SampleFormat,
        mut producer: HeapProd<f32>,
        recording: Arc<AtomicBool>,
    ) -> Result<cpal::Stream, DeviceError> {
        let channels = config.channels as usize;
        let on_error = {
            let recording = Arc::clone(&recording);
            move |err: cpal::StreamError| {
                log::error!("Audio input error: {}", err);
                recording.store(false, Ordering::Relaxed);
            }
        };

        let stream = match format {
            SampleFormat::F32 => device.build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let fit = producer.vacant_len() / channels * channels;
                    producer.push_slice(&data[..data.len().min(fit)]);
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => {
                let mut scratch = Vec::new();
                device.build_input_stream(
                    config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let fit = producer.vacant_len() / channels * channels;
                        scratch.clear();
                        scratch.extend(data[..data.len().min(fit)].iter().map(|&s| pcm::int16_to_sample(s)));
                        producer.push_slice(&scratch);
                    },
                    on_error,
                    None,
                )
            }
            other => return Err(DeviceError::UnsupportedFormat(format!("{:?}", other))),
        };
        stream.map_err(|e| DeviceError::Backend(e.to_string()))
    }
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDeviceSource for CpalDevice {
    fn devices(&self) -> Vec<String> {
        self.host
            .input_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default()
    }

    fn start(
        &mut self,
        device: &str,
        looping: bool,
        duration_secs: u32,
        sample_rate: u32,
    ) -> Result<Recording, DeviceError> {
        self.streams.remove(device);
        let input = self.find(device)?;
        let (config, format) = Self::pick_config(&input, sample_rate)?;
        log::info!("Opening {} with {:?} ({:?})", device, config, format);

        let frames = duration_secs as usize * config.sample_rate.0 as usize;
        let channels = config.channels as usize;
        let (producer, consumer) = HeapRb::<f32>::new((frames * channels).max(channels)).split();
        let recording = Arc::new(AtomicBool::new(true));
        let stream = Self::build_stream(&input, &config, format, producer, Arc::clone(&recording))?;
        stream.play().map_err(|e| DeviceError::Backend(e.to_string()))?;

        self.streams.insert(
            device.to_string(),
            ActiveStream {
                _stream: stream,
                consumer,
                buffer: LoopBuffer::new(frames, channels, looping),
                recording,
                scratch: vec![0.0; 4096 * channels],
            },
        );
        Ok(Recording {
            frames,
            channels: config.channels,
            sample_rate: config.sample_rate.0,
        })
    }

    fn end(&mut self, device: &str) {
        if self.streams.remove(device).is_some() {
            log::info!("Closed {}", device);
        }
    }

    fn is_recording(&self, device: &str) -> bool {
        self.streams
            .get(device)
            .map(|s| s.recording.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn position(&mut self, device: &str) -> usize {
        match self.streams.get_mut(device) {
            Some(stream) => {
                stream.drain();
                stream.buffer.position()
            }
            None => 0,
        }
    }

    fn get_data(&mut self, device: &str, buffer: &mut [f32], from: usize) -> bool {
        match self.streams.get(device) {
            Some(stream) => stream.buffer.read(buffer, from),
            None => false,
        }
    }
}
