use std::collections::VecDeque;
use rubato::{Fft, FixedSync, Resampler};
use rubato::audioadapter::Adapter;
use crate::messages::AudioFrame;
use super::AudioProcessor;
use anyhow::{bail, Result};

// Custom adapter to bridge raw buffers to Rubato
struct PlanarBuffer<'a> {
    data: &'a [Vec<f32>],
    channels: usize,
    frames: usize,
}

impl<'a> Adapter<'a, f32> for PlanarBuffer<'a> {
    fn channels(&self) -> usize { self.channels }
    fn frames(&self) -> usize { self.frames }
    fn read_sample(&self, channel: usize, frame: usize) -> Option<f32> {
        self.data.get(channel).and_then(|ch| ch.get(frame)).copied()
    }
    unsafe fn read_sample_unchecked(&self, channel: usize, frame: usize) -> f32 {
        *self.data.get_unchecked(channel).get_unchecked(frame)
    }
}

/// Converts device audio to the network format: channel down/up-mix first,
/// then sample-rate conversion with an FFT resampler when the rates differ.
pub struct ResampleProcessor {
    resampler: Option<Fft<f32>>,
    source_rate: u32,
    target_rate: u32,
    target_channels: u16,
    chunk_size: usize,
    input_buffer: VecDeque<f32>,
    ready_queue: VecDeque<AudioFrame>,
    current_timestamp: f64,
    emitted_frames: u64,

    // Reusable buffer to avoid allocations in channel conversion
    mix_buffer: Vec<f32>,
}

impl ResampleProcessor {
    pub fn new(source_rate: u32, target_rate: u32, target_channels: u16) -> Self {
        let chunk_size = 1024;
        let resampler = if source_rate != target_rate {
            match Fft::<f32>::new(
                source_rate as usize,
                target_rate as usize,
                chunk_size,
                1,
                target_channels as usize,
                FixedSync::Input,
            ) {
                Ok(resampler) => Some(resampler),
                Err(err) => {
                    log::warn!(
                        "Failed to create resampler {}->{}Hz: {}. Falling back to passthrough.",
                        source_rate, target_rate, err
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            resampler,
            source_rate,
            target_rate,
            target_channels,
            chunk_size,
            input_buffer: VecDeque::with_capacity(chunk_size * 4),
            ready_queue: VecDeque::with_capacity(8),
            current_timestamp: 0.0,
            emitted_frames: 0,
            mix_buffer: Vec::with_capacity(chunk_size * 2),
        }
    }

    /// Whether frames from a device with this format need any conditioning.
    pub fn needed(source_rate: u32, source_channels: u16, target_rate: u32, target_channels: u16) -> bool {
        source_rate != target_rate || source_channels != target_channels
    }

    fn convert_channels(&mut self, frame: &AudioFrame) -> Vec<f32> {
        if self.target_channels == 1 && frame.channels > 1 {
            // Multi-channel -> Mono downmix
            self.mix_buffer.clear();
            let ch_count = frame.channels as usize;
            for chunk in frame.samples.chunks_exact(ch_count) {
                self.mix_buffer.push(chunk.iter().sum::<f32>() / ch_count as f32);
            }
            self.mix_buffer.clone()
        } else if self.target_channels == 2 && frame.channels == 1 {
            // Mono -> Stereo upmix
            self.mix_buffer.clear();
            for &sample in &frame.samples {
                self.mix_buffer.push(sample);
                self.mix_buffer.push(sample);
            }
            self.mix_buffer.clone()
        } else {
            frame.samples.clone()
        }
    }

    fn next_timestamp(&mut self, frames: usize) -> f64 {
        let ts = self.current_timestamp + self.emitted_frames as f64 / self.target_rate as f64;
        self.emitted_frames += frames as u64;
        ts
    }

    fn resample_buffered(&mut self) {
        let channels = self.target_channels as usize;
        let mut planar_data: Vec<Vec<f32>> = (0..channels)
            .map(|_| Vec::with_capacity(self.chunk_size))
            .collect();

        loop {
            let chunk_size = match self.resampler.as_ref() {
                Some(resampler) => resampler.input_frames_next(),
                None => return,
            };
            if self.input_buffer.len() < chunk_size * channels {
                return;
            }
            for channel_buf in &mut planar_data {
                channel_buf.clear();
            }
            for _ in 0..chunk_size {
                for channel_buf in &mut planar_data {
                    let Some(sample) = self.input_buffer.pop_front() else {
                        return;
                    };
                    channel_buf.push(sample);
                }
            }

            let planar_input = PlanarBuffer {
                data: &planar_data,
                channels,
                frames: chunk_size,
            };

            let Some(resampler) = self.resampler.as_mut() else {
                return;
            };
            let output = match resampler.process(&planar_input, 0, None) {
                Ok(output) => output,
                Err(e) => {
                    log::warn!("Resampler error: {}", e);
                    continue;
                }
            };

            let mut samples = Vec::with_capacity(output.frames() * channels);
            for i in 0..output.frames() {
                for ch in 0..channels {
                    match output.read_sample(ch, i) {
                        Some(sample) => samples.push(sample),
                        None => return,
                    }
                }
            }

            if !samples.is_empty() {
                let frames = samples.len() / channels;
                let timestamp = self.next_timestamp(frames);
                self.ready_queue.push_back(AudioFrame {
                    samples,
                    sample_rate: self.target_rate,
                    channels: self.target_channels,
                    timestamp,
                });
            }
        }
    }
}

impl AudioProcessor for ResampleProcessor {
    fn process(&mut self, frame: AudioFrame) -> Result<Option<AudioFrame>> {
        if frame.sample_rate != self.source_rate {
            bail!(
                "Resampler configured for {} Hz received a {} Hz frame",
                self.source_rate,
                frame.sample_rate
            );
        }

        let samples = self.convert_channels(&frame);
        if self.input_buffer.is_empty() && self.ready_queue.is_empty() {
            self.current_timestamp = frame.timestamp;
            self.emitted_frames = 0;
        }

        if self.resampler.is_some() {
            self.input_buffer.extend(&samples);
            self.resample_buffered();
        } else {
            let frames = samples.len() / self.target_channels as usize;
            let timestamp = self.next_timestamp(frames);
            self.ready_queue.push_back(AudioFrame {
                samples,
                sample_rate: self.source_rate,
                channels: self.target_channels,
                timestamp,
            });
        }

        Ok(self.ready_queue.pop_front())
    }

    fn drain_ready(&mut self) -> Result<Option<AudioFrame>> {
        Ok(self.ready_queue.pop_front())
    }

    /// Resample whatever is left in the input buffer, zero-padded to a full
    /// chunk, and trim the output to the length the real input maps to.
    fn flush(&mut self) -> Vec<AudioFrame> {
        let channels = self.target_channels as usize;
        let pending_frames = self.input_buffer.len() / channels;
        let chunk_size = self.resampler.as_ref().map(|r| r.input_frames_next());
        if let (Some(chunk_size), true) = (chunk_size, pending_frames > 0) {
            self.input_buffer.resize(chunk_size * channels, 0.0);
            let queued = self.ready_queue.len();
            self.resample_buffered();
            let expected = (pending_frames as u64 * self.target_rate as u64)
                .div_ceil(self.source_rate as u64) as usize;
            if self.ready_queue.len() > queued {
                if let Some(tail) = self.ready_queue.back_mut() {
                    tail.samples.truncate(expected * channels);
                }
            }
        }
        self.input_buffer.clear();
        self.ready_queue.drain(..).collect()
    }

    fn reset(&mut self) {
        self.input_buffer.clear();
        self.ready_queue.clear();
        self.current_timestamp = 0.0;
        self.emitted_frames = 0;
    }
}
