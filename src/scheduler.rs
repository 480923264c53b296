//! Periodic capture driver.
//!
//! The host calls [`CaptureScheduler::tick`] from its update loop. Every
//! `poll_interval_secs` the scheduler pulls new samples from the device loop
//! buffer, conditions them to the network format, converts them to PCM16,
//! removes playback echo and hands the chunk to the sink (or keeps it until
//! [`CaptureScheduler::push_audio`] when auto-push is off).

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, info, warn};

use crate::capture_source::RingCaptureSource;
use crate::clock::{Clock, SessionClock};
use crate::config::CaptureConfig;
use crate::device::{AudioDeviceSource, DeviceError};
use crate::echo_reference::EchoReferenceStore;
use crate::messages::{AudioChunk, AudioFrame, CaptureEvent};
use crate::pcm;
use crate::processors::{run_chain, AudioProcessor, EchoCanceller, EchoEngine, ResampleProcessor};
use crate::stats::CaptureStatsHandle;
use crate::voice::VoiceDetector;

/// Receiver of finished PCM16 chunks.
pub trait AudioSink {
    fn send(&mut self, chunk: AudioChunk) -> Result<()>;
}

impl AudioSink for Sender<AudioChunk> {
    fn send(&mut self, chunk: AudioChunk) -> Result<()> {
        Sender::send(self, chunk).map_err(|_| anyhow!("audio receiver disconnected"))
    }
}

impl AudioSink for Vec<AudioChunk> {
    fn send(&mut self, chunk: AudioChunk) -> Result<()> {
        self.push(chunk);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
}

pub struct CaptureScheduler<D: AudioDeviceSource, S: AudioSink> {
    config: CaptureConfig,
    source: RingCaptureSource<D>,
    sink: S,
    conditioning: Vec<Box<dyn AudioProcessor>>,
    canceller: Option<EchoCanceller>,
    echo_reference: Option<EchoReferenceStore>,
    clock: Arc<dyn Clock>,
    voice: Option<VoiceDetector>,
    events: Option<Sender<CaptureEvent>>,
    state: CaptureState,
    blocked: bool,
    auto_push: bool,
    cooldown: f32,
    pending: Vec<AudioChunk>,
    byte_buffer: Vec<u8>,
    sequence: u64,
    stats: CaptureStatsHandle,
}

impl<D: AudioDeviceSource, S: AudioSink> CaptureScheduler<D, S> {
    /// Open the configured device and build the processing chain. With
    /// `enable_aec` set the WebRTC engine is created here.
    pub fn new(config: CaptureConfig, device: D, sink: S) -> Result<Self> {
        let stats = CaptureStatsHandle::new();
        let canceller = if config.enable_aec {
            Some(
                EchoCanceller::webrtc(config.sample_rate, config.aec_stream_delay_ms, stats.clone())
                    .context("failed to initialise echo cancellation")?,
            )
        } else {
            None
        };
        Self::build(config, device, sink, canceller, stats)
    }

    /// Like [`CaptureScheduler::new`] but cancels echo with the given engine,
    /// regardless of `enable_aec`.
    pub fn with_engine(config: CaptureConfig, device: D, sink: S, engine: Box<dyn EchoEngine>) -> Result<Self> {
        let stats = CaptureStatsHandle::new();
        let canceller = EchoCanceller::new(engine, stats.clone());
        Self::build(config, device, sink, Some(canceller), stats)
    }

    fn build(
        config: CaptureConfig,
        device: D,
        sink: S,
        canceller: Option<EchoCanceller>,
        stats: CaptureStatsHandle,
    ) -> Result<Self> {
        config.validate()?;
        let source = RingCaptureSource::open(
            device,
            config.device_name.as_deref(),
            config.buffer_seconds,
            config.sample_rate,
        )?;
        let conditioning = Self::conditioning_for(&config, &source);
        let voice = config.voice_detection.then(|| {
            VoiceDetector::new(
                config.player_volume_threshold_db,
                config.calibration_secs,
                config.min_speech_hold_secs,
            )
        });
        let byte_buffer = vec![0_u8; config.buffer_frames() * config.channels as usize * pcm::BYTES_PER_SAMPLE];

        Ok(Self {
            auto_push: config.auto_push,
            config,
            source,
            sink,
            conditioning,
            canceller,
            echo_reference: None,
            clock: Arc::new(SessionClock::new()),
            voice,
            events: None,
            state: CaptureState::Idle,
            blocked: false,
            cooldown: 0.0,
            pending: Vec::new(),
            byte_buffer,
            sequence: 0,
            stats,
        })
    }

    fn conditioning_for(config: &CaptureConfig, source: &RingCaptureSource<D>) -> Vec<Box<dyn AudioProcessor>> {
        let rec = source.recording();
        if ResampleProcessor::needed(rec.sample_rate, rec.channels, config.sample_rate, config.channels) {
            info!(
                "Converting {} Hz/{} ch input to {} Hz/{} ch",
                rec.sample_rate, rec.channels, config.sample_rate, config.channels
            );
            let resample: Box<dyn AudioProcessor> =
                Box::new(ResampleProcessor::new(rec.sample_rate, config.sample_rate, config.channels));
            vec![resample]
        } else {
            Vec::new()
        }
    }

    /// Far-end audio for echo cancellation, on the same clock as capture.
    pub fn with_echo_reference(mut self, store: EchoReferenceStore, clock: Arc<dyn Clock>) -> Self {
        if store.sample_rate() != self.config.sample_rate {
            warn!(
                "Echo reference runs at {} Hz, capture at {} Hz",
                store.sample_rate(),
                self.config.sample_rate
            );
        }
        self.echo_reference = Some(store);
        self.clock = clock;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Sender<CaptureEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.state == CaptureState::Capturing
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// A blocked scheduler keeps its state but skips ticks.
    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    pub fn auto_push(&self) -> bool {
        self.auto_push
    }

    pub fn set_auto_push(&mut self, auto_push: bool) {
        self.auto_push = auto_push;
    }

    pub fn pending_chunks(&self) -> &[AudioChunk] {
        &self.pending
    }

    pub fn stats(&self) -> CaptureStatsHandle {
        self.stats.clone()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn device_name(&self) -> &str {
        self.source.device_name()
    }

    pub fn device(&self) -> &D {
        self.source.device()
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.source.device_mut()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn voice_detector(&self) -> Option<&VoiceDetector> {
        self.voice.as_ref()
    }

    /// Measure background noise over the next `calibration_secs` of capture.
    pub fn start_calibration(&mut self) {
        if let Some(voice) = self.voice.as_mut() {
            voice.start_calibration();
        }
    }

    /// Begin capturing from the current device position. Audio recorded
    /// before this call is skipped.
    pub fn start_recording(&mut self) {
        if self.is_capturing() {
            return;
        }
        self.source.reset_cursor();
        self.pending.clear();
        self.cooldown = 0.0;
        for processor in &mut self.conditioning {
            processor.reset();
        }
        if let Some(voice) = self.voice.as_mut() {
            voice.reset();
            if voice.background_noise().is_none() {
                voice.start_calibration();
            }
        }
        self.state = CaptureState::Capturing;
        info!("Recording started on {}", self.source.device_name());
        self.notify(CaptureEvent::RecordingStarted);
    }

    /// Stop capturing. Buffered chunks are sent when `push_remaining` is set
    /// and dropped otherwise.
    pub fn stop_recording(&mut self, push_remaining: bool) {
        if !self.is_capturing() {
            return;
        }
        let tail: Vec<AudioFrame> = self.conditioning.iter_mut().flat_map(|p| p.flush()).collect();
        if push_remaining {
            let now = self.clock.now();
            for frame in tail {
                self.deliver(frame, now);
            }
            self.push_audio();
        } else if !self.pending.is_empty() {
            let discarded = self.pending.len() as u64;
            self.pending.clear();
            self.stats.update(|s| s.chunks_discarded += discarded);
            debug!("Discarded {} buffered chunks", discarded);
        }
        self.state = CaptureState::Idle;
        if let Some(voice) = self.voice.as_mut() {
            voice.reset();
        }
        info!("Recording stopped on {}", self.source.device_name());
        self.notify(CaptureEvent::RecordingStopped);
    }

    /// Send every buffered chunk, oldest first.
    pub fn push_audio(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for chunk in pending {
            self.send(chunk);
        }
    }

    /// Advance the poll timer by `dt` seconds and capture when it runs out.
    pub fn tick(&mut self, dt: f32) {
        if !self.is_capturing() || self.blocked {
            return;
        }
        self.stats.update(|s| s.ticks += 1);

        if self.config.auto_restart {
            match self.source.ensure_recording() {
                Ok(true) => {
                    self.stats.update(|s| s.device_restarts += 1);
                    for processor in &mut self.conditioning {
                        processor.reset();
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to restart {}: {}", self.source.device_name(), e);
                    self.stats.update(|s| s.restart_failures += 1);
                    return;
                }
            }
        }

        self.cooldown -= dt;
        if self.cooldown > 0.0 {
            return;
        }
        self.cooldown = self.config.poll_interval_secs;

        let start_time = Instant::now();
        self.capture_once();
        let elapsed = start_time.elapsed().as_nanos() as u64;
        self.stats.update(|s| s.capture_tick.record(elapsed));
    }

    /// Switch to another input device, keeping the capture state.
    pub fn switch_device(&mut self, device_name: &str) -> Result<(), DeviceError> {
        self.source.switch_device(device_name)?;
        self.conditioning = Self::conditioning_for(&self.config, &self.source);
        Ok(())
    }

    /// Stop without pushing, release the echo engine and close the device.
    pub fn shutdown(mut self) -> D {
        self.stop_recording(false);
        if let Some(canceller) = self.canceller.take() {
            canceller.release();
        }
        self.source.close()
    }

    fn capture_once(&mut self) {
        let now = self.clock.now();
        self.stats.update(|s| s.polls += 1);
        let Some(frame) = self.source.poll(now) else {
            self.stats.update(|s| s.empty_polls += 1);
            return;
        };
        let captured = frame.samples.len() as u64;
        self.stats.update(|s| s.samples_captured += captured);

        if let Some(frame) = self.condition(frame) {
            self.deliver(frame, now);
        }
    }

    /// Detect speech in, encode and emit one conditioned frame captured up
    /// to `now`.
    fn deliver(&mut self, frame: AudioFrame, now: f64) {
        let calibrating = self.voice.as_ref().map_or(false, |v| v.is_calibrating());
        let speech = self
            .voice
            .as_mut()
            .and_then(|voice| voice.update(&frame.samples, frame.duration_secs() as f32));
        if let Some(event) = speech {
            self.notify(event);
        }
        // Background noise is measured on audio that is never sent, unless
        // the host pushes manually.
        if calibrating && self.auto_push {
            self.stats.update(|s| s.calibration_chunks += 1);
            return;
        }

        let frames = frame.frames();
        let data = match self.canceller.as_mut() {
            Some(canceller) => {
                let near = pcm::float_to_int16(&frame.samples);
                let far = self
                    .echo_reference
                    .as_ref()
                    .map(|store| store.window(now, near.len()))
                    .unwrap_or_default();
                pcm::int16_to_bytes(&canceller.filter(&near, &far))
            }
            None => {
                let needed = frame.samples.len() * pcm::BYTES_PER_SAMPLE;
                if self.byte_buffer.len() < needed {
                    self.byte_buffer.resize(needed, 0);
                }
                let written = pcm::float_to_byte_buffer(
                    &frame.samples,
                    frames,
                    frame.channels as usize,
                    &mut self.byte_buffer,
                );
                self.byte_buffer[..written].to_vec()
            }
        };

        let chunk = AudioChunk {
            data,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            timestamp: now - frame.duration_secs(),
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.emit(chunk);
    }

    fn condition(&mut self, frame: AudioFrame) -> Option<AudioFrame> {
        if self.conditioning.is_empty() {
            return Some(frame);
        }
        let start_time = Instant::now();
        let mut frames = run_chain(&mut self.conditioning, frame).into_iter();
        let mut merged = frames.next()?;
        for next in frames {
            merged.samples.extend_from_slice(&next.samples);
        }
        let elapsed = start_time.elapsed().as_nanos() as u64;
        self.stats.update(|s| s.condition_stage.record(elapsed));
        Some(merged)
    }

    fn emit(&mut self, chunk: AudioChunk) {
        if self.auto_push {
            self.send(chunk);
        } else {
            self.pending.push(chunk);
            self.stats.update(|s| s.chunks_buffered += 1);
        }
    }

    fn send(&mut self, chunk: AudioChunk) {
        match self.sink.send(chunk) {
            Ok(()) => self.stats.update(|s| s.chunks_sent += 1),
            Err(e) => {
                warn!("Dropping audio chunk: {}", e);
                self.stats.update(|s| s.sink_errors += 1);
            }
        }
    }

    fn notify(&self, event: CaptureEvent) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => debug!("Event queue full, dropping {:?}", event),
            Err(TrySendError::Disconnected(event)) => debug!("No event listener for {:?}", event),
        }
    }
}
