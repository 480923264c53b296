//! Microphone capture for voice chat.
//!
//! Samples are pulled from a device's looping buffer on a fixed cadence,
//! converted to 16-bit PCM, cleaned of playback echo against a timestamped
//! far-end reference and handed to a network sender.

pub mod capture_source;
pub mod clock;
pub mod config;
pub mod device;
pub mod echo_reference;
pub mod messages;
pub mod pcm;
pub mod processors;
pub mod ring_buffer;
pub mod runner;
pub mod scheduler;
pub mod stats;
pub mod voice;

#[cfg(feature = "capture")]
pub mod capture;

pub use capture_source::RingCaptureSource;
pub use clock::{Clock, ManualClock, SessionClock};
pub use config::CaptureConfig;
pub use device::{AudioDeviceSource, DeviceError, MemoryDevice, Recording};
pub use echo_reference::EchoReferenceStore;
pub use messages::{AudioChunk, AudioFrame, CaptureEvent};
pub use processors::{EchoCanceller, EchoEngine, WebRtcEngine};
pub use runner::{CaptureRunner, RunnerCommand};
pub use scheduler::{AudioSink, CaptureScheduler, CaptureState};
pub use stats::{CaptureStats, CaptureStatsHandle};
pub use voice::VoiceDetector;

#[cfg(feature = "capture")]
pub use capture::CpalDevice;
