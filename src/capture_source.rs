use log::{debug, info, warn};

use crate::device::{AudioDeviceSource, DeviceError, Recording};
use crate::messages::AudioFrame;

/// Pulls newly recorded samples out of a device's looping buffer.
///
/// The device owns the write cursor; this type owns the read cursor
/// (`last_position`). A poll never crosses the end of the loop buffer: when the
/// device has wrapped, the poll stops at capacity and the samples at the start
/// of the buffer are picked up by the next poll.
pub struct RingCaptureSource<D: AudioDeviceSource> {
    device: D,
    device_name: String,
    buffer_seconds: u32,
    sample_rate: u32,
    recording: Recording,
    last_position: usize,
    input_buffer: Vec<f32>,
}

impl<D: AudioDeviceSource> RingCaptureSource<D> {
    pub fn open(
        mut device: D,
        device_name: Option<&str>,
        buffer_seconds: u32,
        sample_rate: u32,
    ) -> Result<Self, DeviceError> {
        let device_name = match device_name {
            Some(name) => name.to_string(),
            None => device.devices().into_iter().next().ok_or(DeviceError::NoDevices)?,
        };
        let recording = device.start(&device_name, true, buffer_seconds, sample_rate)?;
        info!(
            "Recording from {} ({} frames, {} ch, {} Hz)",
            device_name, recording.frames, recording.channels, recording.sample_rate
        );
        let last_position = device.position(&device_name);

        Ok(Self {
            device,
            device_name,
            buffer_seconds,
            sample_rate,
            input_buffer: vec![0.0; recording.samples()],
            recording,
            last_position,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn recording(&self) -> Recording {
        self.recording
    }

    pub fn capacity(&self) -> usize {
        self.recording.frames
    }

    pub fn last_position(&self) -> usize {
        self.last_position
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn is_recording(&self) -> bool {
        self.device.is_recording(&self.device_name)
    }

    /// Move the read cursor to the device's current write position, skipping
    /// anything recorded before now.
    pub fn reset_cursor(&mut self) {
        self.last_position = self.device.position(&self.device_name);
    }

    /// Restart the device with the original parameters if it stopped on its
    /// own. Returns true when a restart happened.
    pub fn ensure_recording(&mut self) -> Result<bool, DeviceError> {
        if self.is_recording() {
            return Ok(false);
        }
        warn!("Device {} stopped recording, restarting", self.device_name);
        self.restart()?;
        Ok(true)
    }

    /// Switch to another input device. No-op when the name is unchanged.
    /// The new device is started before the current one is ended, so a
    /// failed switch leaves the current device recording.
    pub fn switch_device(&mut self, device_name: &str) -> Result<(), DeviceError> {
        if device_name == self.device_name {
            return Ok(());
        }
        info!("Switching input device {} -> {}", self.device_name, device_name);
        let recording = self
            .device
            .start(device_name, true, self.buffer_seconds, self.sample_rate)?;
        self.device.end(&self.device_name);
        self.device_name = device_name.to_string();
        self.adopt(recording);
        Ok(())
    }

    fn restart(&mut self) -> Result<(), DeviceError> {
        let recording =
            self.device
                .start(&self.device_name, true, self.buffer_seconds, self.sample_rate)?;
        self.adopt(recording);
        Ok(())
    }

    fn adopt(&mut self, recording: Recording) {
        if recording.samples() != self.input_buffer.len() {
            self.input_buffer = vec![0.0; recording.samples()];
        }
        self.recording = recording;
        self.last_position = self.device.position(&self.device_name);
    }

    /// Samples recorded since the previous poll, or `None` when there is
    /// nothing new or the device could not be read.
    pub fn poll(&mut self, timestamp: f64) -> Option<AudioFrame> {
        let capacity = self.recording.frames;
        if capacity == 0 {
            return None;
        }
        let mut current = self.device.position(&self.device_name).min(capacity);
        if current < self.last_position {
            current = capacity;
        }
        if current <= self.last_position {
            return None;
        }

        let new_frames = current - self.last_position;
        let channels = self.recording.channels as usize;
        let len = new_frames * channels;
        if !self
            .device
            .get_data(&self.device_name, &mut self.input_buffer[..len], self.last_position)
        {
            debug!("No data from {} at {}", self.device_name, self.last_position);
            return None;
        }
        self.last_position = current % capacity;

        Some(AudioFrame {
            samples: self.input_buffer[..len].to_vec(),
            sample_rate: self.recording.sample_rate,
            channels: self.recording.channels,
            timestamp,
        })
    }

    /// End the device stream and hand the device back.
    pub fn close(mut self) -> D {
        self.device.end(&self.device_name);
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use std::collections::VecDeque;

    /// Device that replays scripted write positions.
    struct ScriptedDevice {
        positions: VecDeque<usize>,
        current: usize,
        frames: usize,
        recording: bool,
        fail_reads: bool,
        reads: Vec<(usize, usize)>,
        starts: usize,
    }

    impl ScriptedDevice {
        fn new(frames: usize, positions: &[usize]) -> Self {
            Self {
                positions: positions.iter().copied().collect(),
                current: 0,
                frames,
                recording: false,
                fail_reads: false,
                reads: Vec::new(),
                starts: 0,
            }
        }
    }

    impl AudioDeviceSource for ScriptedDevice {
        fn devices(&self) -> Vec<String> {
            vec!["scripted".to_string()]
        }

        fn start(&mut self, _: &str, _: bool, _: u32, sample_rate: u32) -> Result<Recording, DeviceError> {
            self.recording = true;
            self.starts += 1;
            Ok(Recording {
                frames: self.frames,
                channels: 1,
                sample_rate,
            })
        }

        fn end(&mut self, _: &str) {
            self.recording = false;
        }

        fn is_recording(&self, _: &str) -> bool {
            self.recording
        }

        fn position(&mut self, _: &str) -> usize {
            if let Some(next) = self.positions.pop_front() {
                self.current = next;
            }
            self.current
        }

        fn get_data(&mut self, _: &str, buffer: &mut [f32], from: usize) -> bool {
            self.reads.push((from, buffer.len()));
            if self.fail_reads {
                return false;
            }
            for (i, s) in buffer.iter_mut().enumerate() {
                *s = ((from + i) % self.frames) as f32;
            }
            true
        }
    }

    #[test]
    fn reads_from_last_position_to_current() {
        // open() consumes the first position
        let d = ScriptedDevice::new(100, &[10, 40]);
        let mut src = RingCaptureSource::open(d, None, 1, 100).unwrap();
        assert_eq!(src.last_position(), 10);

        let frame = src.poll(0.0).unwrap();
        assert_eq!(frame.samples.len(), 30);
        assert_eq!(frame.samples[0], 10.0);
        assert_eq!(src.last_position(), 40);
    }

    #[test]
    fn wraparound_reads_to_capacity_then_from_zero() {
        let d = ScriptedDevice::new(100, &[0, 90, 20, 20]);
        let mut src = RingCaptureSource::open(d, None, 1, 100).unwrap();

        assert_eq!(src.poll(0.0).unwrap().samples.len(), 90);
        assert_eq!(src.last_position(), 90);

        // Device wrapped to 20: this poll covers [90, 100) only
        let tail = src.poll(0.1).unwrap();
        assert_eq!(tail.samples.len(), 10);
        assert_eq!(tail.samples[0], 90.0);
        assert_eq!(src.last_position(), 0);

        // Next poll picks up [0, 20)
        let head = src.poll(0.2).unwrap();
        assert_eq!(head.samples.len(), 20);
        assert_eq!(head.samples[0], 0.0);
        assert_eq!(src.device().reads, vec![(0, 90), (90, 10), (0, 20)]);
    }

    #[test]
    fn unchanged_position_yields_nothing() {
        let d = ScriptedDevice::new(100, &[5, 5]);
        let mut src = RingCaptureSource::open(d, None, 1, 100).unwrap();
        assert!(src.poll(0.0).is_none());
        assert!(src.device().reads.is_empty());
    }

    #[test]
    fn failed_read_keeps_cursor() {
        let d = ScriptedDevice::new(100, &[0, 50]);
        let mut src = RingCaptureSource::open(d, None, 1, 100).unwrap();
        src.device_mut().fail_reads = true;
        assert!(src.poll(0.0).is_none());
        assert_eq!(src.last_position(), 0);

        src.device_mut().fail_reads = false;
        assert_eq!(src.poll(0.1).unwrap().samples.len(), 50);
    }

    #[test]
    fn ensure_recording_restarts_stopped_device() {
        let d = ScriptedDevice::new(100, &[0]);
        let mut src = RingCaptureSource::open(d, None, 1, 100).unwrap();
        assert!(!src.ensure_recording().unwrap());

        src.device_mut().recording = false;
        assert!(src.ensure_recording().unwrap());
        assert_eq!(src.device().starts, 2);
        assert!(src.is_recording());
    }

    #[test]
    fn switch_device_is_noop_for_same_name() {
        let d = MemoryDevice::new(["a", "b"]);
        let host = d.clone();
        let mut src = RingCaptureSource::open(d, Some("a"), 1, 100).unwrap();
        src.switch_device("a").unwrap();
        assert!(host.is_recording("a"));

        src.switch_device("b").unwrap();
        assert_eq!(src.device_name(), "b");
        assert!(!host.is_recording("a"));
        assert!(host.is_recording("b"));
        assert_eq!(src.capacity(), 100);
    }

    #[test]
    fn failed_switch_keeps_current_device() {
        let d = MemoryDevice::new(["a"]);
        let host = d.clone();
        let mut src = RingCaptureSource::open(d, Some("a"), 1, 100).unwrap();

        assert!(matches!(src.switch_device("missing"), Err(DeviceError::NotFound(_))));
        assert_eq!(src.device_name(), "a");
        assert!(host.is_recording("a"));

        host.inject("a", &[0.2; 30]);
        assert_eq!(src.poll(0.0).unwrap().samples.len(), 30);
    }

    #[test]
    fn multichannel_polls_return_interleaved_samples() {
        let d = MemoryDevice::with_channels(["mic"], 2);
        let host = d.clone();
        let mut src = RingCaptureSource::open(d, None, 1, 10).unwrap();
        host.inject("mic", &[0.1, 0.2, 0.3, 0.4]);

        let frame = src.poll(0.0).unwrap();
        assert_eq!(frame.channels, 2);
        assert_eq!(frame.samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(src.last_position(), 2);
    }
}
