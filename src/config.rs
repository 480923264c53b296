use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Settings for one capture session.
///
/// Fields use `#[serde(default)]` so a partial config file only overrides the
/// values it names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub device_name: Option<String>, // None = first device the backend reports
    pub sample_rate: u32,            // Network format rate; AEC runs at this rate
    pub channels: u16,               // Network format channels (mono)
    pub buffer_seconds: u32,         // Length of the looping device buffer
    pub poll_interval_secs: f32,
    pub auto_push: bool,
    pub auto_restart: bool,          // Restart a device that stopped on its own
    pub enable_aec: bool,
    pub aec_stream_delay_ms: i32,    // Positive = playback ahead of mic
    pub echo_window_secs: f64,
    pub voice_detection: bool,
    pub calibration_secs: f32,
    pub player_volume_threshold_db: f32,
    pub min_speech_hold_secs: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: 16_000,
            channels: 1,
            buffer_seconds: 1,
            poll_interval_secs: 0.1,
            auto_push: true,
            auto_restart: true,
            enable_aec: true,
            aec_stream_delay_ms: 0,
            echo_window_secs: 1.0,
            voice_detection: false,
            calibration_secs: 1.0,
            player_volume_threshold_db: 10.0,
            min_speech_hold_secs: 0.5,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            bail!("sample_rate must be non-zero");
        }
        if self.channels == 0 {
            bail!("channels must be non-zero");
        }
        if self.buffer_seconds == 0 {
            bail!("buffer_seconds must be non-zero");
        }
        if !(self.poll_interval_secs > 0.0) {
            bail!("poll_interval_secs must be positive, got {}", self.poll_interval_secs);
        }
        if !(self.echo_window_secs > 0.0) {
            bail!("echo_window_secs must be positive, got {}", self.echo_window_secs);
        }
        if self.enable_aec && self.channels != 1 {
            bail!("AEC runs on mono audio, {} channels requested", self.channels);
        }
        if self.enable_aec && self.sample_rate % 100 != 0 {
            bail!("AEC needs 10 ms blocks; {} Hz is not divisible by 100", self.sample_rate);
        }
        Ok(())
    }

    /// Capacity of the device loop buffer in frames.
    pub fn buffer_frames(&self) -> usize {
        self.buffer_seconds as usize * self.sample_rate as usize
    }

    /// Derive the AEC stream delay from measured output and input latencies.
    pub fn calibrate_delay(&mut self, measured_playback_latency_ms: f32, measured_mic_latency_ms: f32) {
        self.aec_stream_delay_ms = (measured_playback_latency_ms - measured_mic_latency_ms) as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_network_format() {
        let c = CaptureConfig::default();
        assert_eq!(c.sample_rate, 16_000);
        assert_eq!(c.channels, 1);
        assert_eq!(c.buffer_frames(), 16_000);
        assert!(c.auto_push);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn calibrate_delay_updates_stream_delay() {
        let mut c = CaptureConfig::default();
        c.calibrate_delay(42.5, 10.0);
        assert_eq!(c.aec_stream_delay_ms, 32);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut c = CaptureConfig::default();
        c.poll_interval_secs = 0.0;
        assert!(c.validate().is_err());

        let mut c = CaptureConfig::default();
        c.sample_rate = 22_050;
        assert!(c.validate().is_err());
        c.enable_aec = false;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c: CaptureConfig =
            serde_json::from_str(r#"{ "buffer_seconds": 2, "auto_push": false }"#).unwrap();
        assert_eq!(c.buffer_seconds, 2);
        assert!(!c.auto_push);
        assert_eq!(c.sample_rate, 16_000);
        assert_eq!(c.device_name, None);
    }
}
