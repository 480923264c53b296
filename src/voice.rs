//! Background-noise calibration and player speech detection.
//!
//! While calibrating, the loudest RMS seen becomes the background level.
//! Afterwards each capture is compared against it as a signal-to-noise ratio
//! in dB; speech starts as soon as the ratio crosses the threshold and ends
//! only after it has stayed below for the hold time.

use crate::messages::CaptureEvent;

const UNCALIBRATED_NOISE_FLOOR: f32 = 0.001;

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[derive(Debug, Clone)]
pub struct VoiceDetector {
    threshold_db: f32,
    calibration_secs: f32,
    hold_secs: f32,
    background: Option<f32>,
    calibrating: bool,
    calibrated_for: f32,
    silence_for: f32,
    speaking: bool,
}

impl VoiceDetector {
    pub fn new(threshold_db: f32, calibration_secs: f32, hold_secs: f32) -> Self {
        Self {
            threshold_db,
            calibration_secs,
            hold_secs,
            background: None,
            calibrating: false,
            calibrated_for: 0.0,
            silence_for: 0.0,
            speaking: false,
        }
    }

    pub fn start_calibration(&mut self) {
        self.calibrating = true;
        self.calibrated_for = 0.0;
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating
    }

    pub fn background_noise(&self) -> Option<f32> {
        self.background
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn snr_db(&self, level: f32) -> f32 {
        let floor = match self.background {
            Some(b) if b > 0.0 => b,
            _ => UNCALIBRATED_NOISE_FLOOR,
        };
        20.0 * (level / floor).log10()
    }

    /// Feed one capture covering `elapsed` seconds. Returns the speaking
    /// transition it caused, if any.
    pub fn update(&mut self, samples: &[f32], elapsed: f32) -> Option<CaptureEvent> {
        let level = rms(samples);
        if self.calibrating {
            if self.background.map_or(true, |b| level > b) {
                self.background = Some(level);
            }
            self.calibrated_for += elapsed;
            if self.calibrated_for >= self.calibration_secs {
                self.calibrating = false;
                log::debug!("Calibrated background noise: {:?}", self.background);
            }
            return None;
        }

        if self.snr_db(level) > self.threshold_db {
            self.silence_for = 0.0;
            if !self.speaking {
                self.speaking = true;
                return Some(CaptureEvent::PlayerStartedSpeaking);
            }
        } else {
            self.silence_for += elapsed;
            if self.speaking && self.silence_for >= self.hold_secs {
                self.speaking = false;
                return Some(CaptureEvent::PlayerStoppedSpeaking);
            }
        }
        None
    }

    /// Forget the speaking state; the calibration is kept.
    pub fn reset(&mut self) {
        self.speaking = false;
        self.silence_for = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_constant_signal() {
        assert!((rms(&[0.5; 100]) - 0.5).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn calibration_keeps_loudest_level() {
        let mut v = VoiceDetector::new(10.0, 0.25, 0.5);
        v.start_calibration();
        assert_eq!(v.update(&[0.01; 160], 0.1), None);
        assert_eq!(v.update(&[0.02; 160], 0.1), None);
        assert_eq!(v.update(&[0.005; 160], 0.1), None);
        assert!(!v.is_calibrating());
        assert!((v.background_noise().unwrap() - 0.02).abs() < 1e-6);
    }

    #[test]
    fn speech_starts_immediately_and_stops_after_hold() {
        let mut v = VoiceDetector::new(10.0, 0.1, 0.25);
        v.start_calibration();
        v.update(&[0.01; 160], 0.1);

        // 20 dB over the background
        assert_eq!(v.update(&[0.1; 160], 0.1), Some(CaptureEvent::PlayerStartedSpeaking));
        assert_eq!(v.update(&[0.1; 160], 0.1), None);
        assert_eq!(v.update(&[0.01; 160], 0.1), None);
        assert_eq!(v.update(&[0.01; 160], 0.1), None);
        assert_eq!(v.update(&[0.01; 160], 0.1), Some(CaptureEvent::PlayerStoppedSpeaking));
        assert!(!v.is_speaking());
    }

    #[test]
    fn uncalibrated_detector_uses_noise_floor() {
        let v = VoiceDetector::new(10.0, 1.0, 0.5);
        assert!((v.snr_db(0.01) - 20.0).abs() < 1e-3);
    }
}
