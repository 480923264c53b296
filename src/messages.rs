/// Float audio moving through the capture pipeline.
/// Captured frames, conditioned frames and playback frames all use it.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,     // Interleaved when channels > 1
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp: f64,        // Seconds on the session clock
}

impl AudioFrame {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames() as f64 / self.sample_rate as f64
        }
    }
}

/// PCM16 little-endian audio ready for the network sender.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp: f64,
    pub sequence: u64,
}

impl AudioChunk {
    pub fn sample_count(&self) -> usize {
        self.data.len() / crate::pcm::BYTES_PER_SAMPLE
    }

    pub fn samples(&self) -> Vec<i16> {
        crate::pcm::bytes_to_int16(&self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    RecordingStarted,
    RecordingStopped,
    PlayerStartedSpeaking,
    PlayerStoppedSpeaking,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_duration_accounts_for_channels() {
        let f = AudioFrame {
            samples: vec![0.1; 3200],
            sample_rate: 16_000,
            channels: 2,
            timestamp: 1.5,
        };
        assert_eq!(f.frames(), 1600);
        assert!((f.duration_secs() - 0.1).abs() < 1e-9);
        let c = f.clone();
        assert_eq!(c.timestamp, 1.5);
    }

    #[test]
    fn chunk_counts_pcm16_samples() {
        let chunk = AudioChunk {
            data: vec![0; 320],
            sample_rate: 16_000,
            channels: 1,
            timestamp: 0.0,
            sequence: 7,
        };
        assert_eq!(chunk.sample_count(), 160);
    }
}
