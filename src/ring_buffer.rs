//! Fixed-capacity looping sample store written by a recording device.
//!
//! This mirrors how capture hardware exposes a recording: a buffer of
//! `frames * channels` samples that the device overwrites from the start once
//! it reaches the end, plus a write position the consumer polls. The consumer
//! keeps its own read cursor (see `capture_source`).

#[derive(Debug, Clone)]
pub struct LoopBuffer {
    data: Vec<f32>,
    frames: usize,
    channels: usize,
    write_pos: usize, // In frames, always < frames
    looping: bool,
    stopped: bool,
}

impl LoopBuffer {
    pub fn new(frames: usize, channels: usize, looping: bool) -> Self {
        let channels = channels.max(1);
        Self {
            data: vec![0.0; frames * channels],
            frames,
            channels,
            write_pos: 0,
            looping,
            stopped: frames == 0,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Current write position in frames.
    pub fn position(&self) -> usize {
        self.write_pos
    }

    /// A non-looping buffer stops once it has been filled.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Append interleaved samples, wrapping at capacity. Returns the number of
    /// frames accepted; a trailing partial frame is dropped.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        if self.stopped {
            return 0;
        }
        let mut accepted = 0;
        for frame in samples.chunks_exact(self.channels) {
            let start = self.write_pos * self.channels;
            self.data[start..start + self.channels].copy_from_slice(frame);
            self.write_pos += 1;
            accepted += 1;
            if self.write_pos == self.frames {
                self.write_pos = 0;
                if !self.looping {
                    self.stopped = true;
                    break;
                }
            }
        }
        accepted
    }

    /// Copy `dst.len()` samples starting at frame `from`, wrapping around the
    /// end. Returns false when `from` is out of range or `dst` is larger than
    /// the whole buffer.
    pub fn read(&self, dst: &mut [f32], from: usize) -> bool {
        if from >= self.frames || dst.len() > self.data.len() {
            return false;
        }
        let start = from * self.channels;
        let first = dst.len().min(self.data.len() - start);
        dst[..first].copy_from_slice(&self.data[start..start + first]);
        let rest = dst.len() - first;
        dst[first..].copy_from_slice(&self.data[..rest]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_wraps_position() {
        let mut b = LoopBuffer::new(4, 1, true);
        assert_eq!(b.write(&[1.0, 2.0, 3.0]), 3);
        assert_eq!(b.position(), 3);
        assert_eq!(b.write(&[4.0, 5.0]), 2);
        assert_eq!(b.position(), 1);

        let mut out = [0.0; 4];
        assert!(b.read(&mut out, 0));
        assert_eq!(out, [5.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn read_wraps_across_end() {
        let mut b = LoopBuffer::new(4, 1, true);
        b.write(&[1.0, 2.0, 3.0, 4.0]);
        let mut out = [0.0; 3];
        assert!(b.read(&mut out, 2));
        assert_eq!(out, [3.0, 4.0, 1.0]);
    }

    #[test]
    fn read_rejects_bad_requests() {
        let b = LoopBuffer::new(4, 2, true);
        let mut big = [0.0; 9];
        assert!(!b.read(&mut big, 0));
        let mut small = [0.0; 2];
        assert!(!b.read(&mut small, 4));
    }

    #[test]
    fn non_looping_buffer_stops_when_full() {
        let mut b = LoopBuffer::new(2, 1, false);
        assert_eq!(b.write(&[1.0, 2.0, 3.0]), 2);
        assert!(b.is_stopped());
        assert_eq!(b.write(&[4.0]), 0);
    }

    #[test]
    fn interleaved_frames_are_kept_together() {
        let mut b = LoopBuffer::new(3, 2, true);
        assert_eq!(b.write(&[1.0, -1.0, 2.0, -2.0, 9.0]), 2);
        assert_eq!(b.position(), 2);
        let mut out = [0.0; 4];
        assert!(b.read(&mut out, 0));
        assert_eq!(out, [1.0, -1.0, 2.0, -2.0]);
    }
}
