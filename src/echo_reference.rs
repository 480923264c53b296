//! Recently played-back audio, kept as the far-end reference for echo
//! cancellation.
//!
//! Frames are mixed in by absolute sample position (`timestamp * rate + i`),
//! so overlapping playback sources sum instead of overwriting each other.
//! Storage is a dense ring indexed by `position mod capacity`; every slot is
//! tagged with the absolute position it currently holds, which makes stale
//! slots detectable without a separate index. After each `add`, positions
//! older than `timestamp - window` are pruned.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::CaptureConfig;
use crate::pcm;

const EMPTY: i64 = i64::MIN;

struct EchoWindow {
    tags: Vec<i64>,
    values: Vec<f32>,
    sample_rate: u32,
    window_secs: f64,
    latest_timestamp: Option<f64>,
    lowest: i64,  // Lower bound of live positions
    highest: i64, // One past the highest position ever written
    live: usize,
}

impl EchoWindow {
    fn new(sample_rate: u32, window_secs: f64) -> Self {
        // Live span is the window plus the length of the newest frame. Two
        // windows of room covers frames up to a full window; longer frames
        // grow the ring in `add`.
        let capacity = ((window_secs * sample_rate as f64).ceil() as usize * 2).max(1);
        Self {
            tags: vec![EMPTY; capacity],
            values: vec![0.0; capacity],
            sample_rate,
            window_secs,
            latest_timestamp: None,
            lowest: i64::MAX,
            highest: i64::MIN,
            live: 0,
        }
    }

    fn window_samples(&self) -> usize {
        (self.window_secs * self.sample_rate as f64).ceil() as usize
    }

    fn capacity(&self) -> usize {
        self.tags.len()
    }

    fn slot(&self, position: i64) -> usize {
        position.rem_euclid(self.capacity() as i64) as usize
    }

    fn position_of(&self, timestamp: f64) -> i64 {
        (timestamp * self.sample_rate as f64) as i64
    }

    fn add(&mut self, frame: &[f32], timestamp: f64) {
        let start = self.position_of(timestamp);
        let end = start + frame.len() as i64;
        let cutoff = self.position_of(timestamp - self.window_secs);
        let span = end.max(self.highest).saturating_sub(cutoff);
        if span > self.capacity() as i64 {
            self.grow(span as usize, cutoff);
        }

        for (i, &sample) in frame.iter().enumerate() {
            let position = start + i as i64;
            let slot = self.slot(position);
            if self.tags[slot] == position {
                self.values[slot] += sample;
            } else {
                if self.tags[slot] == EMPTY {
                    self.live += 1;
                }
                self.tags[slot] = position;
                self.values[slot] = sample;
            }
        }
        if !frame.is_empty() {
            self.lowest = self.lowest.min(start);
            self.highest = self.highest.max(end);
        }
        self.latest_timestamp = Some(timestamp);
        self.prune(cutoff);
    }

    /// Re-home every position at or after `cutoff` into a ring that holds
    /// `span` positions plus a window of headroom. Older positions are
    /// dropped, as the following prune would do.
    fn grow(&mut self, span: usize, cutoff: i64) {
        let capacity = span + self.window_samples();
        log::debug!("Growing echo reference from {} to {} samples", self.capacity(), capacity);
        let tags = std::mem::replace(&mut self.tags, vec![EMPTY; capacity]);
        let values = std::mem::replace(&mut self.values, vec![0.0; capacity]);
        self.live = 0;
        for (tag, value) in tags.into_iter().zip(values) {
            if tag != EMPTY && tag >= cutoff {
                let slot = self.slot(tag);
                self.tags[slot] = tag;
                self.values[slot] = value;
                self.live += 1;
            }
        }
        self.lowest = self.lowest.max(cutoff);
    }

    fn prune(&mut self, cutoff: i64) {
        if self.live == 0 || cutoff <= self.lowest {
            return;
        }
        let span = cutoff.saturating_sub(self.lowest);
        if span >= self.capacity() as i64 {
            for slot in 0..self.capacity() {
                if self.tags[slot] != EMPTY && self.tags[slot] < cutoff {
                    self.evict(slot);
                }
            }
        } else {
            for position in self.lowest..cutoff {
                let slot = self.slot(position);
                if self.tags[slot] == position {
                    self.evict(slot);
                }
            }
        }
        self.lowest = cutoff;
    }

    fn evict(&mut self, slot: usize) {
        self.tags[slot] = EMPTY;
        self.values[slot] = 0.0;
        self.live -= 1;
    }

    fn clear(&mut self) {
        self.tags.iter_mut().for_each(|t| *t = EMPTY);
        self.values.iter_mut().for_each(|v| *v = 0.0);
        self.latest_timestamp = None;
        self.lowest = i64::MAX;
        self.highest = i64::MIN;
        self.live = 0;
    }

    fn sample_at(&self, position: i64) -> Option<f32> {
        let slot = self.slot(position);
        (self.tags[slot] == position).then(|| self.values[slot])
    }

    fn flatten(&self) -> Vec<i16> {
        let Some(latest) = self.latest_timestamp else {
            return Vec::new();
        };
        if self.live == 0 {
            return Vec::new();
        }
        let total = ((latest + self.window_secs) * self.sample_rate as f64).max(0.0) as usize;
        let mut out = vec![0_i16; total];
        for (&tag, &value) in self.tags.iter().zip(&self.values) {
            if tag >= 0 && (tag as usize) < total {
                out[tag as usize] = pcm::sample_to_int16(value.clamp(-1.0, 1.0));
            }
        }
        out
    }

    fn window(&self, end_timestamp: f64, len: usize) -> Vec<i16> {
        if self.live == 0 {
            return Vec::new();
        }
        let end = self.position_of(end_timestamp);
        let start = end - len as i64;
        (start..end)
            .map(|p| {
                self.sample_at(p)
                    .map(|v| pcm::sample_to_int16(v.clamp(-1.0, 1.0)))
                    .unwrap_or(0)
            })
            .collect()
    }
}

/// Shared handle to the echo reference window. Clones refer to the same store;
/// every operation holds the same lock for its whole duration.
#[derive(Clone)]
pub struct EchoReferenceStore {
    inner: Arc<Mutex<EchoWindow>>,
    sample_rate: u32,
}

impl EchoReferenceStore {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_window(sample_rate, 1.0)
    }

    pub fn with_window(sample_rate: u32, window_secs: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EchoWindow::new(sample_rate, window_secs))),
            sample_rate,
        }
    }

    /// Store sized for the capture format and echo window of `config`.
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::with_window(config.sample_rate, config.echo_window_secs)
    }

    fn lock(&self) -> MutexGuard<'_, EchoWindow> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Mix a rendered mono frame in at `timestamp` seconds.
    pub fn add(&self, frame: &[f32], timestamp: f64) {
        self.lock().add(frame, timestamp);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.lock().live == 0
    }

    /// Number of sample positions currently held.
    pub fn live_samples(&self) -> usize {
        self.lock().live
    }

    pub fn latest_timestamp(&self) -> Option<f64> {
        self.lock().latest_timestamp
    }

    /// Contiguous PCM16 covering `[0, (latest + window) * rate)`, silence where
    /// nothing is stored. Empty when the store is empty.
    pub fn flatten(&self) -> Vec<i16> {
        self.lock().flatten()
    }

    /// The `len` samples ending at `end_timestamp`, silence where nothing is
    /// stored. Empty when the store is empty.
    pub fn window(&self, end_timestamp: f64, len: usize) -> Vec<i16> {
        self.lock().window(end_timestamp, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn empty_store_flattens_to_nothing() {
        let s = EchoReferenceStore::new(16_000);
        assert!(s.flatten().is_empty());
        assert!(s.window(1.0, 160).is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn overlapping_frames_are_summed() {
        let s = EchoReferenceStore::new(100);
        s.add(&[0.25; 4], 0.0);
        s.add(&[0.5; 4], 0.0);
        let flat = s.flatten();

        assert_eq!(flat.len(), 100);
        assert!(flat[..4].iter().all(|&v| v == 24575));
        assert!(flat[4..].iter().all(|&v| v == 0));
    }

    #[test]
    fn summed_overflow_is_clamped() {
        let s = EchoReferenceStore::new(100);
        s.add(&[0.8, -0.8], 0.0);
        s.add(&[0.8, -0.8], 0.0);
        let flat = s.flatten();
        assert_eq!(flat[0], 32767);
        assert_eq!(flat[1], -32767);
    }

    #[test]
    fn prunes_positions_older_than_window() {
        let s = EchoReferenceStore::new(100);
        s.add(&[0.5; 10], 0.0);
        s.add(&[0.5; 10], 0.5);
        assert_eq!(s.live_samples(), 20);

        s.add(&[0.25; 10], 1.25);
        let flat = s.flatten();
        assert_eq!(flat.len(), 225);
        assert!(flat[..10].iter().all(|&v| v == 0));
        assert!(flat[50..60].iter().all(|&v| v == 16383));
        assert!(flat[125..135].iter().all(|&v| v == 8191));
        assert_eq!(s.live_samples(), 20);
    }

    #[test]
    fn nothing_older_than_window_survives_increasing_adds() {
        let s = EchoReferenceStore::new(100);
        for k in 0..40 {
            let t = k as f64 * 0.25;
            s.add(&[0.5; 5], t);
            let cutoff = ((t - 1.0) * 100.0) as i64;
            let flat = s.flatten();
            for (pos, &v) in flat.iter().enumerate() {
                if (pos as i64) < cutoff {
                    assert_eq!(v, 0, "stale sample at {pos} after add at {t}");
                }
            }
            assert!(s.live_samples() <= 30);
        }
    }

    #[test]
    fn frame_longer_than_ring_keeps_its_start() {
        let s = EchoReferenceStore::new(100);
        s.add(&[0.5; 250], 0.0);
        assert_eq!(s.live_samples(), 250);
        let flat = s.flatten();
        assert_eq!(flat.len(), 100);
        assert!(flat.iter().all(|&v| v == 16383));
        assert!(s.window(2.5, 250).iter().all(|&v| v == 16383));

        s.add(&[0.25; 10], 3.0);
        let flat = s.flatten();
        assert_eq!(flat.len(), 400);
        assert!(flat[..200].iter().all(|&v| v == 0));
        assert!(flat[200..250].iter().all(|&v| v == 16383));
        assert!(flat[300..310].iter().all(|&v| v == 8191));
        assert_eq!(s.live_samples(), 60);
    }

    #[test]
    fn window_aligns_by_timestamp() {
        let s = EchoReferenceStore::new(100);
        s.add(&[0.5; 10], 1.0);
        let w = s.window(1.1, 20);
        assert_eq!(w.len(), 20);
        assert!(w[..10].iter().all(|&v| v == 0));
        assert!(w[10..].iter().all(|&v| v == 16383));
    }

    #[test]
    fn clear_empties_store() {
        let s = EchoReferenceStore::new(100);
        s.add(&[0.5; 10], 0.0);
        s.clear();
        assert!(s.is_empty());
        assert_eq!(s.latest_timestamp(), None);
        assert!(s.flatten().is_empty());
    }

    #[test]
    fn concurrent_adds_all_land() {
        let s = EchoReferenceStore::new(1_000);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                thread::spawn(move || s.add(&[0.125; 100], 0.0))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let flat = s.flatten();
        assert!(flat[..100].iter().all(|&v| v == 16383));
    }
}
