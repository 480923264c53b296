use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
pub struct StageStats {
    pub samples: u64,
    pub total_ns: u128,
    pub max_ns: u64,
}

impl StageStats {
    pub fn record(&mut self, duration_ns: u64) {
        self.samples += 1;
        self.total_ns += duration_ns as u128;
        self.max_ns = self.max_ns.max(duration_ns);
    }

    pub fn avg_ns(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_ns as f64 / self.samples as f64
        }
    }

    pub fn avg_ms(&self) -> f64 {
        self.avg_ns() / 1_000_000.0
    }

    pub fn max_ms(&self) -> f64 {
        self.max_ns as f64 / 1_000_000.0
    }
}

#[derive(Clone, Debug, Default)]
pub struct CaptureStats {
    pub ticks: u64,
    pub polls: u64,
    pub empty_polls: u64,
    pub samples_captured: u64,
    pub device_restarts: u64,
    pub restart_failures: u64,

    pub chunks_sent: u64,
    pub chunks_buffered: u64,
    pub chunks_discarded: u64,
    pub calibration_chunks: u64, // Captures withheld while measuring background noise
    pub sink_errors: u64,

    pub aec_blocks: u64,
    pub aec_passthrough: u64,
    pub aec_unfiltered_samples: u64,
    pub aec_errors: u64,

    pub condition_stage: StageStats,
    pub aec_stage: StageStats,
    pub capture_tick: StageStats,
}

#[derive(Clone)]
pub struct CaptureStatsHandle {
    inner: Arc<Mutex<CaptureStats>>,
}

impl CaptureStatsHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CaptureStats::default())),
        }
    }

    pub fn reset(&self) {
        if let Ok(mut stats) = self.inner.lock() {
            *stats = CaptureStats::default();
        }
    }

    pub fn update<F>(&self, update_fn: F)
    where
        F: FnOnce(&mut CaptureStats),
    {
        if let Ok(mut stats) = self.inner.lock() {
            update_fn(&mut stats);
        }
    }

    pub fn snapshot(&self) -> CaptureStats {
        if let Ok(stats) = self.inner.lock() {
            stats.clone()
        } else {
            CaptureStats::default()
        }
    }
}

impl Default for CaptureStatsHandle {
    fn default() -> Self {
        Self::new()
    }
}
