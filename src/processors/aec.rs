use webrtc_audio_processing::{Config, Processor};
use webrtc_audio_processing::config::{EchoCanceller as EchoCancellerConfig, HighPassFilter};
use crate::pcm;
use crate::stats::CaptureStatsHandle;
use anyhow::{anyhow, bail, Result};
use std::time::Instant;

/// Block-based echo cancellation core.
///
/// Each block is fed in two steps: the far-end (playback) block is buffered
/// first, then the near-end (microphone) block is processed into `out`.
pub trait EchoEngine: Send {
    /// Samples per block.
    fn block_size(&self) -> usize;

    fn buffer_far_end(&mut self, block: &[i16]) -> Result<()>;

    fn process_near_end(&mut self, block: &[i16], out: &mut [i16]) -> Result<()>;
}

/// WebRTC audio processing module running full AEC on 10 ms mono blocks.
pub struct WebRtcEngine {
    apm: Processor,
    block_size: usize,
    render: Vec<f32>,
    capture: Vec<f32>,
}

impl WebRtcEngine {
    pub fn new(sample_rate: u32, stream_delay_ms: i32) -> Result<Self> {
        let apm = Processor::new(sample_rate)
            .map_err(|e| anyhow!("failed to create AEC processor: {}", e))?;
        apm.set_config(Self::build_apm_config(stream_delay_ms.max(0)));
        let block_size = (sample_rate / 100) as usize;
        Ok(Self {
            apm,
            block_size,
            render: vec![0.0; block_size],
            capture: vec![0.0; block_size],
        })
    }

    fn build_apm_config(delay_ms: i32) -> Config {
        let mut apm_config = Config::default();
        apm_config.high_pass_filter = Some(HighPassFilter::default());
        apm_config.echo_canceller = Some(EchoCancellerConfig::Full {
            stream_delay_ms: if delay_ms > 0 { Some(delay_ms as u16) } else { None },
        });
        apm_config.noise_suppression = None;
        apm_config.gain_controller = None;
        apm_config
    }

    fn check_block(&self, len: usize) -> Result<()> {
        if len != self.block_size {
            bail!("AEC block must hold {} samples, got {}", self.block_size, len);
        }
        Ok(())
    }
}

impl EchoEngine for WebRtcEngine {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn buffer_far_end(&mut self, block: &[i16]) -> Result<()> {
        self.check_block(block.len())?;
        for (dst, &s) in self.render.iter_mut().zip(block) {
            *dst = pcm::int16_to_sample(s);
        }
        self.apm
            .process_render_frame([self.render.as_mut_slice()])
            .map_err(|e| anyhow!("APM render error: {}", e))
    }

    fn process_near_end(&mut self, block: &[i16], out: &mut [i16]) -> Result<()> {
        self.check_block(block.len())?;
        self.check_block(out.len())?;
        for (dst, &s) in self.capture.iter_mut().zip(block) {
            *dst = pcm::int16_to_sample(s);
        }
        self.apm
            .process_capture_frame([self.capture.as_mut_slice()])
            .map_err(|e| anyhow!("APM capture error: {}", e))?;
        for (dst, &s) in out.iter_mut().zip(&self.capture) {
            *dst = pcm::sample_to_int16(s.clamp(-1.0, 1.0));
        }
        Ok(())
    }
}

/// Removes playback echo from captured PCM16 using an [`EchoEngine`].
///
/// The engine lives as long as the canceller; the capture scheduler creates
/// one per session and releases it on shutdown.
pub struct EchoCanceller {
    engine: Box<dyn EchoEngine>,
    stats: CaptureStatsHandle,
}

impl EchoCanceller {
    pub fn new(engine: Box<dyn EchoEngine>, stats: CaptureStatsHandle) -> Self {
        Self { engine, stats }
    }

    pub fn webrtc(sample_rate: u32, stream_delay_ms: i32, stats: CaptureStatsHandle) -> Result<Self> {
        Ok(Self::new(Box::new(WebRtcEngine::new(sample_rate, stream_delay_ms)?), stats))
    }

    pub fn block_size(&self) -> usize {
        self.engine.block_size()
    }

    /// Filter `near` against `far`, returning a buffer the length of `near`.
    ///
    /// Silent or missing far-end audio returns `near` unchanged. Otherwise only
    /// whole blocks of the overlapping length are processed: a trailing partial
    /// block, and any near-end samples past the end of `far`, come back
    /// unfiltered.
    pub fn filter(&mut self, near: &[i16], far: &[i16]) -> Vec<i16> {
        let mut output = near.to_vec();
        if far.is_empty() || Self::is_silent(far) {
            self.stats.update(|s| s.aec_passthrough += 1);
            return output;
        }

        let start_time = Instant::now();
        let block = self.engine.block_size();
        if block == 0 {
            return output;
        }
        let processed = near.len().min(far.len()) / block * block;
        let mut filtered = vec![0_i16; block];
        let mut blocks = 0_u64;
        let mut errors = 0_u64;

        for start in (0..processed).step_by(block) {
            let end = start + block;
            if let Err(e) = self.engine.buffer_far_end(&far[start..end]) {
                log::error!("AEC far-end error: {}", e);
                errors += 1;
                continue;
            }
            match self.engine.process_near_end(&near[start..end], &mut filtered) {
                Ok(()) => {
                    output[start..end].copy_from_slice(&filtered);
                    blocks += 1;
                }
                Err(e) => {
                    log::error!("AEC near-end error: {}", e);
                    errors += 1;
                }
            }
        }

        let skipped = (near.len() - processed) as u64;
        let elapsed = start_time.elapsed().as_nanos() as u64;
        self.stats.update(|s| {
            s.aec_blocks += blocks;
            s.aec_errors += errors;
            s.aec_unfiltered_samples += skipped;
            s.aec_stage.record(elapsed);
        });
        output
    }

    fn is_silent(samples: &[i16]) -> bool {
        samples.iter().all(|&s| s == 0)
    }

    /// Release the engine. Consuming `self` rules out use after release.
    pub fn release(self) {
        log::debug!("Releasing echo cancellation engine");
        drop(self.engine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Engine that records calls and outputs near-end minus far-end.
    #[derive(Default)]
    struct SubtractEngine {
        calls: Arc<Mutex<Vec<&'static str>>>,
        last_far: Vec<i16>,
    }

    impl EchoEngine for SubtractEngine {
        fn block_size(&self) -> usize {
            160
        }

        fn buffer_far_end(&mut self, block: &[i16]) -> Result<()> {
            self.calls.lock().unwrap().push("far");
            self.last_far = block.to_vec();
            Ok(())
        }

        fn process_near_end(&mut self, block: &[i16], out: &mut [i16]) -> Result<()> {
            self.calls.lock().unwrap().push("near");
            for ((o, &n), &f) in out.iter_mut().zip(block).zip(&self.last_far) {
                *o = n.saturating_sub(f);
            }
            Ok(())
        }
    }

    fn canceller() -> (EchoCanceller, Arc<Mutex<Vec<&'static str>>>, CaptureStatsHandle) {
        let engine = SubtractEngine::default();
        let calls = engine.calls.clone();
        let stats = CaptureStatsHandle::new();
        (EchoCanceller::new(Box::new(engine), stats.clone()), calls, stats)
    }

    #[test]
    fn silent_far_end_is_passthrough() {
        let (mut aec, calls, stats) = canceller();
        for len in [0, 1, 160, 161, 1000] {
            let near: Vec<i16> = (0..len).map(|i| i as i16).collect();
            assert_eq!(aec.filter(&near, &vec![0; len]), near);
            assert_eq!(aec.filter(&near, &[]), near);
        }
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(stats.snapshot().aec_passthrough, 10);
    }

    #[test]
    fn trailing_partial_block_is_left_unfiltered() {
        let (mut aec, calls, stats) = canceller();
        let near = vec![100_i16; 161];
        let far = vec![40_i16; 161];
        let out = aec.filter(&near, &far);

        assert_eq!(out.len(), 161);
        assert!(out[..160].iter().all(|&s| s == 60));
        assert_eq!(out[160], 100);
        assert_eq!(*calls.lock().unwrap(), vec!["far", "near"]);
        let snap = stats.snapshot();
        assert_eq!(snap.aec_blocks, 1);
        assert_eq!(snap.aec_unfiltered_samples, 1);
    }

    #[test]
    fn processes_only_overlap_with_far_end() {
        let (mut aec, calls, _) = canceller();
        let near = vec![10_i16; 500];
        let far = vec![1_i16; 330];
        let out = aec.filter(&near, &far);

        assert_eq!(out.len(), 500);
        assert!(out[..320].iter().all(|&s| s == 9));
        assert!(out[320..].iter().all(|&s| s == 10));
        assert_eq!(calls.lock().unwrap().len(), 4);
    }

    #[test]
    fn failing_engine_leaves_block_untouched() {
        struct Broken;
        impl EchoEngine for Broken {
            fn block_size(&self) -> usize { 160 }
            fn buffer_far_end(&mut self, _: &[i16]) -> Result<()> { Ok(()) }
            fn process_near_end(&mut self, _: &[i16], _: &mut [i16]) -> Result<()> {
                bail!("engine gone")
            }
        }
        let stats = CaptureStatsHandle::new();
        let mut aec = EchoCanceller::new(Box::new(Broken), stats.clone());
        let near = vec![7_i16; 320];
        assert_eq!(aec.filter(&near, &vec![3; 320]), near);
        assert_eq!(stats.snapshot().aec_errors, 2);
    }

    #[test]
    fn webrtc_engine_uses_10ms_blocks() {
        let mut engine = WebRtcEngine::new(16_000, 0).unwrap();
        assert_eq!(engine.block_size(), 160);

        let far = vec![1000_i16; 160];
        let near = vec![500_i16; 160];
        let mut out = vec![0_i16; 160];
        engine.buffer_far_end(&far).unwrap();
        engine.process_near_end(&near, &mut out).unwrap();
        assert!(engine.buffer_far_end(&far[..100]).is_err());
    }

    #[test]
    fn release_consumes_canceller() {
        let (aec, _, _) = canceller();
        aec.release();
    }
}
