use crate::messages::AudioFrame;
use anyhow::Result;

// Sub-modules
pub mod resample;
pub mod aec;

// Re-exports
pub use resample::ResampleProcessor;
pub use aec::{EchoCanceller, EchoEngine, WebRtcEngine};

/// Trait for the stages that condition captured audio before conversion
pub trait AudioProcessor: Send {
    /// Process a single audio frame
    /// Returns processed frame or None if more input is needed
    fn process(&mut self, frame: AudioFrame) -> Result<Option<AudioFrame>>;

    /// Return additional ready frames produced from previously buffered input.
    /// Processors that are strictly 1:1 can keep the default implementation.
    fn drain_ready(&mut self) -> Result<Option<AudioFrame>> {
        Ok(None)
    }

    /// Flush any remaining buffered data
    fn flush(&mut self) -> Vec<AudioFrame>;

    /// Reset processor state
    fn reset(&mut self);
}

/// Run one frame through a chain of processors, collecting everything the
/// last stage emits. Errors are logged and drop the offending frame.
pub fn run_chain(processors: &mut [Box<dyn AudioProcessor>], frame: AudioFrame) -> Vec<AudioFrame> {
    let mut frames = vec![frame];

    for processor in processors {
        let mut next_frames = Vec::new();
        for input in frames {
            match processor.process(input) {
                Ok(Some(processed)) => next_frames.push(processed),
                Ok(None) => {}
                Err(e) => log::warn!("Processor error: {}", e),
            }
        }

        loop {
            match processor.drain_ready() {
                Ok(Some(ready)) => next_frames.push(ready),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Processor drain error: {}", e);
                    break;
                }
            }
        }

        if next_frames.is_empty() {
            return Vec::new();
        }

        frames = next_frames;
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DropProcessor;
    impl AudioProcessor for DropProcessor {
        fn process(&mut self, _frame: AudioFrame) -> Result<Option<AudioFrame>> { Ok(None) }
        fn flush(&mut self) -> Vec<AudioFrame> { Vec::new() }
        fn reset(&mut self) {}
    }

    struct GainProcessor(f32);
    impl AudioProcessor for GainProcessor {
        fn process(&mut self, mut frame: AudioFrame) -> Result<Option<AudioFrame>> {
            frame.samples.iter_mut().for_each(|s| *s *= self.0);
            Ok(Some(frame))
        }
        fn flush(&mut self) -> Vec<AudioFrame> { Vec::new() }
        fn reset(&mut self) {}
    }

    fn frame() -> AudioFrame {
        AudioFrame {
            samples: vec![0.1, 0.2],
            sample_rate: 16_000,
            channels: 1,
            timestamp: 0.0,
        }
    }

    #[test]
    fn empty_chain_returns_input() {
        let out = run_chain(&mut [], frame());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].samples, vec![0.1, 0.2]);
    }

    #[test]
    fn chain_stops_when_frame_dropped() {
        let mut processors: Vec<Box<dyn AudioProcessor>> =
            vec![Box::new(DropProcessor), Box::new(GainProcessor(2.0))];
        assert!(run_chain(&mut processors, frame()).is_empty());
    }

    #[test]
    fn chain_applies_stages_in_order() {
        let mut processors: Vec<Box<dyn AudioProcessor>> =
            vec![Box::new(GainProcessor(2.0)), Box::new(GainProcessor(0.5))];
        let out = run_chain(&mut processors, frame());
        assert_eq!(out[0].samples, vec![0.1, 0.2]);
    }
}
