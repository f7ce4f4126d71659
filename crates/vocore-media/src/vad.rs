//! Voice activity detection over the processed (post-DSP) audio stream.
//!
//! Computes short-window RMS loudness and applies hysteresis so a momentary
//! dip below threshold doesn't flicker the speaking flag.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default RMS threshold above which audio is considered speech.
pub const DEFAULT_THRESHOLD: f32 = 0.02;

/// How long to keep `speaking = true` after the level drops below threshold.
pub const DEFAULT_HOLD_TIME: Duration = Duration::from_millis(280);

/// Computes the RMS (root-mean-square) level of a block of `f32` PCM samples.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Voice activity detector with hysteresis. Feed it RMS levels (via
/// [`Self::observe`]) or raw samples (via [`Self::observe_samples`]) at
/// roughly 20 Hz; read [`Self::is_speaking`] for the debounced result.
pub struct VoiceActivityDetector {
    level: Arc<AtomicU32>,
    threshold: f32,
    is_speaking: Arc<AtomicBool>,
    last_above_threshold_at: Option<Instant>,
    hold_time: Duration,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f32, hold_time: Duration) -> Self {
        Self {
            level: Arc::new(AtomicU32::new(0.0f32.to_bits())),
            threshold,
            is_speaking: Arc::new(AtomicBool::new(false)),
            last_above_threshold_at: None,
            hold_time,
        }
    }

    /// Feed a raw frame of processed PCM samples and update speaking state.
    pub fn observe_samples(&mut self, samples: &[f32]) -> bool {
        self.observe(compute_rms(samples))
    }

    /// Feed a precomputed RMS level and update speaking state.
    pub fn observe(&mut self, level: f32) -> bool {
        self.level.store(level.to_bits(), Ordering::Relaxed);
        let now = Instant::now();

        let speaking = if level > self.threshold {
            self.last_above_threshold_at = Some(now);
            true
        } else if let Some(last) = self.last_above_threshold_at {
            now.duration_since(last) < self.hold_time
        } else {
            false
        };

        self.is_speaking.store(speaking, Ordering::SeqCst);
        speaking
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking.load(Ordering::SeqCst)
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_hold_time(&mut self, hold_time: Duration) {
        self.hold_time = hold_time;
    }

    /// Clone of the shared speaking flag, for publishing to another task
    /// without holding a reference to the detector itself.
    pub fn speaking_flag(&self) -> Arc<AtomicBool> {
        self.is_speaking.clone()
    }
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_HOLD_TIME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loud_signal_triggers_speaking() {
        let mut vad = VoiceActivityDetector::default();
        let loud = vec![0.5f32; 960];
        assert!(vad.observe_samples(&loud));
    }

    #[test]
    fn silence_never_speaking_without_prior_speech() {
        let mut vad = VoiceActivityDetector::default();
        let silence = vec![0.0f32; 960];
        assert!(!vad.observe_samples(&silence));
    }

    #[test]
    fn holds_speaking_state_through_brief_dip() {
        let mut vad = VoiceActivityDetector::new(0.02, Duration::from_millis(250));
        assert!(vad.observe_samples(&vec![0.5f32; 960]));
        // Immediately below threshold: still within hold window.
        assert!(vad.observe_samples(&vec![0.0f32; 960]));
    }

    #[test]
    fn releases_speaking_after_hold_time_elapses() {
        let mut vad = VoiceActivityDetector::new(0.02, Duration::from_millis(10));
        assert!(vad.observe_samples(&vec![0.5f32; 960]));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!vad.observe_samples(&vec![0.0f32; 960]));
    }
}
