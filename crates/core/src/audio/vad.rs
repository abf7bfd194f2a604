//! Energy-threshold voice activity detection.
//!
//! The gate distinguishes speech from silence on the capture stream using
//! root-mean-square energy with hysteresis: an upper threshold opens the
//! gate, and it closes only after energy stays below a lower threshold for
//! a full hang-time while the utterance has lasted at least the minimum
//! speech duration. Short noise bursts therefore never produce premature
//! end events.
//!
//! Time is passed in by the caller (`now_ms`), so the state machine is
//! deterministic under test.

use serde::{Deserialize, Serialize};

use super::format::rms;

/// Configuration for the voice gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// RMS energy above which silence becomes speech.
    pub energy_threshold: f32,
    /// RMS energy below which speech may decay to silence.
    pub silence_threshold: f32,
    /// Minimum total speech duration before an end event may fire.
    pub min_speech_ms: u64,
    /// Continuous silence required before speech ends.
    pub hang_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        VadConfig {
            energy_threshold: 0.018,
            silence_threshold: 0.015,
            min_speech_ms: 250,
            hang_ms: 1000,
        }
    }
}

/// Speech boundary event, emitted exactly once per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart {
        at_ms: u64,
    },
    SpeechEnd {
        at_ms: u64,
        /// Time from speech start to the end event.
        duration_ms: u64,
    },
}

/// Energy-gated speech detector.
pub struct VoiceGate {
    config: VadConfig,
    speaking: bool,
    locked: bool,
    speech_start_ms: u64,
    silence_since_ms: Option<u64>,
}

impl VoiceGate {
    pub fn new(config: VadConfig) -> Self {
        VoiceGate {
            config,
            speaking: false,
            locked: false,
            speech_start_ms: 0,
            silence_since_ms: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(VadConfig::default())
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Locks or unlocks the gate.
    ///
    /// Locking suppresses all processing and clears in-flight state; it is
    /// how the session silences the gate while the agent holds the floor
    /// or the session is not listening. Distinct from the energy gating.
    pub fn set_locked(&mut self, locked: bool) {
        if locked && !self.locked {
            self.reset();
        }
        self.locked = locked;
    }

    /// Clears all speech state without emitting events.
    pub fn reset(&mut self) {
        self.speaking = false;
        self.silence_since_ms = None;
    }

    /// Feeds one capture frame; returns a boundary event on transition.
    pub fn process_frame(&mut self, samples: &[f32], now_ms: u64) -> Option<VadEvent> {
        if self.locked {
            return None;
        }
        self.process_energy(rms(samples), now_ms)
    }

    /// Feeds a precomputed frame energy.
    pub fn process_energy(&mut self, energy: f32, now_ms: u64) -> Option<VadEvent> {
        if self.locked {
            return None;
        }

        if !self.speaking {
            if energy > self.config.energy_threshold {
                self.speaking = true;
                self.speech_start_ms = now_ms;
                self.silence_since_ms = None;
                return Some(VadEvent::SpeechStart { at_ms: now_ms });
            }
            return None;
        }

        if energy >= self.config.silence_threshold {
            // Speech resumed; cancel the pending hang timer.
            self.silence_since_ms = None;
            return None;
        }

        let silence_since = *self.silence_since_ms.get_or_insert(now_ms);
        let hang_elapsed = now_ms.saturating_sub(silence_since) >= self.config.hang_ms;
        let long_enough =
            now_ms.saturating_sub(self.speech_start_ms) >= self.config.min_speech_ms;
        if hang_elapsed && long_enough {
            self.speaking = false;
            self.silence_since_ms = None;
            return Some(VadEvent::SpeechEnd {
                at_ms: now_ms,
                duration_ms: now_ms.saturating_sub(self.speech_start_ms),
            });
        }
        None
    }
}
