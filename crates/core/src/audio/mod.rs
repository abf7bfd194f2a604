//! Audio session: capture, voice-activity gating, gapless playback.
//!
//! The capture path runs on a fixed short cadence: every frame is energy
//! metered, VAD gated, and (when the half-duplex discipline allows)
//! serialized to 16-bit PCM for the outbound channel. The playback path
//! schedules inbound chunks back-to-back on an advancing cursor. The two
//! meet at exactly one flag: `agent_speaking`, written by playback turn
//! boundaries and read by the frame handler, so the agent's own voice is
//! never captured as user speech.

pub mod format;
pub mod playback;
pub mod vad;

#[cfg(feature = "device-audio")]
pub mod capture;

pub use playback::{AudioSink, NullSink, Playback, PlaybackEvent, PlaybackScheduler};
pub use vad::{VadConfig, VadEvent, VoiceGate};

#[cfg(feature = "device-audio")]
pub use capture::{MicCapture, SpeakerSink};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pilot_protocol::AudioFormat;
use thiserror::Error;

use format::{encode_pcm_s16le, rms};

/// Errors from the audio subsystem. All are non-fatal to the session:
/// capture failures degrade to text-only mode and decode failures drop
/// the chunk.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    /// Microphone denied, missing, or blocked by policy.
    #[error("Microphone unavailable: {0}")]
    MicUnavailable(String),

    /// Device stream failure after startup.
    #[error("Audio stream error: {0}")]
    Stream(String),

    /// Malformed chunk payload.
    #[error("Audio decode error: {0}")]
    Decode(String),
}

/// One chunk of raw PCM, inbound or outbound.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub payload: Vec<u8>,
}

/// Capture device parameters.
///
/// 16 kHz mono matches what the agent's speech recognizer expects.
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            sample_rate: 16_000,
            channels: 1,
        }
    }
}

/// What happened to one capture frame.
#[derive(Debug, Clone, Default)]
pub struct FrameOutcome {
    /// Frame energy, for host-side level metering.
    pub rms: f32,
    /// Speech boundary crossed by this frame, if any.
    pub vad_event: Option<VadEvent>,
    /// Serialized 16-bit PCM to forward, unless the frame was dropped.
    pub outbound: Option<Vec<u8>>,
}

/// Per-frame capture processing: half-duplex gate, VAD, serialization.
pub struct AudioPipeline {
    gate: VoiceGate,
    agent_speaking: Arc<AtomicBool>,
}

impl AudioPipeline {
    pub fn new(vad: VadConfig, agent_speaking: Arc<AtomicBool>) -> Self {
        AudioPipeline {
            gate: VoiceGate::new(vad),
            agent_speaking,
        }
    }

    /// Locks or unlocks the voice gate (see [`VoiceGate::set_locked`]).
    pub fn set_locked(&mut self, locked: bool) {
        self.gate.set_locked(locked);
    }

    pub fn locked(&self) -> bool {
        self.gate.locked()
    }

    pub fn user_speaking(&self) -> bool {
        self.gate.is_speaking()
    }

    /// Processes one capture frame.
    ///
    /// Frames delivered while the agent is speaking are dropped outright -
    /// not buffered - so the agent's voice cannot echo back as input.
    pub fn on_frame(&mut self, samples: &[f32], now_ms: u64) -> FrameOutcome {
        if self.agent_speaking.load(Ordering::SeqCst) {
            return FrameOutcome::default();
        }

        let energy = rms(samples);
        let vad_event = self.gate.process_energy(energy, now_ms);
        FrameOutcome {
            rms: energy,
            vad_event,
            outbound: Some(encode_pcm_s16le(samples)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_frame() -> Vec<f32> {
        vec![0.1; 320]
    }

    #[test]
    fn frames_while_agent_speaks_are_dropped() {
        let speaking = Arc::new(AtomicBool::new(false));
        let mut pipeline = AudioPipeline::new(VadConfig::default(), Arc::clone(&speaking));

        let forwarded = pipeline.on_frame(&loud_frame(), 0);
        assert!(forwarded.outbound.is_some());
        assert!(forwarded.vad_event.is_some());

        speaking.store(true, Ordering::SeqCst);
        for i in 1..50 {
            let outcome = pipeline.on_frame(&loud_frame(), i * 20);
            assert!(outcome.outbound.is_none(), "half-duplex violated");
            assert!(outcome.vad_event.is_none());
        }

        speaking.store(false, Ordering::SeqCst);
        let resumed = pipeline.on_frame(&loud_frame(), 2000);
        assert!(resumed.outbound.is_some());
    }

    #[test]
    fn locked_pipeline_still_forwards_audio() {
        // The lock silences VAD transitions; raw audio still flows so the
        // agent-side recognizer keeps context (the agent-speaking gate is
        // the one that stops forwarding).
        let speaking = Arc::new(AtomicBool::new(false));
        let mut pipeline = AudioPipeline::new(VadConfig::default(), speaking);
        pipeline.set_locked(true);

        let outcome = pipeline.on_frame(&loud_frame(), 0);
        assert!(outcome.vad_event.is_none());
        assert!(outcome.outbound.is_some());
        assert!(outcome.rms > 0.0);
    }

    #[test]
    fn serialized_frames_are_s16le() {
        let speaking = Arc::new(AtomicBool::new(false));
        let mut pipeline = AudioPipeline::new(VadConfig::default(), speaking);
        let outcome = pipeline.on_frame(&[0.5, -0.5], 0);
        let bytes = outcome.outbound.unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 16383);
    }
}
