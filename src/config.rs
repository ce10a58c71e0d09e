//! Session configuration
//!
//! All tuning knobs for the conversation engine live here. The defaults are
//! the values the engine ships with; an embedding application can load its
//! own via serde.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capture sample rate in Hz (mono PCM)
    pub sample_rate: u32,

    /// Duration of one audio chunk window in milliseconds
    pub chunk_ms: u64,

    /// Peak-amplitude threshold on [-1, 1] samples above which a chunk
    /// counts as speech
    pub energy_threshold: f32,

    /// Contiguous silence required to close a turn, in milliseconds
    pub silence_timeout_ms: u64,

    /// Minimum captured speech worth transcribing, in milliseconds.
    /// Anything shorter is dropped without a transcription round-trip.
    pub min_turn_ms: u64,

    /// Delay before re-arming capture after playback ends, in milliseconds.
    /// Guards against capturing the tail of the just-finished audio.
    pub guard_delay_ms: u64,

    /// Ceiling on response generation (including synthesis of the reply)
    /// before the turn is abandoned, in milliseconds
    pub response_timeout_ms: u64,

    /// Optional greeting spoken when the session starts
    pub greeting: Option<String>,

    /// Optional voice hint forwarded to the speech-synthesis endpoint
    pub voice: Option<String>,

    /// Transcript artifacts rejected before they reach the response
    /// generator. Compared case-insensitively with trailing punctuation
    /// stripped. This is data, not logic - extend freely.
    pub denylist: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_ms: 1_500,
            energy_threshold: 0.01,
            silence_timeout_ms: 1_500,
            min_turn_ms: 500,
            guard_delay_ms: 500,
            response_timeout_ms: 30_000,
            greeting: None,
            voice: None,
            denylist: crate::hallucination::default_denylist(),
        }
    }
}

impl SessionConfig {
    /// Samples per chunk window
    pub fn chunk_samples(&self) -> usize {
        (self.sample_rate as u64 * self.chunk_ms / 1000) as usize
    }

    /// Number of consecutive silent chunks that closes a turn
    pub fn silence_chunk_threshold(&self) -> usize {
        (self.silence_timeout_ms.div_ceil(self.chunk_ms)).max(1) as usize
    }

    /// Minimum buffered samples worth sending to the transcriber
    pub fn min_turn_samples(&self) -> usize {
        (self.sample_rate as u64 * self.min_turn_ms / 1000) as usize
    }

    pub fn guard_delay(&self) -> Duration {
        Duration::from_millis(self.guard_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}
