//! Silence and end-of-turn detection
//!
//! Counter-based rather than timer-based: the tracker is driven purely by
//! chunk arrival, so turn boundaries are deterministic under test. Wall-clock
//! behavior falls out of the chunk cadence the capture layer provides.

use std::time::Duration;

/// Tracks consecutive silent chunks and fires a turn boundary when the run
/// crosses the configured threshold.
pub struct SilenceTracker {
    threshold_chunks: usize,
    chunk_ms: u64,
    consecutive_silent: usize,
    chunks_since_speech: Option<usize>,
}

impl SilenceTracker {
    pub fn new(threshold_chunks: usize, chunk_ms: u64) -> Self {
        Self {
            threshold_chunks,
            chunk_ms,
            consecutive_silent: 0,
            chunks_since_speech: None,
        }
    }

    /// A speech-classified chunk arrived. Resets the silence run immediately,
    /// even mid-buffer.
    pub fn observe_speech(&mut self) {
        self.consecutive_silent = 0;
        self.chunks_since_speech = Some(0);
    }

    /// A silent chunk arrived. Returns true exactly once per silence run,
    /// when the run reaches the threshold.
    pub fn observe_silence(&mut self) -> bool {
        self.consecutive_silent += 1;
        if let Some(n) = self.chunks_since_speech.as_mut() {
            *n += 1;
        }
        self.consecutive_silent == self.threshold_chunks
    }

    /// Time since the last speech-classified chunk, if any speech has been
    /// heard at all. Diagnostic only.
    pub fn time_since_speech(&self) -> Option<Duration> {
        self.chunks_since_speech
            .map(|n| Duration::from_millis(n as u64 * self.chunk_ms))
    }

    pub fn reset(&mut self) {
        self.consecutive_silent = 0;
        self.chunks_since_speech = None;
    }
}
