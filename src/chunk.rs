//! Audio chunking and voice-activity classification
//!
//! Raw capture buffers arrive at whatever granularity the device delivers
//! them; the [`Chunker`] re-times them into fixed windows and classifies each
//! window as speech or silence with a peak-amplitude check. The check is
//! intentionally crude - false positives are caught downstream by the
//! hallucination filter, false negatives are mitigated by keeping the
//! threshold low.

use std::io::Cursor;

/// One fixed window of captured audio, already VAD-classified.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono PCM samples on [-1, 1]
    pub samples: Vec<f32>,
    /// True if peak amplitude exceeded the silence threshold
    pub has_energy: bool,
}

/// Peak absolute amplitude of a sample buffer.
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}

/// Re-times incoming sample buffers into fixed-size classified chunks.
pub struct Chunker {
    window: usize,
    threshold: f32,
    pending: Vec<f32>,
}

impl Chunker {
    pub fn new(window_samples: usize, energy_threshold: f32) -> Self {
        Self {
            window: window_samples,
            threshold: energy_threshold,
            pending: Vec::with_capacity(window_samples),
        }
    }

    /// Feed raw samples; returns every complete window they filled.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.window {
            let rest = self.pending.split_off(self.window);
            let window = std::mem::replace(&mut self.pending, rest);
            out.push(self.classify(window));
        }
        out
    }

    fn classify(&self, samples: Vec<f32>) -> AudioChunk {
        let has_energy = peak_amplitude(&samples) > self.threshold;
        AudioChunk { samples, has_energy }
    }
}

/// Containerize f32 PCM as 16-bit mono WAV for the transcription endpoint.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        // Writing into an in-memory cursor cannot fail.
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .unwrap_or_else(|e| unreachable!("wav header into memory: {e}"));
        for &s in samples {
            let s = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            let _ = writer.write_sample(s);
        }
        let _ = writer.finalize();
    }
    cursor.into_inner()
}
