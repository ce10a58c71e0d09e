//! voxloop - real-time streaming voice conversation engine
//!
//! One [`ConversationSession`] owns a full-duplex turn-taking loop between a
//! human speaker and an AI agent over a noisy, chunked audio channel:
//! energy-based voice-activity detection, silence-driven end-of-turn
//! detection, hallucination filtering of transcripts, and priority-ordered
//! speech playback with barge-in protection - all coordinated by a small
//! deterministic state machine.
//!
//! The transcription, response-generation and speech-synthesis services are
//! external collaborators behind trait seams ([`Transcriber`], [`Responder`],
//! [`Synthesizer`]) with HTTP implementations included. Real microphone and
//! speaker adapters live behind the `devices` feature; the core is driven
//! purely by events and is testable without audio hardware or network.

#![forbid(unsafe_code)]

pub mod aggregate;
pub mod capture;
pub mod chunk;
pub mod client;
pub mod config;
pub mod events;
pub mod fsm;
pub mod hallucination;
pub mod playback;
pub mod session;
pub mod silence;

pub use capture::{AudioSource, CaptureError, ChannelSource};
pub use chunk::AudioChunk;
pub use client::{
    ClientError, HttpResponder, HttpSynthesizer, HttpTranscriber, Responder, Synthesizer,
    Transcriber,
};
pub use config::SessionConfig;
pub use events::{ChatRole, ChatTurn, SessionState, TranscriptionOutcome};
pub use playback::{PlaybackError, SpeechOutput};
pub use session::{Collaborators, ConversationSession};

#[cfg(feature = "devices")]
pub use capture::MicSource;
#[cfg(feature = "devices")]
pub use playback::RodioOutput;
