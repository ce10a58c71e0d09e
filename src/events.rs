//! Event and effect types for the session state machine

use crate::chunk::AudioChunk;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Listening,
    Transcribing,
    AwaitingResponse,
    Speaking,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One entry in the append-only conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn now(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What the transcription collaborator made of a turn's audio. Service
/// failures degrade to `NoSpeech` so the session keeps listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionOutcome {
    Text(String),
    NoSpeech,
}

/// Discrete events driving the state machine.
#[derive(Debug)]
pub enum SessionEvent {
    /// Session start requested; greeting (if any) gets queued for playback
    Started,
    /// A classified chunk came off the capture pipeline
    ChunkCaptured(AudioChunk),
    /// The transcriber resolved for the turn tagged `epoch`
    TranscriptArrived {
        epoch: u64,
        outcome: TranscriptionOutcome,
    },
    /// The response generator resolved for the turn tagged `epoch`
    ResponseArrived {
        epoch: u64,
        result: Result<String, String>,
    },
    /// Synthesized audio finished playing naturally
    PlaybackEnded,
    /// Playback or synthesis failed; the session must not stay in Speaking
    PlaybackFailed(String),
    /// Explicit disconnect
    Stop,
}

/// Side effects requested by a transition. The runner executes these; the
/// state machine itself stays pure and testable.
#[derive(Debug, PartialEq)]
pub enum Effect {
    /// Submit buffered turn audio for transcription
    Transcribe { epoch: u64, pcm: Vec<f32> },
    /// Forward a completed utterance to the response generator
    Respond { epoch: u64, utterance: String },
    /// Synthesize and play reply text
    Speak(String),
    /// Stop feeding chunks - capture must be paused at the source
    PauseCapture,
    /// Re-arm capture (after the configured guard delay)
    ResumeCapture,
    AppendUser(String),
    AppendAssistant(String),
    /// Tear the session down and release capture/playback resources
    Disconnect,
}
