//! voxloop demo binary
//!
//! Wires the conversation engine to the default microphone and speaker and
//! to HTTP collaborator endpoints taken from the environment:
//!
//! - `VOXLOOP_TRANSCRIBE_URL` - transcription endpoint
//! - `VOXLOOP_RESPOND_URL`    - response-generation endpoint
//! - `VOXLOOP_SPEAK_URL`      - speech-synthesis endpoint
//! - `VOXLOOP_GREETING`       - optional spoken greeting
//! - `VOXLOOP_VOICE`          - optional voice hint for synthesis

use anyhow::Context;
use std::sync::Arc;
use voxloop::{
    Collaborators, ConversationSession, HttpResponder, HttpSynthesizer, HttpTranscriber,
    MicSource, RodioOutput, SessionConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let transcribe_url =
        std::env::var("VOXLOOP_TRANSCRIBE_URL").context("VOXLOOP_TRANSCRIBE_URL not set")?;
    let respond_url =
        std::env::var("VOXLOOP_RESPOND_URL").context("VOXLOOP_RESPOND_URL not set")?;
    let speak_url = std::env::var("VOXLOOP_SPEAK_URL").context("VOXLOOP_SPEAK_URL not set")?;

    let cfg = SessionConfig {
        greeting: std::env::var("VOXLOOP_GREETING").ok(),
        voice: std::env::var("VOXLOOP_VOICE").ok(),
        ..Default::default()
    };

    let http = reqwest::Client::new();
    let collaborators = Collaborators {
        transcriber: Arc::new(HttpTranscriber::new(http.clone(), transcribe_url)),
        responder: Arc::new(HttpResponder::new(http.clone(), respond_url)),
        synthesizer: Arc::new(HttpSynthesizer::new(http, speak_url, cfg.voice.clone())),
    };

    let mic = MicSource::open(cfg.sample_rate).context("opening microphone")?;
    let speaker = RodioOutput::open().context("opening audio output")?;

    let mut session =
        ConversationSession::start(cfg, collaborators, Box::new(mic), Box::new(speaker));
    tracing::info!(session_id = %session.session_id(), "conversation running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    session.stop().await;

    if let Some(error) = session.last_error() {
        tracing::warn!(%error, "session ended with error");
    }
    for turn in session.history() {
        println!("[{:?}] {}", turn.role, turn.text);
    }
    Ok(())
}
