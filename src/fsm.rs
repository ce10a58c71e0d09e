//! Session state machine
//!
//! The coordinator for one conversation: every transition is a pure function
//! from `(state, event)` to `(state, effects)`, driven by discrete events and
//! independent of real audio or network. The async runner in `session`
//! executes the drained effects.
//!
//! Turn epochs implement cancellation and barge-in: each dispatched turn is
//! tagged with the epoch current at dispatch time, and any collaborator
//! result arriving with a stale tag is discarded. Entering `Speaking` bumps
//! the epoch so a superseded turn can never queue a second reply.

use crate::aggregate::TurnAggregator;
use crate::chunk::AudioChunk;
use crate::config::SessionConfig;
use crate::events::{Effect, SessionEvent, SessionState, TranscriptionOutcome};
use crate::hallucination::is_hallucination;
use crate::silence::SilenceTracker;
use tracing::{debug, info, warn};

/// Deterministic conversation state machine.
pub struct SessionFsm {
    state: SessionState,
    cfg: SessionConfig,

    /// Speech audio buffered for the in-flight human turn
    speech_buf: Vec<f32>,

    silence: SilenceTracker,
    aggregator: TurnAggregator,

    /// Current turn epoch; results tagged with an older value are stale
    epoch: u64,

    /// Effect queue, drained after each event
    effects: Vec<Effect>,
}

impl SessionFsm {
    pub fn new(cfg: SessionConfig) -> Self {
        let silence = SilenceTracker::new(cfg.silence_chunk_threshold(), cfg.chunk_ms);
        let aggregator = TurnAggregator::new();
        Self {
            state: SessionState::Idle,
            cfg,
            speech_buf: Vec::new(),
            silence,
            aggregator,
            epoch: 0,
            effects: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Drain all effects produced since the last call.
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Process one event.
    pub fn on_event(&mut self, event: SessionEvent) {
        if self.state == SessionState::Disconnected {
            debug!(?event, "event after disconnect ignored");
            return;
        }
        match event {
            SessionEvent::Started => self.on_started(),
            SessionEvent::ChunkCaptured(chunk) => self.on_chunk(chunk),
            SessionEvent::TranscriptArrived { epoch, outcome } => {
                self.on_transcript(epoch, outcome)
            }
            SessionEvent::ResponseArrived { epoch, result } => self.on_response(epoch, result),
            SessionEvent::PlaybackEnded => self.on_playback_done(None),
            SessionEvent::PlaybackFailed(reason) => self.on_playback_done(Some(reason)),
            SessionEvent::Stop => self.disconnect(),
        }
    }

    fn on_started(&mut self) {
        if self.state != SessionState::Idle {
            return;
        }
        if let Some(greeting) = self.cfg.greeting.clone() {
            info!("session started, queueing greeting");
            self.effects.push(Effect::PauseCapture);
            self.effects.push(Effect::AppendAssistant(greeting.clone()));
            self.effects.push(Effect::Speak(greeting));
            self.transition(SessionState::Speaking);
        } else {
            info!("session started, listening");
            self.transition(SessionState::Listening);
        }
    }

    fn on_chunk(&mut self, chunk: AudioChunk) {
        match self.state {
            // No self-feedback: while we are speaking, chunks are dropped
            // here as well as paused at the source.
            SessionState::Speaking => {
                debug!("chunk dropped while speaking");
            }
            SessionState::Listening
            | SessionState::Transcribing
            | SessionState::AwaitingResponse => {
                if chunk.has_energy {
                    self.silence.observe_speech();
                    self.speech_buf.extend_from_slice(&chunk.samples);
                    debug!(
                        buffered_samples = self.speech_buf.len(),
                        "speech chunk buffered"
                    );
                } else {
                    let boundary = self.silence.observe_silence();
                    if let Some(since) = self.silence.time_since_speech() {
                        debug!(?since, "silent chunk");
                    }
                    if boundary {
                        self.on_turn_boundary();
                    }
                }
            }
            SessionState::Idle | SessionState::Disconnected => {}
        }
    }

    /// The end-of-turn detector fired: dispatch the buffered audio if there
    /// is enough of it to be worth a transcription round-trip.
    fn on_turn_boundary(&mut self) {
        if self.speech_buf.is_empty() {
            return;
        }
        if self.speech_buf.len() < self.cfg.min_turn_samples() {
            debug!(
                samples = self.speech_buf.len(),
                floor = self.cfg.min_turn_samples(),
                "turn audio below minimum size, dropped"
            );
            self.speech_buf.clear();
            return;
        }
        self.epoch += 1;
        let pcm = std::mem::take(&mut self.speech_buf);
        info!(
            epoch = self.epoch,
            samples = pcm.len(),
            "🎤 turn boundary, submitting audio for transcription"
        );
        self.effects.push(Effect::Transcribe {
            epoch: self.epoch,
            pcm,
        });
        self.transition(SessionState::Transcribing);
    }

    fn on_transcript(&mut self, epoch: u64, outcome: TranscriptionOutcome) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "stale transcript discarded");
            return;
        }
        if self.state != SessionState::Transcribing {
            debug!(state = ?self.state, "transcript outside Transcribing ignored");
            return;
        }
        match outcome {
            TranscriptionOutcome::Text(text) => {
                if is_hallucination(&text, &self.cfg.denylist) {
                    info!(%text, "transcript matched hallucination denylist, dropped");
                } else {
                    self.aggregator.push(text);
                }
            }
            TranscriptionOutcome::NoSpeech => {
                debug!("no speech detected in turn audio");
            }
        }

        // The boundary already fired, so any non-empty filtered buffer is a
        // complete utterance.
        if self.aggregator.is_empty() {
            debug!("turn abandoned, nothing to forward");
            self.transition(SessionState::Listening);
            return;
        }
        let utterance = self.aggregator.take();
        info!(%utterance, epoch = self.epoch, "utterance complete, requesting response");
        self.effects.push(Effect::AppendUser(utterance.clone()));
        self.effects.push(Effect::Respond {
            epoch: self.epoch,
            utterance,
        });
        self.transition(SessionState::AwaitingResponse);
    }

    fn on_response(&mut self, epoch: u64, result: Result<String, String>) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "stale response discarded");
            return;
        }
        if self.state != SessionState::AwaitingResponse {
            debug!(state = ?self.state, "response outside AwaitingResponse ignored");
            return;
        }
        match result {
            Ok(text) => {
                info!(chars = text.chars().count(), "response received, speaking");
                // Supersede anything still in flight before audio starts.
                self.epoch += 1;
                self.effects.push(Effect::AppendAssistant(text.clone()));
                self.effects.push(Effect::PauseCapture);
                self.effects.push(Effect::Speak(text));
                self.transition(SessionState::Speaking);
            }
            Err(reason) => {
                // Non-fatal: the user turn stays in history, no assistant
                // reply is appended, and we go back to listening.
                warn!(%reason, "response generation failed, turn abandoned");
                self.transition(SessionState::Listening);
            }
        }
    }

    fn on_playback_done(&mut self, failure: Option<String>) {
        if self.state != SessionState::Speaking {
            debug!(state = ?self.state, "playback completion outside Speaking ignored");
            return;
        }
        if let Some(reason) = failure {
            warn!(%reason, "playback failed, returning to listening");
        }
        self.silence.reset();
        self.speech_buf.clear();
        self.effects.push(Effect::ResumeCapture);
        self.transition(SessionState::Listening);
    }

    fn disconnect(&mut self) {
        info!("session disconnecting");
        self.epoch += 1;
        self.speech_buf.clear();
        self.aggregator.clear();
        self.silence.reset();
        self.effects.push(Effect::Disconnect);
        self.transition(SessionState::Disconnected);
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!("🔄 state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> SessionConfig {
        SessionConfig {
            sample_rate: 16_000,
            chunk_ms: 100,        // 1600-sample windows
            silence_timeout_ms: 200, // 2 silent chunks close a turn
            min_turn_ms: 100,
            greeting: None,
            ..Default::default()
        }
    }

    fn speech_chunk(n: usize) -> AudioChunk {
        AudioChunk {
            samples: vec![0.2; n],
            has_energy: true,
        }
    }

    fn silent_chunk(n: usize) -> AudioChunk {
        AudioChunk {
            samples: vec![0.0; n],
            has_energy: false,
        }
    }

    fn started(cfg: SessionConfig) -> SessionFsm {
        let mut fsm = SessionFsm::new(cfg);
        fsm.on_event(SessionEvent::Started);
        fsm.drain_effects();
        fsm
    }

    /// Silence, speech, silence over the threshold produces exactly one
    /// transcription request containing only the speech chunks' audio.
    #[test]
    fn one_transcription_per_turn_with_speech_audio_only() {
        let mut fsm = started(test_cfg());
        for _ in 0..3 {
            fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        }
        for _ in 0..4 {
            fsm.on_event(SessionEvent::ChunkCaptured(speech_chunk(1600)));
        }
        for _ in 0..5 {
            fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        }
        let transcribes: Vec<_> = fsm
            .drain_effects()
            .into_iter()
            .filter(|e| matches!(e, Effect::Transcribe { .. }))
            .collect();
        assert_eq!(transcribes.len(), 1);
        match &transcribes[0] {
            Effect::Transcribe { pcm, .. } => assert_eq!(pcm.len(), 4 * 1600),
            _ => unreachable!(),
        }
        assert_eq!(fsm.state(), SessionState::Transcribing);
    }

    #[test]
    fn below_minimum_audio_is_dropped_without_dispatch() {
        let cfg = SessionConfig {
            min_turn_ms: 500, // 8000 samples, more than one 1600-sample chunk
            ..test_cfg()
        };
        let mut fsm = started(cfg);
        fsm.on_event(SessionEvent::ChunkCaptured(speech_chunk(1600)));
        for _ in 0..3 {
            fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        }
        assert!(fsm.drain_effects().is_empty());
        assert_eq!(fsm.state(), SessionState::Listening);
    }

    /// A denylisted transcript is not forwarded to the response generator.
    #[test]
    fn hallucination_abandons_the_turn() {
        let mut fsm = started(test_cfg());
        fsm.on_event(SessionEvent::ChunkCaptured(speech_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        let epoch = fsm.epoch();
        fsm.drain_effects();

        fsm.on_event(SessionEvent::TranscriptArrived {
            epoch,
            outcome: TranscriptionOutcome::Text("Um.".into()),
        });
        assert!(fsm.drain_effects().is_empty());
        assert_eq!(fsm.state(), SessionState::Listening);
    }

    /// Transcription failure degrades to no-speech and the session keeps
    /// listening.
    #[test]
    fn no_speech_returns_to_listening() {
        let mut fsm = started(test_cfg());
        fsm.on_event(SessionEvent::ChunkCaptured(speech_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        let epoch = fsm.epoch();
        fsm.drain_effects();

        fsm.on_event(SessionEvent::TranscriptArrived {
            epoch,
            outcome: TranscriptionOutcome::NoSpeech,
        });
        assert!(fsm.drain_effects().is_empty());
        assert_eq!(fsm.state(), SessionState::Listening);
    }

    /// An accepted transcript appends the user turn and requests a response;
    /// the reply is appended and spoken.
    #[test]
    fn full_turn_reaches_speaking() {
        let mut fsm = started(test_cfg());
        fsm.on_event(SessionEvent::ChunkCaptured(speech_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        let epoch = fsm.epoch();
        fsm.drain_effects();

        fsm.on_event(SessionEvent::TranscriptArrived {
            epoch,
            outcome: TranscriptionOutcome::Text("I want to save a memory".into()),
        });
        let effects = fsm.drain_effects();
        assert_eq!(
            effects[0],
            Effect::AppendUser("I want to save a memory".into())
        );
        assert!(matches!(effects[1], Effect::Respond { .. }));
        assert_eq!(fsm.state(), SessionState::AwaitingResponse);

        fsm.on_event(SessionEvent::ResponseArrived {
            epoch,
            result: Ok("Tell me more about it.".into()),
        });
        let effects = fsm.drain_effects();
        assert!(effects.contains(&Effect::AppendAssistant("Tell me more about it.".into())));
        assert!(effects.contains(&Effect::PauseCapture));
        assert!(effects.contains(&Effect::Speak("Tell me more about it.".into())));
        assert_eq!(fsm.state(), SessionState::Speaking);

        fsm.on_event(SessionEvent::PlaybackEnded);
        assert!(fsm.drain_effects().contains(&Effect::ResumeCapture));
        assert_eq!(fsm.state(), SessionState::Listening);
    }

    /// Chunks during Speaking never reach the pipeline.
    #[test]
    fn chunks_ignored_while_speaking() {
        let cfg = SessionConfig {
            greeting: Some("Hello!".into()),
            ..test_cfg()
        };
        let mut fsm = SessionFsm::new(cfg);
        fsm.on_event(SessionEvent::Started);
        fsm.drain_effects();
        assert_eq!(fsm.state(), SessionState::Speaking);

        for _ in 0..10 {
            fsm.on_event(SessionEvent::ChunkCaptured(speech_chunk(1600)));
            fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        }
        assert!(fsm.drain_effects().is_empty());
        assert_eq!(fsm.state(), SessionState::Speaking);
    }

    #[test]
    fn stale_results_are_discarded() {
        let mut fsm = started(test_cfg());
        fsm.on_event(SessionEvent::ChunkCaptured(speech_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        let first_epoch = fsm.epoch();
        fsm.drain_effects();

        // A second turn boundary supersedes the first while it is in flight.
        fsm.on_event(SessionEvent::ChunkCaptured(speech_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        assert_eq!(fsm.epoch(), first_epoch + 1);
        fsm.drain_effects();

        fsm.on_event(SessionEvent::TranscriptArrived {
            epoch: first_epoch,
            outcome: TranscriptionOutcome::Text("late".into()),
        });
        assert!(fsm.drain_effects().is_empty());
        assert_eq!(fsm.state(), SessionState::Transcribing);
    }

    #[test]
    fn response_failure_keeps_user_turn_only() {
        let mut fsm = started(test_cfg());
        fsm.on_event(SessionEvent::ChunkCaptured(speech_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        let epoch = fsm.epoch();
        fsm.drain_effects();
        fsm.on_event(SessionEvent::TranscriptArrived {
            epoch,
            outcome: TranscriptionOutcome::Text("hello there".into()),
        });
        fsm.drain_effects();

        fsm.on_event(SessionEvent::ResponseArrived {
            epoch,
            result: Err("upstream 500".into()),
        });
        let effects = fsm.drain_effects();
        assert!(!effects.iter().any(|e| matches!(e, Effect::Speak(_))));
        assert_eq!(fsm.state(), SessionState::Listening);
    }

    #[test]
    fn playback_failure_never_sticks_in_speaking() {
        let cfg = SessionConfig {
            greeting: Some("Hi".into()),
            ..test_cfg()
        };
        let mut fsm = SessionFsm::new(cfg);
        fsm.on_event(SessionEvent::Started);
        fsm.drain_effects();
        fsm.on_event(SessionEvent::PlaybackFailed("decoder error".into()));
        assert!(fsm.drain_effects().contains(&Effect::ResumeCapture));
        assert_eq!(fsm.state(), SessionState::Listening);
    }

    /// Stop invalidates the epoch and emits Disconnect; later events are
    /// ignored outright.
    #[test]
    fn stop_disconnects_from_any_state() {
        let mut fsm = started(test_cfg());
        fsm.on_event(SessionEvent::ChunkCaptured(speech_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        fsm.on_event(SessionEvent::ChunkCaptured(silent_chunk(1600)));
        let epoch = fsm.epoch();
        fsm.drain_effects();

        fsm.on_event(SessionEvent::Stop);
        assert!(fsm.drain_effects().contains(&Effect::Disconnect));
        assert_eq!(fsm.state(), SessionState::Disconnected);

        fsm.on_event(SessionEvent::TranscriptArrived {
            epoch,
            outcome: TranscriptionOutcome::Text("too late".into()),
        });
        assert!(fsm.drain_effects().is_empty());
        assert_eq!(fsm.state(), SessionState::Disconnected);
    }
}
