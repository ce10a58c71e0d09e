//! Conversation session
//!
//! [`ConversationSession`] owns one full-duplex turn-taking loop: it wires
//! the capture source, the deterministic state machine, the collaborator
//! clients and the playback controller together, and exposes lifecycle
//! controls plus the live history and state to the embedding application.
//!
//! The runner is the only place with real time and real I/O in it; every
//! decision is delegated to the state machine and executed as drained
//! effects, so the interesting logic stays testable without audio or
//! network.

use crate::capture::AudioSource;
use crate::chunk::{encode_wav, Chunker};
use crate::client::{Responder, Synthesizer, Transcriber};
use crate::config::SessionConfig;
use crate::events::{ChatRole, ChatTurn, Effect, SessionEvent, SessionState};
use crate::fsm::SessionFsm;
use crate::playback::{run_playback, split_sentences, PlaybackCommand, SpeechOutput};
use rand::Rng;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The three black-box services a session talks to.
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// One live conversation. Constructed with [`start`](Self::start), torn down
/// with [`stop`](Self::stop); dropping it cancels the session too.
pub struct ConversationSession {
    session_id: String,
    cancel: CancellationToken,
    state_rx: watch::Receiver<SessionState>,
    history: Arc<Mutex<Vec<ChatTurn>>>,
    last_error: Arc<Mutex<Option<String>>>,
    runner: Option<JoinHandle<()>>,
    playback: Option<JoinHandle<()>>,
}

impl ConversationSession {
    /// Start a session: arms capture, queues the greeting if configured,
    /// and begins listening.
    pub fn start(
        cfg: SessionConfig,
        collaborators: Collaborators,
        source: Box<dyn AudioSource>,
        output: Box<dyn SpeechOutput>,
    ) -> Self {
        let session_id: String = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        info!(%session_id, "starting conversation session");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let cancel = CancellationToken::new();
        let history = Arc::new(Mutex::new(Vec::new()));
        let last_error = Arc::new(Mutex::new(None));

        let playback = tokio::spawn(run_playback(
            playback_rx,
            collaborators.synthesizer.clone(),
            output,
            events_tx.clone(),
            cfg.response_timeout(),
            cancel.clone(),
        ));

        let runner = SessionRunner {
            chunker: Chunker::new(cfg.chunk_samples(), cfg.energy_threshold),
            fsm: SessionFsm::new(cfg.clone()),
            cfg,
            session_id: session_id.clone(),
            source,
            events_tx,
            events_rx,
            playback_tx,
            transcriber: collaborators.transcriber,
            responder: collaborators.responder,
            history: history.clone(),
            state_tx,
            cancel: cancel.clone(),
            last_error: last_error.clone(),
            resume_at: None,
        };
        let runner = tokio::spawn(runner.run());

        Self {
            session_id,
            cancel,
            state_rx,
            history,
            last_error,
            runner: Some(runner),
            playback: Some(playback),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch for state changes (status indication in the embedding UI).
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Snapshot of the append-only conversation history.
    pub fn history(&self) -> Vec<ChatTurn> {
        self.history.lock().unwrap().clone()
    }

    /// The fatal error that ended the session, if one did.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Stop the session: halts playback, tears down capture, clears buffers
    /// and transitions to `Disconnected`. Resources are released before this
    /// returns; collaborator results that resolve later are discarded.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.runner.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.playback.take() {
            let _ = handle.await;
        }
        info!(session_id = %self.session_id, "session stopped");
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What the select loop decided to do next; separated from the select so
/// effect application can borrow the runner mutably.
enum Step {
    Cancelled,
    GuardElapsed,
    Samples(Option<Vec<f32>>),
    Event(Option<SessionEvent>),
}

struct SessionRunner {
    fsm: SessionFsm,
    cfg: SessionConfig,
    session_id: String,
    chunker: Chunker,
    source: Box<dyn AudioSource>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    playback_tx: mpsc::UnboundedSender<PlaybackCommand>,
    transcriber: Arc<dyn Transcriber>,
    responder: Arc<dyn Responder>,
    history: Arc<Mutex<Vec<ChatTurn>>>,
    state_tx: watch::Sender<SessionState>,
    cancel: CancellationToken,
    last_error: Arc<Mutex<Option<String>>>,
    /// Deadline for re-arming capture after playback (guard delay)
    resume_at: Option<Instant>,
}

impl SessionRunner {
    async fn run(mut self) {
        self.fsm.on_event(SessionEvent::Started);
        self.apply_effects();

        while self.fsm.state() != SessionState::Disconnected {
            let guard_deadline = self.resume_at.unwrap_or_else(Instant::now);
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                _ = tokio::time::sleep_until(guard_deadline), if self.resume_at.is_some() => {
                    Step::GuardElapsed
                }
                samples = self.source.next_samples() => Step::Samples(samples),
                event = self.events_rx.recv() => Step::Event(event),
            };

            match step {
                Step::Cancelled => {
                    self.fsm.on_event(SessionEvent::Stop);
                    self.apply_effects();
                }
                Step::GuardElapsed => {
                    debug!("guard delay elapsed, re-arming capture");
                    self.resume_at = None;
                    self.source.resume();
                }
                Step::Samples(Some(samples)) => {
                    for chunk in self.chunker.push(&samples) {
                        self.fsm.on_event(SessionEvent::ChunkCaptured(chunk));
                    }
                    self.apply_effects();
                }
                Step::Samples(None) => {
                    // Device gone. Fatal: report and disconnect, no retry.
                    error!("capture source closed, disconnecting");
                    *self.last_error.lock().unwrap() =
                        Some("microphone unavailable".to_string());
                    self.fsm.on_event(SessionEvent::Stop);
                    self.apply_effects();
                }
                Step::Event(Some(event)) => {
                    self.fsm.on_event(event);
                    self.apply_effects();
                }
                Step::Event(None) => {
                    // All senders gone, nothing can drive us anymore.
                    self.fsm.on_event(SessionEvent::Stop);
                    self.apply_effects();
                }
            }
        }
        debug!(session_id = %self.session_id, "session runner exited");
    }

    fn apply_effects(&mut self) {
        for effect in self.fsm.drain_effects() {
            match effect {
                Effect::Transcribe { epoch, pcm } => self.spawn_transcription(epoch, pcm),
                Effect::Respond { epoch, utterance } => self.spawn_response(epoch, utterance),
                Effect::Speak(text) => {
                    let segments = split_sentences(&text);
                    if self
                        .playback_tx
                        .send(PlaybackCommand::Speak { segments })
                        .is_err()
                    {
                        // Never hang in Speaking because the controller died.
                        let _ = self
                            .events_tx
                            .send(SessionEvent::PlaybackFailed("playback controller gone".into()));
                    }
                }
                Effect::PauseCapture => {
                    self.resume_at = None;
                    self.source.pause();
                }
                Effect::ResumeCapture => {
                    self.resume_at = Some(Instant::now() + self.cfg.guard_delay());
                }
                Effect::AppendUser(text) => self.append(ChatRole::User, text),
                Effect::AppendAssistant(text) => self.append(ChatRole::Assistant, text),
                Effect::Disconnect => {
                    let _ = self.playback_tx.send(PlaybackCommand::Stop);
                    self.cancel.cancel();
                }
            }
        }
        let state = self.fsm.state();
        if *self.state_tx.borrow() != state {
            let _ = self.state_tx.send(state);
        }
    }

    fn append(&self, role: ChatRole, text: String) {
        self.history.lock().unwrap().push(ChatTurn::now(role, text));
    }

    fn spawn_transcription(&self, epoch: u64, pcm: Vec<f32>) {
        let wav = encode_wav(&pcm, self.cfg.sample_rate);
        let transcriber = self.transcriber.clone();
        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let outcome = transcriber.transcribe(wav).await;
            if cancel.is_cancelled() {
                debug!("transcription resolved after cancel, discarded");
                return;
            }
            let _ = events_tx.send(SessionEvent::TranscriptArrived { epoch, outcome });
        });
    }

    fn spawn_response(&self, epoch: u64, utterance: String) {
        let responder = self.responder.clone();
        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        let session_id = self.session_id.clone();
        let history: Vec<ChatTurn> = self.history.lock().unwrap().clone();
        let ceiling = self.cfg.response_timeout();
        tokio::spawn(async move {
            let call = responder.respond(&utterance, &session_id, &history);
            let result = match tokio::time::timeout(ceiling, call).await {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("no response within {}ms", ceiling.as_millis())),
            };
            if cancel.is_cancelled() {
                debug!("response resolved after cancel, discarded");
                return;
            }
            let _ = events_tx.send(SessionEvent::ResponseArrived { epoch, result });
        });
    }
}
