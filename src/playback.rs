//! Speech playback sequencing
//!
//! A dedicated task owns synthesis and playback, driven by commands from the
//! session runner. Reply text is split into sentence-level segments that are
//! synthesized and played strictly in order, so long replies start audibly
//! sooner. Exactly one audio stream is ever active: a new request stops the
//! active stream before starting, and `Stop` or cancellation halts playback
//! immediately. Natural completion and failure both report back as events -
//! the session never sticks in `Speaking`. Synthesis itself is raced against
//! cancellation and a ceiling, so a stalled endpoint cannot wedge the task.

use crate::client::Synthesizer;
use crate::events::SessionEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("audio output error: {0}")]
    Output(String),
}

/// Commands accepted by the playback task.
#[derive(Debug)]
pub enum PlaybackCommand {
    /// Play these segments in order, stopping anything already active
    Speak { segments: Vec<String> },
    /// Stop the active stream and drop the queue
    Stop,
}

/// Handle to one in-flight audio stream.
pub struct ActivePlayback {
    done: oneshot::Receiver<()>,
    stopper: Box<dyn FnOnce() + Send>,
}

impl ActivePlayback {
    /// `done` resolves when playback reaches its natural end; `stopper`
    /// halts the stream early.
    pub fn new(done: oneshot::Receiver<()>, stopper: Box<dyn FnOnce() + Send>) -> Self {
        Self { done, stopper }
    }
}

/// Seam to the physical audio output.
pub trait SpeechOutput: Send {
    fn start(&mut self, audio: Vec<u8>) -> Result<ActivePlayback, PlaybackError>;
}

/// Split reply text into sentence-level fragments for incremental synthesis.
/// Terminators followed by whitespace end a fragment, so decimals and
/// abbreviations mid-token survive.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\n' {
            flush(&mut cur, &mut out);
            continue;
        }
        cur.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            match chars.peek() {
                None => flush(&mut cur, &mut out),
                Some(next) if next.is_whitespace() => flush(&mut cur, &mut out),
                _ => {}
            }
        }
    }
    flush(&mut cur, &mut out);
    out
}

fn flush(cur: &mut String, out: &mut Vec<String>) {
    let s = std::mem::take(cur);
    let s = s.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
}

enum PlayOutcome {
    Completed,
    Failed(String),
    Preempted(Vec<String>),
    Halted,
}

/// Run the playback controller until the command channel closes or the
/// session is cancelled.
pub async fn run_playback(
    mut cmd_rx: mpsc::UnboundedReceiver<PlaybackCommand>,
    synth: Arc<dyn Synthesizer>,
    mut output: Box<dyn SpeechOutput>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    synth_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut queued: Option<Vec<String>> = None;
    loop {
        let segments = match queued.take() {
            Some(s) => s,
            None => tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    None => break,
                    Some(PlaybackCommand::Stop) => continue,
                    Some(PlaybackCommand::Speak { segments }) => segments,
                },
            },
        };

        info!(segments = segments.len(), "starting playback");
        match play_segments(
            segments,
            &synth,
            &mut output,
            &mut cmd_rx,
            synth_timeout,
            &cancel,
        )
        .await
        {
            PlayOutcome::Completed => {
                debug!("playback reached natural end");
                let _ = events_tx.send(SessionEvent::PlaybackEnded);
            }
            PlayOutcome::Failed(reason) => {
                warn!(%reason, "playback failed");
                let _ = events_tx.send(SessionEvent::PlaybackFailed(reason));
            }
            PlayOutcome::Preempted(next) => {
                debug!("playback preempted by new request");
                queued = Some(next);
            }
            PlayOutcome::Halted => {}
        }
    }
    debug!("playback controller stopped");
}

async fn play_segments(
    segments: Vec<String>,
    synth: &Arc<dyn Synthesizer>,
    output: &mut Box<dyn SpeechOutput>,
    cmd_rx: &mut mpsc::UnboundedReceiver<PlaybackCommand>,
    synth_timeout: Duration,
    cancel: &CancellationToken,
) -> PlayOutcome {
    for segment in segments {
        // The synthesize call must stay interruptible: cancellation aborts
        // it mid-flight, and the ceiling bounds a stalled endpoint.
        let audio = tokio::select! {
            _ = cancel.cancelled() => return PlayOutcome::Halted,
            result = tokio::time::timeout(synth_timeout, synth.synthesize(&segment)) => {
                match result {
                    Ok(Ok(audio)) => audio,
                    Ok(Err(e)) => return PlayOutcome::Failed(e.to_string()),
                    Err(_) => {
                        return PlayOutcome::Failed(format!(
                            "synthesis exceeded {}ms",
                            synth_timeout.as_millis()
                        ))
                    }
                }
            }
        };
        if cancel.is_cancelled() {
            return PlayOutcome::Halted;
        }
        let ActivePlayback { mut done, stopper } = match output.start(audio) {
            Ok(active) => active,
            Err(e) => return PlayOutcome::Failed(e.to_string()),
        };
        tokio::select! {
            // Sender dropped counts as ended; the output is gone either way.
            _ = &mut done => {}
            _ = cancel.cancelled() => {
                stopper();
                return PlayOutcome::Halted;
            }
            cmd = cmd_rx.recv() => {
                // At-most-one-active: whatever comes next, the current
                // stream stops first.
                stopper();
                match cmd {
                    None | Some(PlaybackCommand::Stop) => return PlayOutcome::Halted,
                    Some(PlaybackCommand::Speak { segments }) => {
                        return PlayOutcome::Preempted(segments)
                    }
                }
            }
        }
    }
    PlayOutcome::Completed
}

/// Speaker output backed by rodio. The `OutputStream` is not `Send`, so a
/// dedicated thread owns it and hands sinks back over a channel - the same
/// shape the capture side uses for its device thread.
#[cfg(feature = "devices")]
pub use device::RodioOutput;

#[cfg(feature = "devices")]
mod device {
    use super::{ActivePlayback, PlaybackError, SpeechOutput};
    use std::io::Cursor;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    struct SinkRequest {
        audio: Vec<u8>,
        reply: std_mpsc::Sender<Result<rodio::Sink, String>>,
    }

    pub struct RodioOutput {
        req_tx: std_mpsc::Sender<SinkRequest>,
    }

    impl RodioOutput {
        /// Open the default output device.
        pub fn open() -> Result<Self, PlaybackError> {
            let (req_tx, req_rx) = std_mpsc::channel::<SinkRequest>();
            let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();

            std::thread::Builder::new()
                .name("voxloop-output".into())
                .spawn(move || {
                    let (stream, handle) = match rodio::OutputStream::try_default() {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.to_string()));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    // Keep the stream alive for the life of the thread.
                    let _stream = stream;
                    for req in req_rx {
                        let result = build_sink(&handle, req.audio);
                        let _ = req.reply.send(result);
                    }
                })
                .map_err(|e| PlaybackError::Output(e.to_string()))?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Self { req_tx }),
                Ok(Err(e)) => Err(PlaybackError::Output(e)),
                Err(_) => Err(PlaybackError::Output("output thread died".into())),
            }
        }
    }

    fn build_sink(
        handle: &rodio::OutputStreamHandle,
        audio: Vec<u8>,
    ) -> Result<rodio::Sink, String> {
        let sink = rodio::Sink::try_new(handle).map_err(|e| e.to_string())?;
        let source = rodio::Decoder::new(Cursor::new(audio)).map_err(|e| e.to_string())?;
        sink.append(source);
        Ok(sink)
    }

    impl SpeechOutput for RodioOutput {
        fn start(&mut self, audio: Vec<u8>) -> Result<ActivePlayback, PlaybackError> {
            let (reply_tx, reply_rx) = std_mpsc::channel();
            self.req_tx
                .send(SinkRequest {
                    audio,
                    reply: reply_tx,
                })
                .map_err(|_| PlaybackError::Output("output thread gone".into()))?;
            let sink = reply_rx
                .recv()
                .map_err(|_| PlaybackError::Output("output thread gone".into()))?
                .map_err(PlaybackError::Output)?;

            let sink = Arc::new(sink);
            let (done_tx, done_rx) = oneshot::channel();
            let waiter = sink.clone();
            tokio::task::spawn_blocking(move || {
                waiter.sleep_until_end();
                let _ = done_tx.send(());
            });
            let stopper = Box::new(move || {
                sink.stop();
            });
            Ok(ActivePlayback::new(done_rx, stopper))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, Result as ClientResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct EchoSynth;

    #[async_trait]
    impl Synthesizer for EchoSynth {
        async fn synthesize(&self, text: &str) -> ClientResult<Vec<u8>> {
            Ok(text.as_bytes().to_vec())
        }
    }

    struct FailingSynth;

    #[async_trait]
    impl Synthesizer for FailingSynth {
        async fn synthesize(&self, _text: &str) -> ClientResult<Vec<u8>> {
            Err(ClientError::Malformed("tts down".into()))
        }
    }

    struct StalledSynth;

    #[async_trait]
    impl Synthesizer for StalledSynth {
        async fn synthesize(&self, _text: &str) -> ClientResult<Vec<u8>> {
            std::future::pending().await
        }
    }

    /// Output double: records starts/stops, optionally completes instantly.
    #[derive(Clone)]
    struct ScriptedOutput {
        auto_complete: bool,
        started: Arc<Mutex<Vec<String>>>,
        stops: Arc<AtomicUsize>,
        completers: Arc<Mutex<Vec<oneshot::Sender<()>>>>,
    }

    impl ScriptedOutput {
        fn new(auto_complete: bool) -> Self {
            Self {
                auto_complete,
                started: Arc::new(Mutex::new(Vec::new())),
                stops: Arc::new(AtomicUsize::new(0)),
                completers: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn complete_current(&self) {
            if let Some(tx) = self.completers.lock().unwrap().pop() {
                let _ = tx.send(());
            }
        }
    }

    impl SpeechOutput for ScriptedOutput {
        fn start(&mut self, audio: Vec<u8>) -> Result<ActivePlayback, PlaybackError> {
            self.started
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&audio).into_owned());
            let (done_tx, done_rx) = oneshot::channel();
            if self.auto_complete {
                let _ = done_tx.send(());
            } else {
                self.completers.lock().unwrap().push(done_tx);
            }
            let stops = self.stops.clone();
            let stopper = Box::new(move || {
                stops.fetch_add(1, Ordering::SeqCst);
            });
            Ok(ActivePlayback::new(done_rx, stopper))
        }
    }

    fn spawn_controller(
        output: ScriptedOutput,
        synth: Arc<dyn Synthesizer>,
        synth_timeout: Duration,
    ) -> (
        mpsc::UnboundedSender<PlaybackCommand>,
        mpsc::UnboundedReceiver<SessionEvent>,
        CancellationToken,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_playback(
            cmd_rx,
            synth,
            Box::new(output),
            events_tx,
            synth_timeout,
            cancel.clone(),
        ));
        (cmd_tx, events_rx, cancel)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn sentences_split_in_order() {
        assert_eq!(
            split_sentences("Hello there. How are you? Great!"),
            vec!["Hello there.", "How are you?", "Great!"]
        );
        assert_eq!(split_sentences("no terminator"), vec!["no terminator"]);
        assert_eq!(split_sentences("pi is 3.14 ok."), vec!["pi is 3.14 ok."]);
        assert!(split_sentences("   ").is_empty());
    }

    #[tokio::test]
    async fn segments_play_in_order_then_report_ended() {
        let output = ScriptedOutput::new(true);
        let (cmd_tx, mut events_rx, _cancel) =
            spawn_controller(output.clone(), Arc::new(EchoSynth), Duration::from_secs(5));

        cmd_tx
            .send(PlaybackCommand::Speak {
                segments: vec!["First.".into(), "Second.".into()],
            })
            .unwrap();

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::PlaybackEnded));
        assert_eq!(
            *output.started.lock().unwrap(),
            vec!["First.".to_string(), "Second.".to_string()]
        );
        assert_eq!(output.stops.load(Ordering::SeqCst), 0);
    }

    /// A new request stops the active stream before its own audio starts.
    #[tokio::test]
    async fn new_request_stops_active_stream_first() {
        let output = ScriptedOutput::new(false);
        let (cmd_tx, mut events_rx, _cancel) =
            spawn_controller(output.clone(), Arc::new(EchoSynth), Duration::from_secs(5));

        cmd_tx
            .send(PlaybackCommand::Speak {
                segments: vec!["long reply".into()],
            })
            .unwrap();
        let o = output.clone();
        wait_for(move || o.started.lock().unwrap().len() == 1).await;

        cmd_tx
            .send(PlaybackCommand::Speak {
                segments: vec!["urgent".into()],
            })
            .unwrap();
        let o = output.clone();
        wait_for(move || o.stops.load(Ordering::SeqCst) == 1).await;
        let o = output.clone();
        wait_for(move || o.started.lock().unwrap().len() == 2).await;
        assert_eq!(output.started.lock().unwrap()[1], "urgent");

        output.complete_current();
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::PlaybackEnded));
    }

    #[tokio::test]
    async fn stop_halts_without_ended_event() {
        let output = ScriptedOutput::new(false);
        let (cmd_tx, mut events_rx, _cancel) =
            spawn_controller(output.clone(), Arc::new(EchoSynth), Duration::from_secs(5));

        cmd_tx
            .send(PlaybackCommand::Speak {
                segments: vec!["hello".into()],
            })
            .unwrap();
        let o = output.clone();
        wait_for(move || o.started.lock().unwrap().len() == 1).await;

        cmd_tx.send(PlaybackCommand::Stop).unwrap();
        let o = output.clone();
        wait_for(move || o.stops.load(Ordering::SeqCst) == 1).await;

        let got = tokio::time::timeout(Duration::from_millis(50), events_rx.recv()).await;
        assert!(got.is_err(), "no completion event after Stop");
    }

    #[tokio::test]
    async fn synthesis_failure_reports_playback_failed() {
        let output = ScriptedOutput::new(true);
        let (cmd_tx, mut events_rx, _cancel) =
            spawn_controller(output.clone(), Arc::new(FailingSynth), Duration::from_secs(5));

        cmd_tx
            .send(PlaybackCommand::Speak {
                segments: vec!["doomed".into()],
            })
            .unwrap();
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::PlaybackFailed(_)));
        assert!(output.started.lock().unwrap().is_empty());
    }

    /// A synthesis call that never resolves trips the ceiling instead of
    /// wedging the controller in place with capture paused.
    #[tokio::test]
    async fn stalled_synthesis_trips_the_ceiling() {
        let output = ScriptedOutput::new(true);
        let (cmd_tx, mut events_rx, _cancel) = spawn_controller(
            output.clone(),
            Arc::new(StalledSynth),
            Duration::from_millis(50),
        );

        cmd_tx
            .send(PlaybackCommand::Speak {
                segments: vec!["never".into()],
            })
            .unwrap();
        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::PlaybackFailed(_)));
        assert!(output.started.lock().unwrap().is_empty());
    }

    /// Cancellation interrupts an in-flight synthesize call; the controller
    /// exits without waiting out the ceiling.
    #[tokio::test]
    async fn cancellation_interrupts_stalled_synthesis() {
        let output = ScriptedOutput::new(true);
        let (cmd_tx, mut events_rx, cancel) = spawn_controller(
            output.clone(),
            Arc::new(StalledSynth),
            Duration::from_secs(60),
        );

        cmd_tx
            .send(PlaybackCommand::Speak {
                segments: vec!["never".into()],
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        // Task exit drops its event sender; no completion event is emitted.
        let got = tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await;
        assert!(matches!(got, Ok(None)));
        assert!(output.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_active_audio() {
        let output = ScriptedOutput::new(false);
        let (cmd_tx, mut events_rx, cancel) =
            spawn_controller(output.clone(), Arc::new(EchoSynth), Duration::from_secs(5));

        cmd_tx
            .send(PlaybackCommand::Speak {
                segments: vec!["hello".into()],
            })
            .unwrap();
        let o = output.clone();
        wait_for(move || o.started.lock().unwrap().len() == 1).await;

        cancel.cancel();
        let o = output.clone();
        wait_for(move || o.stops.load(Ordering::SeqCst) == 1).await;
        let got = tokio::time::timeout(Duration::from_millis(50), events_rx.recv()).await;
        assert!(matches!(got, Err(_) | Ok(None)));
    }
}
