//! Audio capture sources
//!
//! The session pulls raw sample buffers from an [`AudioSource`]. Pausing
//! happens at the source - while the assistant is speaking nothing is
//! captured at all, so the engine cannot hear its own voice. A source that
//! returns `None` has lost its device; that is fatal to the session.
//!
//! Two implementations: [`ChannelSource`] for audio fed in by the embedding
//! application (or tests), and a cpal-backed microphone behind the `devices`
//! feature that runs the stream on a dedicated thread feeding a tokio
//! channel.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("audio device unavailable: {0}")]
    Device(String),
}

/// A live stream of raw mono PCM buffers.
#[async_trait]
pub trait AudioSource: Send {
    /// Next buffer of samples, or `None` once the device is gone.
    async fn next_samples(&mut self) -> Option<Vec<f32>>;

    /// Stop capturing. Buffers arriving while paused are discarded at the
    /// source, not filtered downstream.
    fn pause(&mut self);

    /// Resume capturing.
    fn resume(&mut self);
}

/// Source fed over a channel by the embedding application.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<f32>>,
    paused: Arc<AtomicBool>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            rx,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Observer for the paused flag (diagnostics and tests).
    pub fn paused_flag(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }
}

#[async_trait]
impl AudioSource for ChannelSource {
    async fn next_samples(&mut self) -> Option<Vec<f32>> {
        loop {
            let samples = self.rx.recv().await?;
            if self.paused.load(Ordering::SeqCst) {
                continue;
            }
            return Some(samples);
        }
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

#[cfg(feature = "devices")]
pub use device::MicSource;

#[cfg(feature = "devices")]
mod device {
    use super::{AudioSource, CaptureError};
    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::mpsc as std_mpsc;
    use tokio::sync::mpsc;
    use tracing::{error, info, warn};

    enum MicCommand {
        Pause,
        Resume,
        Shutdown,
        DeviceError(String),
    }

    /// Microphone capture on a dedicated OS thread. The cpal stream is not
    /// `Send`, so the thread owns it and the session talks to it through
    /// channels.
    pub struct MicSource {
        rx: mpsc::Receiver<Vec<f32>>,
        ctl: std_mpsc::Sender<MicCommand>,
    }

    impl MicSource {
        /// Open the default input device at the given rate, mono.
        pub fn open(sample_rate: u32) -> Result<Self, CaptureError> {
            let (tx, rx) = mpsc::channel::<Vec<f32>>(32);
            let (ctl_tx, ctl_rx) = std_mpsc::channel::<MicCommand>();
            let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();

            let err_ctl = ctl_tx.clone();
            std::thread::Builder::new()
                .name("voxloop-capture".into())
                .spawn(move || {
                    run_capture(sample_rate, tx, ctl_rx, err_ctl, ready_tx);
                })
                .map_err(|e| CaptureError::Device(e.to_string()))?;

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Self { rx, ctl: ctl_tx }),
                Ok(Err(e)) => Err(CaptureError::Device(e)),
                Err(_) => Err(CaptureError::Device("capture thread died".into())),
            }
        }
    }

    fn run_capture(
        sample_rate: u32,
        tx: mpsc::Sender<Vec<f32>>,
        ctl_rx: std_mpsc::Receiver<MicCommand>,
        err_ctl: std_mpsc::Sender<MicCommand>,
        ready_tx: std_mpsc::Sender<Result<(), String>>,
    ) {
        let host = cpal::default_host();
        let device = match host.default_input_device() {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err("no input device".into()));
                return;
            }
        };
        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Dropped receiver just means the session is going away.
                let _ = tx.blocking_send(data.to_vec());
            },
            move |e| {
                let _ = err_ctl.send(MicCommand::DeviceError(e.to_string()));
            },
            None,
        );
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
        let _ = ready_tx.send(Ok(()));
        info!(sample_rate, "microphone capture started");

        loop {
            match ctl_rx.recv() {
                Ok(MicCommand::Pause) => {
                    if let Err(e) = stream.pause() {
                        warn!(error = %e, "failed to pause capture stream");
                    }
                }
                Ok(MicCommand::Resume) => {
                    if let Err(e) = stream.play() {
                        warn!(error = %e, "failed to resume capture stream");
                    }
                }
                Ok(MicCommand::DeviceError(e)) => {
                    error!(error = %e, "capture device error");
                    break;
                }
                Ok(MicCommand::Shutdown) | Err(_) => break,
            }
        }
        // Dropping the stream here releases the device; dropping `tx` with
        // it tells the session capture is gone.
        info!("microphone capture stopped");
    }

    #[async_trait]
    impl AudioSource for MicSource {
        async fn next_samples(&mut self) -> Option<Vec<f32>> {
            self.rx.recv().await
        }

        fn pause(&mut self) {
            let _ = self.ctl.send(MicCommand::Pause);
        }

        fn resume(&mut self) {
            let _ = self.ctl.send(MicCommand::Resume);
        }
    }

    impl Drop for MicSource {
        fn drop(&mut self) {
            let _ = self.ctl.send(MicCommand::Shutdown);
        }
    }
}
