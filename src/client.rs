//! Collaborator boundaries
//!
//! The engine consumes three black-box network services: transcription,
//! response generation and speech synthesis. Only their logical contracts
//! matter here; each gets a trait seam so the session can be exercised with
//! doubles, plus an HTTP implementation for the real endpoints.

use crate::events::{ChatTurn, TranscriptionOutcome};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

/// Error type for collaborator calls.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned {status}: {body}")]
    Endpoint {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Audio in, text (or "no speech") out.
///
/// Infallible by contract: a service error degrades to `NoSpeech` so the
/// session keeps listening instead of crashing on a flaky endpoint.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>) -> TranscriptionOutcome;
}

/// Utterance plus rolling history in, reply text out.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(
        &self,
        utterance: &str,
        session_id: &str,
        history: &[ChatTurn],
    ) -> Result<String>;
}

/// Reply text in, playable audio out.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Deserialize)]
struct TranscribeReply {
    success: bool,
    transcription: Option<String>,
    reason: Option<String>,
}

/// HTTP transcription client. Posts the WAV payload, reads
/// `{ success, transcription?, reason? }`.
pub struct HttpTranscriber {
    http: reqwest::Client,
    url: String,
}

impl HttpTranscriber {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, wav: Vec<u8>) -> TranscriptionOutcome {
        let resp = match self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(wav)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "transcription request failed, treating as no speech");
                return TranscriptionOutcome::NoSpeech;
            }
        };
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "transcription endpoint error, treating as no speech");
            return TranscriptionOutcome::NoSpeech;
        }
        match resp.json::<TranscribeReply>().await {
            Ok(TranscribeReply {
                success: true,
                transcription: Some(text),
                ..
            }) if !text.trim().is_empty() => TranscriptionOutcome::Text(text),
            Ok(reply) => {
                debug!(reason = ?reply.reason, "no speech detected");
                TranscriptionOutcome::NoSpeech
            }
            Err(e) => {
                warn!(error = %e, "malformed transcription reply, treating as no speech");
                TranscriptionOutcome::NoSpeech
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RespondReply {
    response: String,
}

/// Marker terminating a text-delta stream.
const STREAM_END: &str = "[DONE]";

/// HTTP response-generation client.
///
/// Accepts either a single `{ response }` object or a newline-delimited
/// text-delta stream terminated by `[DONE]`; deltas are accumulated strictly
/// in arrival order.
pub struct HttpResponder {
    http: reqwest::Client,
    url: String,
}

impl HttpResponder {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    async fn collect_stream(resp: reqwest::Response) -> Result<String> {
        let mut reply = String::new();
        let mut pending = Vec::new();
        let mut stream = resp.bytes_stream();
        'outer: while let Some(bytes) = stream.next().await {
            pending.extend_from_slice(&bytes?);
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                let delta = line.strip_prefix("data: ").unwrap_or(&line);
                if delta == STREAM_END {
                    break 'outer;
                }
                reply.push_str(delta);
            }
        }
        // A final unterminated line is still a delta.
        if !pending.is_empty() {
            let tail = String::from_utf8_lossy(&pending);
            let delta = tail.strip_prefix("data: ").unwrap_or(&tail);
            if delta != STREAM_END {
                reply.push_str(delta);
            }
        }
        if reply.trim().is_empty() {
            return Err(ClientError::Malformed("empty response stream".into()));
        }
        Ok(reply)
    }
}

#[async_trait]
impl Responder for HttpResponder {
    async fn respond(
        &self,
        utterance: &str,
        session_id: &str,
        history: &[ChatTurn],
    ) -> Result<String> {
        let body = serde_json::json!({
            "message": utterance,
            "sessionId": session_id,
            "conversationHistory": history,
        });
        let resp = self.http.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Endpoint { status, body });
        }

        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        if is_json {
            let reply: RespondReply = resp
                .json()
                .await
                .map_err(|e| ClientError::Malformed(e.to_string()))?;
            Ok(reply.response)
        } else {
            Self::collect_stream(resp).await
        }
    }
}

/// HTTP speech-synthesis client. Posts `{ text, voice? }`, returns the raw
/// audio body.
pub struct HttpSynthesizer {
    http: reqwest::Client,
    url: String,
    voice: Option<String>,
}

impl HttpSynthesizer {
    pub fn new(http: reqwest::Client, url: impl Into<String>, voice: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            voice,
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let mut body = serde_json::json!({ "text": text });
        if let Some(voice) = &self.voice {
            body["voice"] = serde_json::Value::String(voice.clone());
        }
        let resp = self.http.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Endpoint { status, body });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}
