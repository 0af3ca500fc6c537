//! Live speech-to-text (STT) sessions
//!
//! Each listening client gets one streaming provider connection. Audio is
//! forwarded through a bounded queue so a slow provider can never stall the
//! client's WebSocket read loop; transcripts come back as [`SttEvent`]s on a
//! single channel shared by all sessions.

mod deepgram;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use uuid::Uuid;

pub use deepgram::DeepgramLiveStt;

use super::cancel::CancelToken;
use super::connection::{VoiceConnectionManager, VoiceState};
use crate::Result;
use crate::config::{SettingsSource, SttSettings};

/// Audio chunks queued per session before new ones are dropped
pub const AUDIO_QUEUE_CAPACITY: usize = 64;

/// Idle period after which a keep-alive is sent to the provider
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Transcript produced by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

/// Stream of transcripts from one provider connection
pub type TranscriptStream = BoxStream<'static, Result<Transcript>>;

/// Write half of a provider connection
#[async_trait]
pub trait AudioSink: Send {
    /// Forward raw 16-bit PCM
    async fn send_audio(&mut self, audio: Bytes) -> Result<()>;

    /// Keep an idle connection open
    async fn keep_alive(&mut self) -> Result<()>;

    /// Ask the provider to flush and close
    async fn finish(&mut self) -> Result<()>;
}

/// An open provider connection
pub struct SttConnection {
    pub sink: Box<dyn AudioSink>,
    pub transcripts: TranscriptStream,
}

/// A streaming speech recognition backend
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Open a streaming recognition connection
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established
    async fn connect(&self, settings: &SttSettings) -> Result<SttConnection>;
}

/// Something a live session reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SttEvent {
    pub client_id: String,
    pub session_id: Uuid,
    pub kind: SttEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEventKind {
    Transcript(Transcript),
    /// The session failed and has been torn down
    Error(String),
}

struct SttHandle {
    session_id: Uuid,
    audio: mpsc::Sender<Bytes>,
    paused: Arc<AtomicBool>,
    cancel: CancelToken,
}

type Handles = Arc<Mutex<HashMap<String, SttHandle>>>;

fn lock(handles: &Handles) -> MutexGuard<'_, HashMap<String, SttHandle>> {
    handles.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every client's live STT session
pub struct SttSessionManager {
    provider: Option<Arc<dyn SttProvider>>,
    settings: Arc<dyn SettingsSource>,
    connections: Arc<VoiceConnectionManager>,
    events: mpsc::Sender<SttEvent>,
    sessions: Handles,
}

impl SttSessionManager {
    /// Create a manager; without a provider every start is refused
    #[must_use]
    pub fn new(
        provider: Option<Arc<dyn SttProvider>>,
        settings: Arc<dyn SettingsSource>,
        connections: Arc<VoiceConnectionManager>,
        events: mpsc::Sender<SttEvent>,
    ) -> Self {
        Self {
            provider,
            settings,
            connections,
            events,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a provider is configured
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    /// Open a new session for a client, replacing any existing one
    ///
    /// The connection is established in the background; audio sent in the
    /// meantime is queued. Returns the new session ID, or `None` if no
    /// provider is configured.
    pub fn start(&self, client_id: &str) -> Option<Uuid> {
        let Some(provider) = self.provider.clone() else {
            tracing::warn!(client_id, "no STT provider configured");
            return None;
        };

        let session_id = Uuid::new_v4();
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_CAPACITY);
        let paused = Arc::new(AtomicBool::new(false));
        let cancel = CancelToken::new();

        let previous = lock(&self.sessions).insert(
            client_id.to_string(),
            SttHandle {
                session_id,
                audio: audio_tx,
                paused: Arc::clone(&paused),
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(client_id, old = %previous.session_id, "replacing STT session");
            previous.cancel.cancel();
        }
        self.connections.mark_stt_pending(client_id, true);

        let task = SessionTask {
            provider,
            settings: self.settings.voice_settings().stt,
            client_id: client_id.to_string(),
            session_id,
            paused,
            cancel,
            events: self.events.clone(),
            connections: Arc::clone(&self.connections),
            sessions: Arc::clone(&self.sessions),
        };
        tokio::spawn(task.run(audio_rx));

        Some(session_id)
    }

    /// Queue microphone audio for a client's session
    ///
    /// Audio is only accepted while the client is `LISTENING` and its session
    /// is not paused. Returns whether the chunk was queued.
    pub fn send_audio(&self, client_id: &str, audio: Bytes) -> bool {
        if self.connections.state(client_id) != Some(VoiceState::Listening) {
            return false;
        }

        let sessions = lock(&self.sessions);
        let Some(handle) = sessions.get(client_id) else {
            return false;
        };
        if handle.paused.load(Ordering::Acquire) {
            return false;
        }

        match handle.audio.try_send(audio) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client_id, "STT audio queue full, dropping chunk");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop forwarding audio on every session; returns how many were paused
    pub fn pause_all(&self) -> usize {
        self.set_paused(true)
    }

    /// Resume forwarding audio on every session; returns how many were resumed
    pub fn resume_all(&self) -> usize {
        self.set_paused(false)
    }

    fn set_paused(&self, paused: bool) -> usize {
        let sessions = lock(&self.sessions);
        for handle in sessions.values() {
            handle.paused.store(paused, Ordering::Release);
        }
        tracing::debug!(paused, sessions = sessions.len(), "STT pause state changed");
        sessions.len()
    }

    /// Whether a client's session is paused
    #[must_use]
    pub fn is_paused(&self, client_id: &str) -> bool {
        lock(&self.sessions)
            .get(client_id)
            .is_some_and(|h| h.paused.load(Ordering::Acquire))
    }

    /// Close a client's session; returns false if it had none
    pub fn close(&self, client_id: &str) -> bool {
        let Some(handle) = lock(&self.sessions).remove(client_id) else {
            return false;
        };
        handle.cancel.cancel();
        self.connections.detach_stt(client_id, handle.session_id);
        self.connections.mark_stt_pending(client_id, false);
        tracing::debug!(client_id, session = %handle.session_id, "STT session closed");
        true
    }

    /// Close every session
    pub fn close_all(&self) {
        let drained: Vec<(String, SttHandle)> = lock(&self.sessions).drain().collect();
        for (client_id, handle) in drained {
            handle.cancel.cancel();
            self.connections.detach_stt(&client_id, handle.session_id);
            self.connections.mark_stt_pending(&client_id, false);
        }
    }

    /// Whether a client has a session (connected or connecting)
    #[must_use]
    pub fn is_active(&self, client_id: &str) -> bool {
        lock(&self.sessions).contains_key(client_id)
    }

    /// Current session ID of a client
    #[must_use]
    pub fn session_id(&self, client_id: &str) -> Option<Uuid> {
        lock(&self.sessions).get(client_id).map(|h| h.session_id)
    }
}

/// Background task driving one provider connection
struct SessionTask {
    provider: Arc<dyn SttProvider>,
    settings: SttSettings,
    client_id: String,
    session_id: Uuid,
    paused: Arc<AtomicBool>,
    cancel: CancelToken,
    events: mpsc::Sender<SttEvent>,
    connections: Arc<VoiceConnectionManager>,
    sessions: Handles,
}

impl SessionTask {
    async fn run(self, mut audio: mpsc::Receiver<Bytes>) {
        let connected = tokio::select! {
            () = self.cancel.cancelled() => {
                self.cleanup();
                return;
            }
            result = self.provider.connect(&self.settings) => result,
        };

        let SttConnection {
            mut sink,
            mut transcripts,
        } = match connected {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, provider = self.provider.name(), error = %e, "STT connect failed");
                self.report(SttEventKind::Error(e.to_string())).await;
                self.cleanup();
                return;
            }
        };

        self.connections.attach_stt(&self.client_id, self.session_id);
        tracing::info!(client_id = %self.client_id, session = %self.session_id, provider = self.provider.name(), "STT session connected");

        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.tick().await;
        let mut last_audio = Instant::now();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                chunk = audio.recv() => {
                    let Some(chunk) = chunk else { break };
                    if let Err(e) = sink.send_audio(chunk).await {
                        self.report(SttEventKind::Error(e.to_string())).await;
                        break;
                    }
                    last_audio = Instant::now();
                }
                transcript = transcripts.next() => match transcript {
                    Some(Ok(transcript)) => {
                        self.report(SttEventKind::Transcript(transcript)).await;
                    }
                    Some(Err(e)) => {
                        self.report(SttEventKind::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        if !self.cancel.is_cancelled() {
                            self.report(SttEventKind::Error("provider closed the stream".to_string())).await;
                        }
                        break;
                    }
                },
                _ = keep_alive.tick() => {
                    if last_audio.elapsed() >= KEEP_ALIVE_INTERVAL {
                        tracing::trace!(
                            client_id = %self.client_id,
                            paused = self.paused.load(Ordering::Acquire),
                            "STT keep-alive"
                        );
                        if let Err(e) = sink.keep_alive().await {
                            tracing::debug!(client_id = %self.client_id, error = %e, "STT keep-alive failed");
                        }
                    }
                }
            }
        }

        if let Err(e) = sink.finish().await {
            tracing::debug!(client_id = %self.client_id, error = %e, "STT close failed");
        }
        self.cleanup();
    }

    async fn report(&self, kind: SttEventKind) {
        let event = SttEvent {
            client_id: self.client_id.clone(),
            session_id: self.session_id,
            kind,
        };
        if self.events.send(event).await.is_err() {
            tracing::debug!(client_id = %self.client_id, "STT event receiver gone");
        }
    }

    /// Drop this session's handle if a newer session has not replaced it
    fn cleanup(&self) {
        let current = {
            let mut sessions = lock(&self.sessions);
            let current = sessions
                .get(&self.client_id)
                .is_some_and(|h| h.session_id == self.session_id);
            if current {
                sessions.remove(&self.client_id);
            }
            current
        };

        self.connections.detach_stt(&self.client_id, self.session_id);
        if current {
            self.connections.mark_stt_pending(&self.client_id, false);
        }
        tracing::debug!(client_id = %self.client_id, session = %self.session_id, "STT session ended");
    }
}
