//! Conversation orchestration
//!
//! [`VoiceOrchestrator`] reacts to client messages and STT events, drives the
//! per-client state machine and runs assistant turns. A turn streams the
//! generator's reply through a [`TurnSegmenter`] into the TTS processor's
//! phrase queue, so synthesis of the first phrase starts while the rest of
//! the reply is still being generated.
//!
//! Only one turn runs at a time: there is one physical speaker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::cancel::CancelToken;
use super::connection::{ClientSender, VoiceConnectionManager, VoiceState};
use super::messages::{ClientMessage, ServerMessage};
use super::processor::{Announcement, PhraseSender, TtsProcessor, TurnOutcome, phrase_queue};
use super::segmenter::TurnSegmenter;
use super::stt::{SttEvent, SttEventKind, SttSessionManager};
use crate::agent::ResponseGenerator;
use crate::config::{SettingsSource, VoiceSettings};
use crate::{Error, Result};

/// Spoken when the response generator fails outright
const APOLOGY: &str = "Sorry, I ran into a problem answering that. Please try again.";

/// Owner recorded for announcements that no client asked for
const ANNOUNCER: &str = "announcer";

struct ActiveTurn {
    id: Uuid,
    client_id: String,
    cancel: CancelToken,
}

/// Coordinates clients, STT sessions and assistant turns
pub struct VoiceOrchestrator {
    connections: Arc<VoiceConnectionManager>,
    stt: Arc<SttSessionManager>,
    processor: Arc<TtsProcessor>,
    generator: Arc<dyn ResponseGenerator>,
    settings: Arc<dyn SettingsSource>,
    active_turn: Mutex<Option<ActiveTurn>>,
}

impl VoiceOrchestrator {
    #[must_use]
    pub fn new(
        connections: Arc<VoiceConnectionManager>,
        stt: Arc<SttSessionManager>,
        processor: Arc<TtsProcessor>,
        generator: Arc<dyn ResponseGenerator>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            connections,
            stt,
            processor,
            generator,
            settings,
            active_turn: Mutex::new(None),
        }
    }

    /// Client registry
    #[must_use]
    pub fn connections(&self) -> &Arc<VoiceConnectionManager> {
        &self.connections
    }

    /// STT session manager
    #[must_use]
    pub fn stt(&self) -> &Arc<SttSessionManager> {
        &self.stt
    }

    fn active_turn(&self) -> MutexGuard<'_, Option<ActiveTurn>> {
        self.active_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an assistant turn is running
    #[must_use]
    pub fn turn_in_progress(&self) -> bool {
        self.active_turn().is_some()
    }

    /// Consume STT events until every session manager sender is gone
    pub fn spawn_stt_listener(self: &Arc<Self>, mut events: mpsc::Receiver<SttEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_stt_event(event).await;
            }
            tracing::debug!("STT event channel closed");
        })
    }

    /// Register a newly connected client, returning its connection ID
    pub fn handle_connect(&self, client_id: &str, sender: ClientSender) -> Uuid {
        self.connections.connect(client_id, sender)
    }

    /// Tear down a client's session and STT
    ///
    /// Does nothing if the client has since reconnected. A running turn is
    /// left alone; its audio still goes to the other clients.
    pub fn handle_disconnect(&self, client_id: &str, connection_id: Uuid) {
        if self
            .connections
            .disconnect_connection(client_id, connection_id)
            .is_some()
        {
            self.stt.close(client_id);
        }
    }

    /// Dispatch one inbound message
    pub async fn handle_message(&self, client_id: &str, message: ClientMessage) {
        self.connections.touch(client_id);

        match message {
            ClientMessage::Heartbeat => {
                self.connections
                    .send_to(client_id, ServerMessage::HeartbeatAck)
                    .await;
            }
            ClientMessage::ConnectionReady => {
                if let Some(state) = self.connections.state(client_id) {
                    self.connections
                        .send_to(client_id, ServerMessage::state(state))
                        .await;
                }
            }
            ClientMessage::WakewordDetected { confidence } => {
                tracing::info!(client_id, ?confidence, "wake word detected");
                self.wake(client_id).await;
            }
            ClientMessage::WakewordBargeIn => {
                tracing::info!(client_id, "barge-in");
                self.barge_in(client_id).await;
                self.start_listening(client_id).await;
            }
            ClientMessage::AudioChunk { data } => match data.decode() {
                Ok(audio) => self.handle_audio(client_id, audio),
                Err(e) => tracing::warn!(client_id, error = %e, "dropping audio chunk"),
            },
            ClientMessage::TtsPlaybackStart => {
                self.stt.pause_all();
                self.connections
                    .set_all_states(VoiceState::Speaking, None)
                    .await;
            }
            ClientMessage::TtsPlaybackEnd => {
                if self.connections.any_in_state(VoiceState::Speaking) {
                    tracing::debug!(client_id, "playback finished");
                    self.finish_speaking().await;
                } else {
                    tracing::debug!(client_id, "ignoring playback end, nothing is speaking");
                }
            }
            ClientMessage::StreamEnd => {
                self.stt.close(client_id);
                if self.connections.state(client_id) == Some(VoiceState::Listening) {
                    self.connections
                        .update_state(client_id, VoiceState::Idle, false)
                        .await;
                }
            }
            ClientMessage::Unknown => {
                tracing::trace!(client_id, "ignoring unknown message type");
            }
        }
    }

    /// Report a malformed frame back to the client
    pub async fn handle_protocol_error(&self, client_id: &str, error: &Error) {
        tracing::warn!(client_id, error = %error, "bad client message");
        self.connections
            .send_to(
                client_id,
                ServerMessage::Error {
                    code: "invalid_message".to_string(),
                    message: error.to_string(),
                },
            )
            .await;
    }

    /// Forward raw microphone audio
    pub fn handle_audio(&self, client_id: &str, audio: Bytes) {
        if !self.stt.send_audio(client_id, audio) {
            tracing::trace!(client_id, "audio not forwarded");
        }
    }

    async fn wake(&self, client_id: &str) {
        match self.connections.state(client_id) {
            None => return,
            Some(VoiceState::Speaking | VoiceState::Processing) => {
                self.barge_in(client_id).await;
            }
            Some(VoiceState::Idle | VoiceState::Listening) => {}
        }
        self.start_listening(client_id).await;
    }

    /// Stop the current turn and silence every speaker
    async fn barge_in(&self, client_id: &str) {
        if self.cancel_turn() {
            tracing::info!(client_id, "turn cancelled by barge-in");
        }
        self.connections.broadcast(ServerMessage::InterruptTts).await;

        for state in [VoiceState::Speaking, VoiceState::Processing] {
            self.connections
                .replace_state(state, VoiceState::Idle, Some(client_id))
                .await;
        }
    }

    async fn start_listening(&self, client_id: &str) {
        self.connections
            .update_state(client_id, VoiceState::Listening, false)
            .await;
        if self.stt.start(client_id).is_none() {
            self.connections
                .send_to(
                    client_id,
                    ServerMessage::Error {
                        code: "stt_unavailable".to_string(),
                        message: "speech recognition is not configured".to_string(),
                    },
                )
                .await;
            self.connections
                .update_state(client_id, VoiceState::Idle, false)
                .await;
        }
    }

    /// Settle every client after the assistant finished speaking
    async fn finish_speaking(&self) {
        if self.settings.voice_settings().conversation_mode {
            self.connections
                .set_all_states(VoiceState::Listening, None)
                .await;
            self.stt.resume_all();
            for client_id in self.connections.client_ids() {
                if !self.stt.is_active(&client_id) {
                    self.stt.start(&client_id);
                }
            }
        } else {
            self.connections
                .set_all_states(VoiceState::Idle, None)
                .await;
            self.stt.close_all();
        }
    }

    /// Cancel the running turn, if any
    pub fn cancel_turn(&self) -> bool {
        let Some(turn) = self.active_turn().take() else {
            return false;
        };
        turn.cancel.cancel();
        tracing::debug!(turn = %turn.id, client_id = %turn.client_id, "turn cancelled");
        true
    }

    /// React to one STT event
    pub async fn handle_stt_event(self: &Arc<Self>, event: SttEvent) {
        let SttEvent {
            client_id,
            session_id,
            kind,
        } = event;

        // a failed session removes its own handle before the error arrives
        let current = self.stt.session_id(&client_id);
        let relevant = match &kind {
            SttEventKind::Transcript(_) => current == Some(session_id),
            SttEventKind::Error(_) => {
                current == Some(session_id)
                    || (current.is_none()
                        && self.connections.state(&client_id) == Some(VoiceState::Listening))
            }
        };
        if !relevant {
            tracing::trace!(client_id = %client_id, session = %session_id, "stale STT event");
            return;
        }

        match kind {
            SttEventKind::Transcript(transcript) => {
                if self.connections.state(&client_id) != Some(VoiceState::Listening) {
                    return;
                }
                let text = transcript.text.trim().to_string();
                if !transcript.is_final {
                    self.connections
                        .send_to(
                            &client_id,
                            ServerMessage::Transcript {
                                text,
                                is_final: false,
                            },
                        )
                        .await;
                    return;
                }
                if text.is_empty() {
                    return;
                }
                if !self
                    .connections
                    .transition(&client_id, VoiceState::Listening, VoiceState::Processing)
                    .await
                {
                    return;
                }

                tracing::info!(client_id = %client_id, chars = text.len(), "final transcript");
                self.connections
                    .send_to(
                        &client_id,
                        ServerMessage::Transcript {
                            text: text.clone(),
                            is_final: true,
                        },
                    )
                    .await;
                self.start_turn(&client_id, text);
            }
            SttEventKind::Error(message) => {
                tracing::warn!(client_id = %client_id, error = %message, "STT session failed");
                self.stt.close(&client_id);
                self.connections
                    .send_to(
                        &client_id,
                        ServerMessage::Error {
                            code: "stt_error".to_string(),
                            message,
                        },
                    )
                    .await;
                self.connections
                    .update_state(&client_id, VoiceState::Idle, false)
                    .await;
            }
        }
    }

    /// Start a turn for `client_id`, cancelling any running one
    pub fn start_turn(self: &Arc<Self>, client_id: &str, text: String) -> JoinHandle<TurnOutcome> {
        let (turn_id, cancel) = self.begin_turn(client_id);

        let this = Arc::clone(self);
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            let outcome = this.run_turn(turn_id, &client_id, &text, cancel).await;
            this.end_turn(turn_id);
            outcome
        })
    }

    /// Speak `text` on every client as its own turn
    ///
    /// Supersedes a running turn and can itself be cancelled by barge-in.
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    pub async fn announce(&self, text: &str) -> Result<Announcement> {
        let (turn_id, cancel) = self.begin_turn(ANNOUNCER);
        let result = self.processor.announce(text, &cancel).await;
        self.end_turn(turn_id);
        result
    }

    /// Register a new active turn, cancelling the previous one
    fn begin_turn(&self, client_id: &str) -> (Uuid, CancelToken) {
        let turn = ActiveTurn {
            id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            cancel: CancelToken::new(),
        };
        let started = (turn.id, turn.cancel.clone());

        if let Some(previous) = self.active_turn().replace(turn) {
            tracing::info!(turn = %previous.id, "superseding running turn");
            previous.cancel.cancel();
        }
        started
    }

    /// Forget the active turn if it is still `turn_id`
    fn end_turn(&self, turn_id: Uuid) {
        let mut active = self.active_turn();
        if active.as_ref().is_some_and(|t| t.id == turn_id) {
            *active = None;
        }
    }

    async fn run_turn(
        &self,
        turn_id: Uuid,
        client_id: &str,
        text: &str,
        cancel: CancelToken,
    ) -> TurnOutcome {
        let started = Instant::now();
        let settings = self.settings.voice_settings();
        tracing::info!(turn = %turn_id, client_id, "turn started");

        let (phrases, queue) = phrase_queue();
        let processor = Arc::clone(&self.processor);
        let consumer = {
            let cancel = cancel.clone();
            tokio::spawn(async move { processor.run(queue, cancel).await })
        };

        let generated = self
            .generate(client_id, text, &settings, &phrases, &cancel)
            .await;
        // end marker; the consumer may already be gone after cancellation
        let _ = phrases.send(None).await;

        let mut outcome = consumer.await.unwrap_or_else(|e| {
            tracing::error!(turn = %turn_id, error = %e, "TTS processor task failed");
            TurnOutcome::default()
        });

        if cancel.is_cancelled() {
            outcome.cancelled = true;
            tracing::info!(turn = %turn_id, elapsed_ms = started.elapsed().as_millis(), "turn cancelled");
            return outcome;
        }

        match generated {
            Ok(reply) if !reply.trim().is_empty() => {
                self.connections
                    .send_to(
                        client_id,
                        ServerMessage::AssistantResponse {
                            text: reply.trim().to_string(),
                        },
                    )
                    .await;
                if !outcome.audio_started() {
                    self.settle_silent_turn(client_id, &settings).await;
                }
            }
            Ok(_) => {
                tracing::info!(turn = %turn_id, "no response generated");
                self.connections
                    .update_state(client_id, VoiceState::Idle, false)
                    .await;
            }
            Err(e) => {
                tracing::error!(turn = %turn_id, error = %e, "response generation failed");
                if outcome.audio_started() {
                    return outcome;
                }
                match self.processor.announce(APOLOGY, &cancel).await {
                    Ok(Announcement::Spoken | Announcement::Cancelled) => {}
                    Ok(Announcement::Unavailable) => {
                        self.connections
                            .update_state(client_id, VoiceState::Idle, false)
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "apology synthesis failed");
                        self.connections
                            .update_state(client_id, VoiceState::Idle, false)
                            .await;
                    }
                }
            }
        }

        tracing::info!(
            turn = %turn_id,
            elapsed_ms = started.elapsed().as_millis(),
            chunks = outcome.chunks_sent,
            "turn finished"
        );
        outcome
    }

    /// Stream the reply into the phrase queue, returning the full text
    async fn generate(
        &self,
        client_id: &str,
        text: &str,
        settings: &VoiceSettings,
        phrases: &PhraseSender,
        cancel: &CancelToken,
    ) -> Result<String> {
        let mut deltas = tokio::select! {
            () = cancel.cancelled() => return Ok(String::new()),
            stream = self.generator.stream_response(text, client_id) => stream?,
        };

        let mut segmenter = TurnSegmenter::from_settings(&settings.segmenter);
        let mut reply = String::new();
        let mut first_delta = true;
        let started = Instant::now();

        loop {
            let deadline = segmenter.deadline();
            let ready = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(reply),
                () = grace_elapsed(deadline) => segmenter.poll_deadline(Instant::now()),
                delta = deltas.next() => match delta {
                    Some(Ok(delta)) => {
                        if first_delta {
                            first_delta = false;
                            tracing::debug!(ttft_ms = started.elapsed().as_millis(), "first response text");
                        }
                        reply.push_str(&delta);
                        segmenter.consume(&delta)
                    }
                    Some(Err(e)) => {
                        if reply.is_empty() {
                            return Err(e);
                        }
                        tracing::warn!(error = %e, "response stream failed, keeping partial reply");
                        break;
                    }
                    None => break,
                },
            };

            for phrase in ready {
                if phrases.send(Some(phrase)).await.is_err() {
                    return Ok(reply);
                }
            }
        }

        if let Some(rest) = segmenter.flush() {
            let _ = phrases.send(Some(rest)).await;
        }
        Ok(reply)
    }

    /// A reply was shown but nothing was spoken
    async fn settle_silent_turn(&self, client_id: &str, settings: &VoiceSettings) {
        if settings.conversation_mode {
            self.connections
                .update_state(client_id, VoiceState::Listening, false)
                .await;
            self.stt.resume_all();
            if !self.stt.is_active(client_id) {
                self.stt.start(client_id);
            }
        } else {
            self.connections
                .update_state(client_id, VoiceState::Idle, false)
                .await;
        }
    }
}

async fn grace_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
