//! Turns phrases into broadcast assistant audio
//!
//! [`TtsProcessor::run`] is the consumer half of a turn: the response
//! generator pushes phrases into a bounded queue and the processor
//! synthesizes them one at a time, in order, broadcasting each buffered
//! frame to every client as soon as it arrives.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::mpsc;

use super::cancel::CancelToken;
use super::connection::{VoiceConnectionManager, VoiceState};
use super::messages::ServerMessage;
use super::stt::SttSessionManager;
use super::tts::TtsEngine;
use crate::Result;

/// Phrases queued ahead of synthesis before the generator waits
pub const PHRASE_QUEUE_CAPACITY: usize = 8;

/// Producer side of a turn's phrase queue; `None` marks the end of the turn
pub type PhraseSender = mpsc::Sender<Option<String>>;

/// Consumer side of a turn's phrase queue
pub type PhraseReceiver = mpsc::Receiver<Option<String>>;

/// Create a turn's phrase queue
#[must_use]
pub fn phrase_queue() -> (PhraseSender, PhraseReceiver) {
    mpsc::channel(PHRASE_QUEUE_CAPACITY)
}

/// What a turn produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Phrases that produced at least one frame
    pub phrases_spoken: usize,
    /// Phrases whose synthesis failed before any audio
    pub phrases_failed: usize,
    /// Phrases skipped because TTS is unavailable
    pub phrases_skipped: usize,
    /// Frames broadcast
    pub chunks_sent: u64,
    /// PCM bytes broadcast
    pub bytes_sent: usize,
    /// Sample rate announced in `tts_audio_start`
    pub sample_rate: Option<u32>,
    /// The turn was cancelled
    pub cancelled: bool,
}

impl TurnOutcome {
    /// Whether any audio reached the clients
    #[must_use]
    pub const fn audio_started(&self) -> bool {
        self.sample_rate.is_some()
    }
}

/// How an announcement ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    /// Every frame was broadcast
    Spoken,
    /// Interrupted before completion
    Cancelled,
    /// TTS is disabled or the provider is unavailable
    Unavailable,
}

enum PhraseResult {
    Continue,
    Cancelled,
}

/// Synthesizes queued phrases and broadcasts the audio
pub struct TtsProcessor {
    engine: Arc<TtsEngine>,
    connections: Arc<VoiceConnectionManager>,
    stt: Arc<SttSessionManager>,
}

impl TtsProcessor {
    #[must_use]
    pub fn new(
        engine: Arc<TtsEngine>,
        connections: Arc<VoiceConnectionManager>,
        stt: Arc<SttSessionManager>,
    ) -> Self {
        Self {
            engine,
            connections,
            stt,
        }
    }

    /// The engine used for synthesis
    #[must_use]
    pub fn engine(&self) -> &Arc<TtsEngine> {
        &self.engine
    }

    /// Consume phrases until the end marker, queue close, or cancellation
    ///
    /// Broadcast order for a turn that produces audio is `tts_audio_start`,
    /// frames with strictly increasing `chunk_index`, then exactly one of
    /// `tts_audio_end` or `tts_audio_cancelled`.
    pub async fn run(&self, mut phrases: PhraseReceiver, cancel: CancelToken) -> TurnOutcome {
        let started = Instant::now();
        let mut outcome = TurnOutcome::default();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return self.cancelled(outcome).await,
                next = phrases.recv() => next,
            };
            let Some(Some(phrase)) = next else {
                break;
            };

            let phrase = phrase.trim();
            if phrase.is_empty() {
                continue;
            }

            if let PhraseResult::Cancelled = self
                .speak(phrase, &cancel, &mut outcome, started)
                .await
            {
                return self.cancelled(outcome).await;
            }
        }

        if outcome.audio_started() {
            self.connections.broadcast(ServerMessage::TtsAudioEnd).await;
        } else if outcome.phrases_failed > 0 {
            self.connections
                .broadcast(ServerMessage::TtsAudioCancelled)
                .await;
        }

        tracing::info!(
            spoken = outcome.phrases_spoken,
            failed = outcome.phrases_failed,
            skipped = outcome.phrases_skipped,
            chunks = outcome.chunks_sent,
            bytes = outcome.bytes_sent,
            total_ms = started.elapsed().as_millis(),
            "turn audio finished"
        );
        outcome
    }

    async fn cancelled(&self, mut outcome: TurnOutcome) -> TurnOutcome {
        outcome.cancelled = true;
        if outcome.audio_started() {
            self.connections
                .broadcast(ServerMessage::TtsAudioCancelled)
                .await;
        }
        tracing::info!(chunks = outcome.chunks_sent, "turn audio cancelled");
        outcome
    }

    async fn speak(
        &self,
        phrase: &str,
        cancel: &CancelToken,
        outcome: &mut TurnOutcome,
        turn_started: Instant,
    ) -> PhraseResult {
        let requested = Instant::now();
        let synthesized = tokio::select! {
            biased;
            () = cancel.cancelled() => return PhraseResult::Cancelled,
            result = self.engine.synthesize_stream(phrase) => result,
        };

        let mut stream = match synthesized {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                outcome.phrases_skipped += 1;
                return PhraseResult::Continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, phrase, "phrase synthesis failed");
                outcome.phrases_failed += 1;
                return PhraseResult::Continue;
            }
        };

        let mut phrase_chunks = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return PhraseResult::Cancelled,
                next = stream.chunks.next() => next,
            };

            let frame = match next {
                None => break,
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, phrase, "phrase audio stream failed");
                    if phrase_chunks == 0 {
                        outcome.phrases_failed += 1;
                        return PhraseResult::Continue;
                    }
                    break;
                }
            };

            if !outcome.audio_started() {
                self.begin_audio(stream.sample_rate).await;
                outcome.sample_rate = Some(stream.sample_rate);
                tracing::info!(
                    ttfa_ms = turn_started.elapsed().as_millis(),
                    synth_ms = requested.elapsed().as_millis(),
                    sample_rate = stream.sample_rate,
                    "first audio of turn"
                );
            } else if outcome.sample_rate != Some(stream.sample_rate) {
                tracing::warn!(
                    expected = ?outcome.sample_rate,
                    actual = stream.sample_rate,
                    "sample rate changed mid-turn"
                );
            }

            if cancel.is_cancelled() {
                return PhraseResult::Cancelled;
            }

            self.connections
                .broadcast(ServerMessage::audio_chunk(
                    &frame,
                    outcome.chunks_sent,
                    false,
                ))
                .await;
            outcome.chunks_sent += 1;
            outcome.bytes_sent += frame.len();
            phrase_chunks += 1;
        }

        if phrase_chunks > 0 {
            outcome.phrases_spoken += 1;
            tracing::debug!(chunks = phrase_chunks, phrase, "phrase spoken");
        }
        PhraseResult::Continue
    }

    /// Announce audio to clients and stop listening to ourselves
    async fn begin_audio(&self, sample_rate: u32) {
        self.connections
            .broadcast(ServerMessage::TtsAudioStart {
                sample_rate,
                total_bytes: None,
                total_chunks: None,
            })
            .await;
        self.stt.pause_all();
        self.connections
            .set_all_states(VoiceState::Speaking, None)
            .await;
    }

    /// Synthesize `text` in one piece and broadcast it with known totals
    ///
    /// Used for short system utterances. Cancellation before any audio sends
    /// nothing; once `tts_audio_start` went out it ends with
    /// `tts_audio_cancelled` and no further frames.
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    pub async fn announce(&self, text: &str, cancel: &CancelToken) -> Result<Announcement> {
        let synthesized = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(Announcement::Cancelled),
            result = self.engine.synthesize(text) => result?,
        };
        let Some(audio) = synthesized else {
            return Ok(Announcement::Unavailable);
        };
        if audio.audio.is_empty() {
            return Ok(Announcement::Unavailable);
        }

        let frame_bytes = self.engine.settings().voice_settings().segmenter.frame_bytes;
        let frame_bytes = (frame_bytes - frame_bytes % 2).max(2);
        let frames: Vec<&[u8]> = audio.audio.chunks(frame_bytes).collect();

        if cancel.is_cancelled() {
            return Ok(Announcement::Cancelled);
        }
        self.connections
            .broadcast(ServerMessage::TtsAudioStart {
                sample_rate: audio.sample_rate,
                total_bytes: Some(audio.audio.len()),
                total_chunks: Some(frames.len()),
            })
            .await;
        if cancel.is_cancelled() {
            return Ok(self.announcement_cancelled().await);
        }
        self.stt.pause_all();
        self.connections
            .set_all_states(VoiceState::Speaking, None)
            .await;

        let last = frames.len() - 1;
        for (index, frame) in frames.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(self.announcement_cancelled().await);
            }
            self.connections
                .broadcast(ServerMessage::audio_chunk(frame, index as u64, index == last))
                .await;
        }
        self.connections.broadcast(ServerMessage::TtsAudioEnd).await;

        tracing::info!(bytes = audio.audio.len(), chunks = frames.len(), "announcement sent");
        Ok(Announcement::Spoken)
    }

    async fn announcement_cancelled(&self) -> Announcement {
        self.connections
            .broadcast(ServerMessage::TtsAudioCancelled)
            .await;
        tracing::info!("announcement cancelled");
        Announcement::Cancelled
    }
}
