//! Client/server WebSocket message shapes

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::connection::VoiceState;
use crate::{Error, Result};

/// Incoming WebSocket message from a kiosk client
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keep-alive
    Heartbeat,
    /// Client finished its own setup and wants the current state
    ConnectionReady,
    /// On-device wake word detector fired
    WakewordDetected {
        #[serde(default)]
        confidence: Option<f32>,
    },
    /// Wake word heard while the assistant was speaking
    WakewordBargeIn,
    /// Base64 microphone audio
    AudioChunk { data: AudioPayload },
    /// The physical speaker started playing assistant audio
    TtsPlaybackStart,
    /// The physical speaker finished playing assistant audio
    TtsPlaybackEnd,
    /// Client stopped streaming microphone audio
    StreamEnd,
    /// Any message type this server does not know
    #[serde(other)]
    Unknown,
}

/// Payload of an `audio_chunk` message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AudioPayload {
    /// Base64-encoded 16-bit PCM
    pub audio: String,
}

impl AudioPayload {
    /// Decode the base64 audio
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not valid base64
    pub fn decode(&self) -> Result<Bytes> {
        STANDARD
            .decode(self.audio.as_bytes())
            .map(Bytes::from)
            .map_err(|e| Error::Protocol(format!("invalid base64 audio: {e}")))
    }
}

impl ClientMessage {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a JSON object with a `type` field
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("invalid message: {e}")))
    }
}

/// Outgoing WebSocket message to kiosk clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Interim or final transcript of the user's speech
    Transcript { text: String, is_final: bool },
    /// Full text of the assistant's reply
    AssistantResponse { text: String },
    /// Session state change
    State {
        state: VoiceState,
        #[serde(flatten)]
        extra: serde_json::Map<String, serde_json::Value>,
    },
    /// Assistant audio is about to start
    TtsAudioStart {
        sample_rate: u32,
        /// Known only for non-streamed audio
        total_bytes: Option<usize>,
        /// Known only for non-streamed audio
        total_chunks: Option<usize>,
    },
    /// One frame of base64 PCM
    TtsAudioChunk {
        data: String,
        chunk_index: u64,
        is_last: bool,
    },
    /// All audio for the turn has been sent
    TtsAudioEnd,
    /// Audio for the turn was cancelled; discard anything queued
    TtsAudioCancelled,
    /// Stop local playback immediately
    InterruptTts,
    /// Reply to `heartbeat`
    HeartbeatAck,
    /// Error visible to the client
    Error { code: String, message: String },
}

impl ServerMessage {
    /// State change without extra fields
    #[must_use]
    pub fn state(state: VoiceState) -> Self {
        Self::State {
            state,
            extra: serde_json::Map::new(),
        }
    }

    /// Audio frame with base64-encoded PCM
    #[must_use]
    pub fn audio_chunk(pcm: &[u8], chunk_index: u64, is_last: bool) -> Self {
        Self::TtsAudioChunk {
            data: STANDARD.encode(pcm),
            chunk_index,
            is_last,
        }
    }

    /// Wire name of this message
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transcript { .. } => "transcript",
            Self::AssistantResponse { .. } => "assistant_response",
            Self::State { .. } => "state",
            Self::TtsAudioStart { .. } => "tts_audio_start",
            Self::TtsAudioChunk { .. } => "tts_audio_chunk",
            Self::TtsAudioEnd => "tts_audio_end",
            Self::TtsAudioCancelled => "tts_audio_cancelled",
            Self::InterruptTts => "interrupt_tts",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_known_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"heartbeat","ts":123}"#).unwrap(),
            ClientMessage::Heartbeat
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"wakeword_detected","confidence":0.87}"#).unwrap(),
            ClientMessage::WakewordDetected {
                confidence: Some(0.87)
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"wakeword_detected"}"#).unwrap(),
            ClientMessage::WakewordDetected { confidence: None }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"tts_playback_end"}"#).unwrap(),
            ClientMessage::TtsPlaybackEnd
        );
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"set_volume","level":3}"#).unwrap(),
            ClientMessage::Unknown
        );
    }

    #[test]
    fn malformed_message_is_protocol_error() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(Error::Protocol(_))
        ));
        assert!(ClientMessage::parse(r#"{"type":"audio_chunk"}"#).is_err());
    }

    #[test]
    fn decodes_audio_payload() {
        let msg = ClientMessage::parse(r#"{"type":"audio_chunk","data":{"audio":"AAEC"}}"#)
            .unwrap();
        let ClientMessage::AudioChunk { data } = msg else {
            panic!("expected audio chunk");
        };
        assert_eq!(&data.decode().unwrap()[..], &[0u8, 1, 2][..]);

        let bad = AudioPayload {
            audio: "***".to_string(),
        };
        assert!(bad.decode().is_err());
    }

    #[test]
    fn serializes_server_messages() {
        let value = serde_json::to_value(ServerMessage::audio_chunk(&[0, 1, 2, 3], 7, false)).unwrap();
        assert_eq!(
            value,
            json!({"type": "tts_audio_chunk", "data": "AAECAw==", "chunk_index": 7, "is_last": false})
        );

        let value = serde_json::to_value(ServerMessage::TtsAudioStart {
            sample_rate: 24_000,
            total_bytes: None,
            total_chunks: None,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "tts_audio_start", "sample_rate": 24000, "total_bytes": null, "total_chunks": null})
        );

        assert_eq!(
            serde_json::to_value(ServerMessage::InterruptTts).unwrap(),
            json!({"type": "interrupt_tts"})
        );
    }

    #[test]
    fn state_message_flattens_extra_fields() {
        let mut extra = serde_json::Map::new();
        extra.insert("reason".to_string(), json!("playback"));
        let value = serde_json::to_value(ServerMessage::State {
            state: VoiceState::Speaking,
            extra,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "state", "state": "speaking", "reason": "playback"})
        );
    }
}
