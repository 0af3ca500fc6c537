//! Error types for the kiosk voice pipeline

use thiserror::Error;

/// Result type alias for voice pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio format error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// LLM response generation error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Malformed client message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Client transport closed or unreachable
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider websocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
