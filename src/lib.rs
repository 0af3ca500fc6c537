//! Kiosk Voice - real-time voice pipeline for kiosk assistants
//!
//! This library provides the server side of a hands-free kiosk:
//! - Live speech recognition per connected client
//! - Phrase segmentation of streamed LLM replies
//! - Streaming, sample-aligned speech synthesis broadcast to every client
//! - A per-client conversation state machine with barge-in
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Kiosk clients (WebSocket)               │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                Voice Orchestrator                    │
//! │  Connections │ STT sessions │ Segmenter │ TTS queue │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                External providers                    │
//! │      LLM  │  Deepgram STT  │  TTS (4 providers)     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod daemon;
pub mod error;
pub mod voice;

pub use agent::{ChatCompletionsGenerator, ResponseGenerator};
pub use config::{Config, SettingsSource, StaticSettings, VoiceSettings};
pub use daemon::{Daemon, VoiceStack};
pub use error::{Error, Result};
