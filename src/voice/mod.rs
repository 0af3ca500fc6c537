//! Voice pipeline
//!
//! Handles live speech recognition, phrase segmentation, streaming speech
//! synthesis and the per-client conversation state machine.

mod buffer;
mod cancel;
mod connection;
mod messages;
mod orchestrator;
mod processor;
mod segmenter;
pub mod stt;
pub mod tts;
mod wav;

pub use buffer::{ChunkBuffer, DEFAULT_FRAME_BYTES};
pub use cancel::CancelToken;
pub use connection::{
    ClientSender, SessionSnapshot, VoiceConnectionManager, VoiceSession, VoiceState,
};
pub use messages::{AudioPayload, ClientMessage, ServerMessage};
pub use orchestrator::VoiceOrchestrator;
pub use processor::{
    Announcement, PHRASE_QUEUE_CAPACITY, PhraseReceiver, PhraseSender, TtsProcessor, TurnOutcome, phrase_queue,
};
pub use segmenter::{
    DEFAULT_DELIMITERS, DEFAULT_FIRST_PHRASE_GRACE, DEFAULT_FIRST_PHRASE_MIN_CHARS,
    DEFAULT_MIN_CHARS, FirstPhraseSegmenter, TextSegmenter, TurnSegmenter,
};
pub use stt::{SttEvent, SttEventKind, SttProvider, SttSessionManager, Transcript};
pub use tts::{TtsEngine, TtsProvider};
pub use wav::pcm_to_wav;
