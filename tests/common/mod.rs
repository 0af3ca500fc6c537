//! Shared test utilities

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use kiosk_voice::agent::{ResponseGenerator, TextStream};
use kiosk_voice::config::{SttSettings, TtsSettings};
use kiosk_voice::voice::stt::{AudioSink, SttConnection, SttProvider, Transcript};
use kiosk_voice::voice::tts::{AudioStream, TtsProvider};
use kiosk_voice::voice::{ServerMessage, TtsEngine};
use kiosk_voice::{Result, StaticSettings, VoiceSettings, VoiceStack};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const WAIT: Duration = Duration::from_secs(2);

/// TTS provider that "speaks" the phrase's own bytes in two chunks
pub struct ScriptedTts {
    /// Delay before each chunk
    pub chunk_delay: Duration,
}

#[async_trait]
impl TtsProvider for ScriptedTts {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn output_sample_rate(&self, _requested: u32) -> u32 {
        16_000
    }

    async fn synthesize_stream(&self, text: &str, _settings: &TtsSettings) -> Result<AudioStream> {
        let bytes = Bytes::from(text.as_bytes().to_vec());
        let mid = bytes.len() / 2;
        let chunks = vec![bytes.slice(..mid), bytes.slice(mid..)];
        let delay = self.chunk_delay;

        let stream = futures::stream::iter(chunks).then(move |chunk| async move {
            tokio::time::sleep(delay).await;
            Ok(chunk)
        });
        Ok(AudioStream {
            sample_rate: 16_000,
            chunks: stream.boxed(),
        })
    }
}

/// One connection opened against [`ScriptedStt`]
pub struct SttLink {
    pub transcripts: mpsc::Sender<Result<Transcript>>,
    pub audio: Arc<Mutex<Vec<Bytes>>>,
}

impl SttLink {
    /// Push a transcript as if the provider produced it
    pub async fn say(&self, text: &str, is_final: bool) {
        self.transcripts
            .send(Ok(Transcript {
                text: text.to_string(),
                is_final,
            }))
            .await
            .expect("STT session gone");
    }
}

/// STT provider whose connections are driven by the test
#[derive(Default)]
pub struct ScriptedStt {
    links: Mutex<Vec<Arc<SttLink>>>,
}

struct RecordingSink {
    audio: Arc<Mutex<Vec<Bytes>>>,
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn send_audio(&mut self, audio: Bytes) -> Result<()> {
        self.audio.lock().unwrap().push(audio);
        Ok(())
    }

    async fn keep_alive(&mut self) -> Result<()> {
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SttProvider for ScriptedStt {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn connect(&self, _settings: &SttSettings) -> Result<SttConnection> {
        let (tx, rx) = mpsc::channel(16);
        let audio = Arc::new(Mutex::new(Vec::new()));
        self.links.lock().unwrap().push(Arc::new(SttLink {
            transcripts: tx,
            audio: Arc::clone(&audio),
        }));
        Ok(SttConnection {
            sink: Box::new(RecordingSink { audio }),
            transcripts: ReceiverStream::new(rx).boxed(),
        })
    }
}

impl ScriptedStt {
    /// Number of connections opened so far
    pub fn connections(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    /// Wait for the `n`th connection (1-based) and return it
    pub async fn link(&self, n: usize) -> Arc<SttLink> {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(link) = self.links.lock().unwrap().get(n - 1) {
                    return Arc::clone(link);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("STT connection never opened")
    }
}

/// Generator that streams a fixed reply word by word
pub struct EchoGenerator {
    pub reply: String,
    pub fail: bool,
}

#[async_trait]
impl ResponseGenerator for EchoGenerator {
    async fn generate_response(&self, _user_text: &str, _client_id: &str) -> Result<String> {
        if self.fail {
            return Err(kiosk_voice::Error::Llm("scripted failure".to_string()));
        }
        Ok(self.reply.clone())
    }

    async fn stream_response(&self, user_text: &str, client_id: &str) -> Result<TextStream> {
        let reply = self.generate_response(user_text, client_id).await?;
        let words: Vec<Result<String>> = reply
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(futures::stream::iter(words).boxed())
    }
}

/// Pipeline wired to scripted providers
pub struct Harness {
    pub stack: VoiceStack,
    pub stt: Arc<ScriptedStt>,
    pub settings: Arc<StaticSettings>,
}

/// Build a pipeline with scripted providers
pub fn harness(reply: &str, chunk_delay: Duration) -> Harness {
    harness_with(reply, chunk_delay, false, |_| {})
}

/// Build a pipeline, customizing settings and generator failure
pub fn harness_with(
    reply: &str,
    chunk_delay: Duration,
    fail: bool,
    customize: impl FnOnce(&mut VoiceSettings),
) -> Harness {
    let mut voice = VoiceSettings::default();
    voice.tts.provider = "scripted".to_string();
    voice.segmenter.min_chars = 10;
    voice.segmenter.first_phrase_min_chars = 5;
    voice.segmenter.frame_bytes = 4;
    customize(&mut voice);

    let settings = Arc::new(StaticSettings::new(voice));
    let mut engine = TtsEngine::new(settings.clone());
    engine.register(Arc::new(ScriptedTts { chunk_delay }));

    let stt = Arc::new(ScriptedStt::default());
    let stack = VoiceStack::new(
        settings.clone(),
        engine,
        Some(stt.clone() as Arc<dyn SttProvider>),
        Arc::new(EchoGenerator {
            reply: reply.to_string(),
            fail,
        }),
    );

    Harness {
        stack,
        stt,
        settings,
    }
}

/// A connected fake kiosk
pub struct TestClient {
    pub id: String,
    pub rx: mpsc::Receiver<ServerMessage>,
}

impl TestClient {
    /// Register a client with the pipeline
    pub fn connect(stack: &VoiceStack, id: &str) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        stack.orchestrator.handle_connect(id, tx);
        Self {
            id: id.to_string(),
            rx,
        }
    }

    /// Next message, failing the test on timeout
    pub async fn next(&mut self) -> ServerMessage {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("client channel closed")
    }

    /// Collect messages up to and including the first of `kind`
    pub async fn until(&mut self, kind: &str) -> Vec<ServerMessage> {
        let mut seen = Vec::new();
        loop {
            let message = self.next().await;
            let done = message.kind() == kind;
            seen.push(message);
            if done {
                return seen;
            }
        }
    }

    /// Everything already queued
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            out.push(message);
        }
        out
    }
}

/// Kinds of a message list
pub fn kinds(messages: &[ServerMessage]) -> Vec<&'static str> {
    messages.iter().map(ServerMessage::kind).collect()
}

/// Chunk indices of a message list
pub fn chunk_indices(messages: &[ServerMessage]) -> Vec<u64> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::TtsAudioChunk { chunk_index, .. } => Some(*chunk_index),
            _ => None,
        })
        .collect()
}
