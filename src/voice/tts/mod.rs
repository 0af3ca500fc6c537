//! Text-to-speech (TTS) providers
//!
//! Every provider produces raw 16-bit little-endian mono PCM and reports the
//! sample rate it actually delivers, which may differ from the one requested.
//! [`TtsEngine`] picks the provider named in the current settings on every
//! call and wraps its output in a [`ChunkBuffer`].

mod deepgram;
mod elevenlabs;
mod openai;
mod unrealspeech;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::ExposeSecret;

pub use deepgram::DeepgramTts;
pub use elevenlabs::ElevenLabsTts;
pub use openai::OpenAiTts;
pub use unrealspeech::UnrealSpeechTts;

use super::buffer::ChunkBuffer;
use crate::config::{ApiKeys, SettingsSource, TtsSettings};
use crate::{Error, Result};

/// Stream of raw PCM bytes
pub type AudioByteStream = BoxStream<'static, Result<Bytes>>;

/// A streaming synthesis result
pub struct AudioStream {
    /// Sample rate of the PCM in `chunks`
    pub sample_rate: u32,

    /// PCM byte stream
    pub chunks: AudioByteStream,
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

/// A complete synthesis result
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// Sample rate of `audio`
    pub sample_rate: u32,

    /// Sample-aligned PCM
    pub audio: Bytes,
}

/// A speech synthesis backend
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Provider name as used in settings
    fn name(&self) -> &'static str;

    /// Sample rate the provider will actually produce for `requested`
    fn output_sample_rate(&self, requested: u32) -> u32;

    /// Start synthesizing `text`, streaming PCM as it is produced
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn synthesize_stream(&self, text: &str, settings: &TtsSettings) -> Result<AudioStream>;
}

/// Pick the supported rate closest to `requested`
pub(crate) fn nearest_rate(supported: &[u32], requested: u32) -> u32 {
    supported
        .iter()
        .copied()
        .min_by_key(|rate| rate.abs_diff(requested))
        .unwrap_or(requested)
}

/// Turn a successful streaming response into a PCM byte stream
pub(crate) async fn response_stream(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<AudioByteStream> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(provider, status = %status, body = %body, "TTS API error");
        return Err(Error::Tts(format!("{provider} TTS error {status}: {body}")));
    }

    Ok(response
        .bytes_stream()
        .map(|chunk| chunk.map_err(Error::from))
        .boxed())
}

/// Build the HTTP client shared by provider adapters
///
/// # Errors
///
/// Returns error if the TLS backend cannot be initialized
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))
}

/// Resolves the configured provider and produces buffered audio
pub struct TtsEngine {
    settings: Arc<dyn SettingsSource>,
    providers: HashMap<&'static str, Arc<dyn TtsProvider>>,
}

impl TtsEngine {
    /// Create an engine with no providers registered
    #[must_use]
    pub fn new(settings: Arc<dyn SettingsSource>) -> Self {
        Self {
            settings,
            providers: HashMap::new(),
        }
    }

    /// Register every provider that has an API key
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn from_keys(
        settings: Arc<dyn SettingsSource>,
        keys: &ApiKeys,
        timeout: Duration,
    ) -> Result<Self> {
        let client = http_client(timeout)?;
        let mut engine = Self::new(settings);

        if let Some(key) = &keys.openai {
            engine.register(Arc::new(OpenAiTts::new(
                client.clone(),
                key.expose_secret().to_string(),
            )?));
        }
        if let Some(key) = &keys.elevenlabs {
            engine.register(Arc::new(ElevenLabsTts::new(
                client.clone(),
                key.expose_secret().to_string(),
            )?));
        }
        if let Some(key) = &keys.deepgram {
            engine.register(Arc::new(DeepgramTts::new(
                client.clone(),
                key.expose_secret().to_string(),
            )?));
        }
        if let Some(key) = &keys.unrealspeech {
            engine.register(Arc::new(UnrealSpeechTts::new(
                client,
                key.expose_secret().to_string(),
            )?));
        }

        tracing::info!(providers = ?engine.provider_names(), "TTS providers registered");
        Ok(engine)
    }

    /// Register a provider under its own name, replacing any previous one
    pub fn register(&mut self, provider: Arc<dyn TtsProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    /// Names of registered providers
    #[must_use]
    pub fn provider_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.providers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Settings source consulted on every call
    #[must_use]
    pub fn settings(&self) -> &Arc<dyn SettingsSource> {
        &self.settings
    }

    /// Provider and settings for the next synthesis, if TTS is available
    fn resolve(&self) -> Option<(Arc<dyn TtsProvider>, TtsSettings, usize)> {
        let settings = self.settings.voice_settings();
        if !settings.tts.enabled {
            tracing::debug!("TTS disabled in settings");
            return None;
        }

        let Some(provider) = self.providers.get(settings.tts.provider.as_str()) else {
            tracing::warn!(provider = %settings.tts.provider, "TTS provider not available");
            return None;
        };

        Some((
            Arc::clone(provider),
            settings.tts,
            settings.segmenter.frame_bytes,
        ))
    }

    /// Stream synthesized audio through a [`ChunkBuffer`]
    ///
    /// Returns `Ok(None)` when TTS is disabled or the configured provider is
    /// not available.
    ///
    /// # Errors
    ///
    /// Returns error if the provider request fails
    pub async fn synthesize_stream(&self, text: &str) -> Result<Option<AudioStream>> {
        let Some((provider, settings, frame_bytes)) = self.resolve() else {
            return Ok(None);
        };

        let stream = provider.synthesize_stream(text, &settings).await?;
        if stream.sample_rate != settings.sample_rate {
            tracing::debug!(
                provider = provider.name(),
                requested = settings.sample_rate,
                actual = stream.sample_rate,
                "provider coerced sample rate"
            );
        }

        Ok(Some(AudioStream {
            sample_rate: stream.sample_rate,
            chunks: ChunkBuffer::with_frame_bytes(stream.chunks, frame_bytes).boxed(),
        }))
    }

    /// Synthesize `text` into one sample-aligned blob
    ///
    /// # Errors
    ///
    /// Returns error if the provider request or stream fails
    pub async fn synthesize(&self, text: &str) -> Result<Option<SynthesizedAudio>> {
        let Some(mut stream) = self.synthesize_stream(text).await? else {
            return Ok(None);
        };

        let mut audio = BytesMut::new();
        while let Some(chunk) = stream.chunks.next().await {
            audio.extend_from_slice(&chunk?);
        }

        Ok(Some(SynthesizedAudio {
            sample_rate: stream.sample_rate,
            audio: audio.freeze(),
        }))
    }
}
