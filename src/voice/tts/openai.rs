//! `OpenAI` speech synthesis

use async_trait::async_trait;

use super::{AudioStream, TtsProvider, response_stream};
use crate::config::TtsSettings;
use crate::{Error, Result};

/// `OpenAI` PCM output is always 24 kHz
const OPENAI_SAMPLE_RATE: u32 = 24_000;

const SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Streams speech from the `OpenAI` audio API
pub struct OpenAiTts {
    client: reqwest::Client,
    api_key: String,
}

impl OpenAiTts {
    /// Create a new `OpenAI` TTS provider
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(client: reqwest::Client, api_key: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self { client, api_key })
    }
}

#[async_trait]
impl TtsProvider for OpenAiTts {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn output_sample_rate(&self, _requested: u32) -> u32 {
        OPENAI_SAMPLE_RATE
    }

    async fn synthesize_stream(&self, text: &str, settings: &TtsSettings) -> Result<AudioStream> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
            speed: f32,
        }

        let request = SpeechRequest {
            model: &settings.model,
            input: text,
            voice: &settings.voice,
            response_format: "pcm",
            speed: settings.speed.clamp(0.25, 4.0),
        };

        tracing::debug!(model = %settings.model, chars = text.len(), "requesting OpenAI speech");

        let response = self
            .client
            .post(SPEECH_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        Ok(AudioStream {
            sample_rate: self.output_sample_rate(settings.sample_rate),
            chunks: response_stream(self.name(), response).await?,
        })
    }
}
