//! `ElevenLabs` speech synthesis

use async_trait::async_trait;

use super::{AudioStream, TtsProvider, nearest_rate, response_stream};
use crate::config::TtsSettings;
use crate::{Error, Result};

/// PCM output formats offered by the streaming endpoint
const SUPPORTED_RATES: &[u32] = &[16_000, 22_050, 24_000, 44_100];

/// Streams speech from the `ElevenLabs` API
pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: String,
}

impl ElevenLabsTts {
    /// Create a new `ElevenLabs` TTS provider
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(client: reqwest::Client, api_key: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self { client, api_key })
    }
}

#[async_trait]
impl TtsProvider for ElevenLabsTts {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    fn output_sample_rate(&self, requested: u32) -> u32 {
        nearest_rate(SUPPORTED_RATES, requested)
    }

    async fn synthesize_stream(&self, text: &str, settings: &TtsSettings) -> Result<AudioStream> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let sample_rate = self.output_sample_rate(settings.sample_rate);
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}/stream?output_format=pcm_{sample_rate}",
            settings.voice
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &settings.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        Ok(AudioStream {
            sample_rate,
            chunks: response_stream(self.name(), response).await?,
        })
    }
}
