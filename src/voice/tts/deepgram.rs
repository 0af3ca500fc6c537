//! Deepgram Aura speech synthesis

use async_trait::async_trait;

use super::{AudioStream, TtsProvider, nearest_rate, response_stream};
use crate::config::TtsSettings;
use crate::{Error, Result};

/// Sample rates accepted for `linear16` output
const SUPPORTED_RATES: &[u32] = &[8_000, 16_000, 24_000, 32_000, 48_000];

const SPEAK_URL: &str = "https://api.deepgram.com/v1/speak";

/// Streams speech from the Deepgram speak API
pub struct DeepgramTts {
    client: reqwest::Client,
    api_key: String,
}

impl DeepgramTts {
    /// Create a new Deepgram TTS provider
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(client: reqwest::Client, api_key: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required for TTS".to_string()));
        }

        Ok(Self { client, api_key })
    }
}

#[async_trait]
impl TtsProvider for DeepgramTts {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    fn output_sample_rate(&self, requested: u32) -> u32 {
        nearest_rate(SUPPORTED_RATES, requested)
    }

    async fn synthesize_stream(&self, text: &str, settings: &TtsSettings) -> Result<AudioStream> {
        #[derive(serde::Serialize)]
        struct SpeakRequest<'a> {
            text: &'a str,
        }

        let sample_rate = self.output_sample_rate(settings.sample_rate);
        let sample_rate_param = sample_rate.to_string();

        // Aura voices are selected by model name, e.g. "aura-asteria-en"
        let model = if settings.voice.starts_with("aura") {
            &settings.voice
        } else {
            &settings.model
        };

        let response = self
            .client
            .post(SPEAK_URL)
            .query(&[
                ("model", model.as_str()),
                ("encoding", "linear16"),
                ("container", "none"),
                ("sample_rate", sample_rate_param.as_str()),
            ])
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&SpeakRequest { text })
            .send()
            .await?;

        Ok(AudioStream {
            sample_rate,
            chunks: response_stream(self.name(), response).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_to_supported_rate() {
        let tts = DeepgramTts::new(reqwest::Client::new(), "key".to_string()).unwrap();
        assert_eq!(tts.output_sample_rate(22_050), 24_000);
        assert_eq!(tts.output_sample_rate(16_000), 16_000);
    }
}
