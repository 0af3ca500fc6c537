//! `UnrealSpeech` synthesis

use async_trait::async_trait;

use super::{AudioStream, TtsProvider, response_stream};
use crate::config::TtsSettings;
use crate::{Error, Result};

/// `pcm_s16le` output from the stream endpoint is 22.05 kHz
const UNREALSPEECH_SAMPLE_RATE: u32 = 22_050;

const STREAM_URL: &str = "https://api.v7.unrealspeech.com/stream";

/// Streams speech from the `UnrealSpeech` API
pub struct UnrealSpeechTts {
    client: reqwest::Client,
    api_key: String,
}

impl UnrealSpeechTts {
    /// Create a new `UnrealSpeech` TTS provider
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(client: reqwest::Client, api_key: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "UnrealSpeech API key required for TTS".to_string(),
            ));
        }

        Ok(Self { client, api_key })
    }
}

#[async_trait]
impl TtsProvider for UnrealSpeechTts {
    fn name(&self) -> &'static str {
        "unrealspeech"
    }

    fn output_sample_rate(&self, _requested: u32) -> u32 {
        UNREALSPEECH_SAMPLE_RATE
    }

    async fn synthesize_stream(&self, text: &str, settings: &TtsSettings) -> Result<AudioStream> {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct StreamRequest<'a> {
            text: &'a str,
            voice_id: &'a str,
            bitrate: &'a str,
            speed: f32,
            pitch: f32,
            codec: &'a str,
        }

        // UnrealSpeech speed is an offset around 0 in [-1, 1]
        let request = StreamRequest {
            text,
            voice_id: &settings.voice,
            bitrate: "192k",
            speed: (settings.speed - 1.0).clamp(-1.0, 1.0),
            pitch: 1.0,
            codec: "pcm_s16le",
        };

        let response = self
            .client
            .post(STREAM_URL)
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
