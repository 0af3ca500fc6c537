//! Deepgram live transcription over WebSocket

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{AudioSink, SttConnection, SttProvider, Transcript, TranscriptStream};
use crate::config::SttSettings;
use crate::{Error, Result};

const LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";
const KEEP_ALIVE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

/// Milliseconds of silence after which Deepgram sends `UtteranceEnd`
const UTTERANCE_END_MS: u32 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Deepgram streaming STT
pub struct DeepgramLiveStt {
    api_key: String,
    url: String,
}

impl DeepgramLiveStt {
    /// Create a live STT provider
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            api_key,
            url: LISTEN_URL.to_string(),
        })
    }

    /// Point at a different listen endpoint
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn listen_url(&self, settings: &SttSettings) -> String {
        format!(
            "{}?model={}&language={}&encoding=linear16&sample_rate={}&channels=1\
             &interim_results=true&punctuate=true&smart_format=true\
             &endpointing={}&utterance_end_ms={UTTERANCE_END_MS}&vad_events=true",
            self.url, settings.model, settings.language, settings.sample_rate, settings.endpointing_ms,
        )
    }
}

#[async_trait]
impl SttProvider for DeepgramLiveStt {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    async fn connect(&self, settings: &SttSettings) -> Result<SttConnection> {
        let mut request = self.listen_url(settings).into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| Error::Config(format!("invalid Deepgram API key: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws, response) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!(status = %response.status(), model = %settings.model, "Deepgram live connection open");

        let (write, read) = ws.split();
        Ok(SttConnection {
            sink: Box::new(DeepgramSink { write }),
            transcripts: transcript_stream(read),
        })
    }
}

struct DeepgramSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl AudioSink for DeepgramSink {
    async fn send_audio(&mut self, audio: Bytes) -> Result<()> {
        self.write.send(Message::Binary(audio.to_vec())).await?;
        Ok(())
    }

    async fn keep_alive(&mut self) -> Result<()> {
        self.write.send(Message::Text(KEEP_ALIVE.to_string())).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.write
            .send(Message::Text(CLOSE_STREAM.to_string()))
            .await?;
        self.write.close().await?;
        Ok(())
    }
}

fn transcript_stream(read: SplitStream<WsStream>) -> TranscriptStream {
    futures::stream::unfold(
        (read, UtteranceAccumulator::default()),
        |(mut read, mut utterance)| async move {
            loop {
                let message = match read.next().await? {
                    Ok(message) => message,
                    Err(e) => return Some((Err(Error::from(e)), (read, utterance))),
                };

                match message {
                    Message::Text(text) => match utterance.handle(&text) {
                        Ok(Some(transcript)) => return Some((Ok(transcript), (read, utterance))),
                        Ok(None) => {}
                        Err(e) => tracing::warn!(error = %e, "unparseable Deepgram message"),
                    },
                    Message::Close(frame) => {
                        tracing::debug!(?frame, "Deepgram closed the connection");
                        return None;
                    }
                    _ => {}
                }
            }
        },
    )
    .boxed()
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ListenMessage {
    Results {
        channel: ResultsChannel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
    },
    UtteranceEnd,
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ResultsChannel {
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize)]
struct Alternative {
    transcript: String,
}

/// Joins finalized fragments into one utterance
///
/// Deepgram finalizes speech in fragments (`is_final`) and marks the end of
/// an utterance with `speech_final` or a separate `UtteranceEnd` event.
#[derive(Debug, Default)]
struct UtteranceAccumulator {
    finalized: Vec<String>,
}

impl UtteranceAccumulator {
    fn handle(&mut self, raw: &str) -> Result<Option<Transcript>> {
        Ok(match serde_json::from_str::<ListenMessage>(raw)? {
            ListenMessage::Results {
                channel,
                is_final,
                speech_final,
            } => {
                let text = channel
                    .alternatives
                    .into_iter()
                    .next()
                    .map(|a| a.transcript)
                    .unwrap_or_default();
                self.on_results(text.trim(), is_final, speech_final)
            }
            ListenMessage::UtteranceEnd => self.take_final(),
            ListenMessage::Other => None,
        })
    }

    fn on_results(&mut self, text: &str, is_final: bool, speech_final: bool) -> Option<Transcript> {
        if is_final {
            if !text.is_empty() {
                self.finalized.push(text.to_string());
            }
            if speech_final {
                return self.take_final();
            }
            if self.finalized.is_empty() {
                return None;
            }
            return Some(Transcript {
                text: self.finalized.join(" "),
                is_final: false,
            });
        }

        if text.is_empty() {
            return None;
        }
        let mut parts = self.finalized.clone();
        parts.push(text.to_string());
        Some(Transcript {
            text: parts.join(" "),
            is_final: false,
        })
    }

    fn take_final(&mut self) -> Option<Transcript> {
        if self.finalized.is_empty() {
            return None;
        }
        let text = self.finalized.join(" ");
        self.finalized.clear();
        Some(Transcript {
            text,
            is_final: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(text: &str, is_final: bool, speech_final: bool) -> String {
        serde_json::json!({
            "type": "Results",
            "is_final": is_final,
            "speech_final": speech_final,
            "channel": {"alternatives": [{"transcript": text, "confidence": 0.9}]},
        })
        .to_string()
    }

    fn interim(text: &str) -> Option<Transcript> {
        Some(Transcript {
            text: text.to_string(),
            is_final: false,
        })
    }

    #[test]
    fn joins_fragments_until_speech_final() {
        let mut acc = UtteranceAccumulator::default();
        assert_eq!(acc.handle(&results("what is", false, false)).unwrap(), interim("what is"));
        assert_eq!(
            acc.handle(&results("what is the", true, false)).unwrap(),
            interim("what is the")
        );
        assert_eq!(
            acc.handle(&results("weather", false, false)).unwrap(),
            interim("what is the weather")
        );
        assert_eq!(
            acc.handle(&results("weather today", true, true)).unwrap(),
            Some(Transcript {
                text: "what is the weather today".to_string(),
                is_final: true,
            })
        );
        assert!(acc.finalized.is_empty());
    }

    #[test]
    fn utterance_end_flushes_pending_fragments() {
        let mut acc = UtteranceAccumulator::default();
        acc.handle(&results("turn on the lights", true, false)).unwrap();
        let end = r#"{"type":"UtteranceEnd","channel":[0,1],"last_word_end":2.4}"#;
        assert_eq!(
            acc.handle(end).unwrap(),
            Some(Transcript {
                text: "turn on the lights".to_string(),
                is_final: true,
            })
        );
        assert_eq!(acc.handle(end).unwrap(), None);
    }

    #[test]
    fn ignores_empty_and_unknown_messages() {
        let mut acc = UtteranceAccumulator::default();
        assert_eq!(acc.handle(&results("", false, false)).unwrap(), None);
        assert_eq!(acc.handle(&results("", true, true)).unwrap(), None);
        assert_eq!(
            acc.handle(r#"{"type":"Metadata","request_id":"abc"}"#).unwrap(),
            None
        );
        assert_eq!(
            acc.handle(r#"{"type":"SpeechStarted","timestamp":0.1}"#).unwrap(),
            None
        );
        assert!(acc.handle("garbage").is_err());
    }

    #[test]
    fn listen_url_carries_audio_format() {
        let stt = DeepgramLiveStt::new("key".to_string()).unwrap();
        let url = stt.listen_url(&SttSettings::default());
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?model=nova-2"));
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("endpointing=300"));
    }

    #[test]
    fn rejects_empty_key() {
        assert!(DeepgramLiveStt::new(String::new()).is_err());
    }
}
