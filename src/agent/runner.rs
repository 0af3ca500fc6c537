//! OpenAI-compatible chat completions backend

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use super::{ResponseGenerator, TextStream};
use crate::config::LlmConfig;
use crate::{Error, Result};

/// Generates replies with a `/chat/completions` endpoint
pub struct ChatCompletionsGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    system_prompt: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkResponse {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionsGenerator {
    /// Create a generator from LLM configuration
    #[must_use]
    pub fn new(client: reqwest::Client, config: &LlmConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            system_prompt: config.system_prompt.clone(),
            max_tokens: config.max_tokens,
        }
    }

    fn request(&self, user_text: &str, stream: bool) -> reqwest::RequestBuilder {
        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": self.system_prompt}));
        }
        messages.push(json!({"role": "user", "content": user_text}));

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "max_tokens": self.max_tokens,
                "stream": stream,
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        request
    }

    async fn send(&self, user_text: &str, stream: bool) -> Result<reqwest::Response> {
        let response = self.request(user_text, stream).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, model = %self.model, "LLM API error");
            return Err(Error::Llm(format!("LLM error {status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionsGenerator {
    async fn generate_response(&self, user_text: &str, client_id: &str) -> Result<String> {
        tracing::debug!(client_id, chars = user_text.len(), "requesting completion");
        let response: CompletionResponse = self.send(user_text, false).await?.json().await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn stream_response(&self, user_text: &str, client_id: &str) -> Result<TextStream> {
        tracing::debug!(client_id, chars = user_text.len(), "requesting streamed completion");
        let bytes = self.send(user_text, true).await?.bytes_stream().boxed();

        let deltas = futures::stream::unfold(
            (bytes, SseDecoder::default(), Vec::<String>::new(), false),
            |(mut bytes, mut decoder, mut pending, mut done)| async move {
                loop {
                    if let Some(delta) = pending.pop() {
                        return Some((Ok(delta), (bytes, decoder, pending, done)));
                    }
                    if done {
                        return None;
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            let mut deltas = Vec::new();
                            for data in decoder.push(&chunk) {
                                match parse_delta(&data) {
                                    Ok(Some(delta)) => deltas.push(delta),
                                    Ok(None) => {}
                                    Err(StreamEnd) => {
                                        done = true;
                                        break;
                                    }
                                }
                            }
                            // popped from the back
                            deltas.reverse();
                            pending = deltas;
                        }
                        Some(Err(e)) => {
                            done = true;
                            return Some((Err(Error::from(e)), (bytes, decoder, pending, done)));
                        }
                        None => done = true,
                    }
                }
            },
        );

        Ok(deltas.boxed())
    }
}

/// `[DONE]` sentinel
struct StreamEnd;

fn parse_delta(data: &str) -> std::result::Result<Option<String>, StreamEnd> {
    if data == "[DONE]" {
        return Err(StreamEnd);
    }
    match serde_json::from_str::<ChunkResponse>(data) {
        Ok(chunk) => Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())),
        Err(e) => {
            tracing::warn!(error = %e, "unparseable completion chunk");
            Ok(None)
        }
    }
}

/// Incremental server-sent events decoder yielding `data:` payloads
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed raw bytes, returning every event completed by them
    ///
    /// Lines are decoded only once complete, so a character split across
    /// chunks is never mangled.
    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(newline + 1);
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&Bytes::from_static(b"data: {\"a\"")).is_empty());
        assert_eq!(
            decoder.push(&Bytes::from_static(b":1}\n\ndata: [DONE]\n\n")),
            vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]
        );
    }

    #[test]
    fn keeps_characters_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&Bytes::from_static(b"data: caf\xC3")).is_empty());
        assert_eq!(
            decoder.push(&Bytes::from_static(b"\xA9\n\n")),
            vec!["caf\u{e9}".to_string()]
        );
    }

    #[test]
    fn ignores_comments_and_crlf() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(&Bytes::from_static(b": keep-alive\r\n\r\ndata: x\r\n\r\n"));
        assert_eq!(events, vec!["x".to_string()]);
    }

    #[test]
    fn parses_content_deltas() {
        let chunk = r#"{"choices":[{"delta":{"content":"Hel"},"index":0}]}"#;
        assert_eq!(parse_delta(chunk).ok().flatten(), Some("Hel".to_string()));

        let role_only = r#"{"choices":[{"delta":{"role":"assistant"},"index":0}]}"#;
        assert_eq!(parse_delta(role_only).ok().flatten(), None);

        assert!(parse_delta("[DONE]").is_err());
    }

    #[test]
    fn request_targets_chat_completions() {
        let config = LlmConfig {
            base_url: "http://localhost:8080/v1/".to_string(),
            model: "test-model".to_string(),
            api_key: None,
            system_prompt: "Be brief.".to_string(),
            max_tokens: 64,
        };
        let generator = ChatCompletionsGenerator::new(reqwest::Client::new(), &config);
        let request = generator.request("hello", true).build().unwrap();
        assert_eq!(
            request.url().as_str(),
            "http://localhost:8080/v1/chat/completions"
        );
        assert!(request.headers().get("authorization").is_none());
    }
}
