//! Response generation for voice turns
//!
//! The voice pipeline only needs text in, text out. Streaming is optional:
//! generators that cannot stream get a single-chunk stream for free.

mod runner;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

pub use runner::{ChatCompletionsGenerator, SseDecoder};

use crate::Result;

/// Stream of response text deltas
pub type TextStream = BoxStream<'static, Result<String>>;

/// Produces the assistant's reply to a user utterance
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Generate a complete reply
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    async fn generate_response(&self, user_text: &str, client_id: &str) -> Result<String>;

    /// Stream the reply as text deltas
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn stream_response(&self, user_text: &str, client_id: &str) -> Result<TextStream> {
        let text = self.generate_response(user_text, client_id).await?;
        Ok(futures::stream::once(async move { Ok(text) }).boxed())
    }
}
