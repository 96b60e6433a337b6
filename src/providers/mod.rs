//! LLM provider layer: one trait, an OpenAI-compatible implementation, and a
//! failover wrapper that swaps to a secondary endpoint on provider overload.

mod error;
mod openai_compatible;

pub use error::{ProviderError, ProviderErrorKind};
pub use openai_compatible::OpenAiCompatibleProvider;

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

/// One chat message in provider wire order.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

/// Completion text plus token accounting.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Callback invoked per streamed token chunk.
pub type TokenSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
        deadline: Duration,
    ) -> Result<Completion, ProviderError>;

    /// Streaming variant used by the debate planner. The default falls back
    /// to a blocking completion and emits it as a single chunk.
    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
        deadline: Duration,
        on_token: TokenSink<'_>,
    ) -> Result<Completion, ProviderError> {
        let completion = self.complete(messages, temperature, max_tokens, deadline).await?;
        on_token(&completion.text);
        Ok(completion)
    }
}

/// Primary/secondary pair. Overload (5xx) on the primary fails over; every
/// other error kind surfaces unchanged.
pub struct FailoverProvider {
    primary: Box<dyn ModelProvider>,
    secondary: Option<Box<dyn ModelProvider>>,
}

impl FailoverProvider {
    pub fn new(primary: Box<dyn ModelProvider>, secondary: Option<Box<dyn ModelProvider>>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl ModelProvider for FailoverProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
        deadline: Duration,
    ) -> Result<Completion, ProviderError> {
        match self.primary.complete(messages, temperature, max_tokens, deadline).await {
            Err(e) if e.kind == ProviderErrorKind::Overloaded => {
                if let Some(secondary) = &self.secondary {
                    warn!(error = %e, "Primary provider overloaded, trying secondary");
                    secondary.complete(messages, temperature, max_tokens, deadline).await
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
        deadline: Duration,
        on_token: TokenSink<'_>,
    ) -> Result<Completion, ProviderError> {
        match self
            .primary
            .complete_streaming(messages, temperature, max_tokens, deadline, on_token)
            .await
        {
            Err(e) if e.kind == ProviderErrorKind::Overloaded => {
                if let Some(secondary) = &self.secondary {
                    warn!(error = %e, "Primary provider overloaded, streaming from secondary");
                    secondary
                        .complete_streaming(messages, temperature, max_tokens, deadline, on_token)
                        .await
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted provider for tests: returns canned responses in order.

    use super::*;
    use std::sync::Mutex;

    pub struct ScriptedProvider {
        responses: Mutex<Vec<Result<String, ProviderError>>>,
    }

    impl ScriptedProvider {
        pub fn new(responses: Vec<Result<String, ProviderError>>) -> Self {
            Self { responses: Mutex::new(responses) }
        }

        pub fn of_texts(texts: &[&str]) -> Self {
            Self::new(texts.iter().map(|t| Ok(t.to_string())).collect())
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _temperature: f64,
            _max_tokens: u32,
            _deadline: Duration,
        ) -> Result<Completion, ProviderError> {
            let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
            if responses.is_empty() {
                return Err(ProviderError::invalid_request("scripted provider exhausted"));
            }
            responses.remove(0).map(|text| Completion {
                text,
                input_tokens: 10,
                output_tokens: 10,
            })
        }
    }

    #[tokio::test]
    async fn failover_kicks_in_only_on_overload() {
        let primary = ScriptedProvider::new(vec![Err(ProviderError::overloaded("503"))]);
        let secondary = ScriptedProvider::of_texts(&["from-secondary"]);
        let provider = FailoverProvider::new(Box::new(primary), Some(Box::new(secondary)));

        let out = provider
            .complete(&[ChatMessage::user("hi")], 0.2, 128, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.text, "from-secondary");

        let primary = ScriptedProvider::new(vec![Err(ProviderError::rate_limited("429", None))]);
        let secondary = ScriptedProvider::of_texts(&["unused"]);
        let provider = FailoverProvider::new(Box::new(primary), Some(Box::new(secondary)));
        let err = provider
            .complete(&[ChatMessage::user("hi")], 0.2, 128, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
    }
}
