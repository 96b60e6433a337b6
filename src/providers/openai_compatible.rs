use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::providers::{ChatMessage, Completion, ModelProvider, ProviderError, TokenSink};

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

/// HTTPS is required for remote endpoints so the API key never travels in
/// cleartext; plain HTTP is allowed only toward localhost LLM servers.
fn validate_base_url(base_url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(base_url)
        .map_err(|e| format!("Invalid base_url '{}': {}", base_url, e))?;
    let host = parsed.host_str().unwrap_or("");

    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let is_localhost = host == "localhost" || host == "127.0.0.1" || host == "[::1]";
            if is_localhost {
                warn!(base_url, "Using unencrypted HTTP toward a local LLM server");
                Ok(())
            } else {
                Err(format!("HTTP is not allowed for remote base_url '{}'", base_url))
            }
        }
        other => Err(format!("Unsupported URL scheme '{}' in base_url", other)),
    }
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, String> {
        validate_base_url(base_url)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
        stream: bool,
    ) -> Value {
        let rendered: Vec<Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();
        let mut body = json!({
            "model": self.model,
            "messages": rendered,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn post(
        &self,
        body: &Value,
        deadline: Duration,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(deadline)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::network(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
        deadline: Duration,
    ) -> Result<Completion, ProviderError> {
        let body = self.request_body(messages, temperature, max_tokens, false);
        let response = self.post(&body, deadline).await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::invalid_request(format!("malformed response: {}", e)))?;

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        debug!(model = %self.model, chars = text.len(), "Completion received");

        Ok(Completion {
            text,
            input_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
        deadline: Duration,
        on_token: TokenSink<'_>,
    ) -> Result<Completion, ProviderError> {
        let body = self.request_body(messages, temperature, max_tokens, true);
        let response = self.post(&body, deadline).await?;

        let mut text = String::new();
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProviderError::network(&e))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames are newline-delimited `data: {...}` lines.
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                let Some(data) = line.strip_prefix("data:") else { continue };
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(Completion { text, input_tokens, output_tokens });
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else { continue };
                if let Some(delta) = event["choices"][0]["delta"]["content"].as_str() {
                    on_token(delta);
                    text.push_str(delta);
                }
                if let Some(usage) = event.get("usage") {
                    input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
                    output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0) as u32;
                }
            }
        }

        Ok(Completion { text, input_tokens, output_tokens })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_is_required_for_remote_endpoints() {
        assert!(validate_base_url("https://api.openai.com/v1").is_ok());
        assert!(validate_base_url("http://localhost:8080/v1").is_ok());
        assert!(validate_base_url("http://127.0.0.1:11434/v1").is_ok());
        assert!(validate_base_url("http://api.example.com/v1").is_err());
        assert!(validate_base_url("ftp://api.example.com").is_err());
    }

    #[test]
    fn request_body_carries_call_parameters() {
        let provider =
            OpenAiCompatibleProvider::new("https://api.openai.com/v1", "sk-test", "gpt-4o").unwrap();
        let body = provider.request_body(
            &[ChatMessage::system("be terse"), ChatMessage::user("hello")],
            0.3,
            512,
            false,
        );
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert!(body.get("stream").is_none());
    }
}
