//! OpenAI-compatible completion client (OpenAI, Groq, Together, Ollama, LM Studio)

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::{CompletionOptions, CompletionService};

/// Non-2xx reply from a completion endpoint
#[derive(Debug, Error)]
#[error("{provider} completion failed with status {status}: {body}")]
pub struct CompletionHttpError {
    pub provider: String,
    pub status: u16,
    pub body: String,
}

impl CompletionHttpError {
    /// Rate limits and server-side failures
    pub fn is_retryable(&self) -> bool {
        self.status == 429 || self.status >= 500
    }
}

/// Chat-completions client with a configurable base URL
pub struct OpenAiCompletionClient {
    client: Client,
    name: String,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for OpenAiCompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompletionClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OpenAiCompletionClient {
    /// Create a client.
    ///
    /// - `name`: label used in logs (e.g. "openai", "groq")
    /// - `base_url`: endpoint root without the `/v1` suffix (e.g. `https://api.openai.com`)
    /// - `timeout`: applied to every request
    pub fn new(name: String, api_key: String, base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            name,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_request(prompt: &str, options: &CompletionOptions) -> CompletionRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &options.system_prompt {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(WireMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        CompletionRequest {
            model: options.model.clone(),
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        }
    }

    fn extract_text(resp: CompletionResponse) -> Result<String> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Completion response had no choices"))?;

        Ok(choice.message.content.unwrap_or_default().trim().to_string())
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletionClient {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = Self::build_request(prompt, options);

        debug!(
            "{} completion request: model={}, prompt_chars={}",
            self.name,
            options.model,
            prompt.len()
        );

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", self.name))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CompletionHttpError {
                provider: self.name.clone(),
                status: status.as_u16(),
                body: error_text,
            }
            .into());
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} completion response", self.name))?;

        let text = Self::extract_text(parsed)?;
        debug!("{} completion response: {} chars", self.name, text.len());
        Ok(text)
    }
}

// ── wire types ──

#[derive(Debug, Clone, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct CompletionChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OpenAiCompletionClient {
        OpenAiCompletionClient::new(
            "openai".to_string(),
            "sk-secret-key".to_string(),
            "https://api.openai.com/".to_string(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_build_request_with_system_prompt() {
        let options = CompletionOptions::new("gpt-4o").with_system_prompt("Be brief.");
        let req = OpenAiCompletionClient::build_request("hello", &options);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[0].content, "Be brief.");
        assert_eq!(req.messages[1].role, "user");
        assert_eq!(req.messages[1].content, "hello");
    }

    #[test]
    fn test_build_request_without_system_prompt() {
        let req = OpenAiCompletionClient::build_request("hi", &CompletionOptions::new("m"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.model, "m");
    }

    #[test]
    fn test_extract_text_trims() {
        let resp: CompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{ "message": { "content": "  Hello!\n" } }]
        }))
        .unwrap();
        assert_eq!(OpenAiCompletionClient::extract_text(resp).unwrap(), "Hello!");
    }

    #[test]
    fn test_extract_text_no_choices() {
        let resp = CompletionResponse { choices: vec![] };
        assert!(OpenAiCompletionClient::extract_text(resp).is_err());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        assert_eq!(client().base_url, "https://api.openai.com");
    }

    #[test]
    fn test_http_error_retryable_statuses() {
        let err = |status| CompletionHttpError {
            provider: "groq".to_string(),
            status,
            body: String::new(),
        };
        assert!(err(429).is_retryable());
        assert!(err(503).is_retryable());
        assert!(!err(401).is_retryable());
        assert_eq!(err(400).to_string(), "groq completion failed with status 400: ");
    }

    #[test]
    fn test_debug_hides_key() {
        let debug = format!("{:?}", client());
        assert!(!debug.contains("sk-secret-key"));
        assert!(debug.contains("openai"));
    }
}
