//! Analysis provider vendors

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{AiConfig, ProviderKind};
use crate::error::{AnalysisError, AnalysisResult};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_BASE_URL: &str = "https://api.openai.com";

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)```").expect("valid fenced json pattern"));
static BRACED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("valid braced json pattern"));

/// Text returned by a provider plus what it cost
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    /// Input plus output tokens
    pub tokens: u64,
    pub model: String,
}

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    async fn complete(&self, prompt: &str) -> AnalysisResult<Completion>;
}

/// Build the vendor selected by configuration
pub fn build_provider(config: &AiConfig) -> AnalysisResult<Arc<dyn AnalysisProvider>> {
    let api_key = config
        .api_key
        .clone()
        .filter(|key| !key.is_empty())
        .ok_or_else(|| AnalysisError::MissingApiKey {
            provider: config.provider.as_str().to_string(),
        })?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .build()
        .map_err(|e| AnalysisError::RequestFailed {
            provider: config.provider.as_str().to_string(),
            reason: e.to_string(),
        })?;

    let provider: Arc<dyn AnalysisProvider> = match config.provider {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider {
            client,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
        }),
        ProviderKind::Openai => Arc::new(OpenAiProvider {
            client,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
        }),
    };
    Ok(provider)
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

async fn post_json<T: for<'de> Deserialize<'de>>(
    provider: &'static str,
    request: reqwest::RequestBuilder,
) -> AnalysisResult<T> {
    let response = request.send().await.map_err(|e| AnalysisError::RequestFailed {
        provider: provider.to_string(),
        reason: e.to_string(),
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AnalysisError::BadStatus {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    response.json().await.map_err(|e| AnalysisError::InvalidResponse {
        provider: provider.to_string(),
        reason: e.to_string(),
    })
}

/// Anthropic Messages API
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    base_url: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    usage: Option<AnthropicUsage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl AnalysisProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> AnalysisResult<Completion> {
        let body = ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        let response: AnthropicResponse = post_json(self.name(), request).await?;
        let content = response
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        let tokens = response
            .usage
            .map(|u| u.input_tokens + u.output_tokens)
            .unwrap_or(0);

        Ok(Completion {
            content,
            tokens,
            model: response.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

/// OpenAI Chat Completions API
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    base_url: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl AnalysisProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> AnalysisResult<Completion> {
        let body = ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let request = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(&body);

        let response: OpenAiResponse = post_json(self.name(), request).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AnalysisError::InvalidResponse {
                provider: self.name().to_string(),
                reason: "response contained no choices".to_string(),
            })?;

        Ok(Completion {
            content,
            tokens: response.usage.map(|u| u.total_tokens).unwrap_or(0),
            model: response.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

/// Extract JSON from a completion: a fenced ```json block, else the outermost
/// `{...}`, else the raw text as a JSON string.
pub fn parse_json_content(content: &str) -> Value {
    let candidate = FENCED_JSON
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .or_else(|| BRACED_JSON.find(content).map(|m| m.as_str()));

    candidate
        .and_then(|json| serde_json::from_str(json.trim()).ok())
        .unwrap_or_else(|| Value::String(content.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_http_responder;
    use serde_json::json;

    fn config(provider: ProviderKind, base_url: String) -> AiConfig {
        AiConfig {
            enabled: true,
            provider,
            api_key: Some("test-key".to_string()),
            base_url: Some(base_url),
            model: "claude-3-haiku-20240307".to_string(),
            ..AiConfig::default()
        }
    }

    #[test]
    fn test_parse_json_content() {
        let fenced = "Here you go:\n```json\n{\"cause\": \"scan\"}\n```";
        assert_eq!(parse_json_content(fenced), json!({"cause": "scan"}));

        let braced = "Analysis: {\"cause\": \"lock\", \"confidence\": 0.7} done";
        assert_eq!(parse_json_content(braced)["cause"], "lock");

        assert_eq!(parse_json_content("  plain words "), json!("plain words"));
        assert_eq!(parse_json_content("{broken"), json!("{broken"));
    }

    #[test]
    fn test_missing_api_key() {
        let mut cfg = AiConfig::default();
        cfg.api_key = None;
        assert!(matches!(
            build_provider(&cfg),
            Err(AnalysisError::MissingApiKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_anthropic_completion() {
        let (url, requests) = spawn_http_responder(
            200,
            json!({
                "content": [{"type": "text", "text": "{\"cause\": \"table scan\"}"}],
                "usage": {"input_tokens": 120, "output_tokens": 80},
                "model": "claude-3-haiku-20240307"
            })
            .to_string(),
        )
        .await;

        let provider = build_provider(&config(ProviderKind::Anthropic, url)).unwrap();
        let completion = provider.complete("why is it slow?").await.unwrap();
        assert_eq!(completion.tokens, 200);
        assert_eq!(completion.content, "{\"cause\": \"table scan\"}");

        let request = requests.lock().unwrap()[0].clone();
        assert!(request.starts_with("POST /v1/messages"));
        assert!(request.to_lowercase().contains("x-api-key: test-key"));
        assert!(request.contains("why is it slow?"));
    }

    #[tokio::test]
    async fn test_openai_completion() {
        let (url, _requests) = spawn_http_responder(
            200,
            json!({
                "choices": [{"message": {"role": "assistant", "content": "add an index"}}],
                "usage": {"total_tokens": 55},
                "model": "gpt-4"
            })
            .to_string(),
        )
        .await;

        let provider = build_provider(&config(ProviderKind::Openai, url)).unwrap();
        let completion = provider.complete("suggest").await.unwrap();
        assert_eq!(completion.tokens, 55);
        assert_eq!(completion.model, "gpt-4");
    }

    #[tokio::test]
    async fn test_error_status() {
        let (url, _requests) = spawn_http_responder(529, "overloaded".to_string()).await;
        let provider = build_provider(&config(ProviderKind::Anthropic, url)).unwrap();
        let result = provider.complete("x").await;
        assert!(matches!(
            result,
            Err(AnalysisError::BadStatus { status: 529, .. })
        ));
    }
}
