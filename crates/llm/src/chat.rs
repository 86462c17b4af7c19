use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::LlmError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Configuration for the chat completions port.
#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer token. Calls fail with `MissingApiKey` when absent.
    pub api_key: Option<SecretString>,
    /// Default per-call timeout.
    pub timeout: Duration,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// One JSON-mode chat completion call.
#[derive(Debug)]
pub struct ChatJsonRequest<'a> {
    /// Model identifier.
    pub model: &'a str,
    /// System prompt.
    pub system: &'a str,
    /// User payload.
    pub user: &'a str,
    /// Override of the configured timeout.
    pub timeout: Option<Duration>,
    /// Override of the configured base URL.
    pub base_url: Option<&'a str>,
}

/// Object-safe version of the chat completions port.
///
/// The core takes `Arc<dyn ChatJson>` so tests can script responses without
/// a network; [`ChatClient`] is the production implementation.
#[async_trait]
pub trait ChatJson: Send + Sync {
    /// Run one JSON-mode chat completion and return the parsed JSON answer.
    async fn chat_json_value(&self, request: ChatJsonRequest<'_>) -> crate::Result<serde_json::Value>;

    /// Whether the port is usable at all (an API key is configured).
    fn is_configured(&self) -> bool;
}

#[async_trait]
impl ChatJson for ChatClient {
    async fn chat_json_value(&self, request: ChatJsonRequest<'_>) -> crate::Result<serde_json::Value> {
        self.chat_json(request).await
    }

    fn is_configured(&self) -> bool {
        self.has_api_key()
    }
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint, always in
/// JSON mode: the response is requested as a JSON object and deserialized
/// into the caller's type.
pub struct ChatClient {
    client: Client,
    config: ChatClientConfig,
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponseBody {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl ChatClient {
    /// Creates a client from the given configuration.
    pub fn new(config: ChatClientConfig) -> crate::Result<Self> {
        let client = Client::builder().build().map_err(|e| {
            log::error!("Failed to create HTTP client for chat completions: {e}");
            LlmError::InternalError(None)
        })?;

        Ok(Self { client, config })
    }

    /// Whether an API key is configured.
    pub fn has_api_key(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// Run one chat completion and deserialize the model's JSON answer.
    pub async fn chat_json<T: DeserializeOwned>(&self, request: ChatJsonRequest<'_>) -> crate::Result<T> {
        let key = self.config.api_key.as_ref().ok_or(LlmError::MissingApiKey)?;

        let base_url = request.base_url.unwrap_or(&self.config.base_url);
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        let body = ChatRequestBody {
            model: request.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: request.system,
                },
                ChatMessage {
                    role: "user",
                    content: request.user,
                },
            ],
            temperature: DEFAULT_TEMPERATURE,
            response_format: ResponseFormat { r#type: "json_object" },
        };

        let response = self
            .client
            .post(&url)
            .timeout(request.timeout.unwrap_or(self.config.timeout))
            .header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(format!("Failed to reach chat completions API: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Chat completions API error ({status}): {error_text}");

            return Err(LlmError::from_status(status.as_u16(), error_text));
        }

        let response_text = response.text().await.map_err(|e| {
            log::error!("Failed to read chat completions response body: {e}");
            LlmError::InternalError(None)
        })?;

        let parsed: ChatResponseBody = sonic_rs::from_str(&response_text).map_err(|e| {
            log::error!("Failed to parse chat completions response: {e}");
            log::error!("Raw response that failed to parse: {response_text}");
            LlmError::InternalError(None)
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("response contained no choices".to_string()))?;

        sonic_rs::from_str(&content)
            .map_err(|e| LlmError::InvalidResponse(format!("model did not return the requested JSON shape: {e}")))
    }
}
