//! OpenAI-compatible chat-completions client.
//!
//! Works against any endpoint speaking the `/chat/completions` protocol
//! (llama.cpp server, vLLM, OpenAI, proxies). HTTP-level failures retry
//! with exponential backoff (2s, 4s, 8s, ...); API-level 4xx errors do
//! not retry.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Completion, CompletionRequest, ModelClient, ModelError};
use crate::config::ModelConfig;

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

impl OpenAiClient {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        }
    }

    async fn call_once(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_message {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let started = Instant::now();
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout {
                        seconds: request.timeout.as_secs(),
                    }
                } else {
                    ModelError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ModelError::MalformedResponse("no choices in response".into()))?;

        Ok(Completion {
            content,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            prompt_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
            completion_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
            duration: started.elapsed(),
        })
    }

    fn should_retry(error: &ModelError) -> bool {
        match error {
            ModelError::Http(_) | ModelError::Timeout { .. } => true,
            // 429 and 5xx are transient; other API errors are not.
            ModelError::Api { status, .. } => *status == 429 || *status >= 500,
            ModelError::MalformedResponse(_) => false,
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ModelError> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(&request).await {
                Ok(completion) => {
                    debug!(
                        model = %completion.model,
                        duration_ms = completion.duration.as_millis() as u64,
                        "completion received"
                    );
                    return Ok(completion);
                }
                Err(error) => {
                    attempt += 1;
                    if attempt > self.max_retries || !Self::should_retry(&error) {
                        return Err(error);
                    }
                    let backoff = Duration::from_secs(2u64 << (attempt - 1).min(5));
                    warn!(
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %error,
                        "model call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_is_selective() {
        assert!(OpenAiClient::should_retry(&ModelError::Http("reset".into())));
        assert!(OpenAiClient::should_retry(&ModelError::Timeout { seconds: 60 }));
        assert!(OpenAiClient::should_retry(&ModelError::Api {
            status: 503,
            message: String::new()
        }));
        assert!(OpenAiClient::should_retry(&ModelError::Api {
            status: 429,
            message: String::new()
        }));
        assert!(!OpenAiClient::should_retry(&ModelError::Api {
            status: 401,
            message: String::new()
        }));
        assert!(!OpenAiClient::should_retry(&ModelError::MalformedResponse(
            "x".into()
        )));
    }

    #[test]
    fn chat_request_serializes_messages_in_order() {
        let body = ChatRequest {
            model: "m",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "sys",
                },
                ChatMessage {
                    role: "user",
                    content: "hello",
                },
            ],
            temperature: 0.2,
            max_tokens: 64,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hello");
    }

    #[test]
    fn chat_response_parses_minimal_payload() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"ok"}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("ok"));
        assert!(parsed.usage.is_none());
    }
}
