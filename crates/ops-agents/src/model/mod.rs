//! The model seam: a stateless completion oracle.
//!
//! The core treats the model as `Complete(prompt, params) -> text`; this
//! module defines that contract plus the adapter that lets the
//! autocorrection engine request command rewrites.

mod openai;

pub use openai::OpenAiClient;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oversight::CommandRewriter;
use serde::{Deserialize, Serialize};

/// One completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_message: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Model-side timeout for this call.
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_message: None,
            temperature: 0.2,
            max_tokens: 2048,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_message = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What came back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub duration: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Http(String),

    #[error("model call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed model response: {0}")]
    MalformedResponse(String),
}

/// The completion oracle. Implementations carry no conversation state.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ModelError>;
}

/// Adapter: exposes a `ModelClient` as the autocorrection engine's
/// rewrite oracle. One short, low-temperature call per rewrite.
pub struct ModelRewriter {
    client: Arc<dyn ModelClient>,
}

impl ModelRewriter {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CommandRewriter for ModelRewriter {
    async fn rewrite(&self, command: &str, stderr: &str) -> anyhow::Result<Option<String>> {
        let prompt = format!(
            "A shell command failed on a Linux server.\n\
             Command: {command}\n\
             Error output: {stderr}\n\n\
             Reply with a single corrected shell command and nothing else. \
             If you cannot improve the command, reply with exactly NONE."
        );
        let request = CompletionRequest::new(prompt)
            .with_system(
                "You repair failed Linux shell commands. Reply with one command only, \
                 no commentary, no code fences.",
            )
            .with_temperature(0.1);

        let completion = self.client.complete(request).await?;
        let candidate = completion
            .content
            .trim()
            .trim_matches('`')
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        if candidate.is_empty() || candidate.eq_ignore_ascii_case("none") {
            Ok(None)
        } else {
            Ok(Some(candidate))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedModel(String);

    #[async_trait]
    impl ModelClient for CannedModel {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, ModelError> {
            Ok(Completion {
                content: self.0.clone(),
                model: "test".into(),
                prompt_tokens: None,
                completion_tokens: None,
                duration: Duration::ZERO,
            })
        }
    }

    #[tokio::test]
    async fn rewriter_strips_fences_and_noise() {
        let rewriter = ModelRewriter::new(Arc::new(CannedModel(
            "`sudo apt install -y nginx`\nsome trailing chatter".into(),
        )));
        let out = rewriter.rewrite("apt install nginx", "boom").await.unwrap();
        assert_eq!(out.as_deref(), Some("sudo apt install -y nginx"));
    }

    #[tokio::test]
    async fn rewriter_honours_none() {
        let rewriter = ModelRewriter::new(Arc::new(CannedModel("NONE".into())));
        assert!(rewriter.rewrite("x", "y").await.unwrap().is_none());
    }
}
