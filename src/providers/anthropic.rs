use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{CompletionClient, CompletionRequest, RetryPolicy};
use crate::error::TransportError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages-API client for Anthropic models.
#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    endpoint: String,
    model: String,
    retry: RetryPolicy,
}

impl AnthropicClient {
    /// Builds a client against `{base_url}/v1/messages`.
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Anthropic API key");
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key.trim()).context("invalid Anthropic API key")?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Anthropic HTTP client")?;
        let endpoint = format!("{}/v1/messages", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            retry,
        })
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, TransportError> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            system: request.system,
            messages: [AnthropicMessage {
                role: "user",
                content: [AnthropicContentBlock {
                    kind: "text",
                    text: request.user,
                }],
            }],
        };
        let parsed: AnthropicResponse = self
            .retry
            .send_json("anthropic", || self.client.post(&self.endpoint).json(&body))
            .await?;
        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                AnthropicResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            return Err(TransportError::Decode(
                "anthropic response missing text content".to_string(),
            ));
        }
        Ok(text)
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    system: &'a str,
    messages: [AnthropicMessage<'a>; 1],
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: [AnthropicContentBlock<'a>; 1],
}

#[derive(Serialize)]
struct AnthropicContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}
