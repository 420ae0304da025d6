//! Completion-service boundary: the trait the pipeline talks to plus the
//! HTTP providers that implement it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::TransportError;

mod anthropic;
mod openai;
mod scripted;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;
pub use scripted::ScriptedClient;

/// Request envelope shared by every provider.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    /// System instruction.
    pub system: &'a str,
    /// User prompt.
    pub user: &'a str,
    /// Upper bound on generated tokens.
    pub max_output_tokens: usize,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Anything that can turn a prompt into generated text.
///
/// Implementations retry transport failures internally; an `Err` means the
/// retry budget is spent.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Generates text for `request`.
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, TransportError>;
}

/// Transport retry budget, independent of coverage regeneration budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first.
    pub max_retries: usize,
    /// Backoff unit, doubled per attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn should_retry(&self, status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    fn is_retryable_error(&self, err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
    }

    /// Delay before attempt `attempt` (1-based), capped at 32 units.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        self.base_delay * (1u32 << capped)
    }

    /// Sends the request built by `build`, retrying throttling, server errors
    /// and transient network failures, then decodes the JSON body.
    pub(crate) async fn send_json<T, F>(&self, provider: &str, build: F) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<T>()
                            .await
                            .map_err(|err| TransportError::Decode(format!("{provider}: {err}")));
                    }
                    let body = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if self.should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(provider, %status, attempt, "retrying completion request");
                        tokio::time::sleep(self.backoff(attempt)).await;
                        continue;
                    }
                    return Err(TransportError::Status {
                        status: status.as_u16(),
                        body: truncate(&body, 512),
                    });
                }
                Err(err) => {
                    if self.is_retryable_error(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        warn!(provider, error = %err, attempt, "retrying completion request");
                        tokio::time::sleep(self.backoff(attempt)).await;
                        continue;
                    }
                    return Err(TransportError::Request(format!("{provider}: {err}")));
                }
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde::Deserialize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        text: String,
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    /// Serves one canned response per connection, in order, repeating the
    /// last one once the list runs out. Returns the base URL and a request
    /// counter.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                read_request(&mut stream).await;
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses[index.min(responses.len() - 1)];
                let response = format!(
                    "HTTP/1.1 {status} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (format!("http://{addr}/v1/complete"), hits)
    }

    async fn read_request(stream: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            let Ok(n) = stream.read(&mut chunk).await else {
                return;
            };
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    #[tokio::test]
    async fn server_error_then_success_is_retried() {
        let (url, hits) = serve(vec![(503, r#"{"error":"busy"}"#), (200, r#"{"text":"ok"}"#)]).await;
        let http = reqwest::Client::new();
        let reply: Reply = fast_policy()
            .send_json("local", || http.post(&url).json(&serde_json::json!({"prompt": "hi"})))
            .await
            .expect("second attempt succeeds");
        assert_eq!(reply, Reply { text: "ok".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_server_errors_stop_at_the_budget() {
        let (url, hits) = serve(vec![(503, r#"{"error":"busy"}"#)]).await;
        let http = reqwest::Client::new();
        let err = fast_policy()
            .send_json::<Reply, _>("local", || http.post(&url).json(&serde_json::json!({"prompt": "hi"})))
            .await
            .expect_err("budget spent");
        assert!(matches!(err, TransportError::Status { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hits) = serve(vec![(401, r#"{"error":"denied"}"#)]).await;
        let http = reqwest::Client::new();
        let err = fast_policy()
            .send_json::<Reply, _>("local", || http.post(&url).json(&serde_json::json!({"prompt": "hi"})))
            .await
            .expect_err("unauthorized");
        assert!(matches!(err, TransportError::Status { status: 401, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(9), Duration::from_millis(16_000));
    }

    #[test]
    fn retries_throttling_and_server_errors_only() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(policy.should_retry(StatusCode::BAD_GATEWAY));
        assert!(!policy.should_retry(StatusCode::UNAUTHORIZED));
    }
}
