use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{CompletionClient, CompletionRequest};
use crate::error::TransportError;

type Responder = dyn Fn(&CompletionRequest<'_>) -> Result<String, TransportError> + Send + Sync;

/// A prompt observed by [`ScriptedClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// System instruction sent.
    pub system: String,
    /// User prompt sent.
    pub user: String,
    /// Sampling temperature requested.
    pub temperature: f32,
    /// Output token bound requested.
    pub max_output_tokens: usize,
}

/// Offline client that answers from a closure or a fixed queue of replies.
///
/// Used for dry runs and for exercising the regeneration loop without a
/// network. Every request is recorded for later inspection.
pub struct ScriptedClient {
    responder: Box<Responder>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedClient {
    /// Answers every request with `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest<'_>) -> Result<String, TransportError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replays `responses` in order and fails once they run out.
    pub fn from_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue: Mutex<VecDeque<String>> =
            Mutex::new(responses.into_iter().map(Into::into).collect());
        Self::new(move |_| {
            lock(&queue)
                .pop_front()
                .ok_or_else(|| TransportError::Exhausted("no scripted responses left".to_string()))
        })
    }

    /// Snapshot of every request seen so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Number of requests seen so far.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, TransportError> {
        lock(&self.calls).push(RecordedCall {
            system: request.system.to_string(),
            user: request.user.to_string(),
            temperature: request.temperature,
            max_output_tokens: request.max_output_tokens,
        });
        (self.responder)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: &str) -> CompletionRequest<'_> {
        CompletionRequest {
            system: "sys",
            user,
            max_output_tokens: 10,
            temperature: 0.0,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn replays_queue_then_fails() {
        let client = ScriptedClient::from_responses(["one", "two"]);
        assert_eq!(client.complete(&request("a")).await.expect("first"), "one");
        assert_eq!(client.complete(&request("b")).await.expect("second"), "two");
        assert!(client.complete(&request("c")).await.is_err());
        assert_eq!(client.call_count(), 3);
        assert_eq!(client.calls()[1].user, "b");
    }
}
