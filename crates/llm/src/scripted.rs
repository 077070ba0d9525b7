use crate::client::CompletionClient;
use crate::types::CompletionRequest;
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Computes a reply from the request and the zero-based global call index.
pub type Responder = Arc<dyn Fn(&CompletionRequest, usize) -> Result<String> + Send + Sync>;

/// Deterministic in-process client.
///
/// Used by tests and by `LORE_LLM_MODE=stub`. Tracks call counts and peak concurrency so callers
/// can assert on fan-out behaviour.
pub struct ScriptedClient {
    model_id: String,
    responder: Responder,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    labels: Mutex<Vec<String>>,
}

impl std::fmt::Debug for ScriptedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedClient")
            .field("model_id", &self.model_id)
            .field("calls", &self.calls())
            .field("max_in_flight", &self.max_in_flight())
            .finish()
    }
}

impl ScriptedClient {
    pub fn new<F>(model_id: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&CompletionRequest, usize) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            model_id: model_id.into(),
            responder: Arc::new(responder),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            labels: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `reply`.
    pub fn fixed(model_id: impl Into<String>, reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(model_id, move |_, _| Ok(reply.clone()))
    }

    /// Hold every call for `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Labels of every call so far, in arrival order.
    pub fn labels(&self) -> Vec<String> {
        self.labels
            .lock()
            .map(|labels| labels.clone())
            .unwrap_or_default()
    }

    pub fn calls_with_prefix(&self, prefix: &str) -> usize {
        self.labels()
            .iter()
            .filter(|label| label.starts_with(prefix))
            .count()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut labels) = self.labels.lock() {
            labels.push(request.label.clone());
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(request, index)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;
    use crate::LlmError;
    use pretty_assertions::assert_eq;

    fn request(label: &str) -> CompletionRequest {
        CompletionRequest::new(label, vec![ChatMessage::user("classify")])
    }

    #[tokio::test]
    async fn routes_by_label_and_counts_calls() {
        let client = ScriptedClient::new("stub", |req, _| {
            if req.label.starts_with("adjudicate") {
                Err(LlmError::Transport("down".to_string()))
            } else {
                Ok("{}".to_string())
            }
        });

        assert_eq!(client.complete(&request("crowd/0")).await.unwrap(), "{}");
        assert!(client.complete(&request("adjudicate/scan")).await.is_err());
        assert_eq!(client.calls(), 2);
        assert_eq!(client.calls_with_prefix("crowd/"), 1);
        assert_eq!(client.labels(), vec!["crowd/0", "adjudicate/scan"]);
    }

    #[tokio::test]
    async fn tracks_peak_concurrency() {
        let client = Arc::new(
            ScriptedClient::fixed("stub", "ok").with_delay(Duration::from_millis(30)),
        );
        let mut handles = Vec::new();
        for i in 0..4 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client.complete(&request(&format!("crowd/{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(client.max_in_flight(), 4);
        assert_eq!(client.in_flight.load(Ordering::SeqCst), 0);
    }
}
