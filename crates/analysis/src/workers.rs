use crate::{AnalysisError, Result};
use lore_llm::{CompletionClient, CompletionRequest, LlmError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One model call keyed by the item it describes.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub key: String,
    pub request: CompletionRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkOutcome {
    pub key: String,
    pub result: std::result::Result<String, String>,
    pub attempts: u32,
}

impl WorkOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Fixed set of workers draining a shared queue of per-item calls.
pub struct WorkerPool {
    client: Arc<dyn CompletionClient>,
    workers: usize,
    concurrency: usize,
    retries: u32,
}

impl WorkerPool {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        workers: usize,
        concurrency: usize,
        retries: u32,
    ) -> Self {
        Self {
            client,
            workers: workers.max(1),
            concurrency: concurrency.max(1),
            retries,
        }
    }

    /// Runs every item, retrying each up to `retries` extra times.
    ///
    /// Outcomes come back in input order. Per-item failures are reported in the outcome, not
    /// as an error; only cancellation fails the whole run.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkOutcome>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let total = items.len();
        let queue: Arc<Mutex<VecDeque<(usize, WorkItem)>>> =
            Arc::new(Mutex::new(items.into_iter().enumerate().collect()));
        let results: Arc<Mutex<Vec<Option<WorkOutcome>>>> = Arc::new(Mutex::new(vec![None; total]));
        let semaphore = Arc::new(Semaphore::new(self.concurrency.min(total)));

        let mut tasks = JoinSet::new();
        for _ in 0..self.workers.min(total) {
            let client = Arc::clone(&self.client);
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let retries = self.retries;
            tasks.spawn(async move {
                loop {
                    let next = queue.lock().ok().and_then(|mut q| q.pop_front());
                    let Some((idx, item)) = next else { break };
                    let _permit = tokio::select! {
                        _ = cancel.cancelled() => return,
                        permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return,
                        },
                    };
                    let Some(outcome) = run_item(client.as_ref(), item, retries, &cancel).await
                    else {
                        return;
                    };
                    if let Ok(mut results) = results.lock() {
                        results[idx] = Some(outcome);
                    }
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                log::warn!("Worker task aborted: {err}");
            }
        }
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let results = results
            .lock()
            .map(|results| results.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        let outcomes: Vec<WorkOutcome> = results.into_iter().flatten().collect();
        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        log::debug!("Worker pool finished {total} items ({failed} failed)");
        Ok(outcomes)
    }
}

/// `None` when cancelled mid-item.
async fn run_item(
    client: &dyn CompletionClient,
    item: WorkItem,
    retries: u32,
    cancel: &CancellationToken,
) -> Option<WorkOutcome> {
    let attempts = retries.saturating_add(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let timeout: Duration = item.request.timeout;
        let reply = tokio::select! {
            _ = cancel.cancelled() => return None,
            reply = tokio::time::timeout(timeout, client.complete(&item.request)) => reply,
        };
        let reply = match reply {
            Ok(Ok(text)) if text.trim().is_empty() => {
                Err(LlmError::Parse("empty reply".to_string()))
            }
            Ok(other) => other,
            Err(_) => Err(LlmError::Timeout(timeout)),
        };
        match reply {
            Ok(text) => {
                return Some(WorkOutcome {
                    key: item.key,
                    result: Ok(text),
                    attempts: attempt,
                })
            }
            Err(err) => {
                log::debug!(
                    "Worker '{}' attempt {attempt}/{attempts} failed: {err}",
                    item.request.label
                );
                last_error = err.to_string();
            }
        }
    }
    log::warn!("Worker '{}' gave up: {last_error}", item.request.label);
    Some(WorkOutcome {
        key: item.key,
        result: Err(last_error),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lore_llm::{ChatMessage, ScriptedClient};
    use pretty_assertions::assert_eq;

    fn item(key: &str) -> WorkItem {
        WorkItem {
            key: key.to_string(),
            request: CompletionRequest::new(
                format!("detailed/worker/{key}"),
                vec![ChatMessage::user(key)],
            ),
        }
    }

    #[tokio::test]
    async fn outcomes_keep_input_order_and_bound_concurrency() {
        let client = Arc::new(
            ScriptedClient::new("m", |req, _| {
                Ok(format!("summary of {}", req.user_prompt().unwrap_or_default()))
            })
                .with_delay(Duration::from_millis(5)),
        );
        let pool = WorkerPool::new(client.clone(), 4, 2, 0);
        let keys = ["a.rs", "b.rs", "c.rs", "d.rs", "e.rs"];
        let outcomes = pool
            .run(keys.iter().map(|k| item(k)).collect(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcomes.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(),
            keys.to_vec()
        );
        assert_eq!(outcomes[2].result, Ok("summary of c.rs".to_string()));
        assert!(client.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn retries_then_reports_failure() {
        let client = Arc::new(ScriptedClient::new("m", |req, _| {
            if req.label.ends_with("bad.rs") {
                Ok("   ".to_string())
            } else {
                Ok("fine".to_string())
            }
        }));
        let pool = WorkerPool::new(client.clone(), 2, 2, 2);
        let outcomes = pool
            .run(vec![item("bad.rs"), item("good.rs")], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcomes[0].attempts, 3);
        assert!(outcomes[0].result.is_err());
        assert_eq!(outcomes[1].attempts, 1);
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn cancellation_fails_the_run() {
        let client = Arc::new(ScriptedClient::fixed("m", "x").with_delay(Duration::from_secs(30)));
        let pool = WorkerPool::new(client, 2, 2, 0);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = pool.run(vec![item("a"), item("b")], &cancel).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
    }
}
