use crate::config::QuorumPolicy;
use crate::model::CrowdVote;
use crate::{AnalysisError, Result};
use lore_llm::{decode_lenient, ChatMessage, CompletionClient, CompletionRequest, LlmError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One-time delay before a client's first batch, shared by every sampler on that client.
#[derive(Debug, Default)]
pub struct Warmup {
    delay: Duration,
    done: OnceCell<()>,
}

impl Warmup {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            done: OnceCell::new(),
        }
    }

    async fn ensure(&self, cancel: &CancellationToken) -> Result<()> {
        if self.delay.is_zero() {
            return Ok(());
        }
        let delay = self.delay;
        tokio::select! {
            _ = cancel.cancelled() => Err(AnalysisError::Cancelled),
            _ = self.done.get_or_init(|| async move {
                log::debug!("Warming up model client for {delay:?}");
                tokio::time::sleep(delay).await;
            }) => Ok(()),
        }
    }
}

/// Per-call knobs of a crowd batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CrowdCallSettings {
    pub max_tokens: u32,
    pub context_size: u32,
    pub timeout: Duration,
    pub temperature: Option<f32>,
}

/// Votes in worker-index order plus the number of failed workers.
///
/// A failed worker's slot holds an empty vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrowdBatch {
    pub votes: Vec<CrowdVote>,
    pub failures: usize,
}

pub struct CrowdSampler {
    client: Arc<dyn CompletionClient>,
    quorum: QuorumPolicy,
    call: CrowdCallSettings,
    warmup: Arc<Warmup>,
}

impl CrowdSampler {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        quorum: QuorumPolicy,
        call: CrowdCallSettings,
        warmup: Arc<Warmup>,
    ) -> Self {
        Self {
            client,
            quorum,
            call,
            warmup,
        }
    }

    /// Fan `n` independent classification calls out over at most `min(concurrency, n)` slots.
    ///
    /// Worker failures (transport, timeout, undecodable or all-empty reply) become empty votes.
    /// The batch only fails when failures exceed the quorum threshold or `cancel` fires.
    pub async fn sample(
        &self,
        label: &str,
        messages: Vec<ChatMessage>,
        n: usize,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<CrowdBatch> {
        if n == 0 {
            return Err(AnalysisError::Config("crowd size must be at least 1".to_string()));
        }
        self.warmup.ensure(cancel).await?;

        let permits = concurrency.clamp(1, n);
        let semaphore = Arc::new(Semaphore::new(permits));
        let slots: Arc<Mutex<Vec<Option<CrowdVote>>>> = Arc::new(Mutex::new(vec![None; n]));
        let messages = Arc::new(messages);
        log::debug!(
            "Sampling {n} votes for '{label}' with {permits} concurrent calls on {}",
            self.client.model_id()
        );

        let mut tasks = JoinSet::new();
        for idx in 0..n {
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let slots = Arc::clone(&slots);
            let cancel = cancel.clone();
            let mut request =
                CompletionRequest::new(format!("{label}/crowd/{idx}"), messages.as_ref().clone())
                    .with_max_tokens(self.call.max_tokens)
                    .with_context_size(self.call.context_size)
                    .with_timeout(self.call.timeout);
            request.temperature = self.call.temperature;

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                let reply = tokio::select! {
                    _ = cancel.cancelled() => return,
                    reply = tokio::time::timeout(request.timeout, client.complete(&request)) => reply,
                };
                let vote = match reply {
                    Ok(Ok(text)) => decode_lenient::<CrowdVote>(&text).and_then(|vote| {
                        if vote.is_empty() {
                            Err(LlmError::Parse("vote has no fields".to_string()))
                        } else {
                            Ok(vote)
                        }
                    }),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(LlmError::Timeout(request.timeout)),
                };
                match vote {
                    Ok(vote) => {
                        if let Ok(mut slots) = slots.lock() {
                            slots[idx] = Some(vote);
                        }
                    }
                    Err(err) => log::debug!("Crowd worker {} failed: {err}", request.label),
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                log::warn!("Crowd worker task for '{label}' aborted: {err}");
            }
        }
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let slots = slots
            .lock()
            .map(|slots| slots.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        let failures = slots.iter().filter(|slot| slot.is_none()).count();
        let threshold = self.quorum.threshold(n);
        if !self.quorum.is_met(failures, n) {
            log::warn!("Crowd '{label}' lost quorum: {failures}/{n} failed (threshold {threshold})");
            return Err(AnalysisError::QuorumFailure {
                failures,
                total: n,
                threshold,
            });
        }
        if failures > 0 {
            log::info!("Crowd '{label}': {failures}/{n} workers failed, quorum held");
        }

        Ok(CrowdBatch {
            votes: slots.into_iter().map(Option::unwrap_or_default).collect(),
            failures,
        })
    }
}
