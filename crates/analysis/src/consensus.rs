//! Reduction of crowd votes into one scored answer.
//!
//! [`LlmAdjudicator`] asks the model to weigh the votes; [`MajorityTally`] counts them locally.
//! Both sit behind [`ConsensusStrategy`], and [`adjudicate_or_fallback`] adds the first-vote
//! fallback when the strategy produces nothing.

use crate::config::ConsensusKind;
use crate::model::{clamp_confidence, AdjudicatedAnswer, CrowdVote};
use crate::prompts;
use crate::{AnalysisError, Result};
use async_trait::async_trait;
use lore_llm::{decode_lenient, CompletionClient, CompletionRequest, LlmError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Which reduction produced an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusPath {
    Adjudicated,
    Tallied,
    Fallback,
}

impl ConsensusPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adjudicated => "adjudicated",
            Self::Tallied => "tallied",
            Self::Fallback => "fallback",
        }
    }
}

#[async_trait]
pub trait ConsensusStrategy: Send + Sync {
    /// `None` when no answer could be produced; never a fabricated confidence.
    async fn reduce(
        &self,
        votes: &[CrowdVote],
        prior: Option<&AdjudicatedAnswer>,
        cancel: &CancellationToken,
    ) -> Option<AdjudicatedAnswer>;

    fn path(&self) -> ConsensusPath;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdjudicatorSettings {
    pub max_tokens: u32,
    pub context_size: u32,
    pub timeout: Duration,
    pub retries: u32,
}

/// Single model call over the verbatim votes, retried `retries` extra times.
pub struct LlmAdjudicator {
    client: Arc<dyn CompletionClient>,
    label: String,
    settings: AdjudicatorSettings,
}

#[derive(Debug, Deserialize)]
struct AdjudicatorReply {
    #[serde(flatten)]
    vote: CrowdVote,
    confidence: f64,
}

impl LlmAdjudicator {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        label: impl Into<String>,
        settings: AdjudicatorSettings,
    ) -> Self {
        Self {
            client,
            label: label.into(),
            settings,
        }
    }

    async fn attempt(&self, request: &CompletionRequest) -> lore_llm::Result<AdjudicatedAnswer> {
        let text = tokio::time::timeout(request.timeout, self.client.complete(request))
            .await
            .map_err(|_| LlmError::Timeout(request.timeout))??;
        let reply: AdjudicatorReply = decode_lenient(&text)?;
        if !reply.confidence.is_finite() {
            return Err(LlmError::Parse("confidence is not a number".to_string()));
        }
        if reply.vote.is_empty() {
            return Err(LlmError::Parse("adjudicator answer has no fields".to_string()));
        }
        Ok(AdjudicatedAnswer::from_vote(&reply.vote, reply.confidence))
    }
}

#[async_trait]
impl ConsensusStrategy for LlmAdjudicator {
    async fn reduce(
        &self,
        votes: &[CrowdVote],
        prior: Option<&AdjudicatedAnswer>,
        cancel: &CancellationToken,
    ) -> Option<AdjudicatedAnswer> {
        let request = CompletionRequest::new(self.label.clone(), prompts::adjudicate(votes, prior))
            .with_max_tokens(self.settings.max_tokens)
            .with_context_size(self.settings.context_size)
            .with_timeout(self.settings.timeout)
            .with_temperature(0.0);

        let attempts = self.settings.retries.saturating_add(1);
        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return None,
                outcome = self.attempt(&request) => outcome,
            };
            match outcome {
                Ok(answer) => return Some(answer),
                Err(err) => log::warn!(
                    "Adjudicator '{}' attempt {attempt}/{attempts} failed: {err}",
                    self.label
                ),
            }
        }
        None
    }

    fn path(&self) -> ConsensusPath {
        ConsensusPath::Adjudicated
    }
}

/// Deterministic per-field plurality vote. No model call.
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityTally;

#[async_trait]
impl ConsensusStrategy for MajorityTally {
    async fn reduce(
        &self,
        votes: &[CrowdVote],
        prior: Option<&AdjudicatedAnswer>,
        _cancel: &CancellationToken,
    ) -> Option<AdjudicatedAnswer> {
        tally(votes, prior)
    }

    fn path(&self) -> ConsensusPath {
        ConsensusPath::Tallied
    }
}

pub(crate) fn tally(
    votes: &[CrowdVote],
    prior: Option<&AdjudicatedAnswer>,
) -> Option<AdjudicatedAnswer> {
    if votes.iter().all(CrowdVote::is_empty) && prior.is_none() {
        return None;
    }
    let prior_fields = prior.map(AdjudicatedAnswer::as_vote).unwrap_or_default();
    let prior_fields = prior_fields.fields();

    let mut winners: [String; 4] = Default::default();
    let mut type_support = 0usize;
    for (field, winner) in winners.iter_mut().enumerate() {
        // (lowercased key, first spelling, count) in first-seen order
        let mut counts: Vec<(String, String, usize)> = Vec::new();
        for vote in votes {
            let value = vote.fields()[field].trim();
            if value.is_empty() {
                continue;
            }
            let key = value.to_lowercase();
            match counts.iter_mut().find(|(k, _, _)| *k == key) {
                Some(entry) => entry.2 += 1,
                None => counts.push((key, value.to_string(), 1)),
            }
        }
        let mut best: Option<&(String, String, usize)> = None;
        for entry in &counts {
            if best.map_or(true, |b| entry.2 > b.2) {
                best = Some(entry);
            }
        }
        match best {
            Some((_, spelling, count)) => {
                *winner = spelling.clone();
                if field == 0 {
                    type_support = *count;
                }
            }
            None => *winner = prior_fields[field].trim().to_string(),
        }
    }

    let [project_type, language, framework, purpose] = winners;
    let confidence = if votes.is_empty() {
        0.0
    } else {
        type_support as f64 / votes.len() as f64
    };
    Some(AdjudicatedAnswer {
        project_type,
        language,
        framework,
        purpose,
        confidence: clamp_confidence(confidence),
    })
}

/// Strategy selected by `consensus` in the config.
pub fn strategy_for(
    kind: ConsensusKind,
    client: Arc<dyn CompletionClient>,
    label: &str,
    settings: AdjudicatorSettings,
) -> Box<dyn ConsensusStrategy> {
    match kind {
        ConsensusKind::Adjudicator => Box::new(LlmAdjudicator::new(client, label, settings)),
        ConsensusKind::Tally => Box::new(MajorityTally),
    }
}

/// First vote with any content, at confidence 0.
pub fn fallback_answer(votes: &[CrowdVote]) -> Result<AdjudicatedAnswer> {
    votes
        .iter()
        .find(|vote| !vote.is_empty())
        .map(|vote| AdjudicatedAnswer::from_vote(vote, 0.0))
        .ok_or(AnalysisError::AdjudicationFailure { votes: votes.len() })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    pub answer: AdjudicatedAnswer,
    pub path: ConsensusPath,
}

impl Consensus {
    pub fn is_fallback(&self) -> bool {
        self.path == ConsensusPath::Fallback
    }
}

pub async fn adjudicate_or_fallback(
    strategy: &dyn ConsensusStrategy,
    votes: &[CrowdVote],
    prior: Option<&AdjudicatedAnswer>,
    cancel: &CancellationToken,
) -> Result<Consensus> {
    if let Some(answer) = strategy.reduce(votes, prior, cancel).await {
        return Ok(Consensus {
            answer: answer.clamped(),
            path: strategy.path(),
        });
    }
    if cancel.is_cancelled() {
        return Err(AnalysisError::Cancelled);
    }
    let answer = fallback_answer(votes)?;
    log::warn!(
        "Consensus via {} produced no answer; falling back to first non-empty vote ({})",
        strategy.path().as_str(),
        answer.project_type
    );
    Ok(Consensus {
        answer,
        path: ConsensusPath::Fallback,
    })
}
