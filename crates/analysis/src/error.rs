use crate::model::{Tier, TierStage};
use lore_indexer::IndexerError;
use lore_llm::LlmError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("LLM transport error: {0}")]
    Transport(#[source] LlmError),

    #[error("Malformed model output: {0}")]
    Parse(String),

    #[error("Crowd quorum not met: {failures} of {total} calls failed (threshold {threshold})")]
    QuorumFailure {
        failures: usize,
        total: usize,
        threshold: usize,
    },

    #[error("Adjudication failed: none of {votes} votes carried an answer")]
    AdjudicationFailure { votes: usize },

    #[error("Permission denied: {action}")]
    PermissionDenied { action: String },

    #[error("Tier '{tier}' failed at stage '{stage}' ({failures} failures): {detail}")]
    TierFailed {
        tier: Tier,
        stage: TierStage,
        failures: usize,
        detail: String,
    },

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Indexer error: {0}")]
    Indexer(#[from] IndexerError),
}

impl From<LlmError> for AnalysisError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Parse(detail) => Self::Parse(detail),
            LlmError::Config(detail) => Self::Config(detail),
            other => Self::Transport(other),
        }
    }
}

impl From<std::io::Error> for AnalysisError {
    fn from(err: std::io::Error) -> Self {
        Self::Indexer(IndexerError::IoError(err))
    }
}

impl AnalysisError {
    pub(crate) fn tier_failed(
        tier: Tier,
        stage: TierStage,
        failures: usize,
        detail: impl Into<String>,
    ) -> Self {
        Self::TierFailed {
            tier,
            stage,
            failures,
            detail: detail.into(),
        }
    }
}
