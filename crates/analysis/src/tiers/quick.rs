use super::{adjudicator_settings, TierData, TierInputs, TierWork};
use crate::consensus::{fallback_answer, strategy_for, Consensus, ConsensusPath};
use crate::knowledge::{KnowledgeFiles, OVERVIEW};
use crate::model::{AdjudicatedAnswer, Tier, TierStage};
use crate::prompts;
use crate::sampler::{CrowdCallSettings, CrowdSampler};
use crate::{AnalysisError, Result};
use lore_indexer::{ItemState, RefreshMode, TierRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(super) const CONSENSUS_ITEM: &str = "@consensus";

#[derive(Debug, Serialize, Deserialize)]
struct ConsensusSnapshot {
    answer: AdjudicatedAnswer,
    path: ConsensusPath,
}

pub(super) async fn run(inputs: &TierInputs<'_>) -> Result<TierWork> {
    let settings = &inputs.config.quick;
    let crowd = &inputs.config.crowd;
    let sampler = CrowdSampler::new(
        Arc::clone(inputs.crowd_client),
        crowd.quorum,
        CrowdCallSettings {
            max_tokens: settings.worker_max_tokens,
            context_size: settings.context_size,
            timeout: settings.request_timeout,
            temperature: Some(crowd.temperature),
        },
        Arc::clone(inputs.warmup),
    );

    let batch = sampler
        .sample(
            Tier::Quick.as_str(),
            prompts::crowd(inputs.ctx),
            settings.workers,
            settings.worker_concurrency,
            inputs.cancel,
        )
        .await
        .map_err(|err| match err {
            AnalysisError::QuorumFailure {
                failures,
                total,
                threshold,
            } => AnalysisError::tier_failed(
                Tier::Quick,
                TierStage::Crowd,
                failures,
                format!("{failures} of {total} crowd calls failed (threshold {threshold})"),
            ),
            other => other,
        })?;

    let strategy = strategy_for(
        inputs.config.consensus,
        Arc::clone(inputs.client),
        "quick/adjudicate",
        adjudicator_settings(settings),
    );
    let own_prior = match inputs.mode {
        RefreshMode::Incremental => inputs.previous.and_then(previous_answer),
        RefreshMode::Reset => None,
    };
    let prior = own_prior.as_ref().or(inputs.scan_prior);
    let consensus = match strategy.reduce(&batch.votes, prior, inputs.cancel).await
    {
        Some(answer) => Consensus {
            answer: answer.clamped(),
            path: strategy.path(),
        },
        None if inputs.cancel.is_cancelled() => return Err(AnalysisError::Cancelled),
        None if settings.strict_fail => {
            return Err(AnalysisError::tier_failed(
                Tier::Quick,
                TierStage::Adjudicator,
                1,
                "adjudicator exhausted its retries",
            ))
        }
        None => {
            let answer = fallback_answer(&batch.votes).map_err(|err| {
                AnalysisError::tier_failed(Tier::Quick, TierStage::Adjudicator, 1, err.to_string())
            })?;
            log::warn!("quick: adjudication failed, using first non-empty vote");
            Consensus {
                answer,
                path: ConsensusPath::Fallback,
            }
        }
    };

    let degraded = consensus.is_fallback();
    let mut documents = KnowledgeFiles::new();
    documents.insert(
        OVERVIEW.to_string(),
        render_overview(&consensus, inputs.ctx.file_count()),
    );

    let snapshot = serde_json::to_string(&ConsensusSnapshot {
        answer: consensus.answer.clone(),
        path: consensus.path,
    })
    .ok();
    let hash = &inputs.ctx.fingerprint.content_hash;
    let state = if degraded {
        let mut state = ItemState::failed(hash.as_str(), "adjudication fell back to first vote");
        state.summary = snapshot;
        state
    } else {
        ItemState::succeeded(hash.as_str(), snapshot)
    };
    let mut items = BTreeMap::new();
    items.insert(CONSENSUS_ITEM.to_string(), state);

    log::info!(
        "quick: {} / {} / {} (confidence {:.2}, {}, {} of {} crowd calls failed)",
        consensus.answer.project_type,
        consensus.answer.language,
        consensus.answer.framework,
        consensus.answer.confidence,
        consensus.path.as_str(),
        batch.failures,
        batch.votes.len()
    );

    Ok(TierWork {
        documents,
        items,
        confidence: consensus.answer.confidence,
        degraded,
        processed: 1,
        carried: 0,
        failed: usize::from(degraded),
        data: TierData::Quick(consensus),
    })
}

fn read_snapshot(record: &TierRecord) -> Option<ConsensusSnapshot> {
    let state = record.items.get(CONSENSUS_ITEM)?;
    serde_json::from_str(state.summary.as_deref()?).ok()
}

/// Answer of the last quick pass; the baseline for the next one.
fn previous_answer(record: &TierRecord) -> Option<AdjudicatedAnswer> {
    read_snapshot(record).map(|snapshot| snapshot.answer)
}

pub(super) fn restore(record: &TierRecord) -> Option<(TierData, f64)> {
    let snapshot = read_snapshot(record)?;
    let confidence = snapshot.answer.confidence;
    Some((
        TierData::Quick(Consensus {
            answer: snapshot.answer,
            path: snapshot.path,
        }),
        confidence,
    ))
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        "unknown"
    } else {
        value
    }
}

fn render_overview(consensus: &Consensus, file_count: usize) -> String {
    let answer = &consensus.answer;
    format!(
        "# Overview\n\n\
         - **Type:** {}\n\
         - **Language:** {}\n\
         - **Framework:** {}\n\
         - **Purpose:** {}\n\n\
         _{file_count} tracked files. Confidence {:.2} ({})._\n",
        or_unknown(&answer.project_type),
        or_unknown(&answer.language),
        or_unknown(&answer.framework),
        or_unknown(&answer.purpose),
        answer.confidence,
        consensus.path.as_str(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overview_marks_missing_fields() {
        let consensus = Consensus {
            answer: AdjudicatedAnswer {
                project_type: "cli".to_string(),
                language: "go".to_string(),
                confidence: 0.0,
                ..AdjudicatedAnswer::default()
            },
            path: ConsensusPath::Fallback,
        };
        let doc = render_overview(&consensus, 3);
        assert!(doc.contains("- **Framework:** unknown\n"));
        assert!(doc.contains("_3 tracked files. Confidence 0.00 (fallback)._"));
    }
}
