//! The four analysis tiers.
//!
//! Every tier turns [`TierInputs`] into a [`TierWork`]: the documents to write, the complete
//! item map for the tier record, and the tier-specific data for the result. Persisting is the
//! cascade's job.
//!
//! Item keys are project-relative paths for per-file work. Keys starting with `@` name
//! tier-level items (consensus, synthesis, drafts) that have no file behind them.

mod deep;
mod detailed;
mod full;
mod quick;

use crate::config::{AnalysisConfig, TierSettings};
use crate::consensus::{AdjudicatorSettings, Consensus};
use crate::context::ProjectContext;
use crate::knowledge::{KnowledgeFiles, ARCHITECTURE, DEEP_DIVE, OVERVIEW, SUMMARY};
use crate::model::{clamp_confidence, AdjudicatedAnswer, Tier, TierStage};
use crate::prompts;
use crate::result::{Finding, RankedFile};
use crate::sampler::Warmup;
use crate::workers::{WorkItem, WorkerPool};
use crate::{AnalysisError, Result};
use lore_indexer::{documents_hash, FileFingerprint, ItemState, RefreshMode, TierRecord};
use lore_llm::{decode_lenient, ChatMessage, CompletionClient, CompletionRequest, LlmError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub(crate) const SYNTHESIS_ITEM: &str = "@synthesis";

/// Rough characters-per-token used to size file excerpts against the context window.
const CHARS_PER_TOKEN: usize = 3;
const PROMPT_RESERVE_CHARS: usize = 2_000;
const MIN_EXCERPT_CHARS: usize = 1_000;
const MAX_EXCERPT_CHARS: usize = 48_000;

pub(crate) struct TierInputs<'a> {
    pub ctx: &'a ProjectContext,
    pub config: &'a AnalysisConfig,
    pub client: &'a Arc<dyn CompletionClient>,
    pub crowd_client: &'a Arc<dyn CompletionClient>,
    pub warmup: &'a Arc<Warmup>,
    /// Documents written by earlier tiers, read from disk.
    pub seed: &'a KnowledgeFiles,
    /// Records of the lower tiers that exist, lowest first.
    pub lower: &'a [TierRecord],
    pub previous: Option<&'a TierRecord>,
    pub mode: RefreshMode,
    pub scan_prior: Option<&'a AdjudicatedAnswer>,
    pub cancel: &'a CancellationToken,
}

impl TierInputs<'_> {
    fn lower_record(&self, tier: Tier) -> Option<&TierRecord> {
        self.lower.iter().find(|record| record.tier == tier.as_str())
    }
}

/// Tier-specific payload of a finished pass.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TierData {
    Quick(Consensus),
    Detailed { top_files: Vec<RankedFile> },
    Deep { examined: Vec<String> },
    Full { top_findings: Vec<Finding> },
}

#[derive(Debug, Clone)]
pub(crate) struct TierWork {
    pub documents: KnowledgeFiles,
    pub items: BTreeMap<String, ItemState>,
    pub confidence: f64,
    pub degraded: bool,
    pub processed: usize,
    pub carried: usize,
    pub failed: usize,
    pub data: TierData,
}

pub(crate) async fn run(tier: Tier, inputs: &TierInputs<'_>) -> Result<TierWork> {
    match tier {
        Tier::Quick => quick::run(inputs).await,
        Tier::Detailed => detailed::run(inputs).await,
        Tier::Deep => deep::run(inputs).await,
        Tier::Full => full::run(inputs).await,
    }
}

/// Rebuild a fresh tier's payload and confidence from its record.
///
/// `None` when the record does not carry enough to serve the tier from cache.
pub(crate) fn restore(
    tier: Tier,
    record: &TierRecord,
    config: &AnalysisConfig,
) -> Option<(TierData, f64)> {
    match tier {
        Tier::Quick => quick::restore(record),
        Tier::Detailed => {
            let confidence = synthesis_confidence(record)?;
            let top_files = rank_files(&record.items, config.top_files);
            Some((TierData::Detailed { top_files }, confidence))
        }
        Tier::Deep => {
            let confidence = synthesis_confidence(record)?;
            Some((
                TierData::Deep {
                    examined: file_keys(record),
                },
                confidence,
            ))
        }
        Tier::Full => full::restore(record),
    }
}

/// Documents a tier is seeded with.
pub(crate) fn seed_documents(tier: Tier) -> &'static [&'static str] {
    match tier {
        Tier::Quick => &[],
        Tier::Detailed => &[OVERVIEW],
        Tier::Deep => &[OVERVIEW, ARCHITECTURE],
        Tier::Full => &[OVERVIEW, ARCHITECTURE, DEEP_DIVE],
    }
}

/// Documents a tier's result exposes; the first is the one the tier always writes.
pub(crate) fn result_documents(tier: Tier) -> &'static [&'static str] {
    match tier {
        Tier::Quick => &[OVERVIEW],
        Tier::Detailed => &[ARCHITECTURE, OVERVIEW],
        Tier::Deep => &[DEEP_DIVE, OVERVIEW, ARCHITECTURE],
        Tier::Full => &[SUMMARY, OVERVIEW, ARCHITECTURE, DEEP_DIVE],
    }
}

/// Identity of what a tier was seeded with: the lower tiers' record stamps plus `extra`.
///
/// Higher tiers revise lower-tier documents in place, so hashing document text would make a
/// tier stale after every run of the tier above it. Record stamps only move when a lower tier
/// actually reruns.
pub(crate) fn seed_hash(lower: &[TierRecord], extra: &[(&str, &str)]) -> Option<String> {
    if lower.is_empty() && extra.is_empty() {
        return None;
    }
    let stamps: Vec<(String, String)> = lower
        .iter()
        .map(|record| {
            (
                record.tier.clone(),
                format!("{}@{}", record.content_hash, record.analyzed_at_unix_ms),
            )
        })
        .collect();
    let entries = stamps
        .iter()
        .map(|(tier, stamp)| (tier.as_str(), stamp.as_str()))
        .chain(extra.iter().copied());
    Some(documents_hash(entries))
}

pub(crate) fn seed_extras(tier: Tier, config: &AnalysisConfig) -> Vec<(&'static str, String)> {
    match tier {
        Tier::Deep => vec![("focus_areas", config.focus_areas.join("\n"))],
        Tier::Full => vec![
            ("final_top_k", config.final_top_k.to_string()),
            ("nl_workers", config.nl_workers.to_string()),
        ],
        Tier::Quick | Tier::Detailed => Vec::new(),
    }
}

/// Copy of `record` without tier-level items, for per-file planning.
pub(crate) fn file_items_only(record: &TierRecord) -> TierRecord {
    let mut record = record.clone();
    record.items.retain(|key, _| !is_tier_item(key));
    record
}

pub(crate) fn is_tier_item(key: &str) -> bool {
    key.starts_with('@')
}

fn file_keys(record: &TierRecord) -> Vec<String> {
    record
        .items
        .keys()
        .filter(|key| !is_tier_item(key))
        .cloned()
        .collect()
}

pub(crate) fn adjudicator_settings(settings: &TierSettings) -> AdjudicatorSettings {
    AdjudicatorSettings {
        max_tokens: settings.adjudicator_max_tokens,
        context_size: settings.context_size,
        timeout: settings.request_timeout,
        retries: settings.adjudicator_retries,
    }
}

fn excerpt_budget(settings: &TierSettings) -> usize {
    (settings.context_size as usize)
        .saturating_mul(CHARS_PER_TOKEN)
        .saturating_sub(PROMPT_RESERVE_CHARS)
        .clamp(MIN_EXCERPT_CHARS, MAX_EXCERPT_CHARS)
}

/// Items produced by one round of per-file workers.
#[derive(Debug, Default)]
struct WorkerPass {
    items: BTreeMap<String, ItemState>,
    processed: usize,
    failed: usize,
}

/// Run one worker per file in `files`.
///
/// Files that cannot be read are recorded as failed without a model call. `normalize` turns a
/// raw reply into the summary stored on the item.
async fn run_file_workers<B, N>(
    inputs: &TierInputs<'_>,
    tier: Tier,
    settings: &TierSettings,
    files: &[FileFingerprint],
    build: B,
    normalize: N,
) -> Result<WorkerPass>
where
    B: Fn(&str, &str) -> Vec<ChatMessage>,
    N: Fn(&str) -> String,
{
    let mut pass = WorkerPass::default();
    if files.is_empty() {
        return Ok(pass);
    }
    let budget = excerpt_budget(settings);
    let hashes: BTreeMap<&str, String> = files
        .iter()
        .map(|file| (file.path.as_str(), file.item_hash()))
        .collect();

    let mut work = Vec::with_capacity(files.len());
    for file in files {
        let Some(content) = inputs.ctx.read_excerpt(&file.path, budget).await else {
            log::warn!("{tier}: cannot read {}", file.path);
            pass.items.insert(
                file.path.clone(),
                ItemState::failed(file.item_hash(), "unreadable file"),
            );
            pass.failed += 1;
            pass.processed += 1;
            continue;
        };
        let request = CompletionRequest::new(
            format!("{tier}/worker/{}", file.path),
            build(&file.path, &content),
        )
        .with_max_tokens(settings.worker_max_tokens)
        .with_context_size(settings.context_size)
        .with_timeout(settings.request_timeout);
        work.push(WorkItem {
            key: file.path.clone(),
            request,
        });
    }

    log::info!(
        "{tier}: running {} workers ({} at a time, {} retries)",
        work.len(),
        settings.worker_concurrency,
        settings.worker_retries
    );
    let pool = WorkerPool::new(
        Arc::clone(inputs.client),
        settings.workers,
        settings.worker_concurrency,
        settings.worker_retries,
    );
    for outcome in pool.run(work, inputs.cancel).await? {
        let hash = hashes.get(outcome.key.as_str()).cloned().unwrap_or_default();
        let state = match &outcome.result {
            Ok(text) => ItemState::succeeded(hash, Some(normalize(text))),
            Err(err) => {
                pass.failed += 1;
                ItemState::failed(hash, err.clone())
            }
        };
        pass.processed += 1;
        pass.items.insert(outcome.key, state);
    }
    Ok(pass)
}

/// Strict tiers abort on any exhausted worker.
fn enforce_worker_policy(tier: Tier, settings: &TierSettings, failed: usize) -> Result<()> {
    if settings.strict_fail && failed > 0 {
        return Err(AnalysisError::tier_failed(
            tier,
            TierStage::Workers,
            failed,
            format!("{failed} workers exhausted their retries"),
        ));
    }
    if failed > 0 {
        log::warn!("{tier}: {failed} workers failed, continuing degraded");
    }
    Ok(())
}

/// Scale confidence by the share of items that succeeded.
fn degrade_confidence(confidence: f64, failed: usize, total: usize) -> f64 {
    if total == 0 || failed == 0 {
        return clamp_confidence(confidence);
    }
    let ok = total.saturating_sub(failed) as f64 / total as f64;
    clamp_confidence(confidence * ok)
}

/// Summary stored on the synthesis item so cached passes can report their confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SynthesisMeta {
    confidence: f64,
    degraded: bool,
}

fn synthesis_item(hash: &str, confidence: f64, degraded: bool) -> ItemState {
    let meta = serde_json::to_string(&SynthesisMeta {
        confidence,
        degraded,
    })
    .ok();
    if degraded {
        // Failed so the next run retries the synthesis; the meta stays for reporting.
        let mut state = ItemState::failed(hash, "synthesis fell back to local composition");
        state.summary = meta;
        state
    } else {
        ItemState::succeeded(hash, meta)
    }
}

fn synthesis_confidence(record: &TierRecord) -> Option<f64> {
    let state = record.items.get(SYNTHESIS_ITEM)?;
    let meta: SynthesisMeta = serde_json::from_str(state.summary.as_deref()?).ok()?;
    Some(clamp_confidence(meta.confidence))
}

#[derive(Debug)]
struct Synthesis {
    documents: KnowledgeFiles,
    confidence: f64,
    /// Composed locally after the model calls failed.
    fallback: bool,
}

#[derive(Debug, Deserialize)]
struct SynthesisReply {
    documents: BTreeMap<String, Value>,
    confidence: f64,
}

/// Ask the model to revise `current` into `expected`, retrying per the tier settings.
///
/// `None` once every attempt failed; the caller decides between failing and composing locally.
async fn synthesize(
    inputs: &TierInputs<'_>,
    tier: Tier,
    settings: &TierSettings,
    task: &str,
    expected: &[&str],
    current: &KnowledgeFiles,
    evidence: &str,
) -> Result<Option<Synthesis>> {
    let adjudicator = adjudicator_settings(settings);
    let request = CompletionRequest::new(
        format!("{tier}/synthesis"),
        prompts::synthesis(task, expected, current, evidence),
    )
    .with_max_tokens(adjudicator.max_tokens)
    .with_context_size(adjudicator.context_size)
    .with_timeout(adjudicator.timeout)
    .with_temperature(0.2);

    let attempts = adjudicator.retries.saturating_add(1);
    for attempt in 1..=attempts {
        let reply = tokio::select! {
            _ = inputs.cancel.cancelled() => return Err(AnalysisError::Cancelled),
            reply = tokio::time::timeout(request.timeout, inputs.client.complete(&request)) => reply,
        };
        let parsed = match reply {
            Ok(Ok(text)) => parse_synthesis(&text, expected),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(LlmError::Timeout(request.timeout)),
        };
        match parsed {
            Ok(synthesis) => return Ok(Some(synthesis)),
            Err(err) => log::warn!("{tier}: synthesis attempt {attempt}/{attempts} failed: {err}"),
        }
    }
    Ok(None)
}

fn parse_synthesis(text: &str, expected: &[&str]) -> lore_llm::Result<Synthesis> {
    let reply: SynthesisReply = decode_lenient(text)?;
    if !reply.confidence.is_finite() {
        return Err(LlmError::Parse("confidence is not a number".to_string()));
    }
    let mut documents = KnowledgeFiles::new();
    for name in expected {
        let body = match reply.documents.get(*name) {
            Some(Value::String(body)) if !body.trim().is_empty() => body.clone(),
            _ => return Err(LlmError::Parse(format!("missing document {name}"))),
        };
        documents.insert((*name).to_string(), ensure_trailing_newline(body));
    }
    Ok(Synthesis {
        documents,
        confidence: clamp_confidence(reply.confidence),
        fallback: false,
    })
}

fn ensure_trailing_newline(mut body: String) -> String {
    if !body.ends_with('\n') {
        body.push('\n');
    }
    body
}

/// Resolve a failed synthesis: strict tiers abort, others compose locally at confidence 0.
fn synthesis_fallback(
    tier: Tier,
    settings: &TierSettings,
    compose: impl FnOnce() -> KnowledgeFiles,
) -> Result<Synthesis> {
    if settings.strict_fail {
        return Err(AnalysisError::tier_failed(
            tier,
            TierStage::Adjudicator,
            1,
            "synthesis exhausted its retries",
        ));
    }
    log::warn!("{tier}: synthesis failed, composing documents locally");
    Ok(Synthesis {
        documents: compose(),
        confidence: 0.0,
        fallback: true,
    })
}

/// Worker summary of one file as stored on its item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FileSummary {
    #[serde(default, deserialize_with = "crate::model::lenient_string")]
    pub summary: String,
    #[serde(default, deserialize_with = "lenient_number")]
    pub importance: f64,
}

impl FileSummary {
    /// Parse a worker reply; prose without JSON becomes the summary at importance 0.
    pub(crate) fn from_reply(text: &str) -> Self {
        match decode_lenient::<FileSummary>(text) {
            Ok(summary) if !summary.summary.trim().is_empty() => Self {
                summary: summary.summary.trim().to_string(),
                importance: summary.importance.clamp(0.0, 10.0),
            },
            _ => Self {
                summary: text.trim().to_string(),
                importance: 0.0,
            },
        }
    }

    pub(crate) fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    let number = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    Ok(if number.is_finite() { number } else { 0.0 })
}

/// Successful file items ranked by importance (ties by path), at most `limit`.
pub(crate) fn rank_files(items: &BTreeMap<String, ItemState>, limit: usize) -> Vec<RankedFile> {
    let mut ranked: Vec<RankedFile> = items
        .iter()
        .filter(|(key, state)| state.success && !is_tier_item(key))
        .filter_map(|(path, state)| {
            let summary: FileSummary = serde_json::from_str(state.summary.as_deref()?).ok()?;
            Some(RankedFile {
                path: path.clone(),
                importance: summary.importance,
                summary: summary.summary,
            })
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.importance
            .total_cmp(&a.importance)
            .then_with(|| a.path.cmp(&b.path))
    });
    ranked.truncate(limit);
    ranked
}

fn log_dropped(tier: Tier, dropped: &[String]) {
    for path in dropped {
        log::info!("{tier}: dropping state for untracked item {path}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn worker_replies_normalize_to_summaries() {
        let parsed = FileSummary::from_reply(r#"ok {"summary": " Entry point ", "importance": "8"}"#);
        assert_eq!(parsed.summary, "Entry point");
        assert_eq!(parsed.importance, 8.0);

        let prose = FileSummary::from_reply("Just some words.");
        assert_eq!(prose.summary, "Just some words.");
        assert_eq!(prose.importance, 0.0);

        let wild = FileSummary::from_reply(r#"{"summary": "x", "importance": 99}"#);
        assert_eq!(wild.importance, 10.0);
    }

    #[test]
    fn ranking_skips_failed_and_tier_items() {
        let mut items = BTreeMap::new();
        let summary = |text: &str, importance: f64| {
            Some(
                FileSummary {
                    summary: text.to_string(),
                    importance,
                }
                .to_json(),
            )
        };
        items.insert("b.rs".to_string(), ItemState::succeeded("h", summary("b", 5.0)));
        items.insert("a.rs".to_string(), ItemState::succeeded("h", summary("a", 5.0)));
        items.insert("c.rs".to_string(), ItemState::succeeded("h", summary("c", 9.0)));
        items.insert("d.rs".to_string(), ItemState::failed("h", "timeout"));
        items.insert(SYNTHESIS_ITEM.to_string(), ItemState::succeeded("h", None));

        let ranked = rank_files(&items, 2);
        let paths: Vec<&str> = ranked.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["c.rs", "a.rs"]);
    }

    #[test]
    fn synthesis_requires_every_expected_document() {
        let reply =
            r##"{"documents": {"overview.md": "# O", "architecture.md": ""}, "confidence": 0.7}"##;
        assert!(parse_synthesis(reply, &[OVERVIEW, ARCHITECTURE]).is_err());

        let parsed = parse_synthesis(reply, &[OVERVIEW]).unwrap();
        assert_eq!(parsed.documents[OVERVIEW], "# O\n");
        assert_eq!(parsed.confidence, 0.7);
    }

    #[test]
    fn degraded_confidence_scales_with_failures() {
        assert_eq!(degrade_confidence(0.8, 0, 4), 0.8);
        assert_eq!(degrade_confidence(0.8, 1, 4), 0.8 * 0.75);
        assert_eq!(degrade_confidence(0.8, 4, 4), 0.0);
    }

    #[test]
    fn seed_hash_moves_with_lower_records() {
        assert_eq!(seed_hash(&[], &[]), None);
        let record = TierRecord {
            schema_version: 1,
            tier: "quick".to_string(),
            content_hash: "abc".to_string(),
            analyzed_at_unix_ms: 10,
            item_count: 0,
            model_id: "m".to_string(),
            seed_hash: None,
            items: BTreeMap::new(),
        };
        let first = seed_hash(std::slice::from_ref(&record), &[]);
        let mut rerun = record.clone();
        rerun.analyzed_at_unix_ms = 11;
        assert_ne!(seed_hash(&[rerun], &[]), first);
        assert_ne!(seed_hash(&[record], &[("focus_areas", "x")]), first);
    }
}
