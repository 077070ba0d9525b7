//! Tier cascade: runs one or more tiers in order, serving fresh tiers from cache.
//!
//! ```text
//! request ──> permission (user runs only)
//!         ──> session mutex + project lock
//!         ──> ProjectContext (listing, fingerprint)
//!         ──> for each tier:
//!               TierCache::check ── fresh ──> restore from record + knowledge files
//!                                └─ stale ──> tiers::run ──> knowledge files ──> TierRecord
//!               health.json
//! ```

use crate::context::{canonical_root, ProjectContext};
use crate::engine::Services;
use crate::knowledge::{read_knowledge, write_knowledge, KnowledgeFiles};
use crate::model::{AdjudicatedAnswer, Tier, TierStage};
use crate::permission::{ensure_permitted, Initiator};
use crate::result::{AnalysisResult, TierOutcome};
use crate::scan::read_scan_record;
use crate::tiers::{self, TierData, TierInputs};
use crate::{AnalysisError, Result};
use lore_indexer::{
    acquire_project_lock, record_tier_failure, record_tier_success, RefreshMode, StaleReason,
    TierCache, TierCheck, TierRecord, TierRunStats,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How far a cascade continues past its start tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Continuation {
    /// Run the start tier only.
    #[default]
    None,
    /// Run every tier after the start tier.
    All,
    /// Run up to and including the given tier.
    UpTo(Tier),
}

impl Continuation {
    #[must_use]
    pub fn tiers_from(self, start: Tier) -> Vec<Tier> {
        match self {
            Self::None => vec![start],
            Self::All => start.through(Tier::Full),
            Self::UpTo(last) => start.through(last),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CascadeRequest {
    pub project: PathBuf,
    pub tier: Tier,
    pub continuation: Continuation,
    /// Ignore fresh records and rerun, still carrying unchanged items.
    pub force: bool,
    /// Rerun from scratch without carrying any item.
    pub reset: bool,
    pub initiator: Initiator,
}

impl CascadeRequest {
    pub fn new(project: impl Into<PathBuf>, tier: Tier) -> Self {
        Self {
            project: project.into(),
            tier,
            continuation: Continuation::None,
            force: false,
            reset: false,
            initiator: Initiator::User,
        }
    }

    #[must_use]
    pub fn continue_all(mut self) -> Self {
        self.continuation = Continuation::All;
        self
    }

    #[must_use]
    pub fn continue_to(mut self, last: Tier) -> Self {
        self.continuation = Continuation::UpTo(last);
        self
    }

    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    #[must_use]
    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    #[must_use]
    pub fn with_initiator(mut self, initiator: Initiator) -> Self {
        self.initiator = initiator;
        self
    }
}

/// Freshness of one tier against the current project state.
#[derive(Debug, Clone)]
pub(crate) struct TierProbe {
    pub cache: TierCache,
    pub lower: Vec<TierRecord>,
    pub seed_hash: Option<String>,
    pub model_id: String,
    pub check: TierCheck,
}

/// Model identity a tier's record is keyed on. Quick mixes in the crowd model when it differs.
pub(crate) fn model_id_for(services: &Services, tier: Tier) -> String {
    let main = services.client.model_id();
    let crowd = services.crowd_client.model_id();
    if tier == Tier::Quick && crowd != main {
        format!("{main}+{crowd}")
    } else {
        main.to_string()
    }
}

/// Records of every tier below `tier` that exist and decode, lowest first.
async fn load_lower_records(root: &Path, tier: Tier) -> Result<Vec<TierRecord>> {
    let mut lower = Vec::new();
    for below in Tier::ALL.iter().copied().filter(|t| *t < tier) {
        if let Some(record) = TierCache::new(root, below.as_str()).load().await?.into_option() {
            lower.push(record);
        }
    }
    Ok(lower)
}

pub(crate) async fn probe_tier(
    services: &Services,
    ctx: &ProjectContext,
    tier: Tier,
    force: bool,
) -> Result<TierProbe> {
    let cache = TierCache::new(&ctx.root, tier.as_str());
    let lower = load_lower_records(&ctx.root, tier).await?;
    let extras = tiers::seed_extras(tier, &services.config);
    let extra_refs: Vec<(&str, &str)> = extras.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let seed_hash = tiers::seed_hash(&lower, &extra_refs);
    let model_id = model_id_for(services, tier);
    let check = cache
        .check(&ctx.fingerprint, &model_id, seed_hash.as_deref(), force)
        .await?;
    Ok(TierProbe {
        cache,
        lower,
        seed_hash,
        model_id,
        check,
    })
}

pub struct TierCascade {
    services: Arc<Services>,
}

impl TierCascade {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Run every tier the request names, in order. Stops at the first failed tier.
    pub async fn run(
        &self,
        request: &CascadeRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<AnalysisResult>> {
        let services = &self.services;
        let plan = request.continuation.tiers_from(request.tier);
        let root = canonical_root(&request.project).await?;
        let names: Vec<&str> = plan.iter().map(|tier| tier.as_str()).collect();
        ensure_permitted(
            services.gate.as_ref(),
            request.initiator,
            "analyze",
            &root,
            format!("tiers: {}", names.join(" -> ")),
        )
        .await?;

        let session = services.sessions.session(&root);
        let _analysis = session.analysis.lock().await;
        let lock = acquire_project_lock(&root).await?;
        if lock.waited_ms() > 0 {
            log::info!("analyze: waited {} ms for the project lock", lock.waited_ms());
        }

        let ctx = ProjectContext::collect(&root, services.lister.as_ref()).await?;
        let scan_prior = read_scan_record(&root).await?.map(|record| record.answer);

        let mut results = Vec::with_capacity(plan.len());
        for tier in plan {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            let result = match self
                .run_tier(tier, &ctx, request, scan_prior.as_ref(), cancel)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    note_failure(&root, tier, &err).await;
                    return Err(err);
                }
            };
            session.record_tier(tier);
            results.push(result);
        }
        Ok(results)
    }

    async fn run_tier(
        &self,
        tier: Tier,
        ctx: &ProjectContext,
        request: &CascadeRequest,
        scan_prior: Option<&AdjudicatedAnswer>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult> {
        let started = Instant::now();
        let services = &self.services;
        let config = &services.config;
        let probe = probe_tier(services, ctx, tier, request.force || request.reset).await?;

        if probe.check.is_fresh() {
            if let Some(result) = self.serve_cached(tier, ctx, &probe, started).await {
                return Ok(result);
            }
            log::info!("{tier}: record is fresh but its documents are missing; recomputing");
        }

        let seed = read_knowledge(&ctx.root, tiers::seed_documents(tier)).await;
        let mode = if request.reset {
            RefreshMode::Reset
        } else {
            RefreshMode::Incremental
        };
        log::info!("{tier}: starting on {} files", ctx.file_count());
        let work = tiers::run(
            tier,
            &TierInputs {
                ctx,
                config,
                client: &services.client,
                crowd_client: &services.crowd_client,
                warmup: &services.warmup,
                seed: &seed,
                lower: &probe.lower,
                previous: probe.check.previous.as_ref(),
                mode,
                scan_prior,
                cancel,
            },
        )
        .await?;

        let record = probe.cache.build_record(
            &ctx.fingerprint,
            &probe.model_id,
            probe.seed_hash.clone(),
            work.items,
        );
        let persisted = async {
            write_knowledge(&ctx.root, &work.documents).await?;
            probe.cache.save(&record).await.map_err(AnalysisError::from)
        };
        if let Err(err) = persisted.await {
            return Err(AnalysisError::tier_failed(
                tier,
                TierStage::Persist,
                1,
                err.to_string(),
            ));
        }

        let duration = started.elapsed();
        let stats = TierRunStats {
            duration_ms: duration_ms(duration),
            processed: work.processed,
            carried: work.carried,
            failed: work.failed,
            cached: false,
        };
        note_success(&ctx.root, tier, stats).await;
        log::info!(
            "{tier}: finished in {} ms ({} processed, {} carried, {} failed{})",
            stats.duration_ms,
            work.processed,
            work.carried,
            work.failed,
            if work.degraded { ", degraded" } else { "" }
        );

        let knowledge_files = read_knowledge(&ctx.root, tiers::result_documents(tier)).await;
        let outcome = TierOutcome {
            tier,
            project_path: ctx.root.clone(),
            duration,
            knowledge_files,
            cached: false,
            degraded: work.degraded,
            confidence: work.confidence,
            processed: work.processed,
            carried: work.carried,
            failed: work.failed,
            stale_reasons: probe.check.assessment.reasons.clone(),
        };
        Ok(build_result(outcome, work.data, &config.focus_areas))
    }

    /// Result rebuilt from a fresh record, or `None` when the record or its documents fall
    /// short and the tier has to run.
    async fn serve_cached(
        &self,
        tier: Tier,
        ctx: &ProjectContext,
        probe: &TierProbe,
        started: Instant,
    ) -> Option<AnalysisResult> {
        let record = probe.check.previous.as_ref()?;
        let (data, confidence) = tiers::restore(tier, record, &self.services.config)?;
        let documents = tiers::result_documents(tier);
        let knowledge_files: KnowledgeFiles = read_knowledge(&ctx.root, documents).await;
        if !knowledge_files.contains_key(documents[0]) {
            return None;
        }

        let carried = record.items.len();
        let duration = started.elapsed();
        note_success(
            &ctx.root,
            tier,
            TierRunStats {
                duration_ms: duration_ms(duration),
                processed: 0,
                carried,
                failed: 0,
                cached: true,
            },
        )
        .await;
        log::info!("{tier}: fresh, served from cache ({carried} items)");

        let outcome = TierOutcome {
            tier,
            project_path: ctx.root.clone(),
            duration,
            knowledge_files,
            cached: true,
            degraded: false,
            confidence,
            processed: 0,
            carried,
            failed: 0,
            stale_reasons: Vec::<StaleReason>::new(),
        };
        Some(build_result(outcome, data, &self.services.config.focus_areas))
    }
}

fn build_result(outcome: TierOutcome, data: TierData, focus_areas: &[String]) -> AnalysisResult {
    match data {
        TierData::Quick(consensus) => AnalysisResult::Quick {
            outcome,
            answer: consensus.answer,
            consensus: consensus.path,
        },
        TierData::Detailed { top_files } => AnalysisResult::Detailed { outcome, top_files },
        TierData::Deep { examined } => AnalysisResult::Deep {
            outcome,
            focus_areas: focus_areas.to_vec(),
            examined,
        },
        TierData::Full { top_findings } => AnalysisResult::Full {
            outcome,
            top_findings,
        },
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn note_success(root: &Path, tier: Tier, stats: TierRunStats) {
    if let Err(err) = record_tier_success(root, tier.as_str(), stats).await {
        log::warn!("{tier}: failed to update health snapshot: {err}");
    }
}

async fn note_failure(root: &Path, tier: Tier, err: &AnalysisError) {
    let (stage, failures, detail) = match err {
        AnalysisError::Cancelled | AnalysisError::PermissionDenied { .. } => return,
        AnalysisError::TierFailed {
            stage,
            failures,
            detail,
            ..
        } => (stage.as_str(), *failures, detail.clone()),
        other => ("run", 1, other.to_string()),
    };
    log::warn!("{tier}: failed at {stage}: {detail}");
    if let Err(err) = record_tier_failure(root, tier.as_str(), stage, failures, &detail).await {
        log::warn!("{tier}: failed to update health snapshot: {err}");
    }
}
