//! # Lore Analysis
//!
//! Tiered, crowd-sourced project analysis with incremental caching.
//!
//! ## Flow
//!
//! ```text
//! scan ──> CrowdSampler (N cheap votes) ──> ConsensusStrategy ──> .lore/scan.json
//!
//! analyze ──> TierCascade
//!               ├─> quick     crowd + consensus        ──> overview.md
//!               ├─> detailed  per-file summary workers ──> architecture.md (+ overview)
//!               ├─> deep      focus-area reviews       ──> deep-dive.md (+ earlier docs)
//!               └─> full      findings + drafts        ──> summary.md (+ every doc)
//! ```
//!
//! Each tier keeps a [`lore_indexer::TierRecord`]; a tier whose record is fresh is served from
//! disk without a model call, and a stale one only reprocesses changed or failed items.
//!
//! ## Example
//!
//! ```no_run
//! use lore_analysis::{AnalysisConfig, CascadeRequest, Engine, Initiator, Tier};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> lore_analysis::Result<()> {
//!     let root = Path::new("/path/to/project");
//!     let engine = Engine::builder(AnalysisConfig::load(root, None)?).build()?;
//!     let cancel = CancellationToken::new();
//!
//!     let request = CascadeRequest::new(root, Tier::Quick)
//!         .continue_to(Tier::Detailed)
//!         .with_initiator(Initiator::System);
//!     for result in engine.analyze(&request, &cancel).await? {
//!         println!("{}", result.format_for_prompt());
//!     }
//!     Ok(())
//! }
//! ```

mod cascade;
mod config;
mod consensus;
mod context;
mod engine;
mod error;
mod knowledge;
mod model;
mod permission;
mod prompts;
mod result;
mod sampler;
mod scan;
mod session;
pub mod stub;
mod tiers;
mod workers;

pub use cascade::{CascadeRequest, Continuation, TierCascade};
pub use config::{
    AnalysisConfig, ConsensusKind, CrowdSettings, LlmSettings, QuorumPolicy, TierSettings,
    ENV_CROWD_CONCURRENCY, ENV_CROWD_MODEL, ENV_LLM_API_KEY, ENV_LLM_BACKEND, ENV_LLM_URL,
    ENV_MODEL,
};
pub use consensus::{
    adjudicate_or_fallback, fallback_answer, strategy_for, AdjudicatorSettings, Consensus,
    ConsensusPath, ConsensusStrategy, LlmAdjudicator, MajorityTally,
};
pub use context::ProjectContext;
pub use engine::{Engine, EngineBuilder, ProjectStatus, Services, TierStatus};
pub use error::{AnalysisError, Result};
pub use knowledge::{
    knowledge_path, read_all_knowledge, read_knowledge, write_knowledge, KnowledgeFiles,
    ALL_DOCUMENTS, ARCHITECTURE, DEEP_DIVE, OVERVIEW, SUMMARY,
};
pub use model::{AdjudicatedAnswer, CrowdVote, ScanResult, Tier, TierStage};
pub use permission::{
    Initiator, PermissionEvent, PermissionGate, PermissionRequest, PermissionService,
};
pub use result::{AnalysisResult, Finding, RankedFile, TierOutcome};
pub use sampler::{CrowdBatch, CrowdCallSettings, CrowdSampler, Warmup};
pub use scan::{read_scan_record, ProjectScanner, ScanRecord, SCAN_RECORD_SCHEMA_VERSION};
pub use session::{ProjectSession, SessionRegistry};
pub use workers::{WorkItem, WorkOutcome, WorkerPool};
