//! # Lore Indexer
//!
//! Project file tracking and tier cache state for the analysis engine.
//!
//! ## Pipeline
//!
//! ```text
//! Project directory
//!     │
//!     ├──> FileLister (git ls-files, .gitignore-aware walk as fallback)
//!     │      └─> Sorted relative paths
//!     │
//!     ├──> fingerprint_files (path, size, mtime)
//!     │      └─> ProjectFingerprint { content_hash, per-item hashes }
//!     │
//!     └──> TierCache (.lore/tiers/<tier>.json)
//!            ├─> StaleAssessment (fresh / stale + reasons)
//!            └─> RefreshPlan (to_process, carried, dropped)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use lore_indexer::{fingerprint_files, FileLister, ProjectFileLister, RefreshMode, TierCache};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> lore_indexer::Result<()> {
//!     let root = Path::new("/path/to/project");
//!     let files = ProjectFileLister.list(root).await?;
//!     let project = fingerprint_files(root, &files).await?;
//!
//!     let cache = TierCache::new(root, "detailed");
//!     let check = cache.check(&project, "qwen2.5-coder", None, false).await?;
//!     if !check.is_fresh() {
//!         let plan = check.plan(&project, RefreshMode::Incremental);
//!         println!("{} files to process", plan.to_process.len());
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod fingerprint;
mod health;
mod paths;
mod persist;
mod project_lock;
mod scanner;
mod tier_cache;
mod tier_state;

pub use error::{IndexerError, Result};
pub use fingerprint::{
    content_hash, documents_hash, fingerprint_files, FileFingerprint, ProjectFingerprint,
};
pub use health::{
    read_health_snapshot, record_tier_failure, record_tier_success, HealthSnapshot, TierRunStats,
};
pub use paths::{
    file_stem_for, health_file_path, knowledge_dir_for_project_root, lock_file_path,
    project_config_path, scan_record_path, state_dir_for_project_root, tier_record_path,
    STATE_DIR_NAME,
};
pub use persist::{read_json_lenient, write_bytes_atomic, write_json_atomic, Loaded};
pub use project_lock::{acquire_project_lock, ProjectLock};
pub use scanner::{FileLister, FileScanner, ProjectFileLister};
pub use tier_cache::{TierCache, TierCheck};
pub use tier_state::{
    assess_freshness, plan_refresh, FreshnessProbe, ItemState, RefreshMode, RefreshPlan,
    unix_now_ms, StaleAssessment, StaleReason, TierRecord, TIER_RECORD_SCHEMA_VERSION,
};
