//! Startup scan: a crowd classification of the project, refined on every rerun.
//!
//! Each scan feeds the previous answer to the consensus step as a prior, so repeated scans
//! sharpen the classification instead of starting over.

use crate::consensus::{adjudicate_or_fallback, strategy_for, AdjudicatorSettings};
use crate::context::{canonical_root, ProjectContext};
use crate::engine::Services;
use crate::model::{AdjudicatedAnswer, ScanResult};
use crate::permission::{ensure_permitted, Initiator};
use crate::prompts;
use crate::sampler::{CrowdCallSettings, CrowdSampler};
use crate::Result;
use lore_indexer::{
    acquire_project_lock, read_json_lenient, scan_record_path, unix_now_ms, write_json_atomic,
    Loaded,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub const SCAN_RECORD_SCHEMA_VERSION: u32 = 1;

/// Persisted outcome of the latest scan (`.lore/scan.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScanRecord {
    pub schema_version: u32,
    pub iteration: u64,
    pub answer: AdjudicatedAnswer,
    pub file_count: usize,
    pub content_hash: String,
    pub scanned_at_unix_ms: u64,
}

/// Latest scan record; missing, corrupt and foreign-schema records all read as `None`.
pub async fn read_scan_record(root: &Path) -> Result<Option<ScanRecord>> {
    let path = scan_record_path(root);
    match read_json_lenient::<ScanRecord>(&path).await? {
        Loaded::Present(record) if record.schema_version == SCAN_RECORD_SCHEMA_VERSION => {
            Ok(Some(record))
        }
        Loaded::Present(record) => {
            log::warn!(
                "Ignoring scan record {} with schema {}",
                path.display(),
                record.schema_version
            );
            Ok(None)
        }
        Loaded::Missing | Loaded::Corrupt(_) => Ok(None),
    }
}

pub struct ProjectScanner {
    services: Arc<Services>,
}

impl ProjectScanner {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub async fn scan(
        &self,
        project: &Path,
        initiator: Initiator,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        let started = Instant::now();
        let services = &self.services;
        let config = &services.config;
        let root = canonical_root(project).await?;
        ensure_permitted(
            services.gate.as_ref(),
            initiator,
            "scan",
            &root,
            format!("{} crowd calls", config.crowd.size),
        )
        .await?;

        let session = services.sessions.session(&root);
        let _analysis = session.analysis.lock().await;
        let lock = acquire_project_lock(&root).await?;
        if lock.waited_ms() > 0 {
            log::info!("scan: waited {} ms for the project lock", lock.waited_ms());
        }

        let ctx = ProjectContext::collect(&root, services.lister.as_ref()).await?;
        let previous = read_scan_record(&root).await?;
        let prior = previous.as_ref().map(|record| &record.answer);
        log::info!(
            "scan: {} files in {}{}",
            ctx.file_count(),
            root.display(),
            if prior.is_some() {
                " (refining previous answer)"
            } else {
                ""
            }
        );

        let crowd = &config.crowd;
        let sampler = CrowdSampler::new(
            Arc::clone(&services.crowd_client),
            crowd.quorum,
            CrowdCallSettings {
                max_tokens: crowd.max_tokens,
                context_size: crowd.context_size,
                timeout: crowd.request_timeout,
                temperature: Some(crowd.temperature),
            },
            Arc::clone(&services.warmup),
        );
        let batch = sampler
            .sample(
                "scan",
                prompts::crowd(&ctx),
                crowd.size,
                crowd.concurrency,
                cancel,
            )
            .await?;

        let quick = &config.quick;
        let strategy = strategy_for(
            config.consensus,
            Arc::clone(&services.client),
            "scan/adjudicate",
            AdjudicatorSettings {
                max_tokens: quick.adjudicator_max_tokens,
                context_size: quick.context_size,
                timeout: quick.request_timeout,
                retries: quick.adjudicator_retries,
            },
        );
        let consensus = adjudicate_or_fallback(strategy.as_ref(), &batch.votes, prior, cancel).await?;

        let iteration = previous.as_ref().map_or(0, |record| record.iteration) + 1;
        let record = ScanRecord {
            schema_version: SCAN_RECORD_SCHEMA_VERSION,
            iteration,
            answer: consensus.answer.clone(),
            file_count: ctx.file_count(),
            content_hash: ctx.fingerprint.content_hash.clone(),
            scanned_at_unix_ms: unix_now_ms(),
        };
        write_json_atomic(&scan_record_path(&root), &record).await?;
        session.record_scan();

        let answer = consensus.answer;
        log::info!(
            "scan #{iteration}: {} / {} / {} (confidence {:.2}, {}, {} of {} crowd calls failed)",
            answer.project_type,
            answer.language,
            answer.framework,
            answer.confidence,
            consensus.path.as_str(),
            batch.failures,
            batch.votes.len()
        );
        Ok(ScanResult {
            project_path: root,
            project_type: answer.project_type,
            language: answer.language,
            framework: answer.framework,
            purpose: answer.purpose,
            file_count: ctx.file_count(),
            confidence: answer.confidence,
            iteration,
            duration: started.elapsed(),
            consensus: consensus.path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn corrupt_or_foreign_records_read_as_absent() {
        let temp = tempdir().unwrap();
        let path = scan_record_path(temp.path());
        assert_eq!(read_scan_record(temp.path()).await.unwrap(), None);

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();
        assert_eq!(read_scan_record(temp.path()).await.unwrap(), None);

        let mut record = ScanRecord {
            schema_version: SCAN_RECORD_SCHEMA_VERSION + 1,
            iteration: 4,
            answer: AdjudicatedAnswer::default(),
            file_count: 1,
            content_hash: "h".to_string(),
            scanned_at_unix_ms: 1,
        };
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();
        assert_eq!(read_scan_record(temp.path()).await.unwrap(), None);

        record.schema_version = SCAN_RECORD_SCHEMA_VERSION;
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();
        assert_eq!(read_scan_record(temp.path()).await.unwrap(), Some(record));
    }
}
