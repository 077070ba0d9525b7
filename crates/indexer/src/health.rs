use crate::paths::health_file_path;
use crate::persist::{read_json_lenient, write_json_atomic, Loaded};
use crate::tier_state::unix_now_ms;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

const MAX_FAILURES: usize = 5;

/// Snapshot persisted to `.lore/health.json` so later runs (and `lore status`) can report the
/// last tier outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthSnapshot {
    #[serde(default)]
    pub last_success_unix_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_processed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_carried: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_failed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_unix_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<usize>,
}

/// Counters of a finished tier pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierRunStats {
    pub duration_ms: u64,
    pub processed: usize,
    pub carried: usize,
    pub failed: usize,
    pub cached: bool,
}

pub async fn record_tier_success(root: &Path, tier: &str, stats: TierRunStats) -> Result<()> {
    let mut snapshot = read_health_snapshot(root).await?.unwrap_or_default();
    snapshot.last_success_unix_ms = unix_now_ms();
    snapshot.last_tier = Some(tier.to_string());
    snapshot.last_duration_ms = Some(stats.duration_ms);
    snapshot.items_processed = Some(stats.processed);
    snapshot.items_carried = Some(stats.carried);
    snapshot.items_failed = Some(stats.failed);
    snapshot.cached = Some(stats.cached);
    write_json_atomic(&health_file_path(root), &snapshot).await
}

pub async fn record_tier_failure(
    root: &Path,
    tier: &str,
    stage: &str,
    failures: usize,
    detail: &str,
) -> Result<()> {
    let mut snapshot = read_health_snapshot(root).await?.unwrap_or_default();

    snapshot
        .failure_reasons
        .push(format!("{tier}/{stage} ({failures} failures): {detail}"));
    if snapshot.failure_reasons.len() > MAX_FAILURES {
        let start = snapshot.failure_reasons.len() - MAX_FAILURES;
        snapshot.failure_reasons = snapshot.failure_reasons.split_off(start);
    }
    snapshot.last_failure_unix_ms = Some(unix_now_ms());
    snapshot.last_failure_stage = Some(format!("{tier}/{stage}"));
    snapshot.last_failure_reason = Some(detail.to_string());
    snapshot.failure_count = Some(snapshot.failure_reasons.len());

    write_json_atomic(&health_file_path(root), &snapshot).await
}

/// Reads the snapshot; a corrupt file reads as absent.
pub async fn read_health_snapshot(root: &Path) -> Result<Option<HealthSnapshot>> {
    match read_json_lenient(&health_file_path(root)).await? {
        Loaded::Present(snapshot) => Ok(Some(snapshot)),
        Loaded::Missing | Loaded::Corrupt(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn failures_are_bounded_and_success_keeps_them() {
        let temp = tempdir().unwrap();
        for i in 0..7 {
            record_tier_failure(temp.path(), "deep", "workers", i, "timeout")
                .await
                .unwrap();
        }
        record_tier_success(
            temp.path(),
            "quick",
            TierRunStats {
                duration_ms: 12,
                processed: 3,
                ..TierRunStats::default()
            },
        )
        .await
        .unwrap();

        let snapshot = read_health_snapshot(temp.path()).await.unwrap().unwrap();
        assert_eq!(snapshot.failure_reasons.len(), MAX_FAILURES);
        assert_eq!(snapshot.failure_count, Some(MAX_FAILURES));
        assert_eq!(snapshot.last_failure_stage.as_deref(), Some("deep/workers"));
        assert_eq!(snapshot.last_tier.as_deref(), Some("quick"));
        assert_eq!(snapshot.items_processed, Some(3));
        assert!(snapshot.failure_reasons[MAX_FAILURES - 1].contains("6 failures"));
    }
}
