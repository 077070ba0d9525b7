use crate::fingerprint::{FileFingerprint, ProjectFingerprint};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TIER_RECORD_SCHEMA_VERSION: u32 = 1;

/// Last known outcome for one work item of a tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ItemState {
    pub hash: String,
    pub time_unix_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Worker output, kept so carried-forward items still feed tier synthesis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ItemState {
    #[must_use]
    pub fn succeeded(hash: impl Into<String>, summary: Option<String>) -> Self {
        Self {
            hash: hash.into(),
            time_unix_ms: unix_now_ms(),
            success: true,
            error: None,
            summary,
        }
    }

    #[must_use]
    pub fn failed(hash: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            time_unix_ms: unix_now_ms(),
            success: false,
            error: Some(error.into()),
            summary: None,
        }
    }
}

/// Persisted per-tier cache record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct TierRecord {
    pub schema_version: u32,
    pub tier: String,
    pub content_hash: String,
    pub analyzed_at_unix_ms: u64,
    pub item_count: usize,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_hash: Option<String>,
    #[serde(default)]
    pub items: BTreeMap<String, ItemState>,
}

impl TierRecord {
    pub fn failed_items(&self) -> impl Iterator<Item = (&String, &ItemState)> {
        self.items.iter().filter(|(_, state)| !state.success)
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.items.values().any(|state| !state.success)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    RecordMissing,
    RecordCorrupt,
    ContentChanged,
    ModelChanged,
    FailedItems,
    SeedChanged,
    Forced,
}

impl StaleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecordMissing => "record_missing",
            Self::RecordCorrupt => "record_corrupt",
            Self::ContentChanged => "content_changed",
            Self::ModelChanged => "model_changed",
            Self::FailedItems => "failed_items",
            Self::SeedChanged => "seed_changed",
            Self::Forced => "forced",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct StaleAssessment {
    pub stale: bool,
    pub reasons: Vec<StaleReason>,
}

impl StaleAssessment {
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        !self.stale
    }
}

/// Inputs the freshness predicate compares against the stored record.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessProbe<'a> {
    pub content_hash: &'a str,
    pub model_id: &'a str,
    pub seed_hash: Option<&'a str>,
    pub force: bool,
}

#[must_use]
pub fn assess_freshness(
    record: Option<&TierRecord>,
    record_corrupt: bool,
    probe: FreshnessProbe<'_>,
) -> StaleAssessment {
    let mut reasons = Vec::new();

    if probe.force {
        reasons.push(StaleReason::Forced);
    }
    if record_corrupt {
        reasons.push(StaleReason::RecordCorrupt);
    }

    match record {
        None => {
            if !record_corrupt {
                reasons.push(StaleReason::RecordMissing);
            }
        }
        Some(record) => {
            if record.content_hash != probe.content_hash {
                reasons.push(StaleReason::ContentChanged);
            }
            if record.model_id != probe.model_id {
                reasons.push(StaleReason::ModelChanged);
            }
            if record.has_failures() {
                reasons.push(StaleReason::FailedItems);
            }
            if record.seed_hash.as_deref() != probe.seed_hash {
                reasons.push(StaleReason::SeedChanged);
            }
        }
    }

    let stale = !reasons.is_empty();
    StaleAssessment { stale, reasons }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Reprocess new, changed and previously failed items only.
    Incremental,
    /// Drop all prior item state.
    Reset,
}

/// Work split for a stale tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshPlan {
    pub to_process: Vec<FileFingerprint>,
    pub carried: BTreeMap<String, ItemState>,
    pub dropped: Vec<String>,
}

impl RefreshPlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.to_process.is_empty() && self.dropped.is_empty()
    }
}

/// Decide which items of `project` need work given the prior record.
#[must_use]
pub fn plan_refresh(
    project: &ProjectFingerprint,
    previous: Option<&TierRecord>,
    mode: RefreshMode,
) -> RefreshPlan {
    let mut plan = RefreshPlan::default();
    let prior = match (mode, previous) {
        (RefreshMode::Incremental, Some(record)) => Some(&record.items),
        _ => None,
    };

    for file in &project.files {
        let hash = file.item_hash();
        match prior.and_then(|items| items.get(&file.path)) {
            Some(state) if state.success && state.hash == hash => {
                plan.carried.insert(file.path.clone(), state.clone());
            }
            _ => plan.to_process.push(file.clone()),
        }
    }

    if let Some(items) = prior {
        for path in items.keys() {
            if project.get(path).is_none() {
                plan.dropped.push(path.clone());
            }
        }
    }

    plan
}

pub fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fp(path: &str, size: u64) -> FileFingerprint {
        FileFingerprint {
            path: path.to_string(),
            size,
            mtime_ns: 42,
        }
    }

    fn record_for(project: &ProjectFingerprint, model: &str) -> TierRecord {
        let items = project
            .files
            .iter()
            .map(|f| (f.path.clone(), ItemState::succeeded(f.item_hash(), None)))
            .collect::<BTreeMap<_, _>>();
        TierRecord {
            schema_version: TIER_RECORD_SCHEMA_VERSION,
            tier: "detailed".to_string(),
            content_hash: project.content_hash.clone(),
            analyzed_at_unix_ms: 1,
            item_count: items.len(),
            model_id: model.to_string(),
            seed_hash: None,
            items,
        }
    }

    fn probe<'a>(project: &'a ProjectFingerprint, model: &'a str) -> FreshnessProbe<'a> {
        FreshnessProbe {
            content_hash: &project.content_hash,
            model_id: model,
            seed_hash: None,
            force: false,
        }
    }

    #[test]
    fn stale_when_record_missing() {
        let project = ProjectFingerprint::from_files(vec![fp("a.rs", 1)]);
        let out = assess_freshness(None, false, probe(&project, "m"));
        assert_eq!(out.stale, true);
        assert_eq!(out.reasons, vec![StaleReason::RecordMissing]);
    }

    #[test]
    fn stale_when_record_corrupt() {
        let project = ProjectFingerprint::from_files(vec![fp("a.rs", 1)]);
        let out = assess_freshness(None, true, probe(&project, "m"));
        assert_eq!(out.reasons, vec![StaleReason::RecordCorrupt]);
    }

    #[test]
    fn fresh_when_everything_matches_twice() {
        let project = ProjectFingerprint::from_files(vec![fp("a.rs", 1), fp("b.rs", 2)]);
        let record = record_for(&project, "m");
        let first = assess_freshness(Some(&record), false, probe(&project, "m"));
        let second = assess_freshness(Some(&record), false, probe(&project, "m"));
        assert!(first.is_fresh());
        assert_eq!(first, second);
    }

    #[test]
    fn stale_when_model_changes() {
        let project = ProjectFingerprint::from_files(vec![fp("a.rs", 1)]);
        let record = record_for(&project, "old-model");
        let out = assess_freshness(Some(&record), false, probe(&project, "new-model"));
        assert_eq!(out.reasons, vec![StaleReason::ModelChanged]);
    }

    #[test]
    fn stale_when_any_item_failed() {
        let project = ProjectFingerprint::from_files(vec![fp("a.rs", 1)]);
        let mut record = record_for(&project, "m");
        record
            .items
            .insert("a.rs".to_string(), ItemState::failed("h", "timeout"));
        let out = assess_freshness(Some(&record), false, probe(&project, "m"));
        assert_eq!(out.reasons, vec![StaleReason::FailedItems]);
    }

    #[test]
    fn stale_when_seed_changes() {
        let project = ProjectFingerprint::from_files(vec![fp("a.rs", 1)]);
        let record = record_for(&project, "m");
        let mut p = probe(&project, "m");
        p.seed_hash = Some("abc");
        let out = assess_freshness(Some(&record), false, p);
        assert_eq!(out.reasons, vec![StaleReason::SeedChanged]);
    }

    #[test]
    fn force_bypasses_fresh_record() {
        let project = ProjectFingerprint::from_files(vec![fp("a.rs", 1)]);
        let record = record_for(&project, "m");
        let mut p = probe(&project, "m");
        p.force = true;
        let out = assess_freshness(Some(&record), false, p);
        assert_eq!(out.stale, true);
        assert_eq!(out.reasons, vec![StaleReason::Forced]);
    }

    #[test]
    fn plan_reprocesses_only_changed_and_failed_items() {
        let before = ProjectFingerprint::from_files(vec![fp("a.rs", 1), fp("b.rs", 2), fp("c.rs", 3)]);
        let mut record = record_for(&before, "m");
        let c_hash = before.get("c.rs").map(FileFingerprint::item_hash).unwrap();
        record
            .items
            .insert("c.rs".to_string(), ItemState::failed(c_hash, "boom"));

        let after = ProjectFingerprint::from_files(vec![fp("a.rs", 1), fp("b.rs", 20), fp("c.rs", 3)]);
        let plan = plan_refresh(&after, Some(&record), RefreshMode::Incremental);

        let processed: Vec<&str> = plan.to_process.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(processed, vec!["b.rs", "c.rs"]);
        assert_eq!(plan.carried.keys().collect::<Vec<_>>(), vec!["a.rs"]);
        assert_eq!(plan.carried["a.rs"], record.items["a.rs"]);
        assert!(plan.dropped.is_empty());
    }

    #[test]
    fn plan_drops_untracked_items_and_reset_clears_state() {
        let before = ProjectFingerprint::from_files(vec![fp("a.rs", 1), fp("old.rs", 2)]);
        let record = record_for(&before, "m");
        let after = ProjectFingerprint::from_files(vec![fp("a.rs", 1)]);

        let plan = plan_refresh(&after, Some(&record), RefreshMode::Incremental);
        assert_eq!(plan.dropped, vec!["old.rs".to_string()]);
        assert!(plan.to_process.is_empty());
        assert!(!plan.is_noop());

        let reset = plan_refresh(&after, Some(&record), RefreshMode::Reset);
        assert_eq!(reset.to_process.len(), 1);
        assert!(reset.carried.is_empty());
    }
}
