use crate::fingerprint::ProjectFingerprint;
use crate::paths::tier_record_path;
use crate::persist::{read_json_lenient, write_json_atomic, Loaded};
use crate::tier_state::{
    assess_freshness, plan_refresh, unix_now_ms, FreshnessProbe, ItemState, RefreshMode,
    RefreshPlan, StaleAssessment, TierRecord, TIER_RECORD_SCHEMA_VERSION,
};
use crate::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Owner of one tier's persisted record.
#[derive(Debug, Clone)]
pub struct TierCache {
    tier: String,
    path: PathBuf,
}

/// Result of a freshness check, carrying the record it was made against.
#[derive(Debug, Clone)]
pub struct TierCheck {
    pub assessment: StaleAssessment,
    pub previous: Option<TierRecord>,
}

impl TierCheck {
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.assessment.is_fresh()
    }

    #[must_use]
    pub fn plan(&self, project: &ProjectFingerprint, mode: RefreshMode) -> RefreshPlan {
        plan_refresh(project, self.previous.as_ref(), mode)
    }
}

impl TierCache {
    pub fn new(root: &Path, tier: impl Into<String>) -> Self {
        let tier = tier.into();
        let path = tier_record_path(root, &tier);
        Self { tier, path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub async fn load(&self) -> Result<Loaded<TierRecord>> {
        let loaded = read_json_lenient::<TierRecord>(&self.path).await?;
        if let Loaded::Present(record) = &loaded {
            if record.schema_version != TIER_RECORD_SCHEMA_VERSION || record.tier != self.tier {
                log::warn!(
                    "Ignoring tier record {} (schema {}, tier '{}')",
                    self.path.display(),
                    record.schema_version,
                    record.tier
                );
                return Ok(Loaded::Corrupt("schema or tier mismatch".to_string()));
            }
        }
        Ok(loaded)
    }

    pub async fn check(
        &self,
        project: &ProjectFingerprint,
        model_id: &str,
        seed_hash: Option<&str>,
        force: bool,
    ) -> Result<TierCheck> {
        let loaded = self.load().await?;
        let corrupt = loaded.is_corrupt();
        let previous = loaded.into_option();
        let assessment = assess_freshness(
            previous.as_ref(),
            corrupt,
            FreshnessProbe {
                content_hash: &project.content_hash,
                model_id,
                seed_hash,
                force,
            },
        );
        if assessment.stale {
            let reasons: Vec<&str> = assessment.reasons.iter().map(|r| r.as_str()).collect();
            log::info!("Tier '{}' is stale: {}", self.tier, reasons.join(", "));
        } else {
            log::debug!("Tier '{}' is fresh", self.tier);
        }
        Ok(TierCheck {
            assessment,
            previous,
        })
    }

    pub async fn save(&self, record: &TierRecord) -> Result<()> {
        write_json_atomic(&self.path, record).await?;
        log::debug!(
            "Saved tier record {} ({} items)",
            self.path.display(),
            record.item_count
        );
        Ok(())
    }

    /// Assemble the record for a finished pass.
    #[must_use]
    pub fn build_record(
        &self,
        project: &ProjectFingerprint,
        model_id: &str,
        seed_hash: Option<String>,
        items: BTreeMap<String, ItemState>,
    ) -> TierRecord {
        TierRecord {
            schema_version: TIER_RECORD_SCHEMA_VERSION,
            tier: self.tier.clone(),
            content_hash: project.content_hash.clone(),
            analyzed_at_unix_ms: unix_now_ms(),
            item_count: items.len(),
            model_id: model_id.to_string(),
            seed_hash,
            items,
        }
    }
}
