use crate::model::Tier;
use crate::{AnalysisError, Result};
use lore_llm::{Backend, LlmMode};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const MAX_CONCURRENCY: usize = 32;
const MAX_CROWD_SIZE: usize = 64;
const MAX_RETRIES: u32 = 5;
const MIN_CONTEXT_SIZE: u32 = 512;
const MAX_CONTEXT_SIZE: u32 = 262_144;
const MIN_MAX_TOKENS: u32 = 16;
const MAX_MAX_TOKENS: u32 = 32_768;
const MAX_TIMEOUT_SECS: u64 = 3_600;

pub const ENV_LLM_URL: &str = "LORE_LLM_URL";
pub const ENV_LLM_BACKEND: &str = "LORE_LLM_BACKEND";
pub const ENV_MODEL: &str = "LORE_MODEL";
pub const ENV_CROWD_MODEL: &str = "LORE_CROWD_MODEL";
pub const ENV_LLM_API_KEY: &str = "LORE_LLM_API_KEY";
pub const ENV_CROWD_CONCURRENCY: &str = "LORE_CROWD_CONCURRENCY";

/// When a crowd batch counts as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuorumPolicy {
    /// Fail iff more than half of the calls failed.
    #[default]
    Majority,
    /// Fail iff more than `k` calls failed.
    MaxFailures(usize),
}

impl QuorumPolicy {
    #[must_use]
    pub fn threshold(self, total: usize) -> usize {
        match self {
            Self::Majority => total / 2,
            Self::MaxFailures(k) => k,
        }
    }

    #[must_use]
    pub fn is_met(self, failures: usize, total: usize) -> bool {
        failures <= self.threshold(total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsensusKind {
    /// One model call reduces the votes.
    #[default]
    Adjudicator,
    /// Local plurality vote, no model call.
    Tally,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub mode: LlmMode,
    pub backend: Backend,
    pub base_url: String,
    pub model: String,
    /// Cheaper model for crowd calls; `model` when unset.
    pub crowd_model: Option<String>,
    pub api_key: Option<String>,
    /// Applied once per client before its first crowd batch.
    pub warmup: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            mode: LlmMode::Http,
            backend: Backend::Ollama,
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "qwen2.5-coder:7b".to_string(),
            crowd_model: None,
            api_key: None,
            warmup: Duration::ZERO,
        }
    }
}

impl LlmSettings {
    pub fn crowd_model(&self) -> &str {
        self.crowd_model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.model)
    }
}

/// Startup-scan crowd.
#[derive(Debug, Clone, PartialEq)]
pub struct CrowdSettings {
    pub size: usize,
    pub concurrency: usize,
    pub max_tokens: u32,
    pub context_size: u32,
    pub request_timeout: Duration,
    pub temperature: f32,
    pub quorum: QuorumPolicy,
}

impl Default for CrowdSettings {
    fn default() -> Self {
        Self {
            size: 10,
            concurrency: 4,
            max_tokens: 256,
            context_size: 8_192,
            request_timeout: Duration::from_secs(60),
            temperature: 0.7,
            quorum: QuorumPolicy::Majority,
        }
    }
}

/// Per-tier tunables.
///
/// For the quick tier the workers are the crowd: `workers` is the crowd size and
/// `worker_concurrency` bounds its fan-out. Crowd calls are never retried.
#[derive(Debug, Clone, PartialEq)]
pub struct TierSettings {
    pub workers: usize,
    pub worker_concurrency: usize,
    pub worker_max_tokens: u32,
    pub adjudicator_max_tokens: u32,
    pub context_size: u32,
    pub request_timeout: Duration,
    pub worker_retries: u32,
    pub adjudicator_retries: u32,
    pub strict_fail: bool,
}

impl TierSettings {
    fn defaults_for(tier: Tier) -> Self {
        match tier {
            Tier::Quick => Self {
                workers: 5,
                worker_concurrency: 4,
                worker_max_tokens: 256,
                adjudicator_max_tokens: 768,
                context_size: 8_192,
                request_timeout: Duration::from_secs(60),
                worker_retries: 0,
                adjudicator_retries: 1,
                strict_fail: false,
            },
            Tier::Detailed => Self {
                workers: 4,
                worker_concurrency: 4,
                worker_max_tokens: 384,
                adjudicator_max_tokens: 1_536,
                context_size: 16_384,
                request_timeout: Duration::from_secs(120),
                worker_retries: 2,
                adjudicator_retries: 1,
                strict_fail: false,
            },
            Tier::Deep => Self {
                workers: 3,
                worker_concurrency: 3,
                worker_max_tokens: 768,
                adjudicator_max_tokens: 2_048,
                context_size: 32_768,
                request_timeout: Duration::from_secs(180),
                worker_retries: 2,
                adjudicator_retries: 2,
                strict_fail: false,
            },
            Tier::Full => Self {
                workers: 2,
                worker_concurrency: 2,
                worker_max_tokens: 1_024,
                adjudicator_max_tokens: 4_096,
                context_size: 32_768,
                request_timeout: Duration::from_secs(300),
                worker_retries: 1,
                adjudicator_retries: 2,
                strict_fail: false,
            },
        }
    }

    fn apply(&mut self, raw: RawTierSettings) {
        if let Some(v) = raw.workers {
            self.workers = v.clamp(1, MAX_CONCURRENCY);
        }
        if let Some(v) = raw.worker_concurrency {
            self.worker_concurrency = v.clamp(1, MAX_CONCURRENCY);
        }
        if let Some(v) = raw.worker_max_tokens {
            self.worker_max_tokens = v.clamp(MIN_MAX_TOKENS, MAX_MAX_TOKENS);
        }
        if let Some(v) = raw.adjudicator_max_tokens {
            self.adjudicator_max_tokens = v.clamp(MIN_MAX_TOKENS, MAX_MAX_TOKENS);
        }
        if let Some(v) = raw.context_size {
            self.context_size = v.clamp(MIN_CONTEXT_SIZE, MAX_CONTEXT_SIZE);
        }
        if let Some(v) = raw.request_timeout_secs {
            self.request_timeout = Duration::from_secs(v.clamp(1, MAX_TIMEOUT_SECS));
        }
        if let Some(v) = raw.worker_retries {
            self.worker_retries = v.min(MAX_RETRIES);
        }
        if let Some(v) = raw.adjudicator_retries {
            self.adjudicator_retries = v.min(MAX_RETRIES);
        }
        if let Some(v) = raw.strict_fail {
            self.strict_fail = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub llm: LlmSettings,
    pub crowd: CrowdSettings,
    pub consensus: ConsensusKind,
    pub quick: TierSettings,
    pub detailed: TierSettings,
    pub deep: TierSettings,
    pub full: TierSettings,
    pub focus_areas: Vec<String>,
    pub top_files: usize,
    pub final_top_k: usize,
    pub nl_workers: bool,
    pub worker_summary_words: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            crowd: CrowdSettings::default(),
            consensus: ConsensusKind::Adjudicator,
            quick: TierSettings::defaults_for(Tier::Quick),
            detailed: TierSettings::defaults_for(Tier::Detailed),
            deep: TierSettings::defaults_for(Tier::Deep),
            full: TierSettings::defaults_for(Tier::Full),
            focus_areas: vec![
                "architecture".to_string(),
                "error handling".to_string(),
                "data flow".to_string(),
            ],
            top_files: 8,
            final_top_k: 5,
            nl_workers: false,
            worker_summary_words: 80,
        }
    }
}

impl AnalysisConfig {
    #[must_use]
    pub fn tier(&self, tier: Tier) -> &TierSettings {
        match tier {
            Tier::Quick => &self.quick,
            Tier::Detailed => &self.detailed,
            Tier::Deep => &self.deep,
            Tier::Full => &self.full,
        }
    }

    pub fn tier_mut(&mut self, tier: Tier) -> &mut TierSettings {
        match tier {
            Tier::Quick => &mut self.quick,
            Tier::Detailed => &mut self.detailed,
            Tier::Deep => &mut self.deep,
            Tier::Full => &mut self.full,
        }
    }

    /// Resolve the effective configuration for a project.
    ///
    /// An explicit file must exist. Otherwise `<root>/.lore/config.toml` (or `.json`) is used
    /// when present. Environment overrides apply last.
    pub fn load(project_root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => lore_indexer::project_config_path(project_root),
        };
        let mut config = match path {
            Some(path) => {
                let bytes = std::fs::read(&path).map_err(|err| {
                    AnalysisError::Config(format!("read {}: {err}", path.display()))
                })?;
                log::debug!("Loading analysis config from {}", path.display());
                Self::from_bytes(&bytes).map_err(|err| match err {
                    AnalysisError::Config(detail) => {
                        AnalysisError::Config(format!("{}: {detail}", path.display()))
                    }
                    other => other,
                })?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a JSON or TOML document merged onto the defaults.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw = parse_raw(bytes)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        if let Some(schema_version) = raw.schema_version {
            if schema_version != 1 {
                return Err(AnalysisError::Config(format!(
                    "schema_version {schema_version} is not supported (expected 1)"
                )));
            }
        }

        let mut cfg = Self::default();

        if let Some(llm) = raw.llm {
            if let Some(mode) = llm.mode {
                cfg.llm.mode = mode.parse()?;
            }
            if let Some(backend) = llm.backend {
                cfg.llm.backend = backend.parse()?;
            }
            if let Some(url) = llm.base_url.filter(|v| !v.trim().is_empty()) {
                cfg.llm.base_url = url;
            }
            if let Some(model) = llm.model.filter(|v| !v.trim().is_empty()) {
                cfg.llm.model = model;
            }
            cfg.llm.crowd_model = llm.crowd_model.filter(|v| !v.trim().is_empty());
            cfg.llm.api_key = llm.api_key.filter(|v| !v.is_empty());
            if let Some(ms) = llm.warmup_ms {
                cfg.llm.warmup = Duration::from_millis(ms.min(60_000));
            }
        }

        if let Some(crowd) = raw.crowd {
            if let Some(v) = crowd.size {
                cfg.crowd.size = v.clamp(1, MAX_CROWD_SIZE);
            }
            if let Some(v) = crowd.concurrency {
                cfg.crowd.concurrency = v.clamp(1, MAX_CONCURRENCY);
            }
            if let Some(v) = crowd.max_tokens {
                cfg.crowd.max_tokens = v.clamp(MIN_MAX_TOKENS, MAX_MAX_TOKENS);
            }
            if let Some(v) = crowd.context_size {
                cfg.crowd.context_size = v.clamp(MIN_CONTEXT_SIZE, MAX_CONTEXT_SIZE);
            }
            if let Some(v) = crowd.request_timeout_secs {
                cfg.crowd.request_timeout = Duration::from_secs(v.clamp(1, MAX_TIMEOUT_SECS));
            }
            if let Some(v) = crowd.temperature {
                cfg.crowd.temperature = v.clamp(0.0, 2.0);
            }
            cfg.crowd.quorum = parse_quorum(crowd.quorum.as_deref(), crowd.max_failures)?;
        }

        if let Some(consensus) = raw.consensus {
            cfg.consensus = match consensus.trim().to_ascii_lowercase().as_str() {
                "adjudicator" | "llm" => ConsensusKind::Adjudicator,
                "tally" | "majority" => ConsensusKind::Tally,
                other => {
                    return Err(AnalysisError::Config(format!(
                        "consensus '{other}' is not supported (expected 'adjudicator' or 'tally')"
                    )))
                }
            };
        }

        if let Some(tiers) = raw.tiers {
            for (tier, settings) in [
                (Tier::Quick, tiers.quick),
                (Tier::Detailed, tiers.detailed),
                (Tier::Deep, tiers.deep),
                (Tier::Full, tiers.full),
            ] {
                if let Some(settings) = settings {
                    cfg.tier_mut(tier).apply(settings);
                }
            }
        }

        if let Some(areas) = raw.focus_areas {
            let areas: Vec<String> = areas
                .into_iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
            if areas.is_empty() {
                return Err(AnalysisError::Config(
                    "focus_areas must not be empty".to_string(),
                ));
            }
            cfg.focus_areas = areas;
        }
        if let Some(v) = raw.top_files {
            cfg.top_files = v.clamp(1, 100);
        }
        if let Some(v) = raw.final_top_k {
            cfg.final_top_k = v.clamp(1, 50);
        }
        if let Some(v) = raw.nl_workers {
            cfg.nl_workers = v;
        }
        if let Some(v) = raw.worker_summary_words {
            cfg.worker_summary_words = v.clamp(10, 1_000);
        }

        Ok(cfg)
    }

    /// Apply `LORE_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(mode) = get(lore_llm::LLM_MODE_ENV) {
            self.llm.mode = mode.parse()?;
        }
        if let Some(backend) = get(ENV_LLM_BACKEND) {
            self.llm.backend = backend.parse()?;
        }
        if let Some(url) = get(ENV_LLM_URL) {
            self.llm.base_url = url;
        }
        if let Some(model) = get(ENV_MODEL) {
            self.llm.model = model;
        }
        if let Some(model) = get(ENV_CROWD_MODEL) {
            self.llm.crowd_model = Some(model);
        }
        if let Some(key) = get(ENV_LLM_API_KEY) {
            self.llm.api_key = Some(key);
        }
        if let Some(raw) = get(ENV_CROWD_CONCURRENCY) {
            let value = raw.trim().parse::<usize>().map_err(|_| {
                AnalysisError::Config(format!("{ENV_CROWD_CONCURRENCY} must be a number, got '{raw}'"))
            })?;
            self.crowd.concurrency = value.clamp(1, MAX_CONCURRENCY);
        }
        Ok(())
    }
}

fn parse_quorum(raw: Option<&str>, max_failures: Option<usize>) -> Result<QuorumPolicy> {
    let kind = raw.map(|r| r.trim().to_ascii_lowercase());
    match (kind.as_deref(), max_failures) {
        (None | Some("max_failures"), Some(k)) => Ok(QuorumPolicy::MaxFailures(k)),
        (None | Some("majority"), _) => Ok(QuorumPolicy::Majority),
        (Some("max_failures"), None) => Err(AnalysisError::Config(
            "quorum 'max_failures' requires crowd.max_failures".to_string(),
        )),
        (Some(other), _) => Err(AnalysisError::Config(format!(
            "quorum '{other}' is not supported (expected 'majority' or 'max_failures')"
        ))),
    }
}

fn parse_raw(bytes: &[u8]) -> Result<RawConfig> {
    let value: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(json_err) => {
            let utf8 = std::str::from_utf8(bytes)
                .map_err(|err| AnalysisError::Config(format!("{json_err}; {err}")))?;
            let toml_value: toml::Value = toml::from_str(utf8).map_err(|toml_err| {
                AnalysisError::Config(format!(
                    "config is not valid JSON or TOML ({json_err}); TOML parse error: {toml_err}"
                ))
            })?;
            serde_json::to_value(toml_value).map_err(|err| {
                AnalysisError::Config(format!("failed to convert TOML config to JSON: {err}"))
            })?
        }
    };
    serde_json::from_value(value)
        .map_err(|err| AnalysisError::Config(format!("config parse error: {err}")))
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    schema_version: Option<u32>,
    llm: Option<RawLlmSettings>,
    crowd: Option<RawCrowdSettings>,
    consensus: Option<String>,
    tiers: Option<RawTiers>,
    focus_areas: Option<Vec<String>>,
    top_files: Option<usize>,
    final_top_k: Option<usize>,
    nl_workers: Option<bool>,
    worker_summary_words: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLlmSettings {
    mode: Option<String>,
    backend: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    crowd_model: Option<String>,
    api_key: Option<String>,
    warmup_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCrowdSettings {
    size: Option<usize>,
    concurrency: Option<usize>,
    max_tokens: Option<u32>,
    context_size: Option<u32>,
    request_timeout_secs: Option<u64>,
    temperature: Option<f32>,
    quorum: Option<String>,
    max_failures: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTiers {
    quick: Option<RawTierSettings>,
    detailed: Option<RawTierSettings>,
    deep: Option<RawTierSettings>,
    full: Option<RawTierSettings>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTierSettings {
    workers: Option<usize>,
    worker_concurrency: Option<usize>,
    worker_max_tokens: Option<u32>,
    adjudicator_max_tokens: Option<u32>,
    context_size: Option<u32>,
    request_timeout_secs: Option<u64>,
    worker_retries: Option<u32>,
    adjudicator_retries: Option<u32>,
    strict_fail: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn toml_overrides_merge_onto_defaults() {
        let cfg = AnalysisConfig::from_bytes(
            br#"
consensus = "tally"
focus_areas = ["security", " "]
top_files = 3

[llm]
backend = "openai"
model = "big"
crowd_model = "small"

[crowd]
size = 7
concurrency = 99
max_failures = 2

[tiers.detailed]
workers = 6
strict_fail = true
request_timeout_secs = 30
"#,
        )
        .unwrap();

        assert_eq!(cfg.consensus, ConsensusKind::Tally);
        assert_eq!(cfg.focus_areas, vec!["security".to_string()]);
        assert_eq!(cfg.top_files, 3);
        assert_eq!(cfg.llm.backend, Backend::OpenAi);
        assert_eq!(cfg.llm.crowd_model(), "small");
        assert_eq!(cfg.crowd.size, 7);
        assert_eq!(cfg.crowd.concurrency, MAX_CONCURRENCY);
        assert_eq!(cfg.crowd.quorum, QuorumPolicy::MaxFailures(2));
        assert_eq!(cfg.detailed.workers, 6);
        assert!(cfg.detailed.strict_fail);
        assert_eq!(cfg.detailed.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.deep, TierSettings::defaults_for(Tier::Deep));
    }

    #[test]
    fn json_is_accepted_too() {
        let cfg = AnalysisConfig::from_bytes(br#"{"nl_workers": true, "final_top_k": 0}"#).unwrap();
        assert!(cfg.nl_workers);
        assert_eq!(cfg.final_top_k, 1);
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(AnalysisConfig::from_bytes(b"crowd_size = 3").is_err());
        assert!(AnalysisConfig::from_bytes(b"consensus = \"vibes\"").is_err());
        assert!(AnalysisConfig::from_bytes(b"[crowd]\nquorum = \"max_failures\"").is_err());
        assert!(AnalysisConfig::from_bytes(b"schema_version = 2").is_err());
    }

    #[test]
    fn quorum_thresholds() {
        assert_eq!(QuorumPolicy::Majority.threshold(10), 5);
        assert!(QuorumPolicy::Majority.is_met(5, 10));
        assert!(!QuorumPolicy::Majority.is_met(6, 10));
        assert!(!QuorumPolicy::Majority.is_met(1, 1));
        assert!(QuorumPolicy::MaxFailures(0).is_met(0, 3));
        assert!(!QuorumPolicy::MaxFailures(0).is_met(1, 3));
    }

    #[test]
    fn env_overrides_apply_last() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LORE_LLM_MODE", "stub"),
            ("LORE_MODEL", "env-model"),
            ("LORE_CROWD_CONCURRENCY", "0"),
            ("LORE_LLM_URL", ""),
        ]);
        let mut cfg = AnalysisConfig::default();
        cfg.apply_env_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(cfg.llm.mode, LlmMode::Stub);
        assert_eq!(cfg.llm.model, "env-model");
        assert_eq!(cfg.llm.crowd_model(), "env-model");
        assert_eq!(cfg.crowd.concurrency, 1);
        assert_eq!(cfg.llm.base_url, LlmSettings::default().base_url);

        let mut cfg = AnalysisConfig::default();
        let err = cfg
            .apply_env_overrides(|key| (key == ENV_CROWD_CONCURRENCY).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Config(_)));
    }

    #[test]
    fn project_config_file_is_discovered() {
        let temp = tempdir().unwrap();
        let state = temp.path().join(".lore");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("config.toml"), "top_files = 2\n").unwrap();

        let cfg = AnalysisConfig::load(temp.path(), None).unwrap();
        assert_eq!(cfg.top_files, 2);

        let missing = temp.path().join("nope.toml");
        assert!(AnalysisConfig::load(temp.path(), Some(&missing)).is_err());
    }
}
