//! Entry point tying the scanner, the cascade and their shared services together.

use crate::cascade::{probe_tier, CascadeRequest, TierCascade};
use crate::config::AnalysisConfig;
use crate::context::{canonical_root, ProjectContext};
use crate::knowledge::read_all_knowledge;
use crate::model::{ScanResult, Tier};
use crate::permission::{Initiator, PermissionGate, PermissionService};
use crate::result::AnalysisResult;
use crate::sampler::Warmup;
use crate::scan::{read_scan_record, ProjectScanner, ScanRecord};
use crate::session::SessionRegistry;
use crate::stub;
use crate::Result;
use lore_indexer::{
    read_health_snapshot, FileLister, HealthSnapshot, ProjectFileLister, StaleReason,
};
use lore_llm::{CompletionClient, HttpClientConfig, HttpCompletionClient, LlmMode};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a scan or cascade needs, shared by reference.
pub struct Services {
    pub config: AnalysisConfig,
    /// Adjudication, workers and synthesis.
    pub client: Arc<dyn CompletionClient>,
    /// Crowd votes; the same client as `client` unless a crowd model is configured.
    pub crowd_client: Arc<dyn CompletionClient>,
    pub warmup: Arc<Warmup>,
    pub lister: Arc<dyn FileLister>,
    pub gate: Arc<dyn PermissionGate>,
    pub sessions: Arc<SessionRegistry>,
}

pub struct EngineBuilder {
    config: AnalysisConfig,
    client: Option<Arc<dyn CompletionClient>>,
    crowd_client: Option<Arc<dyn CompletionClient>>,
    lister: Option<Arc<dyn FileLister>>,
    gate: Option<Arc<dyn PermissionGate>>,
    sessions: Option<Arc<SessionRegistry>>,
}

impl EngineBuilder {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            config,
            client: None,
            crowd_client: None,
            lister: None,
            gate: None,
            sessions: None,
        }
    }

    #[must_use]
    pub fn client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn crowd_client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.crowd_client = Some(client);
        self
    }

    #[must_use]
    pub fn lister(mut self, lister: Arc<dyn FileLister>) -> Self {
        self.lister = Some(lister);
        self
    }

    /// Defaults to a [`PermissionService`] nobody listens to, which denies user-initiated runs.
    #[must_use]
    pub fn gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    #[must_use]
    pub fn sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let llm = &self.config.llm;
        let (client, crowd_client) = match (self.client, self.crowd_client) {
            (Some(client), Some(crowd)) => (client, crowd),
            (Some(client), None) => {
                let crowd = Arc::clone(&client);
                (client, crowd)
            }
            (None, crowd) => {
                let client = configured_client(&self.config, &llm.model)?;
                let crowd = match crowd {
                    Some(crowd) => crowd,
                    None if llm.mode == LlmMode::Http && llm.crowd_model() != llm.model => {
                        configured_client(&self.config, llm.crowd_model())?
                    }
                    None => Arc::clone(&client),
                };
                (client, crowd)
            }
        };
        log::debug!(
            "Engine using {} model '{}' (crowd '{}')",
            llm.mode.as_str(),
            client.model_id(),
            crowd_client.model_id()
        );

        let lister: Arc<dyn FileLister> = match self.lister {
            Some(lister) => lister,
            None => Arc::new(ProjectFileLister),
        };
        let gate: Arc<dyn PermissionGate> = match self.gate {
            Some(gate) => gate,
            None => Arc::new(PermissionService::new()),
        };
        let services = Services {
            warmup: Arc::new(Warmup::new(llm.warmup)),
            client,
            crowd_client,
            lister,
            gate,
            sessions: self.sessions.unwrap_or_default(),
            config: self.config,
        };
        Ok(Engine {
            services: Arc::new(services),
        })
    }
}

fn configured_client(config: &AnalysisConfig, model: &str) -> Result<Arc<dyn CompletionClient>> {
    let llm = &config.llm;
    match llm.mode {
        LlmMode::Stub => Ok(Arc::new(stub::client(model))),
        LlmMode::Http => Ok(Arc::new(HttpCompletionClient::new(HttpClientConfig {
            base_url: llm.base_url.clone(),
            backend: llm.backend,
            model: model.to_string(),
            api_key: llm.api_key.clone(),
        })?)),
    }
}

/// Freshness of one tier as `lore status` reports it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub fresh: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<StaleReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzed_at_unix_ms: Option<u64>,
    pub items: usize,
    pub failed_items: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectStatus {
    pub project_path: PathBuf,
    pub file_count: usize,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanRecord>,
    pub tiers: Vec<TierStatus>,
    pub knowledge_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSnapshot>,
}

#[derive(Clone)]
pub struct Engine {
    services: Arc<Services>,
}

impl Engine {
    pub fn builder(config: AnalysisConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.services.config
    }

    pub async fn scan(
        &self,
        project: &Path,
        initiator: Initiator,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        ProjectScanner::new(Arc::clone(&self.services))
            .scan(project, initiator, cancel)
            .await
    }

    pub async fn analyze(
        &self,
        request: &CascadeRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<AnalysisResult>> {
        TierCascade::new(Arc::clone(&self.services))
            .run(request, cancel)
            .await
    }

    /// Read-only report of scan, tier freshness and health. Makes no model calls.
    pub async fn status(&self, project: &Path) -> Result<ProjectStatus> {
        let root = canonical_root(project).await?;
        let ctx = ProjectContext::collect(&root, self.services.lister.as_ref()).await?;

        let mut tiers = Vec::with_capacity(Tier::ALL.len());
        for tier in Tier::ALL {
            let probe = probe_tier(&self.services, &ctx, tier, false).await?;
            let previous = probe.check.previous.as_ref();
            tiers.push(TierStatus {
                tier,
                fresh: probe.check.is_fresh(),
                reasons: probe.check.assessment.reasons.clone(),
                analyzed_at_unix_ms: previous.map(|record| record.analyzed_at_unix_ms),
                items: previous.map_or(0, |record| record.items.len()),
                failed_items: previous.map_or(0, |record| record.failed_items().count()),
            });
        }

        Ok(ProjectStatus {
            file_count: ctx.file_count(),
            content_hash: ctx.fingerprint.content_hash.clone(),
            scan: read_scan_record(&root).await?,
            tiers,
            knowledge_files: read_all_knowledge(&root).await.into_keys().collect(),
            health: read_health_snapshot(&root).await?,
            project_path: root,
        })
    }
}
