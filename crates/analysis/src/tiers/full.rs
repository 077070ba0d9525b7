use super::{
    degrade_confidence, enforce_worker_policy, is_tier_item, rank_files, seed_documents,
    synthesis_confidence, synthesis_fallback, synthesis_item, synthesize, TierData, TierInputs,
    TierWork, SYNTHESIS_ITEM,
};
use crate::knowledge::{KnowledgeFiles, SUMMARY};
use crate::model::Tier;
use crate::prompts;
use crate::result::Finding;
use crate::workers::{WorkItem, WorkerPool};
use crate::Result;
use lore_indexer::{documents_hash, ItemState, RefreshMode, TierRecord};
use lore_llm::CompletionRequest;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

const FINDINGS_ITEM: &str = "@findings";
const DRAFT_PREFIX: &str = "@draft:";

const TASK: &str = "Produce the final revision of every project document and write \
                    `summary.md`: a one-page summary a new developer reads first, built around the \
                    key findings. Keep documents consistent with each other.";

pub(super) async fn run(inputs: &TierInputs<'_>) -> Result<TierWork> {
    let settings = &inputs.config.full;
    let top_findings = select_findings(inputs);
    let findings_json = serde_json::to_string(&top_findings).unwrap_or_default();
    let findings_hash = documents_hash([("findings", findings_json.as_str())]);
    let findings_text = render_findings(&top_findings);
    log::info!("full: {} findings selected", top_findings.len());

    let mut items = BTreeMap::new();
    items.insert(
        FINDINGS_ITEM.to_string(),
        ItemState::succeeded(findings_hash.as_str(), Some(findings_json)),
    );

    let mut current = inputs.seed.clone();
    let mut processed = 0;
    let mut carried = 0;
    let mut failed = 0;
    if inputs.config.nl_workers {
        let drafts = run_drafts(inputs, &findings_hash, &findings_text).await?;
        processed = drafts.processed;
        carried = drafts.carried;
        failed = drafts.failed;
        enforce_worker_policy(Tier::Full, settings, failed)?;
        for (doc, state) in &drafts.items {
            if let (true, Some(body)) = (state.success, state.summary.as_ref()) {
                current.insert(doc.clone(), body.clone());
            }
        }
        items.extend(
            drafts
                .items
                .into_iter()
                .map(|(doc, state)| (format!("{DRAFT_PREFIX}{doc}"), state)),
        );
    }

    let mut expected: Vec<&str> = seed_documents(Tier::Full)
        .iter()
        .copied()
        .filter(|name| inputs.seed.contains_key(*name))
        .collect();
    expected.push(SUMMARY);
    let synthesis = match synthesize(
        inputs,
        Tier::Full,
        settings,
        TASK,
        &expected,
        &current,
        &findings_text,
    )
    .await?
    {
        Some(synthesis) => synthesis,
        None => synthesis_fallback(Tier::Full, settings, || {
            compose_locally(inputs.seed, &current, &top_findings)
        })?,
    };

    let total = processed + carried;
    let degraded = failed > 0 || synthesis.fallback;
    let confidence = degrade_confidence(synthesis.confidence, failed, total);
    items.insert(
        SYNTHESIS_ITEM.to_string(),
        synthesis_item(
            &inputs.ctx.fingerprint.content_hash,
            confidence,
            synthesis.fallback,
        ),
    );

    Ok(TierWork {
        documents: synthesis.documents,
        items,
        confidence,
        degraded,
        processed,
        carried,
        failed,
        data: TierData::Full { top_findings },
    })
}

pub(super) fn restore(record: &TierRecord) -> Option<(TierData, f64)> {
    let confidence = synthesis_confidence(record)?;
    let findings = record.items.get(FINDINGS_ITEM)?;
    let top_findings: Vec<Finding> = serde_json::from_str(findings.summary.as_deref()?).ok()?;
    Some((TierData::Full { top_findings }, confidence))
}

/// Deep reviews ranked by the detailed importance; detailed summaries when no deep record exists.
fn select_findings(inputs: &TierInputs<'_>) -> Vec<Finding> {
    let ranking = inputs
        .lower_record(Tier::Detailed)
        .map(|record| rank_files(&record.items, usize::MAX))
        .unwrap_or_default();
    let importance: HashMap<&str, f64> = ranking
        .iter()
        .map(|file| (file.path.as_str(), file.importance))
        .collect();

    let mut findings: Vec<Finding> = match inputs.lower_record(Tier::Deep) {
        Some(deep) => deep
            .items
            .iter()
            .filter(|(key, state)| state.success && !is_tier_item(key))
            .filter_map(|(path, state)| {
                Some(Finding {
                    path: path.clone(),
                    importance: importance.get(path.as_str()).copied().unwrap_or(0.0),
                    text: state.summary.clone()?,
                })
            })
            .collect(),
        None => Vec::new(),
    };
    if findings.is_empty() {
        findings = ranking
            .iter()
            .map(|file| Finding {
                path: file.path.clone(),
                importance: file.importance,
                text: file.summary.clone(),
            })
            .collect();
    }

    findings.sort_by(|a, b| {
        b.importance
            .total_cmp(&a.importance)
            .then_with(|| a.path.cmp(&b.path))
    });
    findings.truncate(inputs.config.final_top_k);
    findings
}

fn render_findings(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "No findings are available.\n".to_string();
    }
    let mut out = String::new();
    for (rank, finding) in findings.iter().enumerate() {
        let _ = write!(
            out,
            "\n{}. `{}` (importance {:.0})\n{}\n",
            rank + 1,
            finding.path,
            finding.importance,
            finding.text.trim_end()
        );
    }
    out
}

/// Prose drafts keyed by document name.
#[derive(Debug, Default)]
struct DraftPass {
    items: BTreeMap<String, ItemState>,
    processed: usize,
    carried: usize,
    failed: usize,
}

/// One natural-language worker per seed document; unchanged inputs carry the previous draft.
async fn run_drafts(
    inputs: &TierInputs<'_>,
    findings_hash: &str,
    findings_text: &str,
) -> Result<DraftPass> {
    let settings = &inputs.config.full;
    let mut pass = DraftPass::default();
    let mut hashes = BTreeMap::new();
    let mut work = Vec::new();

    for (doc, body) in inputs.seed {
        let hash = documents_hash([(doc.as_str(), body.as_str()), ("findings", findings_hash)]);
        let previous = inputs
            .previous
            .and_then(|record| record.items.get(&format!("{DRAFT_PREFIX}{doc}")));
        match previous {
            Some(state)
                if inputs.mode == RefreshMode::Incremental && state.success && state.hash == hash =>
            {
                pass.items.insert(doc.clone(), state.clone());
                pass.carried += 1;
                continue;
            }
            _ => {}
        }
        let request = CompletionRequest::new(
            format!("full/draft/{doc}"),
            prompts::full_draft(doc, body, findings_text),
        )
        .with_max_tokens(settings.worker_max_tokens)
        .with_context_size(settings.context_size)
        .with_timeout(settings.request_timeout);
        work.push(WorkItem {
            key: doc.clone(),
            request,
        });
        hashes.insert(doc.clone(), hash);
    }

    let pool = WorkerPool::new(
        Arc::clone(inputs.client),
        settings.workers,
        settings.worker_concurrency,
        settings.worker_retries,
    );
    for outcome in pool.run(work, inputs.cancel).await? {
        let hash = hashes.get(&outcome.key).cloned().unwrap_or_default();
        let state = match outcome.result {
            Ok(text) => ItemState::succeeded(hash, Some(text.trim().to_string() + "\n")),
            Err(err) => {
                pass.failed += 1;
                ItemState::failed(hash, err)
            }
        };
        pass.processed += 1;
        pass.items.insert(outcome.key, state);
    }
    Ok(pass)
}

fn compose_locally(
    seed: &KnowledgeFiles,
    current: &KnowledgeFiles,
    findings: &[Finding],
) -> KnowledgeFiles {
    let mut docs: KnowledgeFiles = current
        .iter()
        .filter(|(name, body)| seed.get(*name) != Some(*body))
        .map(|(name, body)| (name.clone(), body.clone()))
        .collect();
    let mut summary = String::from("# Summary\n\n## Key findings\n");
    summary.push_str(&render_findings(findings));
    docs.insert(SUMMARY.to_string(), summary);
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::OVERVIEW;
    use pretty_assertions::assert_eq;

    #[test]
    fn local_summary_keeps_only_changed_drafts() {
        let mut seed = KnowledgeFiles::new();
        seed.insert(OVERVIEW.to_string(), "# Overview\n".to_string());
        seed.insert("architecture.md".to_string(), "# Arch\n".to_string());
        let mut current = seed.clone();
        current.insert(OVERVIEW.to_string(), "# Overview\nRewritten.\n".to_string());

        let docs = compose_locally(
            &seed,
            &current,
            &[Finding {
                path: "src/lib.rs".to_string(),
                importance: 7.0,
                text: "- central\n".to_string(),
            }],
        );
        assert_eq!(
            docs.keys().map(String::as_str).collect::<Vec<_>>(),
            vec![OVERVIEW, SUMMARY]
        );
        assert!(docs[SUMMARY].contains("1. `src/lib.rs` (importance 7)\n- central\n"));
    }
}
