use super::{
    degrade_confidence, enforce_worker_policy, file_items_only, log_dropped, rank_files,
    run_file_workers, synthesis_fallback, synthesis_item, synthesize, FileSummary, TierData,
    TierInputs, TierWork, SYNTHESIS_ITEM,
};
use crate::knowledge::{KnowledgeFiles, ARCHITECTURE, OVERVIEW};
use crate::model::Tier;
use crate::prompts;
use crate::result::RankedFile;
use crate::Result;
use lore_indexer::plan_refresh;
use std::fmt::Write as _;

const TASK: &str = "Revise the project overview and write an architecture document from the \
                    per-file summaries below. `overview.md` explains what the project is and how \
                    to approach it. `architecture.md` describes the main components, how they \
                    depend on each other, and the key files.";

pub(super) async fn run(inputs: &TierInputs<'_>) -> Result<TierWork> {
    let settings = &inputs.config.detailed;
    let words = inputs.config.worker_summary_words;
    let previous = inputs.previous.map(file_items_only);
    let plan = plan_refresh(&inputs.ctx.fingerprint, previous.as_ref(), inputs.mode);
    log_dropped(Tier::Detailed, &plan.dropped);
    log::info!(
        "detailed: {} files to summarize, {} carried forward",
        plan.to_process.len(),
        plan.carried.len()
    );

    let pass = run_file_workers(
        inputs,
        Tier::Detailed,
        settings,
        &plan.to_process,
        |path, content| prompts::detailed_worker(path, content, words),
        |reply| FileSummary::from_reply(reply).to_json(),
    )
    .await?;
    enforce_worker_policy(Tier::Detailed, settings, pass.failed)?;

    let carried = plan.carried.len();
    let mut items = plan.carried;
    items.extend(pass.items);
    let total = items.len();
    let top_files = rank_files(&items, inputs.config.top_files);

    let evidence = render_evidence(inputs.ctx.file_count(), &top_files);
    let expected = [OVERVIEW, ARCHITECTURE];
    let synthesis = match synthesize(
        inputs,
        Tier::Detailed,
        settings,
        TASK,
        &expected,
        inputs.seed,
        &evidence,
    )
    .await?
    {
        Some(synthesis) => synthesis,
        None => synthesis_fallback(Tier::Detailed, settings, || {
            compose_locally(inputs.seed, &top_files)
        })?,
    };
    let degraded = pass.failed > 0 || synthesis.fallback;
    let confidence = degrade_confidence(synthesis.confidence, pass.failed, total);
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
        processed: pass.processed,
        carried,
        failed: pass.failed,
        data: TierData::Detailed { top_files },
    })
}

fn render_evidence(file_count: usize, top_files: &[RankedFile]) -> String {
    let mut out = format!("{file_count} tracked files. Most important files:\n");
    for file in top_files {
        let _ = writeln!(
            out,
            "- `{}` (importance {:.0}): {}",
            file.path, file.importance, file.summary
        );
    }
    out
}

fn compose_locally(seed: &KnowledgeFiles, top_files: &[RankedFile]) -> KnowledgeFiles {
    let mut docs = KnowledgeFiles::new();
    let overview = seed
        .get(OVERVIEW)
        .cloned()
        .unwrap_or_else(|| "# Overview\n\nNo overview is available yet.\n".to_string());
    docs.insert(OVERVIEW.to_string(), overview);

    let mut architecture = String::from("# Architecture\n\n## Key files\n\n");
    if top_files.is_empty() {
        architecture.push_str("No file summaries are available.\n");
    }
    for file in top_files {
        let _ = writeln!(architecture, "- `{}`: {}", file.path, file.summary);
    }
    docs.insert(ARCHITECTURE.to_string(), architecture);
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn local_composition_keeps_seed_overview() {
        let mut seed = KnowledgeFiles::new();
        seed.insert(OVERVIEW.to_string(), "# Overview\nA cli.\n".to_string());
        let docs = compose_locally(
            &seed,
            &[RankedFile {
                path: "src/main.rs".to_string(),
                importance: 9.0,
                summary: "entry point".to_string(),
            }],
        );
        assert_eq!(docs[OVERVIEW], "# Overview\nA cli.\n");
        assert!(docs[ARCHITECTURE].contains("- `src/main.rs`: entry point\n"));
    }
}
