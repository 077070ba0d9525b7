use super::{
    degrade_confidence, enforce_worker_policy, file_items_only, is_tier_item, log_dropped,
    rank_files, run_file_workers, seed_documents, synthesis_fallback, synthesis_item, synthesize,
    TierData, TierInputs, TierWork, SYNTHESIS_ITEM,
};
use crate::context::ProjectContext;
use crate::knowledge::{KnowledgeFiles, DEEP_DIVE, OVERVIEW};
use crate::model::Tier;
use crate::prompts;
use crate::Result;
use lore_indexer::{
    documents_hash, plan_refresh, FileFingerprint, ItemState, ProjectFingerprint, RefreshMode,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

const FOCUS_ITEM: &str = "@focus";

/// Extensions that rarely hold program logic; skipped when guessing deep targets.
const NON_SOURCE_EXTENSIONS: &[&str] = &[
    "md", "txt", "rst", "json", "toml", "yaml", "yml", "lock", "csv", "ini", "cfg", "xml", "html",
    "css", "svg",
];

const TASK: &str = "Write `deep-dive.md`: an in-depth review of the most important files \
                    organised by focus area, naming concrete functions and types. Revise the \
                    existing documents wherever the findings correct or sharpen them.";

pub(super) async fn run(inputs: &TierInputs<'_>) -> Result<TierWork> {
    let settings = &inputs.config.deep;
    let focus_areas = &inputs.config.focus_areas;
    let targets = select_targets(inputs);
    let subset = ProjectFingerprint::from_files(targets);

    // A changed focus list invalidates every per-file review.
    let focus_hash = documents_hash(focus_areas.iter().map(|area| ("focus", area.as_str())));
    let focus_changed = inputs
        .previous
        .and_then(|record| record.items.get(FOCUS_ITEM))
        .is_some_and(|state| state.hash != focus_hash);
    let mode = if focus_changed {
        log::info!("deep: focus areas changed, reviewing every target again");
        RefreshMode::Reset
    } else {
        inputs.mode
    };

    let previous = inputs.previous.map(file_items_only);
    let plan = plan_refresh(&subset, previous.as_ref(), mode);
    log_dropped(Tier::Deep, &plan.dropped);
    log::info!(
        "deep: {} files to review, {} carried forward",
        plan.to_process.len(),
        plan.carried.len()
    );

    let overview = inputs.seed.get(OVERVIEW).cloned().unwrap_or_default();
    let pass = run_file_workers(
        inputs,
        Tier::Deep,
        settings,
        &plan.to_process,
        |path, content| prompts::deep_worker(path, content, focus_areas, &overview),
        |reply| reply.trim().to_string(),
    )
    .await?;
    enforce_worker_policy(Tier::Deep, settings, pass.failed)?;

    let carried = plan.carried.len();
    let mut items = plan.carried;
    items.extend(pass.items);
    let total = items.len();
    let reviews = collect_reviews(&items);
    let examined: Vec<String> = items.keys().cloned().collect();

    let mut expected = vec![DEEP_DIVE];
    expected.extend(
        seed_documents(Tier::Deep)
            .iter()
            .copied()
            .filter(|name| inputs.seed.contains_key(*name)),
    );
    let evidence = render_evidence(focus_areas, &reviews);
    let synthesis = match synthesize(
        inputs,
        Tier::Deep,
        settings,
        TASK,
        &expected,
        inputs.seed,
        &evidence,
    )
    .await?
    {
        Some(synthesis) => synthesis,
        None => synthesis_fallback(Tier::Deep, settings, || {
            compose_locally(focus_areas, &reviews)
        })?,
    };

    let degraded = pass.failed > 0 || synthesis.fallback;
    let confidence = degrade_confidence(synthesis.confidence, pass.failed, total);
    items.insert(
        FOCUS_ITEM.to_string(),
        ItemState::succeeded(focus_hash, Some(focus_areas.join(", "))),
    );
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
        data: TierData::Deep { examined },
    })
}

/// Top files from the detailed ranking, or a size-based guess when there is none.
fn select_targets(inputs: &TierInputs<'_>) -> Vec<FileFingerprint> {
    let limit = inputs.config.top_files;
    let ranked: Vec<FileFingerprint> = inputs
        .lower_record(Tier::Detailed)
        .map(|record| rank_files(&record.items, limit))
        .unwrap_or_default()
        .iter()
        .filter_map(|file| inputs.ctx.fingerprint.get(&file.path).cloned())
        .collect();
    if !ranked.is_empty() {
        return ranked;
    }
    log::info!("deep: no detailed ranking available, picking the largest source files");
    heuristic_targets(inputs.ctx, limit)
}

fn heuristic_targets(ctx: &ProjectContext, limit: usize) -> Vec<FileFingerprint> {
    let is_source = |file: &&FileFingerprint| {
        Path::new(&file.path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| !NON_SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    };
    let mut candidates: Vec<&FileFingerprint> = ctx.fingerprint.files.iter().filter(is_source).collect();
    if candidates.is_empty() {
        candidates = ctx.fingerprint.files.iter().collect();
    }
    candidates.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
    candidates.into_iter().take(limit).cloned().collect()
}

fn collect_reviews(items: &BTreeMap<String, ItemState>) -> Vec<(String, String)> {
    items
        .iter()
        .filter(|(key, state)| state.success && !is_tier_item(key))
        .filter_map(|(path, state)| Some((path.clone(), state.summary.clone()?)))
        .collect()
}

fn render_evidence(focus_areas: &[String], reviews: &[(String, String)]) -> String {
    let mut out = format!("Focus areas: {}\n", focus_areas.join(", "));
    for (path, review) in reviews {
        let _ = write!(out, "\n### {path}\n{}\n", review.trim_end());
    }
    out
}

fn compose_locally(focus_areas: &[String], reviews: &[(String, String)]) -> KnowledgeFiles {
    let mut body = format!("# Deep dive\n\nFocus areas: {}.\n", focus_areas.join(", "));
    if reviews.is_empty() {
        body.push_str("\nNo file reviews are available.\n");
    }
    for (path, review) in reviews {
        let _ = write!(body, "\n## `{path}`\n\n{}\n", review.trim_end());
    }
    let mut docs = KnowledgeFiles::new();
    docs.insert(DEEP_DIVE.to_string(), body);
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn fp(path: &str, size: u64) -> FileFingerprint {
        FileFingerprint {
            path: path.to_string(),
            size,
            mtime_ns: 1,
        }
    }

    #[test]
    fn heuristic_prefers_large_source_files() {
        let ctx = ProjectContext {
            root: PathBuf::from("/p"),
            fingerprint: ProjectFingerprint::from_files(vec![
                fp("README.md", 9_000),
                fp("src/lib.rs", 500),
                fp("src/big.rs", 4_000),
                fp("Cargo.toml", 300),
            ]),
            readme_excerpt: None,
        };
        let picked: Vec<String> = heuristic_targets(&ctx, 2).into_iter().map(|f| f.path).collect();
        assert_eq!(picked, vec!["src/big.rs".to_string(), "src/lib.rs".to_string()]);
    }

    #[test]
    fn local_deep_dive_lists_reviews() {
        let docs = compose_locally(
            &["error handling".to_string()],
            &[("src/lib.rs".to_string(), "- uses thiserror".to_string())],
        );
        assert!(docs[DEEP_DIVE].contains("## `src/lib.rs`\n\n- uses thiserror\n"));
    }
}
