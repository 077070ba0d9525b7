use lore_analysis::{AnalysisResult, ProjectStatus, ScanResult};
use std::fmt::Write;

pub(crate) fn scan(scan: &ScanResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Project: {}", scan.project_path.display());
    let _ = writeln!(out, "  type:       {}", scan.project_type);
    let _ = writeln!(out, "  language:   {}", scan.language);
    let _ = writeln!(out, "  framework:  {}", scan.framework);
    let _ = writeln!(out, "  purpose:    {}", scan.purpose);
    let _ = writeln!(
        out,
        "  files: {}, confidence {:.2} ({}), iteration {}, {} ms",
        scan.file_count,
        scan.confidence,
        scan.consensus.as_str(),
        scan.iteration,
        scan.duration.as_millis()
    );
    out
}

pub(crate) fn analysis(result: &AnalysisResult) -> String {
    let outcome = result.outcome();
    let mut out = String::new();
    let state = if outcome.cached {
        "cached"
    } else if outcome.degraded {
        "degraded"
    } else {
        "done"
    };
    let _ = writeln!(
        out,
        "[{}] {state}: confidence {:.2}, {} processed, {} carried, {} failed, {} ms",
        outcome.tier,
        outcome.confidence,
        outcome.processed,
        outcome.carried,
        outcome.failed,
        outcome.duration.as_millis()
    );
    if !outcome.stale_reasons.is_empty() {
        let reasons: Vec<&str> = outcome.stale_reasons.iter().map(|r| r.as_str()).collect();
        let _ = writeln!(out, "  stale: {}", reasons.join(", "));
    }

    match result {
        AnalysisResult::Quick { answer, .. } => {
            let _ = writeln!(
                out,
                "  {} {} ({}): {}",
                answer.language, answer.project_type, answer.framework, answer.purpose
            );
        }
        AnalysisResult::Detailed { top_files, .. } => {
            for file in top_files {
                let _ = writeln!(out, "  {:>4.1}  {}", file.importance, file.path);
            }
        }
        AnalysisResult::Deep {
            focus_areas,
            examined,
            ..
        } => {
            let _ = writeln!(out, "  focus: {}", focus_areas.join(", "));
            let _ = writeln!(out, "  examined {} files", examined.len());
        }
        AnalysisResult::Full { top_findings, .. } => {
            for finding in top_findings {
                let headline = finding.text.lines().next().unwrap_or_default();
                let _ = writeln!(out, "  {:>4.1}  {}: {headline}", finding.importance, finding.path);
            }
        }
    }

    let docs: Vec<&str> = outcome.knowledge_files.keys().map(String::as_str).collect();
    let _ = writeln!(out, "  documents: {}", docs.join(", "));
    out
}

pub(crate) fn status(status: &ProjectStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Project: {} ({} files)",
        status.project_path.display(),
        status.file_count
    );
    match &status.scan {
        Some(record) => {
            let _ = writeln!(
                out,
                "Scan: iteration {}, {} {} (confidence {:.2})",
                record.iteration,
                record.answer.language,
                record.answer.project_type,
                record.answer.confidence
            );
        }
        None => out.push_str("Scan: never run\n"),
    }

    out.push_str("Tiers:\n");
    for tier in &status.tiers {
        let state = if tier.fresh { "fresh" } else { "stale" };
        let _ = write!(out, "  {:<9} {state}", tier.tier.as_str());
        if !tier.reasons.is_empty() {
            let reasons: Vec<&str> = tier.reasons.iter().map(|r| r.as_str()).collect();
            let _ = write!(out, " ({})", reasons.join(", "));
        }
        if tier.items > 0 {
            let _ = write!(out, ", {} items", tier.items);
        }
        if tier.failed_items > 0 {
            let _ = write!(out, ", {} failed", tier.failed_items);
        }
        out.push('\n');
    }

    if !status.knowledge_files.is_empty() {
        let _ = writeln!(out, "Documents: {}", status.knowledge_files.join(", "));
    }
    if let Some(health) = &status.health {
        if let Some(tier) = &health.last_tier {
            let _ = writeln!(out, "Last success: {tier}");
        }
        if let Some(stage) = &health.last_failure_stage {
            let _ = writeln!(
                out,
                "Last failure: {stage}: {}",
                health.last_failure_reason.as_deref().unwrap_or("unknown")
            );
        }
    }
    out
}
