use crate::consensus::ConsensusPath;
use crate::knowledge::KnowledgeFiles;
use crate::model::{serialize_duration_ms, AdjudicatedAnswer, Tier};
use lore_indexer::StaleReason;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

/// A file ranked by the detailed tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RankedFile {
    pub path: String,
    pub importance: f64,
    pub summary: String,
}

/// One deep-tier finding carried into the full tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Finding {
    pub path: String,
    pub importance: f64,
    pub text: String,
}

/// Fields shared by every tier result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierOutcome {
    pub tier: Tier,
    pub project_path: PathBuf,
    #[serde(rename = "duration_ms", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    pub knowledge_files: KnowledgeFiles,
    pub cached: bool,
    pub degraded: bool,
    pub confidence: f64,
    pub processed: usize,
    pub carried: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stale_reasons: Vec<StaleReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AnalysisResult {
    Quick {
        #[serde(flatten)]
        outcome: TierOutcome,
        answer: AdjudicatedAnswer,
        consensus: ConsensusPath,
    },
    Detailed {
        #[serde(flatten)]
        outcome: TierOutcome,
        top_files: Vec<RankedFile>,
    },
    Deep {
        #[serde(flatten)]
        outcome: TierOutcome,
        focus_areas: Vec<String>,
        examined: Vec<String>,
    },
    Full {
        #[serde(flatten)]
        outcome: TierOutcome,
        top_findings: Vec<Finding>,
    },
}

impl AnalysisResult {
    pub fn outcome(&self) -> &TierOutcome {
        match self {
            Self::Quick { outcome, .. }
            | Self::Detailed { outcome, .. }
            | Self::Deep { outcome, .. }
            | Self::Full { outcome, .. } => outcome,
        }
    }

    pub fn tier(&self) -> Tier {
        self.outcome().tier
    }

    pub fn knowledge_files(&self) -> &KnowledgeFiles {
        &self.outcome().knowledge_files
    }

    /// Plain-text rendering for handing the result to another model call.
    pub fn format_for_prompt(&self) -> String {
        let outcome = self.outcome();
        let mut out = format!(
            "## {} analysis of {}\nconfidence: {:.2}{}{}\n",
            outcome.tier,
            outcome.project_path.display(),
            outcome.confidence,
            if outcome.cached { ", cached" } else { "" },
            if outcome.degraded { ", degraded" } else { "" },
        );

        match self {
            Self::Quick { answer, .. } => {
                let _ = writeln!(
                    out,
                    "type: {}\nlanguage: {}\nframework: {}\npurpose: {}",
                    answer.project_type, answer.language, answer.framework, answer.purpose
                );
            }
            Self::Detailed { top_files, .. } => {
                out.push_str("top files:\n");
                for file in top_files {
                    let _ = writeln!(out, "- {} ({:.0}): {}", file.path, file.importance, file.summary);
                }
            }
            Self::Deep {
                focus_areas,
                examined,
                ..
            } => {
                let _ = writeln!(out, "focus areas: {}", focus_areas.join(", "));
                let _ = writeln!(out, "examined: {}", examined.join(", "));
            }
            Self::Full { top_findings, .. } => {
                out.push_str("top findings:\n");
                for finding in top_findings {
                    let _ = writeln!(out, "- {}: {}", finding.path, first_line(&finding.text));
                }
            }
        }

        for (name, body) in &outcome.knowledge_files {
            let _ = write!(out, "\n### {name}\n{}\n", body.trim_end());
        }
        out
    }
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn outcome(tier: Tier) -> TierOutcome {
        let mut knowledge_files = KnowledgeFiles::new();
        knowledge_files.insert("overview.md".to_string(), "# Overview\nA tool.\n".to_string());
        TierOutcome {
            tier,
            project_path: PathBuf::from("/work/tool"),
            duration: Duration::from_millis(1500),
            knowledge_files,
            cached: true,
            degraded: false,
            confidence: 0.8,
            processed: 0,
            carried: 3,
            failed: 0,
            stale_reasons: Vec::new(),
        }
    }

    #[test]
    fn serializes_with_kind_tag_and_flat_outcome() {
        let result = AnalysisResult::Detailed {
            outcome: outcome(Tier::Detailed),
            top_files: vec![RankedFile {
                path: "src/main.rs".to_string(),
                importance: 9.0,
                summary: "entry point".to_string(),
            }],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["kind"], "detailed");
        assert_eq!(json["tier"], "detailed");
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["top_files"][0]["path"], "src/main.rs");
        assert!(json.get("stale_reasons").is_none());
    }

    #[test]
    fn prompt_rendering_includes_documents() {
        let result = AnalysisResult::Quick {
            outcome: outcome(Tier::Quick),
            answer: AdjudicatedAnswer {
                project_type: "cli".to_string(),
                language: "rust".to_string(),
                framework: "clap".to_string(),
                purpose: "does things".to_string(),
                confidence: 0.8,
            },
            consensus: ConsensusPath::Adjudicated,
        };
        let text = result.format_for_prompt();
        assert!(text.starts_with("## quick analysis of /work/tool\nconfidence: 0.80, cached\n"));
        assert!(text.contains("language: rust\n"));
        assert!(text.contains("### overview.md\n# Overview\nA tool.\n"));
    }
}
