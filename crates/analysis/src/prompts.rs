//! Prompt text for every model call the engine makes.
//!
//! Replies that must be machine-read are requested as a single JSON object; the reader recovers
//! the object from the first `{` to the last `}`.

use crate::context::ProjectContext;
use crate::knowledge::KnowledgeFiles;
use crate::model::{AdjudicatedAnswer, CrowdVote};
use lore_llm::ChatMessage;

const JSON_ONLY: &str = "Reply with a single JSON object and nothing else.";

pub(crate) fn crowd(ctx: &ProjectContext) -> Vec<ChatMessage> {
    let mut user = String::from(
        "Classify this software project from its file listing.\n\
         Return {\"type\": ..., \"language\": ..., \"framework\": ..., \"purpose\": ...}.\n\
         `type` is one of: library, cli, service, web-app, desktop-app, mobile-app, plugin, \
         monorepo, other. Use \"none\" for framework when there is none. \
         `purpose` is one short sentence.\n\n",
    );
    user.push_str("## Files\n");
    user.push_str(&ctx.listing());
    if let Some(readme) = &ctx.readme_excerpt {
        user.push_str("\n## README (excerpt)\n");
        user.push_str(readme);
        user.push('\n');
    }
    vec![
        ChatMessage::system(format!("You are a fast project classifier. {JSON_ONLY}")),
        ChatMessage::user(user),
    ]
}

pub(crate) fn adjudicate(
    votes: &[CrowdVote],
    prior: Option<&AdjudicatedAnswer>,
) -> Vec<ChatMessage> {
    let votes_json = serde_json::to_string(votes).unwrap_or_else(|_| "[]".to_string());
    let user = match prior {
        Some(prior) => {
            let prior_json = serde_json::to_string(prior).unwrap_or_else(|_| "{}".to_string());
            format!(
                "A previous analysis of this project concluded:\n{prior_json}\n\n\
                 Independent classifiers now voted (empty objects are failed voters, ignore \
                 them):\n{votes_json}\n\n\
                 Treat the previous answer as the baseline. Change a field only when the votes \
                 strongly and consistently disagree with it. When the votes reaffirm the \
                 baseline, raise the confidence.\n\
                 Return {{\"type\", \"language\", \"framework\", \"purpose\", \"confidence\"}} \
                 with confidence between 0 and 1."
            )
        }
        None => format!(
            "Independent classifiers voted on what this project is (empty objects are failed \
             voters, ignore them):\n{votes_json}\n\n\
             Pick the best-supported answer for each field.\n\
             Return {{\"type\", \"language\", \"framework\", \"purpose\", \"confidence\"}} with \
             confidence between 0 and 1 reflecting how strongly the votes agree."
        ),
    };
    vec![
        ChatMessage::system(format!("You adjudicate between noisy votes. {JSON_ONLY}")),
        ChatMessage::user(user),
    ]
}

pub(crate) fn detailed_worker(path: &str, content: &str, words: usize) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!("You summarize source files for a code map. {JSON_ONLY}")),
        ChatMessage::user(format!(
            "File: {path}\n```\n{content}\n```\n\n\
             Return {{\"summary\": ..., \"importance\": ...}}. `summary` is at most {words} \
             words on what the file does and what it exposes. `importance` is 0-10: how central \
             the file is to understanding the project."
        )),
    ]
}

pub(crate) fn deep_worker(
    path: &str,
    content: &str,
    focus_areas: &[String],
    overview: &str,
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You review source files in depth. Answer in concise markdown bullet points."
                .to_string(),
        ),
        ChatMessage::user(format!(
            "Project overview:\n{overview}\n\nFile: {path}\n```\n{content}\n```\n\n\
             Report findings for each focus area: {}. Name concrete functions and types. \
             Say \"nothing notable\" for an area with no findings.",
            focus_areas.join(", ")
        )),
    ]
}

pub(crate) fn full_draft(doc_name: &str, body: &str, findings: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You are a technical writer. Rewrite documents as clear prose markdown.".to_string(),
        ),
        ChatMessage::user(format!(
            "Rewrite `{doc_name}` for a developer new to the project. Keep every fact, drop \
             speculation, prefer short sections.\n\n## Current document\n{body}\n\n\
             ## Key findings\n{findings}"
        )),
    ]
}

/// Revision request shared by the detailed, deep and full syntheses.
///
/// The reply shape is `{"documents": {"<name>.md": "<markdown>"}, "confidence": <0..1>}`.
pub(crate) fn synthesis(
    task: &str,
    expected_docs: &[&str],
    current: &KnowledgeFiles,
    evidence: &str,
) -> Vec<ChatMessage> {
    let mut user = format!("{task}\n\n");
    if current.is_empty() {
        user.push_str("There are no existing documents yet.\n\n");
    } else {
        user.push_str(
            "Existing documents follow. Revise them skeptically: correct what the evidence \
             contradicts, keep what it supports, do not append duplicate sections.\n\n",
        );
        for (name, body) in current {
            user.push_str(&format!("### {name}\n{body}\n\n"));
        }
    }
    user.push_str("## Evidence\n");
    user.push_str(evidence);
    user.push_str(&format!(
        "\n\nReturn {{\"documents\": {{...}}, \"confidence\": ...}} where documents maps each of \
         [{}] to its full markdown text and confidence is between 0 and 1.",
        expected_docs.join(", ")
    ));
    vec![
        ChatMessage::system(format!("You maintain a project's knowledge documents. {JSON_ONLY}")),
        ChatMessage::user(user),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjudication_embeds_votes_verbatim() {
        let votes = vec![
            CrowdVote {
                language: "go".to_string(),
                ..CrowdVote::default()
            },
            CrowdVote::default(),
        ];
        let fresh = adjudicate(&votes, None);
        let user = &fresh[1].content;
        assert!(user.contains(&serde_json::to_string(&votes).unwrap()));
        assert!(user.contains("best-supported"));

        let prior = AdjudicatedAnswer {
            language: "go".to_string(),
            confidence: 0.6,
            ..AdjudicatedAnswer::default()
        };
        let progressive = adjudicate(&votes, Some(&prior));
        assert!(progressive[1].content.contains("baseline"));
        assert!(progressive[1].content.contains("\"confidence\":0.6"));
    }
}
