//! Offline responder behind `LORE_LLM_MODE=stub`.
//!
//! Answers every call the engine makes from the prompt alone, keyed on the request label, so the
//! full pipeline runs without a model server.

use crate::consensus::tally;
use crate::model::CrowdVote;
use lore_llm::{CompletionRequest, LlmError, ScriptedClient};
use serde_json::json;
use std::path::Path;

const LANGUAGES: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("go", "go"),
    ("py", "python"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("js", "javascript"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("c", "c"),
    ("h", "c"),
    ("cpp", "c++"),
    ("cs", "c#"),
    ("rb", "ruby"),
    ("php", "php"),
    ("swift", "swift"),
    ("sh", "shell"),
];

const KEY_FILE_STEMS: &[&str] = &["main", "lib", "mod", "index", "app", "server"];

pub fn client(model_id: impl Into<String>) -> ScriptedClient {
    ScriptedClient::new(model_id, |request, _| respond(request))
}

/// Reply the stub gives to `request`.
pub fn respond(request: &CompletionRequest) -> lore_llm::Result<String> {
    let label = request.label.as_str();
    let prompt = request.user_prompt().unwrap_or_default();
    if label.contains("/crowd/") {
        Ok(crowd_vote(prompt))
    } else if label.ends_with("/adjudicate") {
        adjudicate(prompt)
    } else if let Some(path) = label.split_once("/worker/").map(|(_, path)| path) {
        if label.starts_with("detailed/") {
            Ok(file_summary(path))
        } else {
            Ok(format!("- `{path}` reviewed; nothing unusual found.\n"))
        }
    } else if let Some((_, doc)) = label.split_once("/draft/") {
        Ok(format!("# {doc}\n\nDraft prepared offline.\n"))
    } else if label.ends_with("/synthesis") {
        synthesis(prompt)
    } else {
        Err(LlmError::Config(format!("stub has no answer for '{label}'")))
    }
}

fn crowd_vote(prompt: &str) -> String {
    let language = prompt
        .lines()
        .find_map(|line| line.strip_prefix("extensions: "))
        .and_then(|histogram| {
            histogram.split(", ").find_map(|entry| {
                let ext = entry.split('=').next()?;
                LANGUAGES
                    .iter()
                    .find(|(known, _)| *known == ext)
                    .map(|(_, language)| *language)
            })
        })
        .unwrap_or("unknown");
    let has = |name: &str| prompt.lines().any(|line| line.ends_with(name));
    let project_type = if has("main.rs") || has("main.go") || has("__main__.py") {
        "cli"
    } else if has("lib.rs") || has("setup.py") || has("index.ts") {
        "library"
    } else {
        "other"
    };
    json!({
        "type": project_type,
        "language": language,
        "framework": "none",
        "purpose": format!("A {language} {project_type} project."),
    })
    .to_string()
}

fn adjudicate(prompt: &str) -> lore_llm::Result<String> {
    let votes: Vec<CrowdVote> = prompt
        .lines()
        .find(|line| line.trim_start().starts_with('['))
        .and_then(|line| serde_json::from_str(line.trim()).ok())
        .ok_or_else(|| LlmError::Parse("no votes in adjudication prompt".to_string()))?;
    let answer = tally(&votes, None)
        .ok_or_else(|| LlmError::Parse("every vote is empty".to_string()))?;
    serde_json::to_string(&answer).map_err(|err| LlmError::Parse(err.to_string()))
}

fn file_summary(path: &str) -> String {
    let stem = Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    let importance = if KEY_FILE_STEMS.contains(&stem) { 8 } else { 4 };
    json!({
        "summary": format!("Source file {path}."),
        "importance": importance,
    })
    .to_string()
}

fn synthesis(prompt: &str) -> lore_llm::Result<String> {
    let names = prompt
        .rfind("maps each of [")
        .map(|start| &prompt[start + "maps each of [".len()..])
        .and_then(|rest| rest.split_once(']'))
        .map(|(list, _)| list)
        .ok_or_else(|| LlmError::Parse("no document list in synthesis prompt".to_string()))?;
    let documents: serde_json::Map<String, serde_json::Value> = names
        .split(", ")
        .filter(|name| !name.is_empty())
        .map(|name| {
            let title = name.trim_end_matches(".md").replace('-', " ");
            (
                name.to_string(),
                json!(format!("# {title}\n\nCompiled offline from the evidence.\n")),
            )
        })
        .collect();
    Ok(json!({ "documents": documents, "confidence": 0.6 }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lore_llm::ChatMessage;
    use pretty_assertions::assert_eq;

    fn request(label: &str, prompt: &str) -> CompletionRequest {
        CompletionRequest::new(label, vec![ChatMessage::user(prompt)])
    }

    #[test]
    fn crowd_votes_follow_the_listing() {
        let reply = respond(&request(
            "scan/crowd/0",
            "## Files\n3 files\nextensions: md=1, rs=2\nREADME.md\nsrc/main.rs\nsrc/cli.rs\n",
        ))
        .unwrap();
        let vote: CrowdVote = serde_json::from_str(&reply).unwrap();
        assert_eq!(vote.language, "rust");
        assert_eq!(vote.project_type, "cli");
    }

    #[test]
    fn synthesis_answers_every_requested_document() {
        let reply = respond(&request(
            "detailed/synthesis",
            "... documents maps each of [overview.md, architecture.md] to its full markdown",
        ))
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert!(value["documents"]["overview.md"].is_string());
        assert!(value["documents"]["architecture.md"].is_string());
    }

    #[test]
    fn adjudication_tallies_the_embedded_votes() {
        let prompt = "voted:\n[{\"type\":\"cli\",\"language\":\"go\",\"framework\":\"\",\"purpose\":\"\"},{\"type\":\"\",\"language\":\"\",\"framework\":\"\",\"purpose\":\"\"}]\n\nPick.";
        let reply = respond(&request("quick/adjudicate", prompt)).unwrap();
        assert!(reply.contains("\"language\":\"go\""));
    }

    #[test]
    fn unknown_labels_are_errors() {
        assert!(respond(&request("mystery", "")).is_err());
    }
}
