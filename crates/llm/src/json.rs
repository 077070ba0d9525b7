use crate::{LlmError, Result};
use serde::de::DeserializeOwned;

/// Slice from the first `{` to the last `}` inclusive.
///
/// Models routinely wrap JSON in prose or code fences; this is the only recovery attempted.
#[must_use]
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Decode the embedded JSON object of a model reply.
pub fn decode_lenient<T: DeserializeOwned>(text: &str) -> Result<T> {
    let object = extract_json_object(text)
        .ok_or_else(|| LlmError::Parse(format!("no JSON object in reply: {}", preview(text))))?;
    serde_json::from_str(object).map_err(|err| LlmError::Parse(format!("{err}")))
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 80;
    let trimmed = text.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Vote {
        #[serde(default)]
        language: String,
    }

    #[test]
    fn extracts_object_wrapped_in_prose() {
        let reply = "Sure! Here it is:\n```json\n{\"language\": \"rust\"}\n```\nAnything else?";
        assert_eq!(extract_json_object(reply), Some("{\"language\": \"rust\"}"));
        let vote: Vote = decode_lenient(reply).unwrap();
        assert_eq!(vote.language, "rust");
    }

    #[test]
    fn spans_first_open_to_last_close_brace() {
        let reply = "{\"a\": {\"b\": 1}} trailing }";
        assert_eq!(extract_json_object(reply), Some("{\"a\": {\"b\": 1}} trailing }"));
    }

    #[test]
    fn reversed_or_missing_braces_yield_parse_errors() {
        assert_eq!(extract_json_object("} nope {"), None);
        let err = decode_lenient::<Vote>("no json here").unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
        let err = decode_lenient::<Vote>("{\"language\": }").unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
    }

    #[test]
    fn empty_object_decodes_to_defaults() {
        let vote: Vote = decode_lenient("{}").unwrap();
        assert_eq!(vote, Vote::default());
    }

    proptest! {
        #[test]
        fn proptest_prose_around_object_is_ignored(
            before in "[^{}]{0,40}",
            after in "[^{}]{0,40}",
            language in "[a-z]{1,12}",
        ) {
            let reply = format!("{before}{{\"language\": \"{language}\"}}{after}");
            let vote: Vote = decode_lenient(&reply).unwrap();
            prop_assert_eq!(vote.language, language);
        }
    }
}
