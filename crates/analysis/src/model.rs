use crate::consensus::ConsensusPath;
use crate::{AnalysisError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Escalating cost/fidelity level of an analysis pass.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Quick,
    Detailed,
    Deep,
    Full,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Quick, Tier::Detailed, Tier::Deep, Tier::Full];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Detailed => "detailed",
            Self::Deep => "deep",
            Self::Full => "full",
        }
    }

    #[must_use]
    pub fn next(self) -> Option<Tier> {
        match self {
            Self::Quick => Some(Self::Detailed),
            Self::Detailed => Some(Self::Deep),
            Self::Deep => Some(Self::Full),
            Self::Full => None,
        }
    }

    /// Every tier from `self` up to and including `last`.
    ///
    /// A `last` below `self` yields just `self`.
    #[must_use]
    pub fn through(self, last: Tier) -> Vec<Tier> {
        let mut tiers = vec![self];
        let mut current = self;
        while current < last {
            match current.next() {
                Some(next) => {
                    tiers.push(next);
                    current = next;
                }
                None => break,
            }
        }
        tiers
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = AnalysisError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "detailed" => Ok(Self::Detailed),
            "deep" => Ok(Self::Deep),
            "full" => Ok(Self::Full),
            other => Err(AnalysisError::Config(format!(
                "Unknown tier '{other}' (expected quick, detailed, deep or full)"
            ))),
        }
    }
}

/// Stage of a tier pass that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierStage {
    Crowd,
    Workers,
    Adjudicator,
    Persist,
}

impl TierStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crowd => "crowd",
            Self::Workers => "workers",
            Self::Adjudicator => "adjudicator",
            Self::Persist => "persist",
        }
    }
}

impl fmt::Display for TierStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One speculative classification. Any field may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrowdVote {
    #[serde(
        rename = "type",
        alias = "project_type",
        default,
        deserialize_with = "lenient_string"
    )]
    pub project_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub language: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub framework: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub purpose: String,
}

impl CrowdVote {
    /// True when no field carries any text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|field| field.trim().is_empty())
    }

    pub(crate) fn fields(&self) -> [&str; 4] {
        [
            &self.project_type,
            &self.language,
            &self.framework,
            &self.purpose,
        ]
    }
}

/// Consensus answer with a confidence in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AdjudicatedAnswer {
    #[serde(rename = "type", alias = "project_type", default)]
    pub project_type: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub purpose: String,
    pub confidence: f64,
}

impl AdjudicatedAnswer {
    pub(crate) fn from_vote(vote: &CrowdVote, confidence: f64) -> Self {
        Self {
            project_type: vote.project_type.trim().to_string(),
            language: vote.language.trim().to_string(),
            framework: vote.framework.trim().to_string(),
            purpose: vote.purpose.trim().to_string(),
            confidence,
        }
        .clamped()
    }

    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.confidence = clamp_confidence(self.confidence);
        self
    }

    pub(crate) fn as_vote(&self) -> CrowdVote {
        CrowdVote {
            project_type: self.project_type.clone(),
            language: self.language.clone(),
            framework: self.framework.clone(),
            purpose: self.purpose.clone(),
        }
    }
}

pub(crate) fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Outcome of the startup scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResult {
    pub project_path: PathBuf,
    pub project_type: String,
    pub language: String,
    pub framework: String,
    pub purpose: String,
    pub file_count: usize,
    pub confidence: f64,
    pub iteration: u64,
    #[serde(rename = "duration_ms", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
    pub consensus: ConsensusPath,
}

impl ScanResult {
    pub fn answer(&self) -> AdjudicatedAnswer {
        AdjudicatedAnswer {
            project_type: self.project_type.clone(),
            language: self.language.clone(),
            framework: self.framework.clone(),
            purpose: self.purpose.clone(),
            confidence: self.confidence,
        }
    }
}

pub(crate) fn serialize_duration_ms<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Models emit `null`, numbers or lists where a string is expected; keep whatever text there is.
pub(crate) fn lenient_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tier_order_and_ranges() {
        assert_eq!(Tier::Quick.next(), Some(Tier::Detailed));
        assert_eq!(Tier::Full.next(), None);
        assert_eq!(
            Tier::Detailed.through(Tier::Full),
            vec![Tier::Detailed, Tier::Deep, Tier::Full]
        );
        assert_eq!(Tier::Deep.through(Tier::Quick), vec![Tier::Deep]);
        assert_eq!("DEEP".parse::<Tier>().unwrap(), Tier::Deep);
        assert!("medium".parse::<Tier>().is_err());
    }

    #[test]
    fn vote_emptiness_ignores_whitespace() {
        let vote: CrowdVote = serde_json::from_str(r#"{"type": "  ", "language": null}"#).unwrap();
        assert!(vote.is_empty());
        let vote: CrowdVote = serde_json::from_str(r#"{"purpose": "cli tool"}"#).unwrap();
        assert!(!vote.is_empty());
    }

    #[test]
    fn vote_accepts_loose_field_shapes() {
        let vote: CrowdVote = serde_json::from_str(
            r#"{"project_type": "service", "language": ["rust", "sql"], "framework": 3}"#,
        )
        .unwrap();
        assert_eq!(vote.project_type, "service");
        assert_eq!(vote.language, "rust, sql");
        assert_eq!(vote.framework, "3");
        assert_eq!(vote.purpose, "");
    }

    #[test]
    fn confidence_is_clamped() {
        let answer = AdjudicatedAnswer {
            confidence: 1.7,
            ..AdjudicatedAnswer::default()
        };
        assert_eq!(answer.clamped().confidence, 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
    }
}
