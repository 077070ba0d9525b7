use crate::{LlmError, Result};
use std::str::FromStr;

pub const LLM_MODE_ENV: &str = "LORE_LLM_MODE";

/// Whether completions go to a real model server or a deterministic in-process stub.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LlmMode {
    #[default]
    Http,
    Stub,
}

impl LlmMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Stub => "stub",
        }
    }
}

impl FromStr for LlmMode {
    type Err = LlmError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "http" => Ok(Self::Http),
            "stub" => Ok(Self::Stub),
            other => Err(LlmError::Config(format!(
                "Unsupported {LLM_MODE_ENV} '{other}' (expected 'http' or 'stub')"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_modes() {
        assert_eq!("STUB".parse::<LlmMode>().unwrap(), LlmMode::Stub);
        assert_eq!("".parse::<LlmMode>().unwrap(), LlmMode::Http);
        assert!("fast".parse::<LlmMode>().is_err());
    }
}
