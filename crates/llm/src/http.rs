use crate::client::CompletionClient;
use crate::types::{CompletionRequest, Role};
use crate::{LlmError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::str::FromStr;

const MAX_ERROR_BODY_CHARS: usize = 400;

/// Wire dialect of the local model server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// `POST /v1/chat/completions` (llama.cpp server, vLLM, LM Studio, ...)
    #[default]
    OpenAi,
    /// `POST /api/chat`
    Ollama,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl FromStr for Backend {
    type Err = LlmError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai-compatible" | "llamacpp" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(LlmError::Config(format!(
                "Unsupported backend '{other}' (expected 'openai' or 'ollama')"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub backend: Backend,
    pub model: String,
    pub api_key: Option<String>,
}

/// reqwest-backed client for a locally hosted model server.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    http: reqwest::Client,
    config: HttpClientConfig,
}

impl HttpCompletionClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        if config.model.trim().is_empty() {
            return Err(LlmError::Config("model name must not be empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| LlmError::Config(format!("build HTTP client: {err}")))?;
        Ok(Self { http, config })
    }

    #[must_use]
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.backend {
            Backend::OpenAi if base.ends_with("/v1") => format!("{base}/chat/completions"),
            Backend::OpenAi => format!("{base}/v1/chat/completions"),
            Backend::Ollama => format!("{base}/api/chat"),
        }
    }

    #[must_use]
    pub fn build_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": msg.content })
            })
            .collect();

        match self.config.backend {
            Backend::OpenAi => {
                let mut body = json!({
                    "model": self.config.model,
                    "messages": messages,
                    "stream": false,
                    "max_tokens": request.max_tokens,
                });
                if let Some(temperature) = request.temperature {
                    body["temperature"] = json!(temperature);
                }
                body
            }
            Backend::Ollama => {
                let mut options = json!({
                    "num_ctx": request.context_size,
                    "num_predict": request.max_tokens,
                });
                if let Some(temperature) = request.temperature {
                    options["temperature"] = json!(temperature);
                }
                json!({
                    "model": self.config.model,
                    "messages": messages,
                    "stream": false,
                    "options": options,
                })
            }
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let url = self.endpoint();
        let mut builder = self
            .http
            .post(&url)
            .timeout(request.timeout)
            .json(&self.build_body(request));
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        log::debug!("POST {url} [{}]", request.label);
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::Timeout(request.timeout)
            } else {
                LlmError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::Timeout(request.timeout)
            } else {
                LlmError::Transport(err.to_string())
            }
        })?;
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        match self.config.backend {
            Backend::OpenAi => parse_openai_completion(&body),
            Backend::Ollama => parse_ollama_completion(&body),
        }
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }
}

/// `choices[0].message.content` of an OpenAI-style response.
pub fn parse_openai_completion(body: &str) -> Result<String> {
    let json: Value = serde_json::from_str(body)?;
    json["choices"]
        .get(0)
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LlmError::Parse("missing choices[0].message.content".to_string()))
}

/// `message.content` of an Ollama `/api/chat` response.
pub fn parse_ollama_completion(body: &str) -> Result<String> {
    let json: Value = serde_json::from_str(body)?;
    json.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LlmError::Parse("missing message.content".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;
    use pretty_assertions::assert_eq;

    fn client(backend: Backend, base_url: &str) -> HttpCompletionClient {
        HttpCompletionClient::new(HttpClientConfig {
            base_url: base_url.to_string(),
            backend,
            model: "qwen2.5-coder:7b".to_string(),
            api_key: None,
        })
        .unwrap()
    }

    #[test]
    fn endpoints_follow_backend_dialect() {
        assert_eq!(
            client(Backend::OpenAi, "http://127.0.0.1:8080/").endpoint(),
            "http://127.0.0.1:8080/v1/chat/completions"
        );
        assert_eq!(
            client(Backend::OpenAi, "http://127.0.0.1:8080/v1").endpoint(),
            "http://127.0.0.1:8080/v1/chat/completions"
        );
        assert_eq!(
            client(Backend::Ollama, "http://127.0.0.1:11434").endpoint(),
            "http://127.0.0.1:11434/api/chat"
        );
    }

    #[test]
    fn ollama_body_carries_context_window() {
        let request = CompletionRequest::new("crowd/0", vec![ChatMessage::user("hi")])
            .with_max_tokens(64)
            .with_context_size(4096);
        let body = client(Backend::Ollama, "http://x").build_body(&request);
        assert_eq!(body["options"]["num_ctx"], 4096);
        assert_eq!(body["options"]["num_predict"], 64);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn openai_body_sets_max_tokens_and_temperature() {
        let request = CompletionRequest::new("crowd/0", vec![ChatMessage::system("s")])
            .with_max_tokens(32)
            .with_temperature(0.5);
        let body = client(Backend::OpenAi, "http://x").build_body(&request);
        assert_eq!(body["max_tokens"], 32);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["model"], "qwen2.5-coder:7b");
    }

    #[test]
    fn parses_both_response_shapes() {
        let openai = r#"{"choices":[{"message":{"role":"assistant","content":"{\"a\":1}"}}]}"#;
        assert_eq!(parse_openai_completion(openai).unwrap(), "{\"a\":1}");

        let ollama = r#"{"model":"m","message":{"role":"assistant","content":"hello"},"done":true}"#;
        assert_eq!(parse_ollama_completion(ollama).unwrap(), "hello");

        assert!(matches!(
            parse_openai_completion(r#"{"choices":[]}"#),
            Err(LlmError::Parse(_))
        ));
        assert!(matches!(
            parse_ollama_completion("not json"),
            Err(LlmError::Parse(_))
        ));
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("Ollama".parse::<Backend>().unwrap(), Backend::Ollama);
        assert_eq!("openai".parse::<Backend>().unwrap(), Backend::OpenAi);
        assert!("grpc".parse::<Backend>().is_err());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let client = client(Backend::OpenAi, "http://127.0.0.1:9");
        let request = CompletionRequest::new("probe", vec![ChatMessage::user("hi")])
            .with_timeout(std::time::Duration::from_secs(2));
        let err = client.complete(&request).await.unwrap_err();
        assert!(matches!(
            err,
            LlmError::Transport(_) | LlmError::Timeout(_)
        ));
    }
}
