use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{Value, json};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 45;
const MAX_REPLY_TOKENS: u64 = 4096;

/// Outcome of one oracle request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleReply {
    pub success: bool,
    pub text: String,
}

impl OracleReply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            text: reason.into(),
        }
    }
}

/// Opaque judge used for keep/remove decisions and content condensation.
pub trait Oracle: Send + Sync {
    fn label(&self) -> &str;
    fn complete(&self, instruction: &str) -> OracleReply;
}

/// Declines every request so callers take their deterministic fallback.
pub struct RuleOnlyOracle;

impl Oracle for RuleOnlyOracle {
    fn label(&self) -> &str {
        "local"
    }

    fn complete(&self, _instruction: &str) -> OracleReply {
        OracleReply::failed("no remote oracle configured")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteProvider {
    OpenAi,
    Anthropic,
    Gemini,
    OpenAiCompatible,
}

/// Model-name prefixes that identify a provider without an explicit hint.
const MODEL_PREFIXES: &[(&str, RemoteProvider)] = &[
    ("deepseek-", RemoteProvider::OpenAiCompatible),
    ("claude-", RemoteProvider::Anthropic),
    ("gemini-", RemoteProvider::Gemini),
    ("gpt-", RemoteProvider::OpenAi),
    ("o1", RemoteProvider::OpenAi),
    ("o3", RemoteProvider::OpenAi),
    ("o4", RemoteProvider::OpenAi),
];

/// Lookup order when only an API key is present.
const KEY_LOOKUP_ORDER: &[RemoteProvider] = &[
    RemoteProvider::OpenAiCompatible,
    RemoteProvider::OpenAi,
    RemoteProvider::Anthropic,
    RemoteProvider::Gemini,
];

impl RemoteProvider {
    pub fn label(self) -> &'static str {
        match self {
            RemoteProvider::OpenAi => "openai",
            RemoteProvider::Anthropic => "anthropic",
            RemoteProvider::Gemini => "gemini",
            RemoteProvider::OpenAiCompatible => "openai-compatible",
        }
    }

    fn from_alias(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(RemoteProvider::OpenAi),
            "anthropic" | "claude" => Some(RemoteProvider::Anthropic),
            "gemini" | "google" => Some(RemoteProvider::Gemini),
            "openai-compatible" | "compatible" | "deepseek" => Some(RemoteProvider::OpenAiCompatible),
            _ => None,
        }
    }

    fn from_model(model: &str) -> Option<Self> {
        let lower = model.trim().to_ascii_lowercase();
        MODEL_PREFIXES
            .iter()
            .find(|(prefix, _)| lower.starts_with(prefix))
            .map(|(_, provider)| *provider)
    }

    fn default_model(self) -> &'static str {
        match self {
            RemoteProvider::OpenAi => "gpt-4.1-mini",
            RemoteProvider::Anthropic => "claude-3-5-haiku-latest",
            RemoteProvider::Gemini => "gemini-2.5-flash-lite",
            RemoteProvider::OpenAiCompatible => "deepseek-chat",
        }
    }

    /// Environment variables holding this provider's key, most specific first.
    fn key_vars(self) -> &'static [&'static str] {
        match self {
            RemoteProvider::OpenAi => &["OPENAI_API_KEY", "AI_API_KEY"],
            RemoteProvider::Anthropic => &["ANTHROPIC_API_KEY", "AI_API_KEY"],
            RemoteProvider::Gemini => &["GEMINI_API_KEY", "AI_API_KEY"],
            RemoteProvider::OpenAiCompatible => &["AI_API_KEY", "DEEPSEEK_API_KEY", "OPENAI_API_KEY"],
        }
    }

    fn request_body(self, model: &str, prompt: &str) -> Value {
        match self {
            RemoteProvider::Gemini => json!({"contents": [{"parts": [{"text": prompt}]}]}),
            RemoteProvider::OpenAi => json!({"model": model, "input": prompt, "temperature": 0.0}),
            RemoteProvider::OpenAiCompatible => json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": 0.0
            }),
            RemoteProvider::Anthropic => json!({
                "model": model,
                "max_tokens": MAX_REPLY_TOKENS,
                "temperature": 0.0,
                "messages": [{"role": "user", "content": prompt}]
            }),
        }
    }

    /// Pulls the reply text out of a provider response body.
    fn reply_text(self, body: &Value) -> Option<String> {
        match self {
            RemoteProvider::OpenAi => {
                if let Some(text) = body.get("output_text").and_then(Value::as_str) {
                    return Some(text.to_string());
                }
                let parts: Vec<Value> = body
                    .get("output")?
                    .as_array()?
                    .iter()
                    .filter_map(|item| item.get("content").and_then(Value::as_array))
                    .flatten()
                    .cloned()
                    .collect();
                collect_text_parts(&parts)
            }
            RemoteProvider::Anthropic => collect_text_parts(body.get("content")?.as_array()?),
            RemoteProvider::Gemini => {
                let parts = body
                    .pointer("/candidates/0/content/parts")?
                    .as_array()?;
                collect_text_parts(parts.get(..1)?)
            }
            RemoteProvider::OpenAiCompatible => match body.pointer("/choices/0/message/content")? {
                Value::String(text) => Some(text.clone()),
                Value::Array(parts) => collect_text_parts(parts),
                _ => None,
            },
        }
    }
}

/// Joins the `text` fields of content parts; `None` when there are none.
fn collect_text_parts(parts: &[Value]) -> Option<String> {
    let chunks: Vec<&str> = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    (!chunks.is_empty()).then(|| chunks.join("\n"))
}

#[derive(Debug, Clone)]
pub struct RemoteModelConfig {
    pub provider: RemoteProvider,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
}

fn env_non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Splits an optional `provider:` hint off a model name.
fn parse_prefixed_model(raw: &str) -> (Option<RemoteProvider>, String) {
    let trimmed = raw.trim();
    match trimmed.split_once(':') {
        Some((prefix, model)) => match RemoteProvider::from_alias(prefix) {
            Some(provider) => (Some(provider), model.trim().to_string()),
            None => (None, trimmed.to_string()),
        },
        None => (None, trimmed.to_string()),
    }
}

fn provider_with_key() -> Option<RemoteProvider> {
    KEY_LOOKUP_ORDER
        .iter()
        .copied()
        .find(|p| env_non_empty(p.key_vars()[0]).is_some())
}

fn api_key_for(provider: RemoteProvider) -> Option<String> {
    provider.key_vars().iter().find_map(|var| env_non_empty(var))
}

fn compatible_base_url(model: &str) -> Option<String> {
    env_non_empty("AI_BASE_URL").or_else(|| {
        model
            .trim()
            .to_ascii_lowercase()
            .starts_with("deepseek-")
            .then(|| "https://api.deepseek.com".to_string())
    })
}

/// Resolves the remote model from the environment; `None` means run on rules only.
pub fn resolve_remote_config() -> Option<RemoteModelConfig> {
    let provider_hint = env_non_empty("PREBAKE_ORACLE_PROVIDER");
    if provider_hint
        .as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case("local"))
    {
        return None;
    }

    let configured_model = env_non_empty("PREBAKE_ORACLE_MODEL")
        .or_else(|| env_non_empty("AI_MODEL"))
        .or_else(|| provider_with_key().map(|p| p.default_model().to_string()));
    let (model_hint, mut model) = configured_model
        .as_deref()
        .map(parse_prefixed_model)
        .unwrap_or((None, String::new()));

    let provider = provider_hint
        .as_deref()
        .and_then(RemoteProvider::from_alias)
        .or_else(|| env_non_empty("AI_PROVIDER").as_deref().and_then(RemoteProvider::from_alias))
        .or(model_hint)
        .or_else(|| RemoteProvider::from_model(&model))
        .or_else(provider_with_key)?;
    if model.is_empty() {
        model = provider.default_model().to_string();
    }

    let base_url = match provider {
        RemoteProvider::OpenAiCompatible => Some(compatible_base_url(&model)?),
        _ => None,
    };
    let api_key = api_key_for(provider)?;
    Some(RemoteModelConfig {
        provider,
        model,
        api_key,
        base_url,
    })
}

/// Oracle backed by a hosted language model.
pub struct RemoteOracle {
    config: RemoteModelConfig,
    client: Client,
    label: String,
}

impl RemoteOracle {
    pub fn new(config: RemoteModelConfig) -> Result<Self> {
        let timeout_secs = env_non_empty("PREBAKE_ORACLE_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build oracle http client")?;
        let label = format!("{}:{}", config.provider.label(), config.model);
        Ok(Self {
            config,
            client,
            label,
        })
    }

    fn request(&self, body: &Value) -> Result<RequestBuilder> {
        let cfg = &self.config;
        let request = match cfg.provider {
            RemoteProvider::Gemini => self
                .client
                .post(format!(
                    "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
                    cfg.model
                ))
                .query(&[("key", cfg.api_key.as_str())]),
            RemoteProvider::OpenAi => self
                .client
                .post("https://api.openai.com/v1/responses")
                .bearer_auth(&cfg.api_key),
            RemoteProvider::OpenAiCompatible => {
                let base = cfg
                    .base_url
                    .as_deref()
                    .context("openai-compatible provider requires AI_BASE_URL")?
                    .trim_end_matches('/');
                self.client
                    .post(format!("{base}/v1/chat/completions"))
                    .bearer_auth(&cfg.api_key)
            }
            RemoteProvider::Anthropic => self
                .client
                .post("https://api.anthropic.com/v1/messages")
                .header("x-api-key", &cfg.api_key)
                .header("anthropic-version", "2023-06-01"),
        };
        Ok(request.json(body))
    }

    fn call(&self, prompt: &str) -> Result<String> {
        let provider = self.config.provider;
        let body = provider.request_body(&self.config.model, prompt);
        let response = self.request(&body)?.send()?;
        let status = response.status();
        if !status.is_success() {
            bail!("{} call failed with status {status}", provider.label());
        }
        let reply: Value = response.json()?;
        provider
            .reply_text(&reply)
            .with_context(|| format!("{} response missing text content", provider.label()))
    }
}

impl Oracle for RemoteOracle {
    fn label(&self) -> &str {
        &self.label
    }

    fn complete(&self, instruction: &str) -> OracleReply {
        match self.call(instruction) {
            Ok(text) => OracleReply::ok(text),
            Err(err) => {
                warn!(oracle = %self.label, "oracle call failed: {err:#}");
                OracleReply::failed(format!("{err:#}"))
            }
        }
    }
}

/// Picks the oracle for this deployment from the environment.
pub fn resolve_oracle() -> Arc<dyn Oracle> {
    let Some(config) = resolve_remote_config() else {
        debug!("no remote oracle configured; using rule fallbacks");
        return Arc::new(RuleOnlyOracle);
    };
    match RemoteOracle::new(config) {
        Ok(oracle) => Arc::new(oracle),
        Err(err) => {
            warn!("remote oracle unavailable, using rule fallbacks: {err:#}");
            Arc::new(RuleOnlyOracle)
        }
    }
}

/// Removes a surrounding markdown code fence from a model reply.
pub fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
