//! C5 — LLM Provider Abstraction.
//!
//! Resolves a model alias to a provider-specific `{api_key, base_url,
//! custom_llm_provider}` plus an invoke-model name, normalises per-model
//! knobs via `reload_params`, and emits metering records for every call.
//! The provider table and parameter normalisation rules are ported
//! exactly from the reference model-family behavior; the streaming
//! transport itself is a plain `reqwest` + manual SSE client.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::metering::{record_llm_usage, UsageCall};
use crate::store::Store;
use crate::types::UsageScene;

pub type Result<T> = std::result::Result<T, LlmError>;
pub type BoxStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    #[error("model not supported: {0}")]
    #[diagnostic(code(llm::model_not_supported))]
    ModelNotSupported(String),

    #[error("llm provider for model `{0}` is not configured")]
    #[diagnostic(code(llm::not_configured))]
    SpecifiedLlmNotConfigured(String),

    #[error("llm request for model `{model}` failed: {message}")]
    #[diagnostic(code(llm::request_failed))]
    RequestFailed { model: String, message: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

/// The caller-side identity a usage record needs; threaded through
/// separately from `(messages, model, temperature)` since the capability
/// interface itself is agnostic to who is billed.
#[derive(Clone, Debug)]
pub struct UsageContext {
    pub user_bid: String,
    pub shifu_bid: String,
    pub scene: UsageScene,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKey {
    Openai,
    Qwen,
    ErnieV2,
    Deepseek,
    Gemini,
    Glm,
    Silicon,
    Ark,
}

impl ProviderKey {
    fn label(self) -> &'static str {
        match self {
            ProviderKey::Openai => "openai",
            ProviderKey::Qwen => "qwen",
            ProviderKey::ErnieV2 => "ernie_v2",
            ProviderKey::Deepseek => "deepseek",
            ProviderKey::Gemini => "gemini",
            ProviderKey::Glm => "glm",
            ProviderKey::Silicon => "silicon",
            ProviderKey::Ark => "ark",
        }
    }
}

struct ProviderSpec {
    key: ProviderKey,
    prefix: Option<&'static str>,
    api_key_env: &'static str,
    base_url_env: &'static str,
    default_base_url: &'static str,
}

const PROVIDER_SPECS: &[ProviderSpec] = &[
    ProviderSpec {
        key: ProviderKey::Qwen,
        prefix: Some("qwen/"),
        api_key_env: "QWEN_API_KEY",
        base_url_env: "QWEN_BASE_URL",
        default_base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1",
    },
    ProviderSpec {
        key: ProviderKey::ErnieV2,
        prefix: Some("ernie/"),
        api_key_env: "ERNIE_API_KEY",
        base_url_env: "ERNIE_BASE_URL",
        default_base_url: "https://qianfan.baidubce.com/v2",
    },
    ProviderSpec {
        key: ProviderKey::Deepseek,
        prefix: Some("deepseek/"),
        api_key_env: "DEEPSEEK_API_KEY",
        base_url_env: "DEEPSEEK_BASE_URL",
        default_base_url: "https://api.deepseek.com/v1",
    },
    ProviderSpec {
        key: ProviderKey::Glm,
        prefix: Some("glm/"),
        api_key_env: "GLM_API_KEY",
        base_url_env: "GLM_BASE_URL",
        default_base_url: "https://open.bigmodel.cn/api/paas/v4",
    },
    ProviderSpec {
        key: ProviderKey::Silicon,
        prefix: Some("silicon/"),
        api_key_env: "SILICON_API_KEY",
        base_url_env: "SILICON_BASE_URL",
        default_base_url: "https://api.siliconflow.cn/v1",
    },
    ProviderSpec {
        key: ProviderKey::Ark,
        prefix: Some("ark/"),
        api_key_env: "ARK_API_KEY",
        base_url_env: "ARK_BASE_URL",
        default_base_url: "https://ark.cn-beijing.volces.com/api/v3",
    },
    ProviderSpec {
        key: ProviderKey::Gemini,
        prefix: None,
        api_key_env: "GEMINI_API_KEY",
        base_url_env: "GEMINI_BASE_URL",
        default_base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
    },
    ProviderSpec {
        key: ProviderKey::Openai,
        prefix: None,
        api_key_env: "OPENAI_API_KEY",
        base_url_env: "OPENAI_BASE_URL",
        default_base_url: "https://api.openai.com/v1",
    },
];

/// Splits a model alias into its provider and the bare invoke-model name.
/// Prefixed aliases (`qwen/…`) resolve directly; a bare `gemini*` name is
/// treated as a wildcard match for the Gemini family; anything else with
/// no recognised prefix falls back to OpenAI-compatible (the most common
/// case: plain `gpt-*`/`o*` names carry no prefix at all).
fn resolve_alias(alias: &str) -> Result<(ProviderKey, String)> {
    let lower = alias.to_ascii_lowercase();
    for spec in PROVIDER_SPECS {
        if let Some(prefix) = spec.prefix {
            if lower.starts_with(prefix) {
                return Ok((spec.key, alias[prefix.len()..].to_string()));
            }
        }
    }
    if lower.starts_with("gemini") {
        return Ok((ProviderKey::Gemini, alias.to_string()));
    }
    if let Some(rest) = alias.strip_prefix("openai/") {
        return Ok((ProviderKey::Openai, rest.to_string()));
    }
    if alias.contains('/') {
        return Err(LlmError::ModelNotSupported(alias.to_string()));
    }
    Ok((ProviderKey::Openai, alias.to_string()))
}

struct ProviderConfig {
    api_key: String,
    base_url: String,
    custom_llm_provider: &'static str,
}

fn resolve_provider_config(key: ProviderKey, model_alias: &str) -> Result<ProviderConfig> {
    let spec = PROVIDER_SPECS
        .iter()
        .find(|s| s.key == key)
        .expect("every ProviderKey has a registry entry");
    let api_key = std::env::var(spec.api_key_env)
        .map_err(|_| LlmError::SpecifiedLlmNotConfigured(model_alias.to_string()))?;
    let base_url = std::env::var(spec.base_url_env).unwrap_or_else(|_| spec.default_base_url.to_string());
    Ok(ProviderConfig { api_key, base_url, custom_llm_provider: "openai" })
}

/// Per-model-family parameter normalisation. Longer/more specific
/// prefixes are checked before their shorter, more general counterparts
/// (`gpt-5.2` before `gpt-5`).
fn reload_params(provider: ProviderKey, invoke_model: &str, temperature: Option<f32>) -> Value {
    let m = invoke_model.to_ascii_lowercase();
    let t = temperature.unwrap_or(1.0);
    match provider {
        ProviderKey::Openai => {
            if m.starts_with("gpt-5.2") {
                json!({ "reasoning_effort": "none", "temperature": t })
            } else if m.starts_with("gpt-5.1") {
                json!({ "reasoning_effort": "none", "temperature": 1 })
            } else if m.starts_with("gpt-5-pro") {
                json!({ "reasoning_effort": "none" })
            } else if m.starts_with("gpt-5") {
                json!({ "reasoning_effort": "minimal", "temperature": 1 })
            } else {
                json!({ "temperature": t })
            }
        }
        ProviderKey::Gemini => {
            if m.starts_with("gemini-2.5-pro") || m.starts_with("gemini-3") {
                json!({ "reasoning_effort": "low", "temperature": t })
            } else {
                json!({ "reasoning_effort": "none", "temperature": t })
            }
        }
        ProviderKey::Ark => json!({ "temperature": t, "extra_body": { "thinking": { "type": "disabled" } } }),
        ProviderKey::Silicon => json!({ "temperature": t, "extra_body": { "enable_thinking": false } }),
        _ => json!({ "temperature": t }),
    }
}

fn merge_object(base: &mut Value, extra: &Value) {
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
}

fn extract_token_counts(usage: &Value) -> (u64, u64, u64, u64) {
    let input = usage.get("prompt_tokens").or_else(|| usage.get("input_tokens")).and_then(Value::as_u64).unwrap_or(0);
    let output = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = usage.get("total_tokens").and_then(Value::as_u64).unwrap_or(input + output);
    let cached = usage
        .get("input_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .or_else(|| usage.get("prompt_tokens_details").and_then(|d| d.get("cached_tokens")))
        .or_else(|| usage.get("input_cache"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    (input, output, total, cached)
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: Option<f32>,
        usage_ctx: &UsageContext,
    ) -> Result<String>;

    async fn stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: Option<f32>,
        usage_ctx: UsageContext,
    ) -> Result<BoxStream>;
}

/// OpenAI-compatible HTTP client used for every provider in the registry
/// (all eight expose an OpenAI-shaped `/chat/completions` endpoint).
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    store: Arc<dyn Store>,
}

impl OpenAiCompatClient {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { http: reqwest::Client::new(), store }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatClient {
    #[instrument(skip(self, messages, usage_ctx), fields(model = %model))]
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: Option<f32>,
        usage_ctx: &UsageContext,
    ) -> Result<String> {
        let (provider, invoke_model) = resolve_alias(model)?;
        let config = resolve_provider_config(provider, model)?;
        let params = reload_params(provider, &invoke_model, temperature);

        let mut body = json!({
            "model": invoke_model,
            "messages": messages,
            "stream": false,
        });
        merge_object(&mut body, &params);

        let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        let started = Instant::now();
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed { model: model.to_string(), message: e.to_string() })?;

        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::RequestFailed { model: model.to_string(), message: e.to_string() })?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            record_llm_usage(
                self.store.as_ref(),
                UsageCall {
                    user_bid: usage_ctx.user_bid.clone(),
                    shifu_bid: usage_ctx.shifu_bid.clone(),
                    scene: usage_ctx.scene,
                    provider: provider.label().to_string(),
                    model: model.to_string(),
                    is_stream: false,
                    input: 0,
                    output: 0,
                    total: 0,
                    word_count: 0,
                    duration_ms: 0,
                    latency_ms,
                    status: "error".to_string(),
                    error_message: Some(message.clone()),
                    billable_override: None,
                    extra: Value::Null,
                },
                None,
            )
            .await;
            return Err(LlmError::RequestFailed { model: model.to_string(), message });
        }

        let text = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let (input, output, total, cached) =
            value.get("usage").map(extract_token_counts).unwrap_or((0, 0, 0, 0));

        record_llm_usage(
            self.store.as_ref(),
            UsageCall {
                user_bid: usage_ctx.user_bid.clone(),
                shifu_bid: usage_ctx.shifu_bid.clone(),
                scene: usage_ctx.scene,
                provider: provider.label().to_string(),
                model: model.to_string(),
                is_stream: false,
                input,
                output,
                total,
                word_count: text.split_whitespace().count() as u32,
                duration_ms: 0,
                latency_ms,
                status: "ok".to_string(),
                error_message: None,
                billable_override: None,
                extra: json!({ "input_cache_tokens": cached }),
            },
            None,
        )
        .await;

        Ok(text)
    }

    #[instrument(skip(self, messages, usage_ctx), fields(model = %model))]
    async fn stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: Option<f32>,
        usage_ctx: UsageContext,
    ) -> Result<BoxStream> {
        let (provider, invoke_model) = resolve_alias(model)?;
        let config = resolve_provider_config(provider, model)?;
        let params = reload_params(provider, &invoke_model, temperature);

        let mut body = json!({
            "model": invoke_model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        merge_object(&mut body, &params);

        let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        let started = Instant::now();
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed { model: model.to_string(), message: e.to_string() })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed { model: model.to_string(), message: format!("{status}: {text}") });
        }

        let state = SseState {
            byte_stream: Box::pin(resp.bytes_stream()),
            buffer: String::new(),
            done: false,
            model: model.to_string(),
            provider: provider.label().to_string(),
            usage_ctx,
            store: self.store.clone(),
            started,
            output_chars: 0,
            usage: None,
        };

        Ok(Box::pin(stream::unfold(state, sse_step)))
    }
}

struct SseState {
    byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    buffer: String,
    done: bool,
    model: String,
    provider: String,
    usage_ctx: UsageContext,
    store: Arc<dyn Store>,
    started: Instant,
    output_chars: u64,
    usage: Option<Value>,
}

impl SseState {
    /// Pops the first complete `\n\n`-terminated SSE event off `buffer`
    /// and returns its joined `data:` payload (trimmed), if any.
    fn take_event(&mut self) -> Option<String> {
        let sep = self.buffer.find("\n\n")?;
        let raw: String = self.buffer.drain(..sep + 2).collect();
        let payload: String = raw
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("");
        Some(payload)
    }

    fn finalize_metering(&mut self) {
        let latency_ms = self.started.elapsed().as_millis() as u64;
        let (input, output, total, cached) = self.usage.as_ref().map(extract_token_counts).unwrap_or((0, 0, 0, 0));
        let call = UsageCall {
            user_bid: self.usage_ctx.user_bid.clone(),
            shifu_bid: self.usage_ctx.shifu_bid.clone(),
            scene: self.usage_ctx.scene,
            provider: self.provider.clone(),
            model: self.model.clone(),
            is_stream: true,
            input,
            output,
            total,
            word_count: self.output_chars as u32,
            duration_ms: 0,
            latency_ms,
            status: "ok".to_string(),
            error_message: None,
            billable_override: None,
            extra: json!({ "input_cache_tokens": cached }),
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            record_llm_usage(store.as_ref(), call, None).await;
        });
    }
}

enum EventOutcome {
    Chunk(String),
    Done,
    Skip,
    Error(LlmError),
}

fn process_event(raw: &str, state: &mut SseState) -> EventOutcome {
    let data = raw.trim();
    if data.is_empty() {
        return EventOutcome::Skip;
    }
    if data == "[DONE]" {
        return EventOutcome::Done;
    }
    let parsed: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "skipping malformed SSE chunk");
            return EventOutcome::Skip;
        }
    };
    if let Some(usage) = parsed.get("usage") {
        if !usage.is_null() {
            state.usage = Some(usage.clone());
        }
    }
    let content = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if content.is_empty() {
        EventOutcome::Skip
    } else {
        state.output_chars += content.split_whitespace().count() as u64;
        EventOutcome::Chunk(content.to_string())
    }
}

async fn sse_step(mut state: SseState) -> Option<(Result<String>, SseState)> {
    loop {
        if state.done {
            return None;
        }
        if let Some(event) = state.take_event() {
            match process_event(&event, &mut state) {
                EventOutcome::Chunk(text) => return Some((Ok(text), state)),
                EventOutcome::Done => {
                    state.done = true;
                    state.finalize_metering();
                    return None;
                }
                EventOutcome::Skip => continue,
                EventOutcome::Error(e) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
            }
        }

        match state.byte_stream.next().await {
            Some(Ok(bytes)) => {
                state.buffer.push_str(&String::from_utf8_lossy(&bytes));
            }
            Some(Err(err)) => {
                state.done = true;
                let model = state.model.clone();
                return Some((Err(LlmError::RequestFailed { model, message: err.to_string() }), state));
            }
            None => {
                state.done = true;
                state.finalize_metering();
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_prefixed_aliases_to_their_provider() {
        assert_eq!(resolve_alias("qwen/qwen-max").unwrap(), (ProviderKey::Qwen, "qwen-max".to_string()));
        assert_eq!(resolve_alias("ark/doubao-pro").unwrap(), (ProviderKey::Ark, "doubao-pro".to_string()));
    }

    #[test]
    fn bare_gemini_name_resolves_without_a_prefix() {
        assert_eq!(resolve_alias("gemini-2.5-pro").unwrap(), (ProviderKey::Gemini, "gemini-2.5-pro".to_string()));
    }

    #[test]
    fn bare_gpt_name_defaults_to_openai() {
        assert_eq!(resolve_alias("gpt-5").unwrap(), (ProviderKey::Openai, "gpt-5".to_string()));
    }

    #[test]
    fn unknown_prefix_is_rejected() {
        assert!(matches!(resolve_alias("acme/foo"), Err(LlmError::ModelNotSupported(_))));
    }

    #[test]
    fn reload_params_prefers_more_specific_gpt5_families() {
        assert_eq!(
            reload_params(ProviderKey::Openai, "gpt-5.2-preview", Some(0.4)),
            json!({ "reasoning_effort": "none", "temperature": 0.4 })
        );
        assert_eq!(
            reload_params(ProviderKey::Openai, "gpt-5.1", Some(0.4)),
            json!({ "reasoning_effort": "none", "temperature": 1 })
        );
        assert_eq!(reload_params(ProviderKey::Openai, "gpt-5-pro", Some(0.4)), json!({ "reasoning_effort": "none" }));
        assert_eq!(
            reload_params(ProviderKey::Openai, "gpt-5-mini", Some(0.4)),
            json!({ "reasoning_effort": "minimal", "temperature": 1 })
        );
    }

    #[test]
    fn reload_params_ark_and_silicon_disable_thinking() {
        assert_eq!(
            reload_params(ProviderKey::Ark, "doubao-pro", Some(0.7)),
            json!({ "temperature": 0.7, "extra_body": { "thinking": { "type": "disabled" } } })
        );
        assert_eq!(
            reload_params(ProviderKey::Silicon, "deepseek-v3", Some(0.7)),
            json!({ "temperature": 0.7, "extra_body": { "enable_thinking": false } })
        );
    }

    #[test]
    fn reload_params_gemini_families() {
        assert_eq!(
            reload_params(ProviderKey::Gemini, "gemini-2.5-pro", Some(0.3)),
            json!({ "reasoning_effort": "low", "temperature": 0.3 })
        );
        assert_eq!(
            reload_params(ProviderKey::Gemini, "gemini-3-flash", Some(0.3)),
            json!({ "reasoning_effort": "low", "temperature": 0.3 })
        );
        assert_eq!(
            reload_params(ProviderKey::Gemini, "gemini-1.5-flash", Some(0.3)),
            json!({ "reasoning_effort": "none", "temperature": 0.3 })
        );
    }

    #[test]
    fn extract_token_counts_prefers_cache_detail_fields() {
        let usage = json!({
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "total_tokens": 120,
            "prompt_tokens_details": { "cached_tokens": 40 }
        });
        assert_eq!(extract_token_counts(&usage), (100, 20, 120, 40));
    }
}
