//! Request parameters, API configuration, and batch-key derivation.
//!
//! [`CompletionRequest`] is the closed record of everything a caller can set
//! on a generation request. Fields that must agree for two requests to share
//! one provider call are folded into [`CompletionRequest::batch_key`].

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::tokenizer::Tokenizer;
use crate::trace::TraceSink;

/// Maximum number of logit-bias entries the provider accepts per request.
pub const LOGIT_BIAS_LIMIT: usize = 300;

/// A prompt, either raw text or a pre-tokenized id sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Text(String),
    Ids(Vec<u32>),
}

impl Prompt {
    /// Static-type tag folded into the batch key: string prompts and id
    /// prompts never share a provider call.
    pub fn kind(&self) -> &'static str {
        match self {
            Prompt::Text(_) => "str",
            Prompt::Ids(_) => "ids",
        }
    }

    /// The prompt as JSON for the provider body.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Prompt::Text(s) => serde_json::Value::String(s.clone()),
            Prompt::Ids(ids) => serde_json::json!(ids),
        }
    }

    /// The prompt text. Id prompts are decoded through the tokenizer.
    pub fn as_text(&self, tokenizer: &dyn Tokenizer) -> String {
        match self {
            Prompt::Text(s) => s.clone(),
            Prompt::Ids(ids) => tokenizer.decode(ids),
        }
    }
}

impl From<&str> for Prompt {
    fn from(s: &str) -> Self {
        Prompt::Text(s.to_string())
    }
}

impl From<String> for Prompt {
    fn from(s: String) -> Self {
        Prompt::Text(s)
    }
}

impl From<Vec<u32>> for Prompt {
    fn from(ids: Vec<u32>) -> Self {
        Prompt::Ids(ids)
    }
}

/// What to do when a provider call errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Retry transient errors up to the scheduler's budget (the default).
    #[default]
    Retry,
    /// Surface every error to the caller immediately, no retries.
    Raise,
}

/// Untyped passthrough fields merged verbatim into the provider call body.
pub type ProviderHints = serde_json::Map<String, serde_json::Value>;

/// Endpoint, credential, and behavior configuration for one request.
///
/// Every field is optional; unset fields fall back to the corresponding
/// environment variable (`OPENAI_API_TYPE`, `OPENAI_API_BASE`,
/// `OPENAI_API_VERSION`, `OPENAI_DEPLOYMENT`, `OPENAI_API_KEY`) and then to
/// the public-provider defaults.
#[derive(Clone, Default)]
pub struct ApiConfig {
    /// `"azure"`, `"azure-chat"`, or unset for the public provider.
    pub api_type: Option<String>,
    /// Azure resource base URL.
    pub api_base: Option<String>,
    /// Azure api-version query parameter.
    pub api_version: Option<String>,
    /// Azure deployment name. Defaults to the model identifier.
    pub deployment: Option<String>,
    /// API key. Sent as `api-key` (azure) or `Authorization: Bearer` (public).
    pub api_key: Option<String>,
    /// Organization header for the public provider.
    pub organization: Option<String>,
    /// Custom endpoint used verbatim, bypassing azure/public resolution.
    pub endpoint: Option<String>,
    /// Log every outgoing provider call.
    pub verbose: bool,
    /// Error handling policy for this request.
    pub errors: ErrorPolicy,
    /// Force chat-endpoint treatment regardless of the model name.
    pub chat_model: bool,
    /// Tokenizer used for chat-stream synthesis and recovery.
    pub tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("api_type", &self.api_type)
            .field("api_base", &self.api_base)
            .field("api_version", &self.api_version)
            .field("deployment", &self.deployment)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| {
                    if k.len() > 6 {
                        format!("{}***", &k[..6])
                    } else {
                        "***".to_string()
                    }
                }),
            )
            .field("organization", &self.organization)
            .field("endpoint", &self.endpoint)
            .field("verbose", &self.verbose)
            .field("errors", &self.errors)
            .field("chat_model", &self.chat_model)
            .field("has_tokenizer", &self.tokenizer.is_some())
            .finish()
    }
}

impl ApiConfig {
    /// Populate unset fields from the environment.
    pub fn from_env() -> ApiConfig {
        ApiConfig {
            api_type: env_var("OPENAI_API_TYPE"),
            api_base: env_var("OPENAI_API_BASE"),
            api_version: env_var("OPENAI_API_VERSION"),
            deployment: env_var("OPENAI_DEPLOYMENT"),
            api_key: env_var("OPENAI_API_KEY"),
            ..ApiConfig::default()
        }
    }

    /// Whether verbose per-request logging is enabled, via this config or
    /// the `OPENAI_VERBOSE` / `LMQL_VERBOSE` environment toggles.
    pub fn is_verbose(&self) -> bool {
        self.verbose
            || env_var("OPENAI_VERBOSE").as_deref() == Some("1")
            || env_var("LMQL_VERBOSE").as_deref() == Some("1")
    }
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// A generation or scoring request against a remote backend.
#[derive(Clone)]
pub struct CompletionRequest {
    /// Model identifier (e.g. `"text-davinci-003"`, `"gpt-4"`).
    pub model: String,
    /// The prompt, text or token ids.
    pub prompt: Prompt,
    /// Token budget. `-1` means "unbounded by the caller": chat bodies omit
    /// the field, completion bodies force 1024.
    pub max_tokens: i64,
    /// Sampling temperature.
    pub temperature: f64,
    /// Top-k logprobs to request per token.
    pub logprobs: Option<u32>,
    /// Echo the prompt back through the stream. Required for recovery.
    pub echo: bool,
    /// Additive per-token-id logit biases.
    pub logit_bias: BTreeMap<u32, f64>,
    /// Provider-side user attribution string.
    pub user: Option<String>,
    /// Per-request stall timeout.
    pub timeout: Option<Duration>,
    /// Endpoint and credential configuration.
    pub api_config: Option<ApiConfig>,
    /// Untyped passthrough fields the provider tolerates.
    pub hints: ProviderHints,
    /// Optional observer for request/batch/token/retry events.
    pub trace: Option<Arc<dyn TraceSink>>,
}

impl std::fmt::Debug for CompletionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionRequest")
            .field("model", &self.model)
            .field("prompt", &self.prompt)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("logprobs", &self.logprobs)
            .field("echo", &self.echo)
            .field("logit_bias_len", &self.logit_bias.len())
            .field("user", &self.user)
            .field("timeout", &self.timeout)
            .field("api_config", &self.api_config)
            .finish()
    }
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<Prompt>) -> CompletionRequest {
        CompletionRequest {
            model: model.into(),
            prompt: prompt.into(),
            max_tokens: -1,
            temperature: 0.0,
            logprobs: None,
            echo: true,
            logit_bias: BTreeMap::new(),
            user: None,
            timeout: None,
            api_config: None,
            hints: ProviderHints::new(),
            trace: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_logprobs(mut self, top_k: u32) -> Self {
        self.logprobs = Some(top_k);
        self
    }

    pub fn with_logit_bias(mut self, bias: BTreeMap<u32, f64>) -> Self {
        self.logit_bias = bias;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_api_config(mut self, config: ApiConfig) -> Self {
        self.api_config = Some(config);
        self
    }

    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Whether this request targets a chat endpoint.
    ///
    /// Chat requests are never fused with others: the chat endpoint has no
    /// batched prompt form.
    pub fn is_chat(&self) -> bool {
        if let Some(config) = &self.api_config {
            if config.chat_model {
                return true;
            }
            if let Some(t) = &config.api_type {
                if t.contains("azure-chat") {
                    return true;
                }
            }
        }
        is_chat_model_name(&self.model)
    }

    /// The identifier of everything that must agree for two requests to be
    /// fused into one provider call.
    pub fn batch_key(&self) -> String {
        let bias = self
            .logit_bias
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("-");
        format!(
            "model={}|max_tokens={}|temperature={}|logprobs={}|user={}|logit_bias={}|echo={}-{}",
            self.model,
            self.max_tokens,
            self.temperature,
            self.logprobs.map_or("<none>".to_string(), |v| v.to_string()),
            self.user.as_deref().unwrap_or("<none>"),
            bias,
            self.echo,
            self.prompt.kind(),
        )
    }

    /// Truncate an oversized logit-bias map to [`LOGIT_BIAS_LIMIT`] entries,
    /// keeping the end-of-text token's bias if present. Returns whether a
    /// truncation happened.
    pub(crate) fn truncate_logit_bias(&mut self, eos_token_id: u32) -> bool {
        if self.logit_bias.len() <= LOGIT_BIAS_LIMIT {
            return false;
        }
        let eos_bias = self.logit_bias.get(&eos_token_id).copied();
        let mut kept: BTreeMap<u32, f64> = self
            .logit_bias
            .iter()
            .take(if eos_bias.is_some() {
                LOGIT_BIAS_LIMIT - 1
            } else {
                LOGIT_BIAS_LIMIT
            })
            .map(|(k, v)| (*k, *v))
            .collect();
        if let Some(bias) = eos_bias {
            kept.insert(eos_token_id, bias);
        }
        self.logit_bias = kept;
        true
    }
}

/// Hard-coded chat-model detection for the public provider: the gpt-4 and
/// gpt-3.5-turbo families, except the instruct completion models.
pub fn is_chat_model_name(model: &str) -> bool {
    let model = model.strip_prefix("openai/").unwrap_or(model);
    if model.contains("-instruct") {
        return false;
    }
    model == "gpt-4" || model.starts_with("gpt-4") || model.contains("gpt-3.5-turbo")
}

/// Completion models that reject `echo` combined with `logprobs`; the echo
/// prefix is synthesized client-side for these.
pub fn rejects_echo_logprobs(model: &str) -> bool {
    let model = model.strip_prefix("openai/").unwrap_or(model);
    model == "gpt-3.5-turbo-instruct"
}

/// The end-of-text token id assumed when no tokenizer is configured.
pub(crate) const DEFAULT_EOS_TOKEN_ID: u32 = 50256;
