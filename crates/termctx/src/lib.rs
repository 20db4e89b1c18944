//! Bounded conversation context for terminal LLM tools.
//!
//! `termctx` sits between a terminal client and a remote chat backend. On
//! every query it compiles a prompt fragment of bounded size from four
//! layers of context, and it keeps that context alive across queries,
//! administrative resets and daemon restarts:
//!
//! | Layer | Module | Lifetime |
//! |-------|--------|----------|
//! | L0 facts | [`context::memory`] | `memory.json`, cleared only on request |
//! | L1 topics | [`context::topics`] | `topics.json`, FIFO of 10 |
//! | L2 window | [`context::window`] | in memory, budget-bounded |
//! | L3 shell | [`context::shell`] | read from `shell-state.json` |
//!
//! The remote backend keeps its own conversation history per session. When
//! local context changes in a way the remote history cannot reflect (turns
//! evicted, window compacted or cleared, topic switched or recalled) the
//! [`ContextOrchestrator`](context::ContextOrchestrator) marks the session
//! dirty and the next query starts a fresh remote session carrying a short
//! recap.
//!
//! # Where to find things
//!
//! - **Price text:** [`tokens::estimate`].
//! - **Compose a prompt:** [`ContextOrchestrator::build`](context::ContextOrchestrator::build).
//! - **Talk to a model:** the [`Backend`](backend::Backend) trait and its
//!   [`OpenRouterBackend`](backend::OpenRouterBackend) implementation, built
//!   on [`OpenRouterClient`] and the SSE parser in [`api::streaming`].
//! - **Run the daemon:** [`daemon::serve`] with a [`DaemonState`](daemon::DaemonState).
//! - **Speak the wire protocol:** [`protocol::ClientFrame`] / [`protocol::ServerFrame`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`tokens`] | Mixed-script token cost estimator |
//! | [`context`] | Memory, topics, window, shell state, budget, orchestrator |
//! | [`api`] | SSE streaming and retry with backoff |
//! | [`backend`] | Backend trait, events, OpenRouter adapter with session emulation |
//! | [`extract`] | Background fact extraction into memory |
//! | [`protocol`] | Newline-delimited JSON frames |
//! | [`daemon`] | Single-flight query serializer and Unix-socket server |
//! | [`paths`] | Per-user file layout |

pub mod api;
pub mod backend;
pub mod context;
pub mod daemon;
pub mod error;
pub mod extract;
pub mod paths;
pub mod protocol;
pub mod tokens;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ── Constants ──────────────────────────────────────────────────────

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Environment variable holding the OpenRouter API key.
pub const API_KEY_ENV: &str = "OPENROUTER_KEY";

/// Default model for queries and extraction.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

/// Default completion limit for queries.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use termctx::json_schema_for;
/// use termctx::context::ExtractedFacts;
///
/// let schema = json_schema_for::<ExtractedFacts>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["properties"]["conventions"].is_object());
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body. Unused optional fields are omitted from
/// serialization.
#[derive(Serialize, Debug, Default, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

// ── Response types ─────────────────────────────────────────────────

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ApiErrorResponse {
    pub(crate) message: String,
}

/// Clean return type from `OpenRouterClient::chat()`.
#[derive(Debug)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    pub(crate) client: reqwest::Client,
    pub(crate) api_key: String,
    pub(crate) endpoint: String,
    pub(crate) referer: String,
    pub(crate) title: String,
}

impl OpenRouterClient {
    /// Create a new client with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, String> {
        Self::with_headers(api_key, "https://github.com/termctx/termctx", "termctx")
    }

    /// Create a client from the `OPENROUTER_KEY` environment variable.
    pub fn from_env() -> Result<Self, String> {
        let api_key = std::env::var(API_KEY_ENV).map_err(|_| format!("{API_KEY_ENV} not set"))?;
        Self::new(api_key)
    }

    /// Create a new client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, String> {
        // No whole-request timeout: streamed answers can legitimately run
        // for minutes. Idle time is bounded by the caller instead.
        let client = reqwest::Client::builder()
            .user_agent(concat!("termctx/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: OPENROUTER_URL.to_string(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    /// Point the client at a different chat-completions endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn post(&self) -> reqwest::RequestBuilder {
        self.client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
    }

    /// Send a non-streaming chat completion request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, String> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={}, temp={}",
            body.model,
            body.messages.len(),
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .post()
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(err) = parsed.error {
            return Err(format!("OpenRouter API error: {}", err.message));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        let choice = parsed.choices.and_then(|c| c.into_iter().next());
        Ok(match choice {
            Some(c) => ChatCompletion {
                content: c.message.content,
                usage: parsed.usage,
                finish_reason: c.finish_reason,
            },
            None => {
                debug!("LLM output: empty (no choices)");
                ChatCompletion {
                    content: None,
                    usage: parsed.usage,
                    finish_reason: None,
                }
            }
        })
    }
}
