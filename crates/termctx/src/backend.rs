//! The remote backend seam.
//!
//! The daemon never talks HTTP itself. It hands a [`BackendRequest`] to a
//! [`Backend`] and relays whatever [`BackendEvent`]s come back. A backend is
//! session-oriented: every query either continues a remote conversation it
//! reported earlier via [`BackendEvent::Completed`] or starts a new one.
//!
//! [`OpenRouterBackend`] adapts the stateless chat-completions API to that
//! model by keeping the message history of the current session in memory.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::api::retry::{RetryConfig, retry_transient};
use crate::api::streaming::StreamEvent;
use crate::error::BackendError;
use crate::{ChatRequest, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, Message, OpenRouterClient};

/// Which remote conversation a query belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// Discard any remote history and start over.
    New,
    /// Continue the remote conversation with this id.
    Continue(String),
}

/// One query as the backend sees it.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Composed context, sent as the system prompt.
    pub context: String,
    /// The user's message.
    pub message: String,
    pub session: SessionMode,
}

/// Incremental output of a query.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A fragment of the assistant's answer.
    Text(String),
    /// The backend invoked a tool on its side.
    ToolUse {
        tool: String,
        input: serde_json::Value,
    },
    /// Output of a backend-side tool invocation.
    ToolResult { output: String },
    /// The query finished; `session_id` continues this conversation.
    Completed { session_id: String },
    /// The query failed. No further events follow.
    Failed(BackendError),
}

/// Stream returned by [`Backend::query`]. Dropping it abandons the call.
pub type BackendStream<'a> = Pin<Box<dyn Stream<Item = BackendEvent> + Send + 'a>>;

/// Future returned by [`Backend::complete`].
pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<String, BackendError>> + Send + 'a>>;

/// A session-oriented remote model.
///
/// Implementations must end every query stream with exactly one
/// [`Completed`](BackendEvent::Completed) or [`Failed`](BackendEvent::Failed)
/// event, unless the stream is dropped first.
pub trait Backend: Send + Sync {
    /// Run a query and stream its events.
    fn query(&self, request: BackendRequest) -> BackendStream<'_>;

    /// One-shot completion outside any session. Used for extraction.
    fn complete<'a>(&'a self, system: &'a str, user: &'a str) -> BackendFuture<'a>;
}

/// Generate a unique session id.
pub fn generate_session_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ses-{ts:x}-{count:04x}")
}

/// Generation parameters for [`OpenRouterBackend`].
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub retry: RetryConfig,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.3,
            retry: RetryConfig::default(),
        }
    }
}

/// [`Backend`] over the OpenRouter chat-completions API.
///
/// Remote sessions are emulated: the user/assistant history of each session
/// is kept here and replayed on every call, behind the freshly composed
/// context. Starting a new session discards all stored history, since the
/// daemon only ever drives one conversation.
pub struct OpenRouterBackend {
    client: OpenRouterClient,
    settings: BackendSettings,
    sessions: Mutex<HashMap<String, Vec<Message>>>,
}

impl OpenRouterBackend {
    pub fn new(client: OpenRouterClient, settings: BackendSettings) -> Self {
        Self {
            client,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the session for a request and return its id and history.
    fn open_session(&self, mode: &SessionMode) -> (String, Vec<Message>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match mode {
            SessionMode::Continue(id) if sessions.contains_key(id) => {
                (id.clone(), sessions.get(id).cloned().unwrap_or_default())
            }
            SessionMode::Continue(id) => {
                warn!("Unknown session {id}; starting a new one");
                sessions.clear();
                (generate_session_id(), Vec::new())
            }
            SessionMode::New => {
                sessions.clear();
                let id = generate_session_id();
                info!("Starting remote session {id}");
                (id, Vec::new())
            }
        }
    }

    fn record_exchange(&self, session_id: &str, user: String, assistant: String) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let history = sessions.entry(session_id.to_string()).or_default();
        history.push(Message::user(user));
        history.push(Message::assistant(assistant));
    }

    fn request_body(&self, messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: self.settings.model.clone(),
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }
}

impl Backend for OpenRouterBackend {
    fn query(&self, request: BackendRequest) -> BackendStream<'_> {
        Box::pin(async_stream::stream! {
            let (session_id, history) = self.open_session(&request.session);

            let mut messages = Vec::with_capacity(history.len() + 2);
            messages.push(Message::system(request.context));
            messages.extend(history);
            messages.push(Message::user(request.message.clone()));
            let body = self.request_body(messages);

            let opened = retry_transient(&self.settings.retry, || self.client.chat_stream(&body)).await;
            let mut events = match opened {
                Ok(events) => events,
                Err(e) => {
                    yield BackendEvent::Failed(BackendError::Request(e));
                    return;
                }
            };

            let mut answer = String::new();
            while let Some(event) = events.next().await {
                match event {
                    Ok(StreamEvent::TextDelta(text)) => {
                        answer.push_str(&text);
                        yield BackendEvent::Text(text);
                    }
                    Ok(StreamEvent::Usage(usage)) => {
                        debug!(
                            "Token usage: prompt={}, completion={}",
                            usage.prompt_tokens.unwrap_or(0),
                            usage.completion_tokens.unwrap_or(0),
                        );
                    }
                    Ok(StreamEvent::Error(message)) => {
                        yield BackendEvent::Failed(BackendError::Request(message));
                        return;
                    }
                    Ok(StreamEvent::Done) => break,
                    Err(e) => {
                        yield BackendEvent::Failed(BackendError::Request(e));
                        return;
                    }
                }
            }

            self.record_exchange(&session_id, request.message, answer);
            yield BackendEvent::Completed { session_id };
        })
    }

    fn complete<'a>(&'a self, system: &'a str, user: &'a str) -> BackendFuture<'a> {
        Box::pin(async move {
            let body = self.request_body(vec![Message::system(system), Message::user(user)]);
            let completion = retry_transient(&self.settings.retry, || self.client.chat(&body))
                .await
                .map_err(BackendError::Request)?;
            completion
                .content
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| BackendError::Malformed("empty completion".into()))
        })
    }
}
