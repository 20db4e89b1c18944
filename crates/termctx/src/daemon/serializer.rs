//! Query serializer and command dispatch.
//!
//! A query runs only if it can claim the daemon's single-flight slot;
//! otherwise it is answered `busy` on the spot, even when it was pipelined
//! behind a running query on the same connection. A query that wins the slot
//! runs on its own task so its connection keeps being read. Administrative
//! commands never touch the slot and are served immediately, even while a
//! query streams.
//!
//! Whatever happens, every request is answered with exactly one `done`
//! frame.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{DaemonState, FlightGuard};
use crate::backend::{BackendEvent, BackendRequest, SessionMode};
use crate::error::BackendError;
use crate::extract;
use crate::protocol::{ClientFrame, Command, ServerFrame};

/// Characters of command output forwarded with a query.
pub const COMMAND_CONTEXT_CHARS: usize = 2000;

/// Message sent to a client whose query lost the single-flight race.
pub const BUSY_MESSAGE: &str = "busy: another query is in progress";

/// Outgoing half of a connection.
///
/// Frames are queued to the connection's writer task. If the writer is gone
/// the client has disconnected, and `closed` is fired so an in-flight query
/// stops.
#[derive(Debug, Clone)]
pub struct Responder {
    tx: UnboundedSender<ServerFrame>,
    closed: CancellationToken,
}

impl Responder {
    pub fn new(tx: UnboundedSender<ServerFrame>, closed: CancellationToken) -> Self {
        Self { tx, closed }
    }

    /// Queue a frame. Returns `false` if the client is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        if self.tx.send(frame).is_err() {
            self.closed.cancel();
            return false;
        }
        true
    }

    pub fn info(&self, message: impl Into<String>) -> bool {
        self.send(ServerFrame::info(message))
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(ServerFrame::error(message))
    }

    /// Fires once the client is known to be gone: a write failed or the
    /// socket errored. A client that only shut down its sending side is still
    /// being answered.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

/// Decode one line and dispatch it. Malformed input is answered with an
/// error and `done`; the connection stays usable.
pub fn dispatch_line(
    state: &Arc<DaemonState>,
    line: &str,
    out: &Responder,
) -> Option<JoinHandle<()>> {
    match ClientFrame::decode(line) {
        Ok(frame) => dispatch(state, frame, out),
        Err(e) => {
            debug!("Rejected frame: {e}");
            out.error(e.to_string());
            out.send(ServerFrame::Done);
            None
        }
    }
}

/// Handle one request and terminate it with `done`.
///
/// The single-flight slot is claimed before this returns, so requests are
/// admitted in the order they are dispatched. An admitted query continues on
/// the returned task; everything else is fully answered on return.
pub fn dispatch(
    state: &Arc<DaemonState>,
    frame: ClientFrame,
    out: &Responder,
) -> Option<JoinHandle<()>> {
    let task = match frame {
        ClientFrame::Query {
            message,
            cwd,
            command_context,
        } => {
            let query = Query {
                message,
                cwd,
                command_context,
            };
            spawn_query(state, query, out)
        }
        ClientFrame::Command { command, args } => {
            handle_command(state, command, args.as_deref(), out);
            None
        }
        ClientFrame::Ping => {
            out.info("pong");
            None
        }
    };
    if task.is_none() {
        out.send(ServerFrame::Done);
    }
    task
}

/// Claim the flight slot and run `query` on its own task, which sends the
/// closing `done`. Returns `None` after answering `busy`.
fn spawn_query(
    state: &Arc<DaemonState>,
    query: Query,
    out: &Responder,
) -> Option<JoinHandle<()>> {
    let Some(flight) = state.begin_flight() else {
        info!("Rejected concurrent query");
        out.error(BUSY_MESSAGE);
        return None;
    };
    let state = Arc::clone(state);
    let out = out.clone();
    Some(tokio::spawn(async move {
        run_query(&state, flight, query, &out).await;
        out.send(ServerFrame::Done);
    }))
}

/// A user query as received from a client.
#[derive(Debug, Clone)]
pub struct Query {
    pub message: String,
    pub cwd: Option<String>,
    pub command_context: Option<String>,
}

/// How a backend run ended, from the daemon's point of view.
enum RunOutcome {
    Completed { session_id: String, answer: String },
    Failed(BackendError),
    Cancelled,
    TimedOut,
}

/// Run one query through the backend, relaying its events.
///
/// The window gains a turn only when the backend completes. Any other
/// outcome drops the remote session id, so the next query starts a new
/// session carrying a recap of the window.
pub async fn run_query(
    state: &Arc<DaemonState>,
    flight: FlightGuard,
    query: Query,
    out: &Responder,
) {
    let held_session = state.session_id();
    let built = state.with_orchestrator(|o| {
        if held_session.is_none() {
            o.mark_dirty();
        }
        o.build(query.cwd.as_deref())
    });

    let context = with_command_context(built.prompt, query.command_context.as_deref());
    let session = match held_session {
        Some(id) if !built.needs_new_session => SessionMode::Continue(id),
        _ => SessionMode::New,
    };
    debug!(
        "Query accepted: {} chars, session {:?}",
        query.message.len(),
        session
    );

    let request = BackendRequest {
        context,
        message: query.message.clone(),
        session,
    };

    let outcome = {
        let mut events = state.backend().query(request);
        let mut answer = String::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = flight.token().cancelled() => break RunOutcome::Cancelled,
                _ = out.closed().cancelled() => break RunOutcome::Cancelled,
                _ = tokio::time::sleep(state.idle_timeout()) => break RunOutcome::TimedOut,
                event = events.next() => event,
            };
            match event {
                Some(BackendEvent::Text(text)) => {
                    answer.push_str(&text);
                    out.send(ServerFrame::Text { content: text });
                }
                Some(BackendEvent::ToolUse { tool, input }) => {
                    out.send(ServerFrame::ToolUse { tool, input });
                }
                Some(BackendEvent::ToolResult { output }) => {
                    out.send(ServerFrame::ToolResult { output });
                }
                Some(BackendEvent::Completed { session_id }) => {
                    break RunOutcome::Completed { session_id, answer };
                }
                Some(BackendEvent::Failed(e)) => break RunOutcome::Failed(e),
                None => {
                    break RunOutcome::Failed(BackendError::Malformed(
                        "stream ended without completion".into(),
                    ));
                }
            }
        }
        // The event stream is dropped here, abandoning any call still open.
    };

    match outcome {
        RunOutcome::Completed { session_id, answer } => {
            state.set_session_id(session_id);
            let extract_now = state.with_orchestrator(|o| {
                o.add_turn(&query.message, &answer);
                o.should_extract_memory()
            });
            if extract_now {
                spawn_extraction(state, answer);
            }
        }
        RunOutcome::Failed(e) => {
            warn!("Query failed: {e}");
            state.clear_session_id();
            out.error(e.to_string());
        }
        RunOutcome::Cancelled => {
            info!("Query cancelled");
            state.clear_session_id();
            out.info("cancelled");
        }
        RunOutcome::TimedOut => {
            warn!(
                "Query timed out after {:?} without backend activity",
                state.idle_timeout()
            );
            state.clear_session_id();
            out.error("timed out waiting for the backend");
        }
    }
}

/// Append the ephemeral `<command_output>` fragment. It travels with this
/// request only and is never stored in the window.
fn with_command_context(prompt: String, command_context: Option<&str>) -> String {
    let Some(output) = command_context.map(str::trim).filter(|c| !c.is_empty()) else {
        return prompt;
    };
    let mut clipped: String = output.chars().take(COMMAND_CONTEXT_CHARS).collect();
    if output.chars().nth(COMMAND_CONTEXT_CHARS).is_some() {
        clipped.push_str("...");
    }
    let fragment = format!("<command_output>\n{clipped}\n</command_output>");
    if prompt.is_empty() {
        fragment
    } else {
        format!("{prompt}\n\n{fragment}")
    }
}

/// Start a background extraction pass unless one is already running.
fn spawn_extraction(state: &Arc<DaemonState>, answer: String) {
    let Some(permit) = state.extraction_gate().try_acquire() else {
        debug!("Extraction already running; skipping this trigger");
        return;
    };
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let _permit = permit;
        match extract::extract_facts(state.backend().as_ref(), &answer).await {
            Ok(facts) if facts.is_empty() => debug!("Extraction found nothing new"),
            Ok(facts) => {
                debug!("Extraction merged facts");
                state.with_orchestrator(|o| o.merge_extracted(facts));
            }
            Err(e) => debug!("Extraction failed: {e}"),
        }
    });
}

/// Serve an administrative command. Never waits on the backend.
pub fn handle_command(
    state: &Arc<DaemonState>,
    command: Command,
    args: Option<&str>,
    out: &Responder,
) {
    info!("Command: {command}");
    match command {
        Command::Status => {
            let status = state.status(None);
            match serde_json::to_value(&status) {
                Ok(data) => out.send(ServerFrame::Status { data }),
                Err(e) => out.error(format!("failed to encode status: {e}")),
            };
        }
        Command::Compact => {
            match state.with_orchestrator(|o| o.compact()) {
                Some(name) => out.info(format!("Compacted conversation into topic '{name}'")),
                None => out.info("Nothing to compact"),
            };
        }
        Command::Clear => {
            state.with_orchestrator(|o| o.clear_window());
            out.info("Conversation window cleared");
        }
        Command::Forget => {
            state.with_orchestrator(|o| o.clear_all());
            out.info("Forgot conversation, topics and memory");
        }
        Command::Topic => {
            match state.with_orchestrator(|o| o.switch_topic(args)) {
                Some(name) => out.info(format!("Saved conversation as topic '{name}'")),
                None => out.info("Started a new topic"),
            };
        }
        Command::Recall => {
            let Some(name) = args else {
                out.error("recall needs a topic name");
                return;
            };
            match state.with_orchestrator(|o| o.recall_topic(name)) {
                Some(summary) => out.info(format!("Topic '{name}': {summary}")),
                None => out.error(format!("No topic named '{name}'")),
            };
        }
        Command::Remember => {
            let Some(fact) = args else {
                out.error("remember needs a fact");
                return;
            };
            match state.with_orchestrator(|o| o.remember(fact)) {
                Some(category) => out.info(format!("Remembered under {category}")),
                None => out.error("Nothing to remember"),
            };
        }
        Command::Stop => {
            out.info("Stopping daemon");
            state.request_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn command_context_is_appended_and_truncated() {
        assert_eq!(with_command_context("ctx".into(), None), "ctx");
        assert_eq!(with_command_context("ctx".into(), Some("   ")), "ctx");
        assert_eq!(
            with_command_context(String::new(), Some("exit 1")),
            "<command_output>\nexit 1\n</command_output>"
        );

        let long = "e".repeat(COMMAND_CONTEXT_CHARS + 50);
        let out = with_command_context("ctx".into(), Some(&long));
        assert!(out.starts_with("ctx\n\n<command_output>\n"));
        assert!(out.contains(&format!("{}...", "e".repeat(COMMAND_CONTEXT_CHARS))));
    }

    #[test]
    fn responder_fires_closed_when_writer_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let out = Responder::new(tx, CancellationToken::new());
        assert!(out.info("hello"));
        drop(rx);
        assert!(!out.send(ServerFrame::Done));
        assert!(out.closed().is_cancelled());
    }
}
