//! Per-process daemon state.
//!
//! One [`DaemonState`] is created at startup and shared by `Arc` with every
//! connection task. It holds the orchestrator, the backend, the id of the
//! remote session currently being continued, and the single-flight slot for
//! backend queries.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::Backend;
use crate::context::{ContextOrchestrator, ContextStatus};
use crate::extract::ExtractionGate;

/// Default time a query may go without any backend event.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared daemon state.
pub struct DaemonState {
    orchestrator: Mutex<ContextOrchestrator>,
    backend: Arc<dyn Backend>,
    session_id: Mutex<Option<String>>,
    /// Cancellation token of the query in flight, if any.
    flight: Mutex<Option<CancellationToken>>,
    extraction: ExtractionGate,
    shutdown: CancellationToken,
    idle_timeout: Duration,
}

impl DaemonState {
    pub fn new(orchestrator: ContextOrchestrator, backend: Arc<dyn Backend>) -> Self {
        Self {
            orchestrator: Mutex::new(orchestrator),
            backend,
            session_id: Mutex::new(None),
            flight: Mutex::new(None),
            extraction: ExtractionGate::new(),
            shutdown: CancellationToken::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Run `f` with exclusive access to the orchestrator. Never call this
    /// across an await point.
    pub fn with_orchestrator<R>(&self, f: impl FnOnce(&mut ContextOrchestrator) -> R) -> R {
        let mut orchestrator = self.orchestrator.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut orchestrator)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn extraction_gate(&self) -> &ExtractionGate {
        &self.extraction
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_session_id(&self, id: String) {
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    /// Forget the remote session so the next query starts a new one.
    pub fn clear_session_id(&self) {
        if self
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            debug!("Dropped remote session id");
        }
    }

    /// Claim the single-flight slot. Returns `None` while another query is
    /// running. The slot is released when the guard drops.
    pub fn begin_flight(self: &Arc<Self>) -> Option<FlightGuard> {
        let mut slot = self.flight.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return None;
        }
        let token = self.shutdown.child_token();
        *slot = Some(token.clone());
        Some(FlightGuard {
            state: Arc::clone(self),
            token,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Cancel the query in flight, if any.
    pub fn cancel_flight(&self) -> bool {
        match self.flight.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Begin graceful shutdown. Cancels the query in flight.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Orchestrator status plus daemon-level flags.
    pub fn status(&self, override_cwd: Option<&str>) -> ContextStatus {
        let mut status = self.with_orchestrator(|o| o.status(override_cwd));
        status.session_active = self.session_id().is_some();
        status.query_in_flight = self.is_busy();
        status
    }
}

/// Holds the single-flight slot for one query.
pub struct FlightGuard {
    state: Arc<DaemonState>,
    token: CancellationToken,
}

impl FlightGuard {
    /// Fires on `stop`, daemon shutdown, or an explicit cancel.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        *self.state.flight.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFuture, BackendRequest, BackendStream};
    use crate::context::{ContextBudget, MemoryStore, ShellStateReader, TopicStore};

    struct NoBackend;

    impl Backend for NoBackend {
        fn query(&self, _request: BackendRequest) -> BackendStream<'_> {
            Box::pin(futures::stream::empty())
        }

        fn complete<'a>(&'a self, _system: &'a str, _user: &'a str) -> BackendFuture<'a> {
            Box::pin(async { Ok(String::new()) })
        }
    }

    fn state() -> Arc<DaemonState> {
        let orchestrator = ContextOrchestrator::new(
            MemoryStore::in_memory(),
            TopicStore::in_memory(),
            ShellStateReader::new("/nonexistent/shell-state.json"),
            ContextBudget::default(),
        );
        Arc::new(DaemonState::new(orchestrator, Arc::new(NoBackend)))
    }

    #[test]
    fn flight_slot_is_exclusive_and_released_on_drop() {
        let state = state();
        let guard = state.begin_flight().unwrap();
        assert!(state.is_busy());
        assert!(state.begin_flight().is_none());
        drop(guard);
        assert!(!state.is_busy());
        assert!(state.begin_flight().is_some());
    }

    #[test]
    fn shutdown_cancels_flight() {
        let state = state();
        let guard = state.begin_flight().unwrap();
        state.request_shutdown();
        assert!(guard.token().is_cancelled());
        assert!(state.is_shutting_down());
    }

    #[test]
    fn cancel_flight_only_when_busy() {
        let state = state();
        assert!(!state.cancel_flight());
        let guard = state.begin_flight().unwrap();
        assert!(state.cancel_flight());
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn status_reports_session_and_flight() {
        let state = state();
        assert!(!state.status(None).session_active);
        state.set_session_id("ses-1".into());
        let _guard = state.begin_flight().unwrap();
        let status = state.status(None);
        assert!(status.session_active);
        assert!(status.query_in_flight);
        state.clear_session_id();
        assert!(state.session_id().is_none());
    }
}
