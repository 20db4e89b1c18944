//! The long-running daemon behind the `termctx` client.
//!
//! - [`state`] — [`DaemonState`], the per-process context object.
//! - [`serializer`] — single-flight query execution and command dispatch.
//! - [`server`] — the Unix-socket listener and per-connection framing.

pub mod serializer;
pub mod server;
pub mod state;

pub use serializer::{Responder, dispatch, dispatch_line};
pub use server::Daemon;
pub use state::{DEFAULT_IDLE_TIMEOUT, DaemonState, FlightGuard};

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::DaemonError;

/// Bind and serve until shutdown.
pub async fn serve(
    state: Arc<DaemonState>,
    socket: PathBuf,
    pid_file: Option<PathBuf>,
) -> Result<(), DaemonError> {
    Daemon::bind(state, socket, pid_file).await?.run().await
}
