//! Unix-socket server.
//!
//! One daemon per user: startup probes an existing socket and refuses to run
//! when another daemon answers, or clears the socket when it is stale. Each
//! connection gets a reader task, a writer task, and a dispatch loop that
//! admits its requests in order; admitted queries stream on their own task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::serializer::{self, Responder};
use super::state::DaemonState;
use crate::error::DaemonError;
use crate::protocol::ServerFrame;

/// A bound, not yet serving daemon.
pub struct Daemon {
    state: Arc<DaemonState>,
    listener: UnixListener,
    socket: PathBuf,
    pid_file: Option<PathBuf>,
}

impl Daemon {
    /// Bind `socket`, enforcing a single instance, and write `pid_file`.
    pub async fn bind(
        state: Arc<DaemonState>,
        socket: impl Into<PathBuf>,
        pid_file: Option<PathBuf>,
    ) -> Result<Self, DaemonError> {
        let socket = socket.into();
        let listener = bind_single_instance(&socket).await?;

        if let Some(pid_file) = &pid_file
            && let Err(e) = std::fs::write(pid_file, std::process::id().to_string())
        {
            warn!("Failed to write pid file {}: {e}", pid_file.display());
        }

        info!("Daemon listening on {}", socket.display());
        Ok(Self {
            state,
            listener,
            socket,
            pid_file,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Accept connections until the state's shutdown token fires, then
    /// remove the socket and pid file.
    pub async fn run(self) -> Result<(), DaemonError> {
        let shutdown = self.state.shutdown_token();
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(handle_connection(state, stream));
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        self.state.request_shutdown();
                        break Err(DaemonError::Io(e));
                    }
                },
            }
        };

        self.state.cancel_flight();
        self.cleanup();
        info!("Daemon stopped");
        result
    }

    fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove socket {}: {e}", self.socket.display());
        }
        if let Some(pid_file) = &self.pid_file {
            let _ = std::fs::remove_file(pid_file);
        }
    }
}

/// Bind the socket, or fail if a live daemon already owns it. A socket file
/// nobody answers on is stale and is replaced.
async fn bind_single_instance(socket: &Path) -> Result<UnixListener, DaemonError> {
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if socket.exists() {
        if UnixStream::connect(socket).await.is_ok() {
            return Err(DaemonError::AlreadyRunning(socket.to_path_buf()));
        }
        warn!("Removing stale socket {}", socket.display());
        std::fs::remove_file(socket)?;
    }

    UnixListener::bind(socket).map_err(|source| DaemonError::Bind {
        path: socket.to_path_buf(),
        source,
    })
}

/// Serve one client connection until it closes or the daemon stops.
async fn handle_connection(state: Arc<DaemonState>, stream: UnixStream) {
    debug!("Client connected");
    let (read_half, mut write_half) = stream.into_split();
    let closed = CancellationToken::new();

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let Err(e) = write_half.write_all(frame.encode().as_bytes()).await {
                debug!("Client write failed: {e}");
                writer_closed.cancel();
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Reading runs in its own task so that a socket error is noticed while
    // a query is still streaming. End of input is only a half-close: the
    // client may still be waiting for answers.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    let reader_closed = closed.clone();
    let shutdown = state.shutdown_token();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Client read failed: {e}");
                        reader_closed.cancel();
                        break;
                    }
                },
            }
        }
    });

    // An admitted query runs on its own task holding a responder clone, so
    // the writer stays up until its last frame is queued.
    let responder = Responder::new(frame_tx, closed);
    while let Some(line) = line_rx.recv().await {
        serializer::dispatch_line(&state, &line, &responder);
    }

    drop(responder);
    let _ = writer.await;
    let _ = reader.await;
    debug!("Client disconnected");
}
