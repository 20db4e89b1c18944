//! Client side of the daemon protocol.
//!
//! Sends one request and renders the frames that come back until `done`:
//! answer text goes raw to stdout so it can be piped, everything else goes
//! to stderr.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, bail};
use termctx::protocol::{ClientFrame, ServerFrame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// How a request ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// At least one `error` frame was received.
    pub failed: bool,
}

/// Send `frame` to the daemon at `socket` and render the reply.
pub async fn request(socket: &Path, frame: &ClientFrame) -> anyhow::Result<Outcome> {
    let stream = UnixStream::connect(socket).await.with_context(|| {
        format!(
            "daemon not running at {} (start it with `termctx daemon`)",
            socket.display()
        )
    })?;
    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(frame.encode().as_bytes())
        .await
        .context("failed to send request")?;

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let mut lines = BufReader::new(read_half).lines();
    let mut outcome = Outcome::default();
    let mut wrote_text = false;

    while let Some(line) = lines.next_line().await.context("failed to read reply")? {
        let frame = match ServerFrame::decode(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Ignoring undecodable frame: {e}");
                continue;
            }
        };
        if matches!(frame, ServerFrame::Text { .. }) {
            wrote_text = true;
        }
        if render(&frame, &mut stdout, &mut stderr)? {
            if wrote_text {
                writeln!(stdout)?;
            }
            return Ok(outcome);
        }
        if matches!(frame, ServerFrame::Error { .. }) {
            outcome.failed = true;
        }
    }
    bail!("daemon closed the connection before finishing the request")
}

/// Write one frame. Returns `true` on `done`.
pub fn render(
    frame: &ServerFrame,
    out: &mut impl Write,
    err: &mut impl Write,
) -> anyhow::Result<bool> {
    match frame {
        ServerFrame::Text { content } => {
            write!(out, "{content}")?;
            out.flush()?;
        }
        ServerFrame::ToolUse { tool, input } => writeln!(err, "[tool] {tool} {input}")?,
        ServerFrame::ToolResult { output } => {
            writeln!(err, "[tool result] {}", output.trim_end())?;
        }
        ServerFrame::Status { data } => {
            writeln!(out, "{}", serde_json::to_string_pretty(data)?)?;
        }
        ServerFrame::Info { message } => writeln!(err, "{message}")?,
        ServerFrame::Error { message } => writeln!(err, "error: {message}")?,
        ServerFrame::Done => return Ok(true),
    }
    Ok(false)
}
