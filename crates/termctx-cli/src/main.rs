//! `termctx`: terminal client and daemon for bounded LLM conversation
//! context.
//!
//! The daemon holds the conversation state and talks to the model; every
//! other subcommand is a short-lived client that sends one request over the
//! daemon's Unix socket. Reads the API key from the `OPENROUTER_KEY`
//! environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Start the daemon (logs to daemon.log in the termctx directory)
//! termctx daemon &
//!
//! # Ask, with the output of a failed command attached
//! termctx ask --command-context "$(make 2>&1 | tail -20)" why did this fail
//!
//! termctx remember we always use tabs in Makefiles
//! termctx topic build-errors
//! termctx status
//! termctx stop
//! ```

mod client;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use termctx::OpenRouterClient;
use termctx::backend::OpenRouterBackend;
use termctx::context::{ContextOrchestrator, MemoryStore, ShellStateReader, TopicStore};
use termctx::daemon::{self, DaemonState};
use termctx::paths::Paths;
use termctx::protocol::{ClientFrame, Command};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::DaemonConfig;

/// Log filter directives, in `EnvFilter` syntax.
const LOG_ENV: &str = "TERMCTX_LOG";

/// Bounded conversation context for terminal LLM tools.
#[derive(Parser, Debug)]
#[command(name = "termctx", version)]
struct Cli {
    /// Daemon socket. Defaults to `termctx.sock` in the termctx directory.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug, PartialEq)]
enum CliCommand {
    /// Run the daemon in the foreground.
    Daemon {
        /// Log to stderr instead of daemon.log.
        #[arg(long)]
        foreground_log: bool,

        /// Model to use, overriding config.json.
        #[arg(long)]
        model: Option<String>,
    },
    /// Ask a question.
    Ask {
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,

        /// Working directory to report. Defaults to the current directory.
        #[arg(long)]
        cwd: Option<String>,

        /// Output of the command you just ran, sent with this question only.
        #[arg(long)]
        command_context: Option<String>,
    },
    /// Show the context breakdown.
    Status,
    /// Fold the conversation into a topic.
    Compact,
    /// Drop the conversation.
    Clear,
    /// Drop the conversation, topics and memory.
    Forget,
    /// Save the conversation as a topic and start a new one.
    Topic { name: Option<String> },
    /// Show a saved topic.
    Recall { name: String },
    /// Remember a fact.
    Remember {
        #[arg(required = true, trailing_var_arg = true)]
        fact: Vec<String>,
    },
    /// Stop the daemon.
    Stop,
    /// Check that the daemon is up.
    Ping,
}

impl CliCommand {
    /// The request a client subcommand sends. `None` for `daemon`.
    fn frame(&self) -> Option<ClientFrame> {
        let command = |command, args| Some(ClientFrame::command(command, args));
        match self {
            CliCommand::Daemon { .. } => None,
            CliCommand::Ask {
                message,
                cwd,
                command_context,
            } => Some(ClientFrame::Query {
                message: message.join(" "),
                cwd: cwd.clone().or_else(current_dir),
                command_context: command_context.clone(),
            }),
            CliCommand::Status => command(Command::Status, None),
            CliCommand::Compact => command(Command::Compact, None),
            CliCommand::Clear => command(Command::Clear, None),
            CliCommand::Forget => command(Command::Forget, None),
            CliCommand::Topic { name } => command(Command::Topic, name.clone()),
            CliCommand::Recall { name } => command(Command::Recall, Some(name.clone())),
            CliCommand::Remember { fact } => command(Command::Remember, Some(fact.join(" "))),
            CliCommand::Stop => command(Command::Stop, None),
            CliCommand::Ping => Some(ClientFrame::Ping),
        }
    }
}

fn current_dir() -> Option<String> {
    std::env::current_dir()
        .ok()
        .map(|p| p.to_string_lossy().to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let paths = Paths::from_env();

    if let CliCommand::Daemon {
        foreground_log,
        model,
    } = cli.command
    {
        run_daemon(paths, cli.socket, foreground_log, model).await?;
        return Ok(ExitCode::SUCCESS);
    }

    init_tracing(None, "warn");
    let config = DaemonConfig::load(&paths.config());
    let socket = cli.socket.unwrap_or_else(|| config.socket(&paths));
    let Some(frame) = cli.command.frame() else {
        return Ok(ExitCode::SUCCESS);
    };

    let outcome = client::request(&socket, &frame).await?;
    Ok(if outcome.failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn run_daemon(
    paths: Paths,
    socket: Option<PathBuf>,
    foreground_log: bool,
    model: Option<String>,
) -> anyhow::Result<()> {
    paths
        .ensure_root()
        .with_context(|| format!("failed to create {}", paths.root().display()))?;

    if foreground_log {
        init_tracing(None, "info");
    } else {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.log_file())
            .with_context(|| format!("failed to open {}", paths.log_file().display()))?;
        init_tracing(Some(log), "info");
    }

    let mut config = DaemonConfig::load(&paths.config());
    if let Some(model) = model {
        config.model = model;
    }
    let socket = socket.unwrap_or_else(|| config.socket(&paths));

    let mut client = OpenRouterClient::from_env().map_err(anyhow::Error::msg)?;
    if let Some(endpoint) = &config.endpoint {
        client = client.with_endpoint(endpoint);
    }
    let backend = OpenRouterBackend::new(client, config.backend_settings());

    let orchestrator = ContextOrchestrator::new(
        MemoryStore::load(paths.memory()),
        TopicStore::load(paths.topics()),
        ShellStateReader::new(paths.shell_state()),
        config.budget.clone(),
    )
    .with_extract_every(config.extract_every);

    let state = Arc::new(
        DaemonState::new(orchestrator, Arc::new(backend)).with_idle_timeout(config.idle_timeout()),
    );
    info!(
        "Starting daemon: model={}, budget={} tokens",
        config.model, config.budget.total
    );

    spawn_signal_handler(Arc::clone(&state));
    daemon::serve(state, socket, Some(paths.pid_file()))
        .await
        .context("daemon failed")
}

/// Stop gracefully on SIGINT or SIGTERM.
fn spawn_signal_handler(state: Arc<DaemonState>) {
    tokio::spawn(async move {
        let shutdown = state.shutdown_token();
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Cannot listen for SIGTERM: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
            _ = shutdown.cancelled() => return,
        }
        state.request_shutdown();
    });
}

/// Log to `file` when given, otherwise to stderr. The filter comes from
/// `TERMCTX_LOG` and falls back to `default_level`.
fn init_tracing(file: Option<std::fs::File>, default_level: &str) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = match file {
        Some(file) => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init(),
        None => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("termctx").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn ask_joins_words_and_keeps_flags() {
        let cli = parse(&[
            "ask",
            "--cwd",
            "/src",
            "--command-context",
            "exit 2",
            "why",
            "did",
            "make",
            "fail",
        ]);
        let frame = cli.command.frame().unwrap();
        assert_eq!(
            frame,
            ClientFrame::Query {
                message: "why did make fail".into(),
                cwd: Some("/src".into()),
                command_context: Some("exit 2".into()),
            }
        );
    }

    #[test]
    fn ask_requires_a_message() {
        assert!(Cli::try_parse_from(["termctx", "ask"]).is_err());
    }

    #[test]
    fn admin_commands_map_to_frames() {
        assert_eq!(
            parse(&["remember", "always", "use", "tabs"]).command.frame(),
            Some(ClientFrame::command(
                Command::Remember,
                Some("always use tabs".into())
            ))
        );
        assert_eq!(
            parse(&["topic"]).command.frame(),
            Some(ClientFrame::command(Command::Topic, None))
        );
        assert_eq!(
            parse(&["recall", "build-errors"]).command.frame(),
            Some(ClientFrame::command(
                Command::Recall,
                Some("build-errors".into())
            ))
        );
        assert_eq!(parse(&["ping"]).command.frame(), Some(ClientFrame::Ping));
    }

    #[test]
    fn daemon_takes_global_socket() {
        let cli = parse(&["daemon", "--socket", "/tmp/x.sock", "--foreground-log"]);
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/x.sock")));
        assert_eq!(
            cli.command,
            CliCommand::Daemon {
                foreground_log: true,
                model: None
            }
        );
        assert!(cli.command.frame().is_none());
    }
}
