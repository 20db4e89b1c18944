//! Ambient shell state (L3).
//!
//! The shell integration writes `shell-state.json` after each command; this
//! side only reads it. A missing or unparseable file is not an error, it
//! just means there is nothing to report beyond the working directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::preview;
use crate::tokens::estimate;

/// Number of recent commands rendered into the prompt.
pub const MAX_RECENT_COMMANDS: usize = 5;
/// Character limit of the rendered output preview.
pub const OUTPUT_PREVIEW_CHARS: usize = 200;

/// Snapshot of the user's shell as written by the shell integration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ShellState {
    pub cwd: String,
    #[serde(alias = "recentCommands")]
    pub recent_commands: Vec<String>,
    #[serde(alias = "lastExitCode")]
    pub last_exit_code: i32,
    #[serde(alias = "lastOutputPreview")]
    pub last_output_preview: String,
}

impl Default for ShellState {
    fn default() -> Self {
        Self {
            cwd: current_dir(),
            recent_commands: Vec::new(),
            last_exit_code: 0,
            last_output_preview: String::new(),
        }
    }
}

fn current_dir() -> String {
    std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

/// Read-only view over `shell-state.json`.
#[derive(Debug, Clone)]
pub struct ShellStateReader {
    path: PathBuf,
}

impl ShellStateReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current shell state, or defaults when the file is absent or corrupt.
    /// Read fresh on every call; the file changes behind our back.
    pub fn read(&self) -> ShellState {
        let Ok(json) = std::fs::read_to_string(&self.path) else {
            return ShellState::default();
        };
        serde_json::from_str(&json).unwrap_or_else(|e| {
            debug!("Ignoring unparseable shell state: {e}");
            ShellState::default()
        })
    }

    /// Render the shell section. `override_cwd` (the client's cwd) wins over
    /// the recorded one.
    pub fn build_prompt(&self, override_cwd: Option<&str>) -> String {
        let state = self.read();
        let cwd = override_cwd
            .filter(|c| !c.is_empty())
            .unwrap_or(&state.cwd);

        let mut lines = vec![format!("cwd: {cwd}")];

        let skip = state
            .recent_commands
            .len()
            .saturating_sub(MAX_RECENT_COMMANDS);
        let recent: Vec<&str> = state
            .recent_commands
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect();
        if !recent.is_empty() {
            lines.push(format!("recent commands: {}", recent.join("; ")));
        }

        if state.last_exit_code != 0 {
            lines.push(format!("last exit code: {}", state.last_exit_code));
        }

        let output = state.last_output_preview.trim();
        if !output.is_empty() {
            lines.push(format!(
                "last output: {}",
                preview(output, OUTPUT_PREVIEW_CHARS)
            ));
        }

        lines.join("\n")
    }

    pub fn estimate_tokens(&self, override_cwd: Option<&str>) -> usize {
        estimate(&self.build_prompt(override_cwd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let reader = ShellStateReader::new(dir.path().join("shell-state.json"));
        let state = reader.read();
        assert!(state.recent_commands.is_empty());
        assert_eq!(state.last_exit_code, 0);
        assert_eq!(state.cwd, current_dir());
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell-state.json");
        std::fs::write(&path, "{oops").unwrap();
        assert_eq!(ShellStateReader::new(&path).read().last_exit_code, 0);
    }

    #[test]
    fn camel_case_fields_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell-state.json");
        std::fs::write(
            &path,
            r#"{"cwd": "/srv", "recentCommands": ["make"], "lastExitCode": 2, "lastOutputPreview": "error: x"}"#,
        )
        .unwrap();
        let state = ShellStateReader::new(&path).read();
        assert_eq!(state.cwd, "/srv");
        assert_eq!(state.recent_commands, vec!["make"]);
        assert_eq!(state.last_exit_code, 2);
        assert_eq!(state.last_output_preview, "error: x");
    }

    #[test]
    fn prompt_shows_last_five_commands_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell-state.json");
        let state = ShellState {
            cwd: "/home/me/project".into(),
            recent_commands: (1..=7).map(|i| format!("cmd{i}")).collect(),
            last_exit_code: 127,
            last_output_preview: "o".repeat(300),
        };
        std::fs::write(&path, serde_json::to_string(&state).unwrap()).unwrap();

        let prompt = ShellStateReader::new(&path).build_prompt(None);
        let lines: Vec<&str> = prompt.lines().collect();
        assert_eq!(lines[0], "cwd: /home/me/project");
        assert_eq!(lines[1], "recent commands: cmd3; cmd4; cmd5; cmd6; cmd7");
        assert_eq!(lines[2], "last exit code: 127");
        assert!(lines[3].ends_with("..."));
        assert_eq!(
            lines[3].chars().count(),
            "last output: ".len() + OUTPUT_PREVIEW_CHARS + 3
        );
    }

    #[test]
    fn override_cwd_wins_and_zero_exit_is_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell-state.json");
        std::fs::write(&path, r#"{"cwd": "/recorded", "last_exit_code": 0}"#).unwrap();

        let reader = ShellStateReader::new(&path);
        let prompt = reader.build_prompt(Some("/from/client"));
        assert_eq!(prompt, "cwd: /from/client");
        assert!(reader.estimate_tokens(Some("/from/client")) > 0);
    }
}
