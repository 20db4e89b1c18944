//! Per-user file layout.
//!
//! Everything lives in one directory: `$TERMCTX_HOME` when set, otherwise
//! `termctx/` under the platform config directory (`~/.config/termctx` on
//! Linux).

use std::path::{Path, PathBuf};

/// Overrides the config directory.
pub const HOME_ENV: &str = "TERMCTX_HOME";

/// Locations of every file the daemon reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// Resolve the directory from the environment.
    pub fn from_env() -> Self {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Self::at(PathBuf::from(home));
        }
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(std::env::temp_dir);
        Self::at(base.join("termctx"))
    }

    /// Use `root` as the directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    pub fn memory(&self) -> PathBuf {
        self.root.join("memory.json")
    }

    pub fn topics(&self) -> PathBuf {
        self.root.join("topics.json")
    }

    /// Written by the shell integration, read by the daemon.
    pub fn shell_state(&self) -> PathBuf {
        self.root.join("shell-state.json")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn socket(&self) -> PathBuf {
        self.root.join("termctx.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("termctx.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("daemon.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_share_one_root() {
        let paths = Paths::at("/tmp/tc");
        assert_eq!(paths.memory(), Path::new("/tmp/tc/memory.json"));
        assert_eq!(paths.topics(), Path::new("/tmp/tc/topics.json"));
        assert_eq!(paths.shell_state(), Path::new("/tmp/tc/shell-state.json"));
        assert_eq!(paths.config(), Path::new("/tmp/tc/config.json"));
        assert_eq!(paths.socket(), Path::new("/tmp/tc/termctx.sock"));
        assert_eq!(paths.pid_file(), Path::new("/tmp/tc/termctx.pid"));
        assert_eq!(paths.log_file(), Path::new("/tmp/tc/daemon.log"));
    }

    #[test]
    fn ensure_root_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path().join("a").join("b"));
        paths.ensure_root().unwrap();
        assert!(paths.root().is_dir());
    }
}
