use crate::dispatch::{OnDrop, DEFAULT_THREAD_NAME};
use crate::process::DEFAULT_SHELL;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from procctl.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub pid_file: PidFileConfig,
    pub dispatch: DispatchConfig,
    pub journal: JournalConfig,
    pub shell: ShellConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PidFileConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Signal names (`USR1`, `SIGHUP`, ...) the daemon dispatches.
    pub signals: Vec<String>,
    pub on_drop: OnDrop,
    pub thread_name: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct JournalConfig {
    /// JSONL file receiving one line per caught signal. Disabled when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub path: PathBuf,
}

// --- Default implementations ---

impl Default for PidFileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("procctl.pid"),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            signals: ["HUP", "INT", "TERM", "USR1", "USR2"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            on_drop: OnDrop::Restore,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SHELL),
        }
    }
}

/// Errors from loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load the config at `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(DaemonConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.pid_file.path, PathBuf::from("procctl.pid"));
        assert_eq!(config.dispatch.signals, vec!["HUP", "INT", "TERM", "USR1", "USR2"]);
        assert_eq!(config.dispatch.on_drop, OnDrop::Restore);
        assert_eq!(config.dispatch.thread_name, "procctl-signals");
        assert!(config.journal.path.is_none());
        assert_eq!(config.shell.path, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = load(&dir.path().join("procctl.toml")).unwrap();
        assert_eq!(config.pid_file.path, PathBuf::from("procctl.pid"));
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("procctl.toml");
        std::fs::write(
            &path,
            r#"
[pid_file]
path = "/run/upsd.pid"

[dispatch]
signals = ["USR1"]
on_drop = "ignore"

[journal]
path = "signals.jsonl"
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.pid_file.path, PathBuf::from("/run/upsd.pid"));
        assert_eq!(config.dispatch.signals, vec!["USR1"]);
        assert_eq!(config.dispatch.on_drop, OnDrop::Ignore);
        assert_eq!(config.dispatch.thread_name, "procctl-signals");
        assert_eq!(config.journal.path, Some(PathBuf::from("signals.jsonl")));
        assert_eq!(config.shell.path, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("procctl.toml");
        std::fs::write(&path, "[dispatch]\non_drop = \"explode\"\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }
}
