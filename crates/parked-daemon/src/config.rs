use anyhow::{Context, Result, ensure};
use parked_core::TimeoutPolicy;
use parked_core::broadcaster::DEFAULT_STATUS_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DaemonConfig {
    #[serde(default = "default_daemon_id")]
    pub id: String,
    /// Control socket path. Derived from `id` when unset.
    #[serde(default)]
    pub socket: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            id: default_daemon_id(),
            socket: None,
        }
    }
}

fn default_daemon_id() -> String {
    "main".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LedgerConfig {
    /// Relative paths resolve against the directory holding the config file.
    #[serde(default = "default_ledger_path")]
    pub path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

fn default_ledger_path() -> String {
    "./data/ledger.jsonl".to_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub(crate) enum PolicyKind {
    #[default]
    Indefinite,
    Report,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TimeoutConfig {
    #[serde(default)]
    pub policy: PolicyKind,
    /// Deadline for `report` and `cancel`.
    #[serde(default = "default_after_secs")]
    pub after_secs: u64,
    /// How often `indefinite` logs a call that is still waiting.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            after_secs: default_after_secs(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_after_secs() -> u64 {
    3600
}

fn default_heartbeat_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StatusConfig {
    #[serde(default = "default_status_capacity")]
    pub capacity: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            capacity: default_status_capacity(),
        }
    }
}

fn default_status_capacity() -> usize {
    DEFAULT_STATUS_CAPACITY
}

impl Config {
    /// Load config from a TOML file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub(crate) fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.daemon.id.is_empty(), "daemon.id must not be empty");
        ensure!(self.status.capacity > 0, "status.capacity must be positive");
        match self.timeout.policy {
            PolicyKind::Indefinite => ensure!(
                self.timeout.heartbeat_secs > 0,
                "timeout.heartbeat_secs must be positive"
            ),
            PolicyKind::Report | PolicyKind::Cancel => ensure!(
                self.timeout.after_secs > 0,
                "timeout.after_secs must be positive"
            ),
        }
        Ok(())
    }

    pub(crate) fn timeout_policy(&self) -> TimeoutPolicy {
        let after = Duration::from_secs(self.timeout.after_secs);
        match self.timeout.policy {
            PolicyKind::Indefinite => TimeoutPolicy::Indefinite {
                heartbeat: Duration::from_secs(self.timeout.heartbeat_secs),
            },
            PolicyKind::Report => TimeoutPolicy::Report { after },
            PolicyKind::Cancel => TimeoutPolicy::Cancel { after },
        }
    }

    pub(crate) fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket
            .as_ref()
            .map_or_else(|| parked_ipc::socket_path(&self.daemon.id), PathBuf::from)
    }

    pub(crate) fn ledger_path(&self, base_dir: &Path) -> PathBuf {
        let path = PathBuf::from(&self.ledger.path);
        if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        }
    }

    /// Resolve config path: check arg, then default locations.
    pub(crate) fn find_config_path(explicit: Option<&str>) -> PathBuf {
        if let Some(p) = explicit {
            return PathBuf::from(p);
        }

        let local = PathBuf::from("parked.toml");
        if local.exists() {
            return local;
        }

        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            let xdg = PathBuf::from(config_dir).join("parked/parked.toml");
            if xdg.exists() {
                return xdg;
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home).join(".config/parked/parked.toml");
            if home_config.exists() {
                return home_config;
            }
        }

        local
    }
}

/// Directory that relative paths in the config resolve against.
pub(crate) fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.daemon.id, "main");
        assert!(config.daemon.socket.is_none());
        assert_eq!(config.ledger.path, "./data/ledger.jsonl");
        assert_eq!(config.status.capacity, DEFAULT_STATUS_CAPACITY);
        assert_eq!(
            config.timeout_policy(),
            TimeoutPolicy::Indefinite {
                heartbeat: Duration::from_secs(300)
            }
        );
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[daemon]
id = "mailroom"
socket = "/tmp/mailroom.sock"

[ledger]
path = "/var/lib/parked/ledger.jsonl"

[timeout]
policy = "cancel"
after_secs = 90

[status]
capacity = 16
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.daemon.id, "mailroom");
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/mailroom.sock"));
        assert_eq!(
            config.ledger_path(Path::new("/etc/parked")),
            PathBuf::from("/var/lib/parked/ledger.jsonl")
        );
        assert_eq!(
            config.timeout_policy(),
            TimeoutPolicy::Cancel {
                after: Duration::from_secs(90)
            }
        );
        assert_eq!(config.status.capacity, 16);
    }

    #[test]
    fn report_policy_with_zero_deadline_is_rejected() {
        let config: Config = toml::from_str(
            r#"
[timeout]
policy = "report"
after_secs = 0
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_policy_fails_to_parse() {
        let result: Result<Config, _> = toml::from_str("[timeout]\npolicy = \"forever\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn relative_ledger_path_resolves_against_config_dir() {
        let config = Config::default();
        assert_eq!(
            config.ledger_path(Path::new("/etc/parked")),
            PathBuf::from("/etc/parked/./data/ledger.jsonl")
        );
        assert_eq!(config_dir(Path::new("parked.toml")), PathBuf::from("."));
        assert_eq!(
            config_dir(Path::new("/etc/parked/parked.toml")),
            PathBuf::from("/etc/parked")
        );
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parked.toml");
        std::fs::write(&path, "[daemon\nid = ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err}").contains("failed to parse config file"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.daemon.id, "main");
    }

    #[test]
    fn explicit_path_wins() {
        assert_eq!(
            Config::find_config_path(Some("/opt/parked.toml")),
            PathBuf::from("/opt/parked.toml")
        );
    }
}
