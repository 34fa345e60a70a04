use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from autostop.toml.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct AutostopConfig {
    pub watchdog: WatchdogConfig,
    pub serve: ServeConfig,
    pub work: WorkConfig,
    pub shutdown: ShutdownConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Idle seconds after which the shutdown sequence runs.
    pub timeout_secs: u64,
    pub tick_interval_ms: u64,
    /// Consecutive failed work-source polls after which failures count as
    /// idle ticks. 0 keeps skipping them forever.
    pub max_poll_failures: u32,
    /// Remaining-second marks that log a warning.
    pub warning_thresholds: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkConfig {
    /// Host endpoint reporting its pending work. Unset means only keep-alive
    /// calls hold the process up.
    pub queue_url: Option<String>,
    /// JSON pointer to the pending-work count in the response body.
    pub count_pointer: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_secs: u64,
    /// Environment variable holding the cloud instance id.
    pub instance_id_env: String,
    pub stop_command: String,
    /// Arguments for `stop_command`; `{instance_id}` is substituted.
    pub stop_args: Vec<String>,
    /// 0 waits for the stop command indefinitely.
    pub stop_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    /// Directory whose contents are removed before stopping.
    pub temp_dir: Option<PathBuf>,
    /// Shell commands run (via `sh -c`) after the temp dir is cleared.
    pub commands: Vec<String>,
    /// Per-command limit; a command still running after it is killed.
    pub command_timeout_secs: u64,
}

// --- Default implementations ---

pub const DEFAULT_WARNING_THRESHOLDS: [u64; 11] = [300, 120, 60, 30, 15, 10, 5, 4, 3, 2, 1];

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 900,
            tick_interval_ms: 1000,
            max_poll_failures: 30,
            warning_thresholds: DEFAULT_WARNING_THRESHOLDS.to_vec(),
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8189,
        }
    }
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            queue_url: None,
            count_pointer: "/exec_info/queue_remaining".to_string(),
            request_timeout_secs: 5,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
            instance_id_env: "RUNPOD_POD_ID".to_string(),
            stop_command: "runpodctl".to_string(),
            stop_args: vec![
                "stop".to_string(),
                "pod".to_string(),
                "{instance_id}".to_string(),
            ],
            stop_timeout_secs: 120,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            commands: Vec::new(),
            command_timeout_secs: 60,
        }
    }
}

/// Errors produced while resolving configuration at startup.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// An environment override holds an unusable value.
    InvalidEnv { var: String, value: String },
    /// A resolved setting is out of range.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::InvalidEnv { var, value } => {
                write!(f, "invalid value for {var}: {value:?}")
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidEnv { .. } | ConfigError::Invalid(_) => None,
        }
    }
}

pub const ENV_TIMEOUT: &str = "AUTOSTOP_TIMEOUT_SECONDS";
pub const ENV_PORT: &str = "AUTOSTOP_PORT";
pub const ENV_QUEUE_URL: &str = "AUTOSTOP_QUEUE_URL";

impl AutostopConfig {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply environment overrides, looked up through `lookup` so tests don't
    /// have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TIMEOUT) {
            let parsed = raw.trim().parse::<u64>();
            self.watchdog.timeout_secs = match parsed {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_TIMEOUT.to_string(),
                        value: raw,
                    })
                }
            };
        }
        if let Some(raw) = lookup(ENV_PORT) {
            self.serve.port = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_PORT.to_string(),
                value: raw.clone(),
            })?;
        }
        if let Some(url) = lookup(ENV_QUEUE_URL) {
            if !url.trim().is_empty() {
                self.work.queue_url = Some(url.trim().to_string());
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.timeout_secs must be positive".to_string(),
            ));
        }
        if self.watchdog.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.cleanup.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "cleanup.command_timeout_secs must be positive".to_string(),
            ));
        }
        if self.work.queue_url.is_some() && self.work.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "work.request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AutostopConfig::default();
        assert_eq!(config.watchdog.timeout_secs, 900);
        assert_eq!(config.watchdog.tick_interval_ms, 1000);
        assert_eq!(
            config.watchdog.warning_thresholds,
            vec![300, 120, 60, 30, 15, 10, 5, 4, 3, 2, 1]
        );
        assert_eq!(config.watchdog.max_poll_failures, 30);
        assert_eq!(config.shutdown.grace_period_secs, 5);
        assert_eq!(config.shutdown.instance_id_env, "RUNPOD_POD_ID");
        assert!(config.work.queue_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutostopConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, AutostopConfig::default());
    }

    #[test]
    fn test_load_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autostop.toml");
        std::fs::write(
            &path,
            "[watchdog]\ntimeout_secs = 60\n\n[cleanup]\ntemp_dir = \"/tmp/host-temp\"\n",
        )
        .unwrap();

        let config = AutostopConfig::load(&path).unwrap();
        assert_eq!(config.watchdog.timeout_secs, 60);
        assert_eq!(config.watchdog.tick_interval_ms, 1000);
        assert_eq!(
            config.cleanup.temp_dir,
            Some(PathBuf::from("/tmp/host-temp"))
        );
        assert_eq!(config.serve.port, 8189);
    }

    #[test]
    fn test_load_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autostop.toml");
        std::fs::write(&path, "[watchdog]\ntimeout_secs = \"soon\"\n").unwrap();

        let err = AutostopConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_env_timeout_override() {
        let mut config = AutostopConfig::default();
        config.apply_env(env(&[(ENV_TIMEOUT, "120")])).unwrap();
        assert_eq!(config.watchdog.timeout_secs, 120);
    }

    #[test]
    fn test_env_timeout_rejects_zero_and_garbage() {
        for bad in ["0", "-5", "ten", ""] {
            let mut config = AutostopConfig::default();
            let err = config.apply_env(env(&[(ENV_TIMEOUT, bad)])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidEnv { .. }), "{bad}");
        }
    }

    #[test]
    fn test_env_port_and_queue_url() {
        let mut config = AutostopConfig::default();
        config
            .apply_env(env(&[
                (ENV_PORT, "9000"),
                (ENV_QUEUE_URL, "http://127.0.0.1:8188/prompt"),
            ]))
            .unwrap();
        assert_eq!(config.serve.port, 9000);
        assert_eq!(
            config.work.queue_url.as_deref(),
            Some("http://127.0.0.1:8188/prompt")
        );
    }

    #[test]
    fn test_env_absent_changes_nothing() {
        let mut config = AutostopConfig::default();
        config.apply_env(env(&[])).unwrap();
        assert_eq!(config, AutostopConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = AutostopConfig::default();
        config.watchdog.timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_unbounded_cleanup_commands() {
        let mut config = AutostopConfig::default();
        assert_eq!(config.cleanup.command_timeout_secs, 60);
        config.cleanup.command_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_tick_interval() {
        let mut config = AutostopConfig::default();
        config.watchdog.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
