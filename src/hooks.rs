/// Pre-shutdown cleanup: clear the host's temp directory, then run any
/// configured cleanup commands.
use crate::config::CleanupConfig;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Errors that abort cleanup. A command that runs and exits non-zero or times
/// out is not one of them; it is logged and the next command runs.
#[derive(Debug)]
pub enum CleanupError {
    /// Failed to list or remove temp dir contents.
    TempDir {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn a cleanup command.
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CleanupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupError::TempDir { path, source } => {
                write!(f, "failed to clear temp dir {}: {}", path.display(), source)
            }
            CleanupError::Spawn { command, source } => {
                write!(f, "failed to spawn cleanup command `{command}`: {source}")
            }
        }
    }
}

impl std::error::Error for CleanupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CleanupError::TempDir { source, .. } => Some(source),
            CleanupError::Spawn { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cleanup {
    temp_dir: Option<PathBuf>,
    commands: Vec<String>,
    command_timeout: Duration,
}

impl Default for Cleanup {
    fn default() -> Self {
        Self::from_config(&CleanupConfig::default())
    }
}

/// How a single cleanup command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded,
    Failed { exit_code: Option<i32> },
    TimedOut,
}

impl Cleanup {
    pub fn from_config(config: &CleanupConfig) -> Self {
        Self {
            temp_dir: config.temp_dir.clone(),
            commands: config.commands.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    pub async fn run(&self) -> Result<(), CleanupError> {
        if let Some(dir) = &self.temp_dir {
            let removed = clear_dir(dir).await.map_err(|e| CleanupError::TempDir {
                path: dir.clone(),
                source: e,
            })?;
            tracing::info!(path = %dir.display(), removed, "autostop: cleared temp dir");
        }

        for command in &self.commands {
            tracing::info!(%command, "autostop: running cleanup command");
            match self.run_command(command).await? {
                CommandOutcome::Succeeded => {}
                CommandOutcome::Failed { exit_code } => {
                    tracing::warn!(%command, ?exit_code, "autostop: cleanup command failed");
                }
                CommandOutcome::TimedOut => {
                    tracing::error!(
                        %command,
                        timeout_secs = self.command_timeout.as_secs(),
                        "autostop: cleanup command timed out, killed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Run one command in its own process group, killing the whole group if it
    /// outlives `command_timeout`.
    async fn run_command(&self, command: &str) -> Result<CommandOutcome, CleanupError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CleanupError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        match tokio::time::timeout(self.command_timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(CommandOutcome::Succeeded),
            Ok(Ok(status)) => Ok(CommandOutcome::Failed {
                exit_code: status.code(),
            }),
            Ok(Err(e)) => {
                tracing::warn!(%command, error = %e, "autostop: failed to wait on cleanup command");
                Ok(CommandOutcome::Failed { exit_code: None })
            }
            Err(_) => {
                if let Some(pid) = child.id() {
                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        tracing::debug!(error = %e, "autostop: killpg on cleanup command failed");
                    }
                }
                let _ = child.kill().await;
                Ok(CommandOutcome::TimedOut)
            }
        }
    }
}

/// Remove everything inside `dir`, keeping `dir` itself. A missing directory
/// counts as already clean. Returns the number of entries removed.
async fn clear_dir(dir: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        removed += 1;
    }
    Ok(removed)
}
