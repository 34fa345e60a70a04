/// The shutdown sequence: cleanup, optional cloud-instance stop, grace period,
/// then immediate process exit.
///
/// Exit is unconditional. If any step errors or panics, the process still exits,
/// only with a failure code. Concurrent `stop()` calls are not serialized; at
/// worst the stop command is sent twice before the process goes away.
use crate::config::ShutdownConfig;
use crate::hooks::{Cleanup, CleanupError};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// Placeholder in `stop_args` replaced by the instance id.
const INSTANCE_ID_PLACEHOLDER: &str = "{instance_id}";

/// Errors that turn a graceful stop into a forced failure exit.
#[derive(Debug)]
pub enum ShutdownError {
    Cleanup(CleanupError),
    /// The stop-instance command could not be started at all.
    StopCommand {
        command: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Cleanup(e) => write!(f, "cleanup failed: {e}"),
            ShutdownError::StopCommand { command, source } => {
                write!(f, "failed to run stop command `{command}`: {source}")
            }
        }
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShutdownError::Cleanup(e) => Some(e),
            ShutdownError::StopCommand { source, .. } => Some(source),
        }
    }
}

impl From<CleanupError> for ShutdownError {
    fn from(e: CleanupError) -> Self {
        ShutdownError::Cleanup(e)
    }
}

/// How the stop-instance command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    Sent,
    Failed { exit_code: Option<i32> },
    TimedOut,
}

/// Terminates the process with the given code.
pub trait Exit: Send + Sync {
    fn exit(&self, code: i32);
}

/// Exits via `std::process::exit`: no unwinding, no destructors on any stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExit;

impl Exit for ProcessExit {
    fn exit(&self, code: i32) {
        std::process::exit(code)
    }
}

/// Environment lookup used to find the instance id at stop time.
type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct Shutdown {
    config: Arc<ShutdownConfig>,
    cleanup: Arc<Cleanup>,
    exit: Arc<dyn Exit>,
    env: EnvLookup,
}

impl Shutdown {
    pub fn new(config: ShutdownConfig, cleanup: Cleanup, exit: Arc<dyn Exit>) -> Self {
        Self {
            config: Arc::new(config),
            cleanup: Arc::new(cleanup),
            exit,
            env: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Replace the process environment lookup.
    #[cfg(test)]
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    /// Run the shutdown sequence and exit the process.
    ///
    /// The sequence runs on its own task so a panic inside it is caught here
    /// and still ends in an exit.
    pub async fn stop(&self) {
        let this = self.clone();
        let code = match tokio::spawn(async move { this.run_sequence().await }).await {
            Ok(Ok(())) => EXIT_OK,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "autostop: error while stopping the server, forcing exit");
                EXIT_FAILURE
            }
            Err(e) => {
                tracing::error!(error = %e, "autostop: shutdown sequence panicked, forcing exit");
                EXIT_FAILURE
            }
        };
        self.exit.exit(code);
    }

    async fn run_sequence(&self) -> Result<(), ShutdownError> {
        tracing::info!("autostop: stopping the server");
        self.cleanup.run().await?;

        if let Some(instance_id) = self.instance_id() {
            tracing::info!(%instance_id, "autostop: cloud instance detected, requesting stop");
            match self.stop_instance(&instance_id).await? {
                StopRequest::Sent => tracing::info!("autostop: stop request sent"),
                StopRequest::Failed { exit_code } => {
                    tracing::error!(?exit_code, "autostop: failed to stop the instance")
                }
                StopRequest::TimedOut => tracing::error!(
                    timeout_secs = self.config.stop_timeout_secs,
                    "autostop: stop command timed out"
                ),
            }
        }

        tokio::time::sleep(Duration::from_secs(self.config.grace_period_secs)).await;
        Ok(())
    }

    /// Instance id from the configured environment variable, if set and non-empty.
    fn instance_id(&self) -> Option<String> {
        (self.env)(&self.config.instance_id_env)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<StopRequest, ShutdownError> {
        let args = stop_args(&self.config.stop_args, instance_id);
        tracing::debug!(command = %self.config.stop_command, ?args, "autostop: running stop command");

        let mut child = Command::new(&self.config.stop_command)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShutdownError::StopCommand {
                command: self.config.stop_command.clone(),
                source: e,
            })?;

        let status = if self.config.stop_timeout_secs == 0 {
            child.wait().await
        } else {
            let limit = Duration::from_secs(self.config.stop_timeout_secs);
            match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    let _ = child.kill().await;
                    return Ok(StopRequest::TimedOut);
                }
            }
        };

        // A wait failure means we can't tell; treat it like a failed request
        Ok(match status {
            Ok(status) => request_from_status(status),
            Err(e) => {
                tracing::warn!(error = %e, "autostop: failed to wait on stop command");
                StopRequest::Failed { exit_code: None }
            }
        })
    }
}

fn request_from_status(status: ExitStatus) -> StopRequest {
    if status.success() {
        StopRequest::Sent
    } else {
        StopRequest::Failed {
            exit_code: status.code(),
        }
    }
}

/// Substitute the instance id into the stop command arguments.
fn stop_args(template: &[String], instance_id: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace(INSTANCE_ID_PLACEHOLDER, instance_id))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Exit;
    use std::sync::Mutex;

    /// Records exit codes instead of exiting.
    #[derive(Debug, Default)]
    pub struct RecordingExit {
        codes: Mutex<Vec<i32>>,
    }

    impl RecordingExit {
        pub fn codes(&self) -> Vec<i32> {
            self.codes.lock().unwrap().clone()
        }
    }

    impl Exit for RecordingExit {
        fn exit(&self, code: i32) {
            self.codes.lock().unwrap().push(code);
        }
    }
}
