mod config;
mod counter;
mod hooks;
mod serve;
mod shutdown;
mod signals;
mod watchdog;
mod work;

use clap::Parser;
use config::AutostopConfig;
use std::path::PathBuf;

/// Inactivity watchdog for an expensive server: track idle time, expose it over
/// HTTP, and stop the server (and its cloud instance) once it stays idle too long.
#[derive(Parser, Debug)]
#[command(name = "autostop", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "autostop.toml")]
    config: PathBuf,

    /// Idle timeout in seconds (overrides config and AUTOSTOP_TIMEOUT_SECONDS)
    #[arg(long)]
    timeout: Option<u64>,

    /// Address to bind the HTTP surface to (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Port for the HTTP surface (overrides config and AUTOSTOP_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Host endpoint reporting pending work (overrides config and AUTOSTOP_QUEUE_URL)
    #[arg(long)]
    queue_url: Option<String>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (work source polls, keep-alive calls)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn log_filter(&self) -> &'static str {
        if self.verbose {
            "autostop=debug"
        } else if self.quiet {
            "autostop=warn"
        } else {
            "autostop=info"
        }
    }

    /// Load the config file, then layer environment and CLI overrides on top.
    fn resolve_config(&self) -> Result<AutostopConfig, config::ConfigError> {
        let mut config = AutostopConfig::load(&self.config)?;
        config.apply_env(|key| std::env::var(key).ok())?;

        if let Some(timeout) = self.timeout {
            config.watchdog.timeout_secs = timeout;
        }
        if let Some(bind) = &self.bind {
            config.serve.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.serve.port = port;
        }
        if let Some(url) = &self.queue_url {
            config.work.queue_url = Some(url.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter())),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match cli.resolve_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("autostop: {e}");
            std::process::exit(1);
        }
    };

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                eprintln!("autostop: failed to render config: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    tracing::info!("autostop: initializing");
    if let Err(e) = serve::run(&config).await {
        tracing::error!(error = %e, "autostop: server error");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["autostop"]);
        assert_eq!(cli.config, PathBuf::from("autostop.toml"));
        assert!(cli.timeout.is_none());
        assert!(!cli.dry_run);
        assert_eq!(cli.log_filter(), "autostop=info");
    }

    #[test]
    fn test_cli_overrides_win_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autostop.toml");
        std::fs::write(&path, "[watchdog]\ntimeout_secs = 60\n[serve]\nport = 7000\n").unwrap();

        let cli = Cli::parse_from([
            "autostop",
            "--config",
            path.to_str().unwrap(),
            "--timeout",
            "30",
            "--queue-url",
            "http://127.0.0.1:8188/prompt",
        ]);
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.watchdog.timeout_secs, 30);
        assert_eq!(config.serve.port, 7000);
        assert_eq!(
            config.work.queue_url.as_deref(),
            Some("http://127.0.0.1:8188/prompt")
        );
    }

    #[test]
    fn test_cli_zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "autostop",
            "--config",
            dir.path().join("missing.toml").to_str().unwrap(),
            "--timeout",
            "0",
        ]);
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["autostop", "-v", "-q"]).is_err());
        assert_eq!(
            Cli::parse_from(["autostop", "-q"]).log_filter(),
            "autostop=warn"
        );
    }

    #[test]
    fn test_resolved_config_renders_as_toml() {
        let rendered = toml::to_string_pretty(&AutostopConfig::default()).unwrap();
        let back: AutostopConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back, AutostopConfig::default());
    }
}
