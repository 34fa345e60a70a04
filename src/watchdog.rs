/// Inactivity watchdog.
///
/// Once per tick, checks whether the host has pending work. Pending work resets
/// the idle counter; otherwise the counter advances, warnings are logged as the
/// remaining time crosses each threshold, and once the idle time exceeds the
/// timeout the shutdown sequence runs.
use crate::config::WatchdogConfig;
use crate::counter::IdleCounter;
use crate::shutdown::Shutdown;
use crate::work::WorkSource;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// What a single tick decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Work is pending; the counter is back at zero.
    Active { was_idle: bool },
    /// No work pending; the counter advanced.
    Idle {
        remaining_secs: i64,
        warning: Option<String>,
    },
    /// Idle time exceeded the timeout; the caller must stop the server.
    Expired { idle_secs: u64 },
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    counter: Arc<IdleCounter>,
    timeout_secs: u64,
    warning_thresholds: Vec<u64>,
    tick_interval: Duration,
    max_poll_failures: u32,
}

impl Watchdog {
    pub fn new(counter: Arc<IdleCounter>, config: &WatchdogConfig) -> Self {
        Self {
            counter,
            timeout_secs: config.timeout_secs,
            warning_thresholds: config.warning_thresholds.clone(),
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            max_poll_failures: config.max_poll_failures,
        }
    }

    /// Apply one tick to the idle counter.
    ///
    /// Remaining time and the expiry check both use the idle value read before
    /// this tick's increment, so expiry lands on the tick where that value is
    /// `timeout + 1`, one tick after `time_left` first reads negative.
    pub fn tick(&self, work_pending: bool) -> TickOutcome {
        let idle_secs = self.counter.get();

        if work_pending {
            if idle_secs > 0 {
                tracing::info!(
                    idle_secs,
                    "autostop: new work queued, timer reset and paused until the queue drains"
                );
            }
            self.counter.reset();
            return TickOutcome::Active {
                was_idle: idle_secs > 0,
            };
        }

        self.counter.increment();

        let remaining_secs = self.timeout_secs as i64 - idle_secs as i64;
        let warning = u64::try_from(remaining_secs)
            .ok()
            .filter(|r| self.warning_thresholds.contains(r))
            .map(format_warning);
        if let Some(msg) = &warning {
            tracing::warn!(remaining_secs, "autostop: {msg}");
        }

        if idle_secs > self.timeout_secs {
            tracing::warn!(
                idle_secs,
                timeout_secs = self.timeout_secs,
                "autostop: idle timeout exceeded"
            );
            return TickOutcome::Expired { idle_secs };
        }

        TickOutcome::Idle {
            remaining_secs,
            warning,
        }
    }
}

/// Human-readable countdown warning: whole minutes from 60s up, seconds below.
pub fn format_warning(remaining_secs: u64) -> String {
    let (amount, unit) = if remaining_secs >= 60 {
        (remaining_secs / 60, "minute(s)")
    } else {
        (remaining_secs, "second(s)")
    };
    format!(
        "Warning: the server will stop in {amount} {unit} due to inactivity. \
         Submit any work to keep it running."
    )
}

/// Run the watchdog loop forever.
///
/// A failed poll of the work source skips that tick without touching the
/// counter. Once `max_poll_failures` polls in a row have failed, further
/// failures count as idle ticks so an unreachable host cannot hold the server
/// up forever.
pub async fn run<W: WorkSource>(watchdog: Watchdog, source: Arc<W>, shutdown: Shutdown) {
    let mut ticker = interval(watchdog.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let limit = watchdog.max_poll_failures;
    let mut consecutive_failures: u32 = 0;

    loop {
        ticker.tick().await;

        let work_pending = match source.tasks_remaining().await {
            Ok(pending) => {
                if limit > 0 && consecutive_failures >= limit {
                    tracing::info!(
                        consecutive_failures,
                        "autostop: work source reachable again"
                    );
                }
                consecutive_failures = 0;
                tracing::trace!(pending, "autostop: polled work source");
                pending > 0
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                if limit == 0 || consecutive_failures < limit {
                    tracing::warn!(
                        error = %e,
                        consecutive_failures,
                        "autostop: failed to poll work source, skipping tick"
                    );
                    continue;
                }
                if consecutive_failures == limit {
                    tracing::error!(
                        error = %e,
                        consecutive_failures,
                        "autostop: work source keeps failing, counting failed polls as idle"
                    );
                } else {
                    tracing::debug!(error = %e, "autostop: work source still failing");
                }
                false
            }
        };

        match watchdog.tick(work_pending) {
            TickOutcome::Active { was_idle } => {
                tracing::trace!(was_idle, "autostop: tick active");
            }
            TickOutcome::Idle {
                remaining_secs,
                warning,
            } => {
                tracing::trace!(remaining_secs, warned = warning.is_some(), "autostop: tick idle");
            }
            TickOutcome::Expired { idle_secs } => {
                tracing::info!(idle_secs, "autostop: stopping server");
                shutdown.stop().await;
            }
        }
    }
}

/// Aborts the wrapped task when dropped, so aborting the supervisor also
/// aborts the loop it is running.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawn the watchdog on its own task, restarting it if a tick panics.
///
/// Aborting the returned handle stops the loop as well.
pub fn spawn<W>(watchdog: Watchdog, source: Arc<W>, shutdown: Shutdown) -> JoinHandle<()>
where
    W: WorkSource + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut guard = AbortOnDrop(tokio::spawn(run(
                watchdog.clone(),
                Arc::clone(&source),
                shutdown.clone(),
            )));
            match (&mut guard.0).await {
                Err(e) if e.is_panic() => {
                    tracing::error!(error = %e, "autostop: watchdog loop panicked, restarting");
                }
                _ => return,
            }
        }
    })
}
