use crate::config::AutostopConfig;
use crate::counter::IdleCounter;
use crate::hooks::Cleanup;
use crate::shutdown::{ProcessExit, Shutdown};
use crate::watchdog::{self, Watchdog};
use crate::work::{NoWork, QueuePoller};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    counter: Arc<IdleCounter>,
    timeout_secs: u64,
    shutdown: Shutdown,
}

impl AppState {
    pub fn new(counter: Arc<IdleCounter>, timeout_secs: u64, shutdown: Shutdown) -> Self {
        Self {
            counter,
            timeout_secs,
            shutdown,
        }
    }

    /// Seconds until the timeout, negative once idle time has passed it.
    fn time_left(&self) -> i64 {
        self.timeout_secs as i64 - self.counter.get() as i64
    }
}

#[derive(Debug, Serialize)]
struct TimeLeft {
    time_left: i64,
}

#[derive(Debug, Serialize)]
struct Status {
    status: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/autostop/time-left", get(time_left))
        .route("/autostop/keep-alive", post(keep_alive))
        .route("/autostop/stop-now", post(stop_now))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Wire up the counter, watchdog, and HTTP surface, then serve until interrupted.
pub async fn run(config: &AutostopConfig) -> Result<(), Box<dyn std::error::Error>> {
    let counter = Arc::new(IdleCounter::new());
    let shutdown = Shutdown::new(
        config.shutdown.clone(),
        Cleanup::from_config(&config.cleanup),
        Arc::new(ProcessExit),
    );
    let wd = Watchdog::new(Arc::clone(&counter), &config.watchdog);

    match QueuePoller::from_config(&config.work)? {
        Some(poller) => {
            tracing::info!(url = poller.url(), "autostop: watching host queue");
            watchdog::spawn(wd, Arc::new(poller), shutdown.clone());
        }
        None => {
            tracing::info!("autostop: no queue url configured, only keep-alive calls reset the timer");
            watchdog::spawn(wd, Arc::new(NoWork), shutdown.clone());
        }
    }

    let state = AppState::new(counter, config.watchdog.timeout_secs, shutdown);
    let app = router(state);

    let addr = format!("{}:{}", config.serve.bind, config.serve.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("autostop listening on {local_addr}");
    tracing::info!(
        "autostop: enabled with a timeout of {} second(s). Submit any work to reset the timer.",
        config.watchdog.timeout_secs
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(crate::signals::shutdown_signal())
        .await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn time_left(State(state): State<AppState>) -> Json<TimeLeft> {
    Json(TimeLeft {
        time_left: state.time_left(),
    })
}

async fn keep_alive(State(state): State<AppState>) -> Json<TimeLeft> {
    state.counter.reset();
    tracing::debug!("autostop: keep-alive received, timer reset");
    Json(TimeLeft {
        time_left: state.time_left(),
    })
}

/// Responds before the shutdown finishes; the response may or may not make it
/// out before the process exits.
async fn stop_now(State(state): State<AppState>) -> Json<Status> {
    tracing::info!("autostop: received a request to stop the server now");
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move { shutdown.stop().await });
    Json(Status { status: "ok" })
}
