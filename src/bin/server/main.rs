mod rpc;

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use clap::Parser;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use web_runner::driver::chrome::ChromeLauncher;
use web_runner::logging::{SERVER_LOG_FILE, init_logging};
use web_runner::pdf::HttpFetcher;
use web_runner::{RunEvent, RunOptions, Runner, RunnerConfig};

/// Adapter defaults for tool calls that leave these unset.
const DEFAULT_HEADLESS: bool = true;
const DEFAULT_SLOW_MO_MS: u64 = 0;
const PORT_ATTEMPTS: u16 = 10;

#[derive(Parser)]
#[command(name = "web-runner-server", about = "JSON-RPC front end for the web runner")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// First port to try; the next few are tried if it is taken
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

struct AppState {
    runner: Runner,
    events: broadcast::Sender<RunEvent>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(SERVER_LOG_FILE)?;

    let config = RunnerConfig::from_env();
    let fetcher = HttpFetcher::new(&config.user_agent, &config.accept_language)
        .context("failed to build HTTP client")?;
    let (events, _) = broadcast::channel::<RunEvent>(256);
    let runner = Runner::new(Arc::new(ChromeLauncher), Arc::new(fetcher), config)
        .with_events(events.clone());

    let state = Arc::new(AppState { runner, events });
    let app = Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/events", get(sse_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    let (listener, port) = bind(&cli.host, cli.port).await?;
    info!(host = %cli.host, port, "web runner server listening");
    axum::serve(listener, app).await.context("server terminated")?;
    Ok(())
}

async fn bind(host: &str, first: u16) -> Result<(tokio::net::TcpListener, u16)> {
    let last = first.saturating_add(PORT_ATTEMPTS - 1);
    for port in first..=last {
        match tokio::net::TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) => warn!(port, error = %err, "port unavailable, trying next"),
        }
    }
    anyhow::bail!("could not bind {host} on any port {first}-{last}")
}

async fn rpc_handler(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let request = match rpc::parse_request(&body) {
        Ok(request) => request,
        Err(response) => return Json(response),
    };
    info!(method = %request.method, "rpc request");

    let runner = &state.runner;
    let response = rpc::dispatch(request, |input| async move {
        let options = RunOptions::resolve(&input, DEFAULT_HEADLESS, DEFAULT_SLOW_MO_MS, runner.config());
        runner.run(&input, &options).await
    })
    .await;
    Json(response)
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => to_sse_event(&event).map(Ok),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &RunEvent) -> Option<Event> {
    let data = serde_json::to_string(event).ok()?;
    Some(Event::default().event(event.name()).data(data))
}
