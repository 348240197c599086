use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod attachments;
mod cli;
mod config;
mod error;
mod gate;
mod handlers;
mod history;
mod metrics;
mod phase;
mod producer;
mod relay;
#[cfg(test)]
mod test_helpers;
mod turn;
mod variant;

use crate::config::{AttachmentLimits, FileConfig, HistoryConfig, ProviderKind, RelayConfig};
use crate::history::{HistoryStore, InMemoryHistory};
use crate::metrics::RelayMetrics;
use crate::producer::StreamProducer;
use crate::variant::VariantRegistry;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Streams chat completions from a hosted model to the browser")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground
    Serve(ServeArgs),

    /// Send one message to a running relay and print the answer
    Ask(AskArgs),

    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Port for the web server (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides server.host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Upstream producer (overrides provider.kind)
    #[arg(long, value_enum)]
    provider: Option<ProviderKind>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct AskArgs {
    /// Message to send
    message: String,

    /// Base URL of the relay server
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    url: String,

    /// Variant to talk to (default variant if omitted)
    #[arg(short, long)]
    variant: Option<String>,

    /// Session id for conversation history
    #[arg(short, long)]
    session: Option<String>,

    /// Attach a file (repeatable)
    #[arg(short, long = "file")]
    files: Vec<PathBuf>,
}

#[derive(Parser)]
struct ConfigArgs {
    /// Configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub variants: Arc<VariantRegistry>,
    pub producer: Arc<dyn StreamProducer>,
    /// None when session history is disabled
    pub history: Option<Arc<dyn HistoryStore>>,
    pub relay: Arc<RelayConfig>,
    /// Relay metrics for observability
    pub metrics: Arc<RelayMetrics>,
    /// Cancelled on shutdown; in-flight relays abort
    pub shutdown: CancellationToken,
}

impl FromRef<AppState> for AttachmentLimits {
    fn from_ref(state: &AppState) -> Self {
        state.relay.limits
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_server(args).await,
        Commands::Ask(args) => {
            cli::ask(
                &args.message,
                cli::ask::AskOptions {
                    url: args.url,
                    variant: args.variant,
                    session: args.session,
                    files: args.files,
                },
            )
            .await
        }
        Commands::Config(args) => cli::print_config(&args.config),
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    let body_limit = state.relay.limits.max_request_bytes();

    Router::new()
        .route("/api/chat", post(handlers::chat_handler))
        .route("/api/variants", get(handlers::list_variants))
        .route(
            "/api/variants/{name}/chat",
            post(handlers::variant_chat_handler),
        )
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state)
}

async fn run_server(args: ServeArgs) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "chat_relay=debug,relay_wire=debug,tower_http=debug,info"
    } else {
        "chat_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut config = FileConfig::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(kind) = args.provider {
        config.provider.kind = kind;
    }

    info!("Starting chat relay");

    let producer = producer::build_producer(&config.provider)?;
    let variants = Arc::new(VariantRegistry::from_config(&config)?);
    let relay = Arc::new(RelayConfig::from_file(&config.relay));
    let metrics = Arc::new(RelayMetrics::new());
    let shutdown = CancellationToken::new();

    info!(
        "Producer: {} (model {}), variants: {}, default: {}",
        producer.name(),
        config.provider.model,
        config
            .variants
            .iter()
            .map(|v| v.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        config.default_variant
    );
    match relay.request_timeout {
        Some(timeout) => info!("Request timeout: {}s", timeout.as_secs()),
        None => info!("Request timeout disabled"),
    }

    // Session history with periodic idle-session sweep
    let history_config = HistoryConfig::from_file(&config.history);
    let history: Option<Arc<dyn HistoryStore>> = if history_config.enabled {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistory::from_config(&history_config));
        history::spawn_sweeper(
            store.clone(),
            history_config.sweep_interval,
            shutdown.clone(),
        );
        info!(
            "Session history enabled (max turns: {}, ttl: {})",
            history_config
                .max_turns
                .map_or("unbounded".to_string(), |n| n.to_string()),
            history_config
                .ttl
                .map_or("none".to_string(), |ttl| format!("{}s", ttl.as_secs()))
        );
        Some(store)
    } else {
        info!("Session history disabled");
        None
    };

    let state = AppState {
        variants,
        producer,
        history,
        relay,
        metrics,
        shutdown: shutdown.clone(),
    };

    let mut app = build_router(state);
    if config.server.cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port)
        .parse::<SocketAddr>()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Chat relay listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /api/chat                  - Chat with the default variant");
    info!("  POST   /api/variants/:name/chat   - Chat with a named variant");
    info!("  GET    /api/variants              - List variants");
    info!("  GET    /health, /metrics          - Status and counters");

    // Create shutdown signal handler
    let signal_token = shutdown.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, aborting in-flight relays...");
        signal_token.cancel();
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    shutdown.cancel();
    info!("Shutdown complete");
    server_result
}
