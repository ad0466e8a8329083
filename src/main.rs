//! Application entry point for the `pinlink-backend` service.
//!
//! This binary orchestrates the full startup sequence for the device session
//! API, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Selecting the repository backend (in-memory, or PostgreSQL with schema
//!   creation)
//! - Wiring the external service clients, audio pipeline and assistant engine
//! - Mounting all API routes via the `routes` gateway
//! - Binding the Axum HTTP server and serving requests
//!
//! # Environment Variables
//! See [`config::load_from_env`] for the full list. Logging is controlled by
//! `AXUM_LOG_LEVEL` (default: `debug`), `AXUM_SPAN_EVENTS` and `FORCE_COLOR`.
use std::{env, io::IsTerminal, net::SocketAddr, sync::Arc};

use axum::{extract::DefaultBodyLimit, Router};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::{anyhow, Context as _, Result};

mod audio;
mod config;
mod context;
mod engine;
mod error;
mod framing;
mod location;
mod media;
mod models;
mod repository;
mod routes;
mod schema;
mod services;
mod session;
mod sync;

#[cfg(test)]
mod testing;

pub use config::Config;

use config::DbBackend;
use repository::Repositories;

// ---

/// Largest request body accepted; image plus audio.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Buffered sync events per subscriber before the slowest one lags.
const SYNC_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let repos = connect_repositories(&cfg).await?;
    for device_id in &cfg.seed_devices {
        repos
            .documents
            .register_device(device_id)
            .await
            .with_context(|| format!("Failed to register seed device '{device_id}'"))?;
        tracing::info!("Registered device {}", device_id);
    }

    tokio::fs::create_dir_all(&cfg.media_dir)
        .await
        .with_context(|| format!("Failed to create media directory '{}'", cfg.media_dir))?;

    let services = services::Services::from_config(&cfg);
    let sync = Arc::new(sync::BroadcastSync::new(SYNC_CAPACITY));

    let contexts = context::ContextManager::new(
        repos.clone(),
        Arc::new(media::FsMediaStore::new(&cfg.media_dir)),
        services.clone(),
        sync.clone(),
        cfg.low_battery_threshold,
    );
    let engine = engine::Engine::new(services.clone(), repos, sync.clone(), cfg.completion_max_calls);
    let pipeline = session::SessionPipeline::new(
        contexts,
        engine,
        audio::AudioPipeline::new(&cfg.ffmpeg_path),
        services,
        sync,
        cfg.speech_floor_db,
    );

    // Build app from routes gateway
    let state = routes::AppState::new(Arc::new(pipeline));
    let app: Router = routes::router(state).layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Open the configured repository backend.
async fn connect_repositories(cfg: &Config) -> Result<Repositories> {
    // ---
    match cfg.db_backend {
        DbBackend::Memory => {
            tracing::warn!("Using the in-memory repository; state is lost on restart");
            Ok(Repositories::in_memory())
        }
        DbBackend::Postgres => {
            let db_url = cfg
                .db_url
                .as_deref()
                .ok_or_else(|| anyhow!("DATABASE_URL must be set for the postgres backend"))?;
            tracing::info!("Attempting to connect to database");

            let pool = PgPoolOptions::new()
                .max_connections(cfg.db_pool_max)
                .connect(db_url)
                .await
                .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

            tracing::info!("Successfully connected to database");
            schema::create_schema(&pool).await?;
            Ok(Repositories::postgres(pool))
        }
    }
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off  
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `AXUM_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
