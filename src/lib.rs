//! Lingogate: rate-limited translation gateway.
//! Main library: component wiring, background maintenance, HTTP server lifecycle.

pub mod config;
pub mod dispatcher;
pub mod metrics;
pub mod ratelimit;
pub mod server;
pub mod translate;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use ratelimit::RateLimiter;
use server::AppState;
use translate::remote::RemoteEngineFactory;

/// Process-level options that come from the command line rather than the environment.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
}

/// Install the global tracing subscriber. `RUST_LOG` overrides `default_directive`.
pub fn init_tracing(default_directive: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Periodically forget rate-limit buckets of clients that went quiet.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dropped = limiter.sweep_idle(Instant::now());
                    if dropped > 0 {
                        info!(dropped, remaining = limiter.tracked_clients(), "idle_clients_swept");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("sweeper exiting");
    })
}

/// Serve the router on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = server::router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}

/// Build every component from the environment and run until Ctrl-C.
pub async fn run(opts: ServeOptions) -> anyhow::Result<()> {
    init_tracing(&opts.log_level, opts.log_json);
    info!("lingogate starting");

    let config = Config::from_env();
    config.validate().context("invalid configuration")?;
    info!(
        default_pair = %format!("{}-{}", config.default_source_lang, config.default_target_lang),
        model_base_path = %config.model_base_path,
        cache_capacity = config.cache_capacity,
        max_text_length = config.max_text_length,
        serialize_engine_calls = config.serialize_engine_calls,
        "configuration loaded"
    );

    let factory = RemoteEngineFactory::new(
        &config.inference_url,
        &config.model_base_path,
        config.inference_token.clone(),
        config.build_timeout.max(config.invoke_timeout),
    )
    .context("failed to create inference client")?;
    let state = AppState::new(&config, Arc::new(factory))?;

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        Arc::clone(state.dispatcher.limiter()),
        config.sweep_interval,
        shutdown.clone(),
    );

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                ctrl_c.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });

    let addr = format!("{}:{}", opts.host, opts.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "lingogate listening");

    let dispatcher = Arc::clone(&state.dispatcher);
    serve(listener, state, shutdown.clone())
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = sweeper.await;
    dispatcher.cache().clear();
    info!("lingogate stopped");
    Ok(())
}
