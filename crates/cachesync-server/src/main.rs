use std::env;

use anyhow::Context;
use cachesync_core::{BrokerError, EventListener, MemoryBus};
use cachesync_server::config::loader::load_config;
use cachesync_server::server::shutdown_signal;
use cachesync_server::{AppState, BootstrapError, ServerBuilder, build_components, shutdown_tracing};
use tokio_util::sync::CancellationToken;

/// Listener gave up after repeated read failures.
const EXIT_CONSUMER_EXHAUSTED: i32 = 1;
/// Configuration or startup dependency failure.
const EXIT_STARTUP: i32 = 2;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From CACHESYNC_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (cachesync.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (CACHESYNC_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(
            e,
            dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound
        ) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    cachesync_server::observability::init_tracing();

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(EXIT_STARTUP);
        }
    };

    tracing::info!(
        path = config_path.as_deref().unwrap_or("cachesync.toml"),
        source = %source,
        "Configuration loaded"
    );
    cachesync_server::observability::apply_logging_level(&cfg.logging.level);

    let code = match run(cfg).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            eprintln!("Startup error: {e:#}");
            EXIT_STARTUP
        }
    };

    shutdown_tracing();
    if code != 0 {
        std::process::exit(code);
    }
}

/// Run until Ctrl+C or until the listener gives up. Returns the exit code.
async fn run(cfg: cachesync_server::AppConfig) -> anyhow::Result<i32> {
    let components = match build_components(&cfg, &MemoryBus::new()).await {
        Ok(c) => c,
        Err(BootstrapError::Cache(e)) => {
            return Err(e).context("cache backend unavailable");
        }
        Err(e) => return Err(e.into()),
    };

    let subscription = EventListener::new(components.broker.clone(), components.cache.clone())
        .start()
        .await
        .context("event listener failed to start")?;

    let state = AppState {
        cache: components.cache.clone(),
        broker: components.broker.clone(),
        consumer: subscription.state(),
        default_ttl_seconds: cfg.cache.default_ttl_seconds,
    };
    let shutdown = CancellationToken::new();
    let server = ServerBuilder::from_config(&cfg).build(state);
    let mut server_task = tokio::spawn(server.run(shutdown.clone()));
    let mut consumer_task = tokio::spawn(subscription.wait());

    let code = tokio::select! {
        joined = &mut consumer_task => match joined {
            Ok(Err(e @ BrokerError::ConsumerExhausted { .. })) => {
                tracing::error!(error = %e, "event listener exhausted its retries, exiting");
                EXIT_CONSUMER_EXHAUSTED
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "event listener stopped");
                EXIT_CONSUMER_EXHAUSTED
            }
            Ok(Ok(())) => 0,
            Err(e) => {
                tracing::error!(error = %e, "event listener task failed");
                EXIT_CONSUMER_EXHAUSTED
            }
        },
        served = &mut server_task => {
            match served {
                Ok(Ok(())) => tracing::info!("server stopped"),
                Ok(Err(e)) => tracing::error!(error = %e, "server error"),
                Err(e) => tracing::error!(error = %e, "server task failed"),
            }
            EXIT_STARTUP
        }
        _ = shutdown_signal() => 0,
    };

    shutdown.cancel();
    if let Err(e) = components.broker.close().await {
        tracing::warn!(error = %e, "broker close reported errors");
    }
    if !server_task.is_finished() {
        let _ = server_task.await;
    }
    Ok(code)
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: CACHESYNC_CONFIG
/// 3. Default: cachesync.toml (optional)
fn resolve_config_path() -> (Option<String>, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return (Some(path), ConfigSource::CliArgument);
            }
        }
    }

    if let Ok(path) = env::var("CACHESYNC_CONFIG") {
        if !path.is_empty() {
            return (Some(path), ConfigSource::EnvironmentVariable);
        }
    }

    (None, ConfigSource::Default)
}
