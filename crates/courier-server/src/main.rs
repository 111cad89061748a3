use std::{env, sync::Arc};

use courier_server::config::loader::{DEFAULT_CONFIG_FILE, load_config};
use courier_server::{LoggingHandler, build_service};

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From COURIER_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (courier.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (COURIER_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    courier_server::observability::init_tracing();

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    if env::args().any(|a| a == "--print-config") {
        match cfg.to_toml() {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(2);
            }
        }
        return;
    }

    tracing::info!(
        path = %config_path,
        source = %source,
        "Configuration loaded"
    );
    if let Some(filter) = courier_server::observability::apply_logging_config(&cfg.logging) {
        tracing::debug!(filter = %filter, "Log filter applied");
    }

    if let Err(err) = run(cfg).await {
        eprintln!("Server error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: courier_server::AppConfig) -> anyhow::Result<()> {
    let service = build_service(&cfg).await?;
    service.set_callbacks(Arc::new(LoggingHandler)).await;
    service.start().await?;

    tracing::info!(
        presence_room = %cfg.realtime.presence_room,
        redis = cfg.redis.enabled,
        "Courier realtime service running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    service.destroy().await;
    if let Some(cache) = service.cache() {
        let stats = cache.stats();
        tracing::info!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = stats.hit_rate(),
            "Final cache stats"
        );
    }
    Ok(())
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: COURIER_CONFIG
/// 3. Default: courier.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return (path, ConfigSource::CliArgument);
            }
        }
    }

    if let Ok(path) = env::var("COURIER_CONFIG") {
        if !path.is_empty() {
            return (path, ConfigSource::EnvironmentVariable);
        }
    }

    (DEFAULT_CONFIG_FILE.to_string(), ConfigSource::Default)
}
