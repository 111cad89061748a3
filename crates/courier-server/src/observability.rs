//! Tracing setup for the server binary.
//!
//! The subscriber starts at `info` so config loading is visible, then
//! [`apply_logging_config`] swaps in the level from [`LoggingConfig`]
//! through a reload handle. `RUST_LOG` always wins over the file.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    let directive = effective_filter(std::env::var("RUST_LOG").ok().as_deref(), level);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(level));

    let (reload_layer, handle) = reload::Layer::new(filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer())
        .try_init();
}

/// Filter directive in force for a configured `level`: a non-empty
/// `RUST_LOG` takes it over verbatim.
pub fn effective_filter(rust_log: Option<&str>, level: &str) -> String {
    match rust_log.map(str::trim) {
        Some(env) if !env.is_empty() => env.to_string(),
        _ => level.to_ascii_lowercase(),
    }
}

/// Apply the loaded logging section. Returns the directive now in force,
/// or `None` when tracing was never initialised.
pub fn apply_logging_config(cfg: &LoggingConfig) -> Option<String> {
    let handle = LOG_RELOAD_HANDLE.get()?;
    let directive = effective_filter(std::env::var("RUST_LOG").ok().as_deref(), &cfg.level);
    let filter = EnvFilter::try_new(&directive).ok()?;
    handle.modify(|f| *f = filter).ok()?;
    Some(directive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_is_normalised() {
        assert_eq!(effective_filter(None, "DEBUG"), "debug");
    }

    #[test]
    fn test_rust_log_wins_when_set() {
        assert_eq!(
            effective_filter(Some("courier_realtime=trace"), "warn"),
            "courier_realtime=trace"
        );
        assert_eq!(effective_filter(Some("  "), "warn"), "warn");
    }

    #[test]
    fn test_apply_follows_the_logging_section() {
        init_tracing();
        let cfg = LoggingConfig {
            level: "Warn".into(),
        };
        let expected = effective_filter(std::env::var("RUST_LOG").ok().as_deref(), "warn");
        assert_eq!(apply_logging_config(&cfg), Some(expected));
    }
}
