pub mod config;
pub mod observability;
pub mod wiring;

pub use config::AppConfig;
pub use observability::{apply_logging_config, effective_filter, init_tracing, init_tracing_with_level};
pub use wiring::{LoggingHandler, build_service};
