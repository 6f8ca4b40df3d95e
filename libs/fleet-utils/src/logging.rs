//! Process-wide tracing setup, in the style of the teacher's
//! `libs/tracing-utils` + `libs/utils::logging`: one registry built once at
//! startup from `RUST_LOG`, human-readable in development, JSON in
//! production.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

/// Initializes the global `tracing` subscriber. Must be called exactly once,
/// as early as possible in `main`.
pub fn init(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Plain => {
            registry.with(fmt::layer().with_target(true)).init();
        }
        LogFormat::Json => {
            registry.with(fmt::layer().json().with_target(true)).init();
        }
    }
}
