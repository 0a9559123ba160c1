use std::env;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_FORMAT_ENV: &str = "FAKTORY_LOG_FORMAT";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Output format from `FAKTORY_LOG_FORMAT`, defaulting to JSON in
/// production and human-readable lines elsewhere.
pub fn log_format(production: bool) -> LogFormat {
    match env::var(LOG_FORMAT_ENV) {
        Ok(value) => parse_log_format(&value, production),
        Err(_) if production => LogFormat::Json,
        Err(_) => LogFormat::Pretty,
    }
}

fn parse_log_format(value: &str, production: bool) -> LogFormat {
    match value.trim().to_lowercase().as_str() {
        "pretty" | "text" | "human" => LogFormat::Pretty,
        "json" => LogFormat::Json,
        _ if production => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str, production: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = match log_format(production) {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_current_span(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().with_filter(filter).boxed(),
    };
    if tracing_subscriber::registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
