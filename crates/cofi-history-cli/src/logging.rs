//! Process-wide `tracing` setup for the CLI.
//!
//! Logs go to stderr so stdout stays parseable JSON.

use std::sync::Once;

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive string.
pub const LOG_FILTER_ENV: &str = "COFI_HISTORY_LOG";

const DEFAULT_FILTER: &str = "cofi_history=info";

static INIT_ONCE: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT_ONCE.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);

        let result = match format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };

        if let Err(err) = result {
            eprintln!("cofi-history: logging not initialised: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging(LogFormat::Text);
        init_logging(LogFormat::Json);
        init_logging(LogFormat::Text);
    }
}
