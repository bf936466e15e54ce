//! Tracing/logging initialization.
//!
//! Output is filtered through `RUST_LOG` (default `info`). Ledger operations
//! log one line per committed mutation, so `RUST_LOG=stakeledger_staking=info`
//! is enough to follow the ledger.
//!
//! `STAKELEDGER_LOG_FORMAT` picks the encoding: `json` (default) for
//! machine-read audit trails, `compact` for a terminal.

use tracing_subscriber::EnvFilter;

const FORMAT_VAR: &str = "STAKELEDGER_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl LogFormat {
    /// Parse a format name; unknown names yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "compact" | "text" => Some(Self::Compact),
            _ => None,
        }
    }

    fn from_env() -> Self {
        std::env::var(FORMAT_VAR)
            .ok()
            .and_then(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(LogFormat::from_env());
}

pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_current_span(true).with_target(false).try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_parse() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" compact "), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("text"), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn init_is_idempotent() {
        init_with(LogFormat::Compact);
        init_with(LogFormat::Json);
        ::tracing::info!("observability initialised twice without panicking");
    }
}
