// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Process-wide `tracing` setup

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Guards subscriber installation
static LOGGING_INITIALIZED: Once = Once::new();

/// Output format, chosen by `RUST_LOG_FORMAT`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable, the default
    Full,
    /// One line per event, fewer fields
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl LogFormat {
    /// Parse a `RUST_LOG_FORMAT` value. Anything unrecognized is [`LogFormat::Full`].
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("json") => LogFormat::Json,
            Some("compact") => LogFormat::Compact,
            _ => LogFormat::Full,
        }
    }
}

/// Install a subscriber filtered by `RUST_LOG`
///
/// Safe to call from every test and binary; only the first call has an effect, and a subscriber
/// installed by someone else is left alone.
pub fn setup_logging() {
    LOGGING_INITIALIZED.call_once(|| {
        let format = LogFormat::parse(std::env::var("RUST_LOG_FORMAT").ok().as_deref());
        let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
        let _ = match format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Compact => builder.compact().try_init(),
            LogFormat::Full => builder.try_init(),
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_are_case_insensitive() {
        assert_eq!(LogFormat::parse(Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("compact")), LogFormat::Compact);
        assert_eq!(LogFormat::parse(Some("pretty")), LogFormat::Full);
        assert_eq!(LogFormat::parse(None), LogFormat::Full);
    }
}
