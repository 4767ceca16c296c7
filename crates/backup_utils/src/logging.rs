//! Process-wide `tracing` setup, installed once. Grounded on the teacher's
//! `utils::logging` module: a `LogFormat` selectable from config, backed by
//! `tracing-subscriber`'s `fmt` layer and an `EnvFilter` built from the
//! configured level.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unrecognized log format {other:?}, expected plain|json")),
        }
    }
}

static INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber. Safe to call more than once; only the
/// first call takes effect, matching the teacher's init-once pattern for a
/// long-running daemon that may re-enter setup during tests.
pub fn init(format: LogFormat, level: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        match format {
            LogFormat::Plain => builder.compact().init(),
            LogFormat::Json => builder.json().init(),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_known_formats() {
        assert_eq!(LogFormat::from_str("plain").unwrap(), LogFormat::Plain);
        assert_eq!(LogFormat::from_str("json").unwrap(), LogFormat::Json);
        assert!(LogFormat::from_str("xml").is_err());
    }
}
