//! The `EngineError` taxonomy of §7: one variant family per error kind.
//! Severity (WARNING/ERROR/FATAL/INFO) is a property of the call site —
//! logged via `tracing::{warn,error}` — not re-encoded in the type.

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config: {0}")]
    Config(String),

    #[error("catalog: {0}")]
    Catalog(String),

    #[error("io on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("page error: {0}")]
    Page(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("wal wait: {0}")]
    WalWait(#[from] crate::wal_waiter::WalWaitError),

    #[error("interrupted")]
    Interrupt,
}

impl EngineError {
    pub fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<remote_io::RemoteIoError> for EngineError {
    fn from(e: remote_io::RemoteIoError) -> Self {
        EngineError::Io {
            path: Utf8PathBuf::new(),
            source: match e {
                remote_io::RemoteIoError::Io(io) => io,
                other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
