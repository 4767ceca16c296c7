//! Engine configuration (§4.8): a TOML settings file distinct from the
//! per-backup `backup.control` format. Grounded on the teacher's
//! `pageserver::config` module (a `defaults` sub-module plus a
//! `toml_edit`-backed loader).

use std::num::NonZeroUsize;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::CompressAlg;
use backup_utils::logging::LogFormat;

pub mod defaults {
    pub const DEFAULT_NUM_WORKERS: usize = 1;
    pub const DEFAULT_ARCHIVE_TIMEOUT: &str = "5 min";
    pub const DEFAULT_REPLICA_TIMEOUT: &str = "5 min";
    pub const DEFAULT_STREAM_STOP_TIMEOUT_FACTOR: f64 = 1.1;
    pub const DEFAULT_COMPRESS_LEVEL: i32 = 1;
    pub const DEFAULT_LOG_LEVEL: &str = "info";

    /// Torn-page retry ceiling (§4.3, §5). Named so it is never
    /// re-introduced as a bare literal at a call site.
    pub const MAX_PAGE_READ_RETRIES: u32 = 100;
    /// Lockfile acquisition retry ceiling (§4.1, §5).
    pub const MAX_LOCKFILE_RETRIES: u32 = 100;
    /// Fraction of `replica_timeout` after which a replica WAL wait may
    /// fall back to "last valid LSN before target" (§4.5).
    pub const REPLICA_FALLBACK_FRACTION: f64 = 0.25;
    /// Minimum number of PGDATA entries for a plausible data directory
    /// (§4.4).
    pub const MIN_PLAUSIBLE_PGDATA_ENTRIES: usize = 100;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub catalog_root: Utf8PathBuf,
    pub instance_name: String,
    pub num_workers: usize,
    /// User-listed directories backed up alongside PGDATA (tablespace-like
    /// content living outside it, e.g. `archive_command` staging areas);
    /// each lands under `external_directories/externaldir<N>/` in the
    /// backup, 1-indexed in listing order (§4.4, spec layout "database/").
    pub external_dirs: Vec<Utf8PathBuf>,
    #[serde(with = "humantime_serde")]
    pub archive_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub replica_timeout: Duration,
    pub stream_stop_timeout_factor: f64,
    pub compress_alg: CompressAlg,
    pub compress_level: i32,
    pub log_format: RawLogFormat,
    pub log_level: String,
}

/// `LogFormat` does not implement `Serialize`/`Deserialize` itself (it
/// lives in `backup_utils` alongside the subscriber, not the config
/// schema); this thin mirror carries the on-disk string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawLogFormat {
    Plain,
    Json,
}

impl From<RawLogFormat> for LogFormat {
    fn from(v: RawLogFormat) -> Self {
        match v {
            RawLogFormat::Plain => LogFormat::Plain,
            RawLogFormat::Json => LogFormat::Json,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            catalog_root: Utf8PathBuf::from("."),
            instance_name: "main".to_string(),
            num_workers: defaults::DEFAULT_NUM_WORKERS,
            external_dirs: Vec::new(),
            archive_timeout: humantime::parse_duration(defaults::DEFAULT_ARCHIVE_TIMEOUT)
                .expect("valid literal"),
            replica_timeout: humantime::parse_duration(defaults::DEFAULT_REPLICA_TIMEOUT)
                .expect("valid literal"),
            stream_stop_timeout_factor: defaults::DEFAULT_STREAM_STOP_TIMEOUT_FACTOR,
            compress_alg: CompressAlg::None,
            compress_level: defaults::DEFAULT_COMPRESS_LEVEL,
            log_format: RawLogFormat::Plain,
            log_level: defaults::DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, or return the defaults if the file doesn't exist
    /// yet (mirroring the "init creates the file later" flow).
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(EngineConfig::default())
            }
            Err(e) => return Err(EngineError::io(path, e)),
        };
        let config: EngineConfig = toml_edit::de::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(EngineError::Config(
                "num_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn num_workers(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.num_workers).expect("validated at load time")
    }

    pub fn stream_stop_timeout(&self, checkpoint_timeout: Duration) -> Duration {
        checkpoint_timeout.mul_f64(self.stream_stop_timeout_factor)
    }
}
