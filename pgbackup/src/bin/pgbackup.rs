//! CLI entry point. Grounded on the teacher's `pageserver` binary: a
//! `clap`-derived command enum, `EngineConfig::load` before anything else
//! runs, and `backup_utils::logging::init` installed first so every
//! downstream error is captured.

use std::process::ExitCode;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use backup_utils::logging;
use pgbackup::catalog::{self, Catalog};
use pgbackup::config::EngineConfig;
use pgbackup::error::EngineError;
use pgbackup::model::{Backup, BackupMode};
use pgbackup::orchestrator::BackupSession;

#[derive(Parser)]
#[command(name = "pgbackup", about = "Physical, block-level, incremental PostgreSQL backup engine")]
struct Cli {
    #[arg(long, default_value = "pgbackup.toml")]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Take a backup of the configured instance's PGDATA.
    Backup {
        #[arg(long, value_enum)]
        mode: CliBackupMode,
        #[arg(long)]
        pgdata: Utf8PathBuf,
        #[arg(long)]
        stream: bool,
        #[arg(long)]
        conninfo: String,
    },
    /// List backups known to the catalog, newest first.
    Show,
    /// Print the resolved configuration and exit.
    ShowConfig,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliBackupMode {
    Full,
    Page,
    Ptrack,
    Delta,
}

impl From<CliBackupMode> for BackupMode {
    fn from(m: CliBackupMode) -> Self {
        match m {
            CliBackupMode::Full => BackupMode::Full,
            CliBackupMode::Page => BackupMode::Page,
            CliBackupMode::Ptrack => BackupMode::Ptrack,
            CliBackupMode::Delta => BackupMode::Delta,
        }
    }
}

fn main() -> ExitCode {
    // `anyhow::Context` carries the CLI-facing "what were we doing" message;
    // the library crate itself stays on typed `EngineError` throughout
    // (§7) and only gets wrapped at this outermost boundary.
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}

fn try_main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config))?;
    logging::init(config.log_format.into(), &config.log_level);

    match cli.command {
        Command::Backup { mode, pgdata, stream, conninfo } => {
            run_backup(&config, mode.into(), pgdata, stream, &conninfo).context("backup failed")?
        }
        Command::Show => run_show(&config).context("show failed")?,
        Command::ShowConfig => println!("{config:#?}"),
    }
    Ok(())
}

/// Oldest server version this engine's RPC set is known to work against.
const MIN_SERVER_VERSION: &str = "9.6";

fn run_backup(
    config: &EngineConfig,
    mode: BackupMode,
    pgdata: Utf8PathBuf,
    stream: bool,
    conninfo: &str,
) -> Result<(), EngineError> {
    let instance_root = catalog::instance_root(&config.catalog_root, &config.instance_name);
    let catalog = Catalog::load(&config.catalog_root, &config.instance_name)?;

    let parent: Option<Backup> = if mode.requires_parent() {
        catalog
            .latest_valid_backup()
            .map(|idx| catalog.backups[idx].clone())
    } else {
        None
    };
    if mode.requires_parent() && parent.is_none() {
        return Err(EngineError::Catalog(
            "no valid FULL backup to use as parent for an incremental backup".to_string(),
        ));
    }

    let pg_conn = postgres::Client::connect(conninfo, postgres::NoTls)
        .map_err(|e| EngineError::Protocol(e.to_string()))?;
    let mut client = pgbackup::dbclient::PostgresClient::new(pg_conn);

    let mut session = BackupSession::new(mode, instance_root, pgdata);
    session.backup.stream = stream;
    session.set_parent(parent);

    let outcome = drive_session(&mut session, &mut client, config);
    if outcome.is_err() {
        session.cleanup_on_abort();
    }
    outcome
}

fn drive_session(
    session: &mut BackupSession,
    client: &mut pgbackup::dbclient::PostgresClient,
    config: &EngineConfig,
) -> Result<(), EngineError> {
    let wal_dir = config.catalog_root.join("wal").join(&config.instance_name);

    session.connect(client, config, MIN_SERVER_VERSION)?;
    session.start_backup(client, config)?;
    session.list_files(config)?;
    session.build_page_map(client, &wal_dir)?;
    session.copy_files(config)?;
    session.stop_backup(client, config)?;
    session.finalize(config, &wal_dir)?;
    session.mark_ok()?;
    println!("{}", session.backup.id());
    Ok(())
}

fn run_show(config: &EngineConfig) -> Result<(), EngineError> {
    let catalog = Catalog::load(&config.catalog_root, &config.instance_name)?;
    for backup in &catalog.backups {
        println!(
            "{}\t{}\t{}\t{}",
            backup.id(),
            backup.backup_mode,
            backup.status,
            backup.start_lsn
        );
    }
    Ok(())
}
