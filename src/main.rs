//! CLI (C10) and process entry point. Flag presence selects one of four
//! run modes: help/version, restore, batch, or a full scheduled backup.

mod archiver;
mod config;
mod error;
mod ftp;
mod ignore;
mod persistence;
mod reconciler;
mod restore;
mod scheduler;
mod types;
mod walker;

use anyhow::Context;
use chrono::{Local, NaiveDateTime, TimeZone};
use clap::Parser;
use config::Config;
use error::BackupError;
use ftp::{ListingClient, ListingSession};
use persistence::{PersistencePort, SqlPersistence};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ftpbackup",
    version = "1.0.2",
    about = "Backup and restore ftp files.",
    disable_version_flag = true
)]
struct Cli {
    /// Display version information.
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Load configuration data from a file.
    #[arg(short, long, value_name = "file", default_value = "ftpbackup.toml")]
    config: PathBuf,

    /// Restore archive on site up to the date: `id_site:datetime`.
    #[arg(short, long, value_name = "id_site:datetime")]
    restore: Option<String>,

    /// Execute serial commands on every site's ftp server in lieu of a backup.
    #[arg(short, long, value_name = "cmd1[:arg][,cmd2[:arg]]")]
    batch: Option<String>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// The current process's generation timestamp: microseconds since epoch,
/// assigned once and reused for every mutation this run makes (§3).
fn current_time_point() -> types::TimePoint {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros() as u64
}

fn parse_restore_arg(value: &str) -> anyhow::Result<(u32, types::TimePoint)> {
    let (site_id, datetime) = value
        .split_once(':')
        .context("restore argument must be id_site:datetime")?;
    let site_id: u32 = site_id.parse().context("invalid site id")?;
    let naive = NaiveDateTime::parse_from_str(datetime, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(datetime, "%Y-%m-%dT%H:%M:%S"))
        .context("invalid datetime, expected YYYY-MM-DD HH:MM:SS")?;
    let local = Local
        .from_local_datetime(&naive)
        .single()
        .context("ambiguous or invalid local datetime")?;
    let utc_micros = local.naive_utc().and_utc().timestamp_micros();
    Ok((site_id, utc_micros as u64))
}

fn run_batch(commands: &str, sites: &[types::Site], host: &str, port: u16, timeout_secs: u64) {
    let jobs: Vec<(&str, Option<&str>)> = commands
        .split(',')
        .filter(|c| !c.trim().is_empty())
        .map(|c| match c.split_once(':') {
            Some((verb, arg)) => (verb.trim(), Some(arg.trim())),
            None => (c.trim(), None),
        })
        .collect();

    for site in sites {
        info!(site_id = site.id, "processing batch commands");
        let mut client = match ListingClient::connect(host, port, &site.login, &site.password, timeout_secs) {
            Ok(c) => c,
            Err(e) => {
                error!(site_id = site.id, error = %e, "could not connect for batch mode");
                continue;
            }
        };
        for (verb, arg) in &jobs {
            match client.send_command(verb, *arg) {
                Ok(response) => info!(site_id = site.id, verb, "response: {response}"),
                Err(e) => error!(site_id = site.id, verb, error = %e, "batch command failed"),
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    if cli.version {
        println!("Ftp Backup (version 1.0.2)");
        return Ok(());
    }

    let config = Config::load(&cli.config)?;
    let (host, port) = config.ftp_host_port()?;
    let persistence: Arc<dyn PersistencePort> =
        Arc::new(SqlPersistence::connect(&config.mysql.connection).await?);

    if let Some(restore_arg) = &cli.restore {
        let (site_id, time_point) = parse_restore_arg(restore_arg)?;
        let sites = persistence.load_sites().await?;
        let site = match sites.into_iter().find(|s| s.id == site_id) {
            Some(site) => site,
            None => {
                info!("unable to find site with id {site_id}");
                return Ok(());
            }
        };

        info!(site_id, time_point, "start restoring site");
        let mut client = ListingClient::connect(&host, port, &site.login, &site.password, config.ftp.timeout)?;
        let backup_root = PathBuf::from(&config.backup.path);
        let planner = restore::RestorePlanner::new(persistence.as_ref(), &backup_root);
        match planner.restore(&mut client, site_id, time_point, config.restore_path()?).await {
            Ok(()) => {}
            Err(BackupError::NotFound(msg)) => {
                info!("{msg}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }

    if let Some(batch) = &cli.batch {
        let sites = persistence.load_sites().await?;
        run_batch(batch, &sites, &host, port, config.ftp.timeout);
        return Ok(());
    }

    let generation = current_time_point();
    scheduler::run_backup(persistence, &config.backup.path, &config, generation).await?;
    Ok(())
}
