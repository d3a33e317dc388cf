//! Scheduler (C8): one worker per site, run in parallel, joined at the end.

use crate::config::Config;
use crate::ftp::ListingClient;
use crate::persistence::PersistencePort;
use crate::reconciler::Reconciler;
use crate::types::{Site, TimePoint};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Runs a full backup generation across every site known to `persistence`.
/// Each site's worker is spawned on the blocking pool (its pipeline is a
/// sequential chain of blocking FTP and database calls) and errors are
/// logged, not propagated — one site's failure never cancels the others.
pub async fn run_backup(
    persistence: Arc<dyn PersistencePort>,
    backup_root: impl AsRef<Path>,
    config: &Config,
    generation: TimePoint,
) -> Result<(), crate::error::BackupError> {
    let sites = persistence.load_sites().await?;
    let backup_root = backup_root.as_ref().to_path_buf();
    let (host, port) = config.ftp_host_port()?;
    let timeout_secs = config.ftp.timeout;

    let mut handles = Vec::with_capacity(sites.len());
    for site in sites {
        let persistence = persistence.clone();
        let backup_root = backup_root.clone();
        let host = host.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            run_site(&persistence, &backup_root, &host, port, timeout_secs, &site, generation)
        }));
    }

    let results = futures::future::join_all(handles).await;
    for result in results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "site worker failed"),
            Err(e) => error!(error = %e, "site worker panicked"),
        }
    }
    Ok(())
}

fn run_site(
    persistence: &Arc<dyn PersistencePort>,
    backup_root: &Path,
    host: &str,
    port: u16,
    timeout_secs: u64,
    site: &Site,
    generation: TimePoint,
) -> Result<(), crate::error::BackupError> {
    info!(site_id = site.id, "connecting to ftp server");
    let mut client = ListingClient::connect(host, port, &site.login, &site.password, timeout_secs)?;
    let reconciler = Reconciler::new(persistence.as_ref(), backup_root);
    reconciler.run(&mut client, site, generation)
}
