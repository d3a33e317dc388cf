//! Restore Planner (C7): reconstructs a site's tree at a target timestamp
//! from its archives and pushes it back to the FTP origin.

use crate::archiver;
use crate::error::BackupError;
use crate::ftp::ListingSession;
use crate::persistence::PersistencePort;
use crate::types::{Status, TimePoint};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

pub struct RestorePlanner<'a> {
    persistence: &'a dyn PersistencePort,
    backup_root: &'a Path,
}

impl<'a> RestorePlanner<'a> {
    pub fn new(persistence: &'a dyn PersistencePort, backup_root: &'a Path) -> Self {
        Self {
            persistence,
            backup_root,
        }
    }

    /// Restores `site_id` as of `time_point`, pushing the reconstructed
    /// tree to `remote_path` via `session`. Returns `Ok(())` whether or not
    /// anything was found — callers check `BackupError::NotFound` to tell
    /// "nothing to restore" from a real failure (§7).
    pub async fn restore(
        &self,
        session: &mut dyn ListingSession,
        site_id: u32,
        time_point: TimePoint,
        remote_path: &str,
    ) -> Result<(), BackupError> {
        let revisions = self.persistence.load_tree_at(site_id, time_point).await?;
        if revisions.is_empty() {
            return Err(BackupError::NotFound(format!(
                "no archives found for site {site_id} at or before time point {time_point}"
            )));
        }

        // Collapse to the latest revision per path.
        let mut latest: HashMap<String, (crate::types::File, Status)> = HashMap::new();
        for (file, status) in revisions {
            match latest.get(&file.full_name) {
                Some((existing, _)) if existing.time_point >= file.time_point => {}
                _ => {
                    latest.insert(file.full_name.clone(), (file, status));
                }
            }
        }

        // Drop deleted paths, group survivors by their archive (generation time point).
        let mut archives: HashMap<TimePoint, (Vec<String>, Vec<String>)> = HashMap::new();
        let mut total = 0usize;
        for (file, status) in latest.into_values() {
            if status == Status::Deleted {
                continue;
            }
            let (files, dirs) = archives.entry(file.time_point).or_default();
            if file.is_directory {
                dirs.push(file.full_name);
            } else {
                files.push(file.full_name);
            }
            total += 1;
        }

        let staging = self.backup_root.join(format!("{site_id}-{time_point}"));
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(|e| BackupError::Archiver(e.into()))?;
        }
        std::fs::create_dir_all(&staging).map_err(|e| BackupError::Archiver(e.into()))?;

        info!(
            site_id,
            total,
            archives = archives.len(),
            "extracting files from archives"
        );
        for (archive_time_point, (files, dirs)) in &archives {
            let archive_path = self
                .backup_root
                .join(site_id.to_string())
                .join(format!("{archive_time_point}.tar.gz"));
            archiver::extract_subset(&archive_path, &staging, files, dirs)?;
        }

        info!(site_id, remote_path, "uploading restored tree to ftp");
        for component in remote_path.split('/').filter(|c| !c.is_empty()) {
            let _ = session.mkdir(component);
            session.cwd(component)?;
        }
        if let Some(leaf) = staging.file_name().and_then(|n| n.to_str()) {
            let _ = session.recursive_remove(leaf);
        }
        session.upload(&staging)?;

        std::fs::remove_dir_all(&staging).map_err(|e| BackupError::Archiver(e.into()))?;
        Ok(())
    }
}
