//! Reconciler (C5): diffs a walked listing against the DB tree, downloads
//! new/changed bytes into a per-generation staging directory, and hands the
//! staging directory to the Archiver.

use crate::archiver;
use crate::error::BackupError;
use crate::ftp::{ListingEntry, ListingSession};
use crate::ignore::IgnoreFilter;
use crate::persistence::PersistencePort;
use crate::types::{File, Site, TimePoint};
use crate::walker::TreeWalker;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::runtime::Handle;
use tracing::{info, warn};

pub struct Reconciler<'a> {
    persistence: &'a dyn PersistencePort,
    backup_root: &'a Path,
}

impl<'a> Reconciler<'a> {
    pub fn new(persistence: &'a dyn PersistencePort, backup_root: &'a Path) -> Self {
        Self {
            persistence,
            backup_root,
        }
    }

    /// Runs one generation for `site`: walk, diff, download, persist, pack.
    /// Invoked from a `spawn_blocking` worker; persistence calls are async
    /// and bridged in with `Handle::block_on` since the surrounding call
    /// chain is otherwise a sequential run of blocking FTP I/O.
    pub fn run(
        &self,
        session: &mut dyn ListingSession,
        site: &Site,
        generation: TimePoint,
    ) -> Result<(), BackupError> {
        let handle = Handle::current();
        let ignores = handle.block_on(self.persistence.load_ignores(site.id))?;
        let ignore = IgnoreFilter::compile(&ignores);

        let walker = TreeWalker::new(&ignore, generation);
        let listing = walker.walk(session)?;
        info!(site_id = site.id, found = listing.len(), "list files complete");

        let current = handle.block_on(self.persistence.load_current_tree(site.id))?;
        let mut by_path: HashMap<String, (File, bool)> =
            current.into_iter().map(|f| (f.full_name.clone(), (f, false))).collect();

        let staging = self.backup_root.join(site.id.to_string()).join(generation.to_string());
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(|e| BackupError::Archiver(e.into()))?;
        }
        std::fs::create_dir_all(&staging).map_err(|e| BackupError::Archiver(e.into()))?;

        let mut has_files = false;
        let mut has_changes = false;

        for entry in &listing {
            if let Err(e) = self.reconcile_one(session, &handle, site, generation, entry, &staging, &mut by_path, &mut has_files) {
                warn!(path = %entry.name, error = %e, "error while processing entry");
                let fs_path = staging.join(entry.name.trim_start_matches('/'));
                let _ = std::fs::remove_file(&fs_path);
            }
        }

        for (path, (file, seen)) in by_path.iter() {
            if *seen {
                continue;
            }
            info!(path, "entry has been deleted");
            handle.block_on(self.persistence.delete_file(site.id, file, generation))?;
            has_changes = true;
        }

        if !has_files && !has_changes {
            info!(site_id = site.id, "all files up to date");
        } else if has_files {
            info!(site_id = site.id, "creating archive");
            archiver::pack(&staging)?;
        }
        std::fs::remove_dir_all(&staging).map_err(|e| BackupError::Archiver(e.into()))?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn reconcile_one(
        &self,
        session: &mut dyn ListingSession,
        handle: &Handle,
        site: &Site,
        generation: TimePoint,
        entry: &ListingEntry,
        staging: &Path,
        by_path: &mut HashMap<String, (File, bool)>,
        has_files: &mut bool,
    ) -> Result<(), BackupError> {
        let staging_path: PathBuf = staging.join(entry.name.trim_start_matches('/'));

        match by_path.get(&entry.name) {
            None => {
                let mut file = File::new_unsaved(entry.name.clone(), entry.modify_date.clone(), entry.is_directory);
                if !entry.is_directory {
                    if let Some(parent) = staging_path.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| BackupError::Archiver(e.into()))?;
                    }
                    file.crc32 = session.download(&entry.name, &staging_path)?;
                    *has_files = true;
                }
                info!(path = %entry.name, "new entry discovered");
                handle.block_on(self.persistence.insert_file(site.id, &file, generation))?;
            }
            Some((stored, _)) => {
                let mut file = stored.clone();
                file.full_name = entry.name.clone();

                if stored.is_directory != entry.is_directory {
                    info!(path = %entry.name, "type changed");
                    file.is_directory = entry.is_directory;
                    file.modify_date = entry.modify_date.clone();
                    if !entry.is_directory {
                        if let Some(parent) = staging_path.parent() {
                            std::fs::create_dir_all(parent).map_err(|e| BackupError::Archiver(e.into()))?;
                        }
                        file.crc32 = session.download(&entry.name, &staging_path)?;
                        *has_files = true;
                    }
                    handle.block_on(self.persistence.update_file(site.id, &file, generation))?;
                } else if !entry.is_directory && stored.modify_date != entry.modify_date {
                    info!(path = %entry.name, "modify date differs");
                    if let Some(parent) = staging_path.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| BackupError::Archiver(e.into()))?;
                    }
                    let crc32 = session.download(&entry.name, &staging_path)?;
                    file.modify_date = entry.modify_date.clone();
                    if crc32 == stored.crc32 {
                        let _ = std::fs::remove_file(&staging_path);
                    } else {
                        file.crc32 = crc32;
                        *has_files = true;
                        handle.block_on(self.persistence.update_file(site.id, &file, generation))?;
                    }
                }
            }
        }

        if let Some(entry_mut) = by_path.get_mut(&entry.name) {
            entry_mut.1 = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::MlsdEntry;
    use crate::persistence::FakePersistence;
    use crate::types::IgnoreAttribute;
    use std::path::Path as StdPath;

    struct FakeSession {
        tree: HashMap<String, Vec<MlsdEntry>>,
        cwd_stack: Vec<String>,
        contents: HashMap<String, Vec<u8>>,
    }

    impl FakeSession {
        fn current_key(&self) -> String {
            format!("/{}", self.cwd_stack.join("/"))
        }
    }

    impl ListingSession for FakeSession {
        fn reconnect(&mut self) -> Result<(), BackupError> {
            self.cwd_stack.clear();
            Ok(())
        }
        fn supports_mlsd(&mut self) -> Result<bool, BackupError> {
            Ok(true)
        }
        fn supports_mdtm(&mut self) -> Result<bool, BackupError> {
            Ok(true)
        }
        fn cwd(&mut self, dir: &str) -> Result<(), BackupError> {
            self.cwd_stack.push(dir.to_string());
            if self.tree.contains_key(&self.current_key()) {
                Ok(())
            } else {
                self.cwd_stack.pop();
                Err(BackupError::Transport("no such directory".into()))
            }
        }
        fn cdup(&mut self) -> Result<(), BackupError> {
            self.cwd_stack.pop();
            Ok(())
        }
        fn list_mlsd(&mut self) -> Result<Vec<MlsdEntry>, BackupError> {
            Ok(self.tree.get(&self.current_key()).cloned().unwrap_or_default())
        }
        fn list_names(&mut self) -> Result<Vec<String>, BackupError> {
            unimplemented!()
        }
        fn mdtm(&mut self, _name: &str) -> Result<String, BackupError> {
            Ok("t".into())
        }
        fn download(&mut self, src: &str, dst: &StdPath) -> Result<u32, BackupError> {
            let bytes = self.contents.get(src).cloned().unwrap_or_default();
            std::fs::write(dst, &bytes).map_err(|e| BackupError::Transport(e.to_string()))?;
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&bytes);
            Ok(hasher.finalize())
        }
        fn upload(&mut self, _src: &StdPath) -> Result<(), BackupError> {
            Ok(())
        }
        fn mkdir(&mut self, _name: &str) -> Result<(), BackupError> {
            Ok(())
        }
        fn recursive_remove(&mut self, _path: &str) -> Result<(), BackupError> {
            Ok(())
        }
        fn send_command(&mut self, _verb: &str, _arg: Option<&str>) -> Result<String, BackupError> {
            Ok(String::new())
        }
    }

    fn entry(name: &str, is_dir: bool) -> MlsdEntry {
        MlsdEntry {
            name: name.to_string(),
            is_directory: is_dir,
            modify: "t1".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_file_is_downloaded_and_recorded_as_added() {
        let persistence = FakePersistence::new();
        let tmp = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(&persistence, tmp.path());

        let mut tree = HashMap::new();
        tree.insert("/".to_string(), vec![entry("a.txt", false)]);
        let mut contents = HashMap::new();
        contents.insert("/a.txt".to_string(), b"hello".to_vec());
        let mut session = FakeSession {
            tree,
            cwd_stack: vec![],
            contents,
        };
        let site = Site {
            id: 1,
            login: "u".into(),
            password: "p".into(),
        };

        tokio::task::block_in_place(|| reconciler.run(&mut session, &site, 100)).unwrap();

        let stored = persistence.load_current_tree(1).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].full_name, "/a.txt");
        assert_ne!(stored[0].crc32, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_file_is_marked_deleted() {
        let persistence = FakePersistence::new();
        let seed = File::new_unsaved("/gone.txt".into(), "t0".into(), false);
        persistence.insert_file(1, &seed, 50).await.unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(&persistence, tmp.path());
        let mut tree = HashMap::new();
        tree.insert("/".to_string(), vec![]);
        let mut session = FakeSession {
            tree,
            cwd_stack: vec![],
            contents: HashMap::new(),
        };
        let site = Site {
            id: 1,
            login: "u".into(),
            password: "p".into(),
        };

        tokio::task::block_in_place(|| reconciler.run(&mut session, &site, 100)).unwrap();
        assert!(persistence.load_current_tree(1).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn identical_bytes_with_different_mtime_is_a_no_op() {
        let persistence = FakePersistence::new();
        let mut seed = File::new_unsaved("/a.txt".into(), "t0".into(), false);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(b"hello");
        seed.crc32 = hasher.finalize();
        persistence.insert_file(1, &seed, 50).await.unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(&persistence, tmp.path());
        let mut tree = HashMap::new();
        tree.insert("/".to_string(), vec![entry("a.txt", false)]);
        let mut contents = HashMap::new();
        contents.insert("/a.txt".to_string(), b"hello".to_vec());
        let mut session = FakeSession {
            tree,
            cwd_stack: vec![],
            contents,
        };
        let site = Site {
            id: 1,
            login: "u".into(),
            password: "p".into(),
        };

        tokio::task::block_in_place(|| reconciler.run(&mut session, &site, 100)).unwrap();
        let stored = persistence.load_current_tree(1).await.unwrap();
        assert_eq!(stored[0].time_point, 50);
    }

    #[test]
    fn ignored_extension_never_enters_reconciliation() {
        let ignore = IgnoreFilter::compile(&[crate::types::Ignore {
            site_id: 1,
            attribute: IgnoreAttribute::Ext,
            operand: "tmp".into(),
        }]);
        assert!(ignore.matches_ext("a.tmp"));
    }
}
