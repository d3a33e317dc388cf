//! Tree Walker (C4): recursive, ignore-aware FTP traversal with one-shot
//! reconnect-and-resume on transport failure (§4.4).

use crate::error::BackupError;
use crate::ftp::{ListingEntry, ListingSession};
use crate::ignore::IgnoreFilter;
use crate::types::TimePoint;
use tracing::{info, warn};

/// Reconnect-and-walk entry point for a site. `reconnect` re-establishes a
/// fresh session and navigates back to the site root; it is called at most
/// once per directory-read failure (a second failure propagates).
pub struct TreeWalker<'a> {
    ignore: &'a IgnoreFilter,
    generation: TimePoint,
}

impl<'a> TreeWalker<'a> {
    pub fn new(ignore: &'a IgnoreFilter, generation: TimePoint) -> Self {
        Self { ignore, generation }
    }

    /// Walk the whole tree starting at the session's current working
    /// directory (the site root). Returns every entry in listing order,
    /// pre-order (a directory entry always precedes its children).
    pub fn walk(&self, session: &mut dyn ListingSession) -> Result<Vec<ListingEntry>, BackupError> {
        let mut out = Vec::new();
        self.walk_path(session, "", false, &mut out)?;
        Ok(out)
    }

    fn walk_path(
        &self,
        session: &mut dyn ListingSession,
        path: &str,
        stop_on_fail: bool,
        out: &mut Vec<ListingEntry>,
    ) -> Result<(), BackupError> {
        if !path.is_empty() && self.ignore.matches_path(path) {
            return Ok(());
        }

        let entered = if path.is_empty() {
            true
        } else {
            let last_component = path.rsplit('/').next().unwrap_or(path);
            session.cwd(last_component)?;
            false
        };
        let _ = entered;

        let result = self.list_current_dir(session, path, out);
        match result {
            Ok(()) => {
                if !path.is_empty() {
                    session.cdup()?;
                }
                Ok(())
            }
            Err(BackupError::Transport(reason)) if !stop_on_fail => {
                warn!(path, reason, "transport error during walk, reconnecting once");
                session.reconnect()?;
                let parent = path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");
                for component in parent.split('/').filter(|c| !c.is_empty()) {
                    session.cwd(component)?;
                }
                self.walk_path(session, path, true, out)
            }
            Err(e) => Err(e),
        }
    }

    fn list_current_dir(
        &self,
        session: &mut dyn ListingSession,
        path: &str,
        out: &mut Vec<ListingEntry>,
    ) -> Result<(), BackupError> {
        let entries = if session.supports_mlsd()? {
            self.list_mlsd_mode(session)?
        } else {
            self.list_default_mode(session)?
        };

        for entry in entries {
            if entry.name.is_empty() {
                warn!(path, "listing entry has empty name, skipping");
                continue;
            }
            let full_name = if path.is_empty() {
                format!("/{}", entry.name)
            } else {
                format!("{path}/{}", entry.name)
            };
            if !entry.is_directory {
                info!(full_name, "file found");
            }
            let listed = ListingEntry {
                name: full_name.clone(),
                is_directory: entry.is_directory,
                modify_date: entry.modify_date,
            };
            let is_dir = listed.is_directory;
            out.push(listed);
            if is_dir {
                self.walk_path(session, &full_name, false, out)?;
            }
        }
        Ok(())
    }

    fn list_mlsd_mode(&self, session: &mut dyn ListingSession) -> Result<Vec<ListingEntry>, BackupError> {
        let lines = session.list_mlsd()?;
        Ok(lines
            .into_iter()
            .filter(|e| !self.ignore.matches_ext(&e.name))
            .map(|e| ListingEntry {
                name: e.name,
                is_directory: e.is_directory,
                modify_date: e.modify,
            })
            .collect())
    }

    /// LIST mode: names only trusted, directory-ness probed by attempting
    /// `CWD`/`CDUP`, and `modify_date` fetched via `MDTM` when advertised.
    ///
    /// When the server doesn't support MDTM, `modify_date` is set to this
    /// generation's timestamp instead of a real mtime (SPEC_FULL.md §9,
    /// "Preserved: LIST-mode mtime quirk") — every future generation will
    /// then see a spurious mtime diff for this file and fall back to CRC
    /// comparison, which is correct but redundant.
    fn list_default_mode(&self, session: &mut dyn ListingSession) -> Result<Vec<ListingEntry>, BackupError> {
        let names = session.list_names()?;
        let has_mdtm = session.supports_mdtm()?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if self.ignore.matches_ext(&name) {
                continue;
            }
            let is_directory = match session.cwd(&name) {
                Ok(()) => {
                    session.cdup()?;
                    true
                }
                Err(_) => false,
            };
            let modify_date = if !is_directory && has_mdtm {
                session.mdtm(&name).unwrap_or_else(|_| self.generation.to_string())
            } else {
                self.generation.to_string()
            };
            out.push(ListingEntry {
                name,
                is_directory,
                modify_date,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::MlsdEntry;
    use crate::types::{Ignore, IgnoreAttribute};
    use std::path::Path;

    /// In-memory `ListingSession` fake: a fixed directory tree keyed by the
    /// CWD stack's joined path, so tests don't need a real FTP server.
    struct FakeSession {
        mlsd: bool,
        mdtm: bool,
        tree: std::collections::HashMap<String, Vec<MlsdEntry>>,
        cwd_stack: Vec<String>,
    }

    impl FakeSession {
        fn new(tree: std::collections::HashMap<String, Vec<MlsdEntry>>) -> Self {
            Self {
                mlsd: true,
                mdtm: true,
                tree,
                cwd_stack: vec![],
            }
        }

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
            Ok(self.mlsd)
        }
        fn supports_mdtm(&mut self) -> Result<bool, BackupError> {
            Ok(self.mdtm)
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
            unimplemented!("tests use MLSD mode")
        }
        fn mdtm(&mut self, _name: &str) -> Result<String, BackupError> {
            Ok("20240101000000".into())
        }
        fn download(&mut self, _src: &str, _dst: &Path) -> Result<u32, BackupError> {
            Ok(0)
        }
        fn upload(&mut self, _src: &Path) -> Result<(), BackupError> {
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

    fn entry(name: &str, is_dir: bool, modify: &str) -> MlsdEntry {
        MlsdEntry {
            name: name.to_string(),
            is_directory: is_dir,
            modify: modify.to_string(),
        }
    }

    #[test]
    fn walks_nested_tree_in_preorder() {
        let mut tree = std::collections::HashMap::new();
        tree.insert(
            "/".to_string(),
            vec![
                entry("a.txt", false, "t1"),
                entry("dir", true, "t2"),
            ],
        );
        tree.insert(
            "/dir".to_string(),
            vec![entry("b.txt", false, "t3")],
        );
        let mut session = FakeSession::new(tree);
        let ignore = IgnoreFilter::compile(&[]);
        let walker = TreeWalker::new(&ignore, 1);

        let result = walker.walk(&mut session).unwrap();
        let names: Vec<_> = result.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["/a.txt", "/dir", "/dir/b.txt"]);
        assert_eq!(session.cwd_stack, Vec::<String>::new());
    }

    #[test]
    fn path_ignore_skips_whole_subtree() {
        let mut tree = std::collections::HashMap::new();
        tree.insert(
            "/".to_string(),
            vec![entry("a.txt", false, "t1"), entry("skip", true, "t2")],
        );
        tree.insert("/skip".to_string(), vec![entry("hidden.txt", false, "t3")]);
        let mut session = FakeSession::new(tree);
        let ignore = IgnoreFilter::compile(&[Ignore {
            site_id: 1,
            attribute: IgnoreAttribute::Path,
            operand: "/skip".into(),
        }]);
        let walker = TreeWalker::new(&ignore, 1);

        let result = walker.walk(&mut session).unwrap();
        let names: Vec<_> = result.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["/a.txt"]);
    }

    #[test]
    fn ext_ignore_drops_matching_files() {
        let mut tree = std::collections::HashMap::new();
        tree.insert(
            "/".to_string(),
            vec![entry("a.txt", false, "t1"), entry("a.tmp", false, "t2")],
        );
        let mut session = FakeSession::new(tree);
        let ignore = IgnoreFilter::compile(&[Ignore {
            site_id: 1,
            attribute: IgnoreAttribute::Ext,
            operand: "tmp".into(),
        }]);
        let walker = TreeWalker::new(&ignore, 1);

        let result = walker.walk(&mut session).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "/a.txt");
    }

    #[test]
    fn empty_tree_produces_no_entries() {
        let mut tree = std::collections::HashMap::new();
        tree.insert("/".to_string(), vec![]);
        let mut session = FakeSession::new(tree);
        let ignore = IgnoreFilter::compile(&[]);
        let walker = TreeWalker::new(&ignore, 1);

        assert!(walker.walk(&mut session).unwrap().is_empty());
    }
}
