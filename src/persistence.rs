//! Persistence Port (C1): typed gateway to the relational store.
//!
//! `SqlPersistence` is the production `sqlx`/MySQL implementation; tests use
//! the in-memory `FakePersistence` below instead of a live database.

use crate::error::BackupError;
use crate::types::{File, Ignore, IgnoreAttribute, Site, Status, TimePoint};
use async_trait::async_trait;
use sqlx::{MySqlPool, Row};
use tokio::sync::Mutex;

/// Gateway to sites, files, history and ignores. Implementations must be
/// safe for concurrent use from multiple site workers: every mutation is
/// its own transactional unit (insert-or-update, then a history append).
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn load_sites(&self) -> Result<Vec<Site>, BackupError>;
    async fn load_ignores(&self, site_id: u32) -> Result<Vec<Ignore>, BackupError>;

    /// Latest non-deleted revision per path.
    async fn load_current_tree(&self, site_id: u32) -> Result<Vec<File>, BackupError>;

    /// For each path, the revision whose history event has the maximum
    /// `timePoint <= time_point`. Deleted revisions are retained, not
    /// filtered, so the caller can tell a deletion from a never-existed
    /// path.
    async fn load_tree_at(
        &self,
        site_id: u32,
        time_point: TimePoint,
    ) -> Result<Vec<(File, Status)>, BackupError>;

    async fn insert_file(
        &self,
        site_id: u32,
        file: &File,
        time_point: TimePoint,
    ) -> Result<u32, BackupError>;

    async fn update_file(
        &self,
        site_id: u32,
        file: &File,
        time_point: TimePoint,
    ) -> Result<(), BackupError>;

    /// Clears `modifyDate` and appends a `Deleted` history event. The file
    /// row itself is kept, not removed.
    async fn delete_file(
        &self,
        site_id: u32,
        file: &File,
        time_point: TimePoint,
    ) -> Result<(), BackupError>;
}

pub struct SqlPersistence {
    pool: MySqlPool,
    // Serializes the insert-then-history-append sequence across workers,
    // mirroring the source's single mutex around its bound-parameter cache.
    write_lock: Mutex<()>,
}

impl SqlPersistence {
    pub async fn connect(connection: &str) -> Result<Self, BackupError> {
        let pool = MySqlPool::connect(connection)
            .await
            .map_err(|e| BackupError::Persistence(e.into()))?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl PersistencePort for SqlPersistence {
    async fn load_sites(&self) -> Result<Vec<Site>, BackupError> {
        sqlx::query("SELECT id, login, password FROM ftp_backup_sites")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackupError::Persistence(e.into()))?
            .into_iter()
            .map(|row| {
                Ok(Site {
                    id: row.try_get::<u32, _>("id").map_err(|e| BackupError::Persistence(e.into()))?,
                    login: row.try_get("login").map_err(|e| BackupError::Persistence(e.into()))?,
                    password: row.try_get("password").map_err(|e| BackupError::Persistence(e.into()))?,
                })
            })
            .collect()
    }

    async fn load_ignores(&self, site_id: u32) -> Result<Vec<Ignore>, BackupError> {
        let rows = sqlx::query(
            "SELECT DISTINCT attribute, operand FROM ftp_backup_ignores WHERE siteId = ?",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BackupError::Persistence(e.into()))?;

        rows.into_iter()
            .map(|row| {
                let attribute: String = row.try_get("attribute").map_err(|e| BackupError::Persistence(e.into()))?;
                let attribute = match attribute.as_str() {
                    "ext" => IgnoreAttribute::Ext,
                    "path" => IgnoreAttribute::Path,
                    other => {
                        return Err(BackupError::Persistence(anyhow::anyhow!(
                            "unknown ignore attribute {other}"
                        )))
                    }
                };
                Ok(Ignore {
                    site_id,
                    attribute,
                    operand: row.try_get("operand").map_err(|e| BackupError::Persistence(e.into()))?,
                })
            })
            .collect()
    }

    async fn load_current_tree(&self, site_id: u32) -> Result<Vec<File>, BackupError> {
        let rows = sqlx::query(
            "SELECT f.id, f.crc32, f.fullName, f.isDirectory, f.modifyDate, f.timePoint \
             FROM ftp_backup_files f JOIN ftp_backup_history h \
             ON h.fileId = f.id AND h.timePoint = f.timePoint \
             WHERE f.siteId = ? AND h.fileStatus <> -1",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BackupError::Persistence(e.into()))?;

        rows.into_iter()
            .map(|row| {
                Ok(File {
                    id: row.try_get("id").map_err(|e| BackupError::Persistence(e.into()))?,
                    full_name: row.try_get("fullName").map_err(|e| BackupError::Persistence(e.into()))?,
                    is_directory: row.try_get("isDirectory").map_err(|e| BackupError::Persistence(e.into()))?,
                    modify_date: row.try_get("modifyDate").map_err(|e| BackupError::Persistence(e.into()))?,
                    crc32: row.try_get("crc32").map_err(|e| BackupError::Persistence(e.into()))?,
                    time_point: row.try_get::<i64, _>("timePoint").map_err(|e| BackupError::Persistence(e.into()))? as u64,
                })
            })
            .collect()
    }

    async fn load_tree_at(
        &self,
        site_id: u32,
        time_point: TimePoint,
    ) -> Result<Vec<(File, Status)>, BackupError> {
        let rows = sqlx::query(
            "SELECT f.id, CAST(h.fileStatus AS SIGNED) AS status, f.fullName, f.isDirectory, \
             f.crc32, CAST(MAX(h.timePoint) AS UNSIGNED) AS revTimePoint \
             FROM ftp_backup_files f JOIN ftp_backup_history h ON h.fileId = f.id \
             WHERE h.timePoint <= ? AND f.siteId = ? \
             GROUP BY f.id, h.fileStatus, f.fullName, f.isDirectory, f.crc32",
        )
        .bind(time_point as i64)
        .bind(site_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BackupError::Persistence(e.into()))?;

        rows.into_iter()
            .map(|row| {
                let status_raw: i8 = row.try_get("status").map_err(|e| BackupError::Persistence(e.into()))?;
                let status = match status_raw {
                    0 => Status::Added,
                    1 => Status::Modified,
                    -1 => Status::Deleted,
                    other => {
                        return Err(BackupError::Persistence(anyhow::anyhow!(
                            "unknown history status {other}"
                        )))
                    }
                };
                let time_point: u64 = row.try_get::<i64, _>("revTimePoint").map_err(|e| BackupError::Persistence(e.into()))? as u64;
                let file = File {
                    id: row.try_get("id").map_err(|e| BackupError::Persistence(e.into()))?,
                    full_name: row.try_get("fullName").map_err(|e| BackupError::Persistence(e.into()))?,
                    is_directory: row.try_get("isDirectory").map_err(|e| BackupError::Persistence(e.into()))?,
                    modify_date: time_point.to_string(),
                    crc32: row.try_get("crc32").map_err(|e| BackupError::Persistence(e.into()))?,
                    time_point,
                };
                Ok((file, status))
            })
            .collect()
    }

    async fn insert_file(
        &self,
        site_id: u32,
        file: &File,
        time_point: TimePoint,
    ) -> Result<u32, BackupError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(|e| BackupError::Persistence(e.into()))?;

        let result = sqlx::query(
            "INSERT INTO ftp_backup_files (siteId, crc32, timePoint, fullName, modifyDate, isDirectory) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(site_id)
        .bind(file.crc32)
        .bind(time_point as i64)
        .bind(&file.full_name)
        .bind(&file.modify_date)
        .bind(file.is_directory)
        .execute(&mut *tx)
        .await
        .map_err(|e| BackupError::Persistence(e.into()))?;

        let file_id = result.last_insert_id() as u32;

        sqlx::query("INSERT INTO ftp_backup_history (fileId, timePoint, fileStatus) VALUES (?, ?, ?)")
            .bind(file_id)
            .bind(time_point as i64)
            .bind(Status::Added as i8)
            .execute(&mut *tx)
            .await
            .map_err(|e| BackupError::Persistence(e.into()))?;

        tx.commit().await.map_err(|e| BackupError::Persistence(e.into()))?;
        Ok(file_id)
    }

    async fn update_file(
        &self,
        _site_id: u32,
        file: &File,
        time_point: TimePoint,
    ) -> Result<(), BackupError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(|e| BackupError::Persistence(e.into()))?;

        sqlx::query("INSERT INTO ftp_backup_history (fileId, timePoint, fileStatus) VALUES (?, ?, ?)")
            .bind(file.id)
            .bind(time_point as i64)
            .bind(Status::Modified as i8)
            .execute(&mut *tx)
            .await
            .map_err(|e| BackupError::Persistence(e.into()))?;

        sqlx::query(
            "UPDATE ftp_backup_files SET crc32 = ?, timePoint = ?, modifyDate = ?, isDirectory = ? WHERE id = ?",
        )
        .bind(file.crc32)
        .bind(time_point as i64)
        .bind(&file.modify_date)
        .bind(file.is_directory)
        .bind(file.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| BackupError::Persistence(e.into()))?;

        tx.commit().await.map_err(|e| BackupError::Persistence(e.into()))?;
        Ok(())
    }

    async fn delete_file(
        &self,
        _site_id: u32,
        file: &File,
        time_point: TimePoint,
    ) -> Result<(), BackupError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(|e| BackupError::Persistence(e.into()))?;

        sqlx::query("INSERT INTO ftp_backup_history (fileId, timePoint, fileStatus) VALUES (?, ?, ?)")
            .bind(file.id)
            .bind(time_point as i64)
            .bind(Status::Deleted as i8)
            .execute(&mut *tx)
            .await
            .map_err(|e| BackupError::Persistence(e.into()))?;

        sqlx::query("UPDATE ftp_backup_files SET timePoint = ?, modifyDate = '' WHERE id = ?")
            .bind(time_point as i64)
            .bind(file.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BackupError::Persistence(e.into()))?;

        tx.commit().await.map_err(|e| BackupError::Persistence(e.into()))?;
        Ok(())
    }
}

#[cfg(test)]
pub struct FakePersistence {
    pub sites: std::sync::Mutex<Vec<Site>>,
    pub ignores: std::sync::Mutex<Vec<Ignore>>,
    pub files: std::sync::Mutex<Vec<File>>,
    pub history: std::sync::Mutex<Vec<(u32, TimePoint, Status)>>,
    next_id: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl FakePersistence {
    pub fn new() -> Self {
        Self {
            sites: std::sync::Mutex::new(Vec::new()),
            ignores: std::sync::Mutex::new(Vec::new()),
            files: std::sync::Mutex::new(Vec::new()),
            history: std::sync::Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU32::new(1),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl PersistencePort for FakePersistence {
    async fn load_sites(&self) -> Result<Vec<Site>, BackupError> {
        Ok(self.sites.lock().unwrap().clone())
    }

    async fn load_ignores(&self, site_id: u32) -> Result<Vec<Ignore>, BackupError> {
        Ok(self
            .ignores
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.site_id == site_id)
            .cloned()
            .collect())
    }

    async fn load_current_tree(&self, _site_id: u32) -> Result<Vec<File>, BackupError> {
        let history = self.history.lock().unwrap();
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .filter(|f| {
                history
                    .iter()
                    .filter(|(id, _, _)| *id == f.id)
                    .max_by_key(|(_, tp, _)| *tp)
                    .map(|(_, _, status)| *status != Status::Deleted)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn load_tree_at(
        &self,
        _site_id: u32,
        time_point: TimePoint,
    ) -> Result<Vec<(File, Status)>, BackupError> {
        let history = self.history.lock().unwrap();
        let files = self.files.lock().unwrap();
        Ok(files
            .iter()
            .filter_map(|f| {
                history
                    .iter()
                    .filter(|(id, tp, _)| *id == f.id && *tp <= time_point)
                    .max_by_key(|(_, tp, _)| *tp)
                    .map(|(_, tp, status)| {
                        let mut revision = f.clone();
                        revision.time_point = *tp;
                        (revision, *status)
                    })
            })
            .collect())
    }

    async fn insert_file(
        &self,
        site_id: u32,
        file: &File,
        time_point: TimePoint,
    ) -> Result<u32, BackupError> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut stored = file.clone();
        stored.id = id;
        stored.time_point = time_point;
        self.files.lock().unwrap().push(stored);
        self.history.lock().unwrap().push((id, time_point, Status::Added));
        let _ = site_id;
        Ok(id)
    }

    async fn update_file(
        &self,
        _site_id: u32,
        file: &File,
        time_point: TimePoint,
    ) -> Result<(), BackupError> {
        let mut files = self.files.lock().unwrap();
        if let Some(existing) = files.iter_mut().find(|f| f.id == file.id) {
            existing.crc32 = file.crc32;
            existing.modify_date = file.modify_date.clone();
            existing.is_directory = file.is_directory;
            existing.time_point = time_point;
        }
        self.history.lock().unwrap().push((file.id, time_point, Status::Modified));
        Ok(())
    }

    async fn delete_file(
        &self,
        _site_id: u32,
        file: &File,
        time_point: TimePoint,
    ) -> Result<(), BackupError> {
        let mut files = self.files.lock().unwrap();
        if let Some(existing) = files.iter_mut().find(|f| f.id == file.id) {
            existing.modify_date.clear();
            existing.time_point = time_point;
        }
        self.history.lock().unwrap().push((file.id, time_point, Status::Deleted));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_current_tree_includes_file() {
        let store = FakePersistence::new();
        let file = File::new_unsaved("/a.txt".into(), "t1".into(), false);
        store.insert_file(1, &file, 100).await.unwrap();

        let tree = store.load_current_tree(1).await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].full_name, "/a.txt");
    }

    #[tokio::test]
    async fn delete_removes_file_from_current_tree_but_keeps_row() {
        let store = FakePersistence::new();
        let file = File::new_unsaved("/a.txt".into(), "t1".into(), false);
        let id = store.insert_file(1, &file, 100).await.unwrap();
        let mut stored = file.clone();
        stored.id = id;
        store.delete_file(1, &stored, 200).await.unwrap();

        assert!(store.load_current_tree(1).await.unwrap().is_empty());
        assert_eq!(store.files.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn load_tree_at_returns_latest_revision_not_exceeding_timestamp() {
        let store = FakePersistence::new();
        let file = File::new_unsaved("/a.txt".into(), "t1".into(), false);
        let id = store.insert_file(1, &file, 100).await.unwrap();
        let mut modified = file.clone();
        modified.id = id;
        modified.crc32 = 42;
        store.update_file(1, &modified, 300).await.unwrap();

        let at_200 = store.load_tree_at(1, 200).await.unwrap();
        assert_eq!(at_200.len(), 1);
        assert_eq!(at_200[0].1, Status::Added);

        let at_400 = store.load_tree_at(1, 400).await.unwrap();
        assert_eq!(at_400[0].1, Status::Modified);
    }
}
