//! 备份管理：修改类任务执行前的项目快照与回滚
//!
//! 快照 = 整个目录树打成一个 zip；回滚 = 先解压到同级暂存目录，成功后再整体替换目标目录
//! （不做合并，快照之后新增的文件会丢失）。备份目录与状态目录不能位于被快照的项目内。

pub mod archive;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{StateStore, StoreError};

/// 备份元数据；每个归档只创建一次，之后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    /// 项目目录（绝对路径）
    pub project_path: PathBuf,
    /// 归档文件（绝对路径）
    pub archive_path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("project path {0} does not exist")]
    PathNotFound(String),

    #[error("project path {0} is not a directory")]
    NotADirectory(String),

    #[error("backup {0} not found")]
    UnknownBackup(String),

    #[error("backup archive {0} not found")]
    ArchiveMissing(String),

    #[error("project path {project} contains the {kind} directory {dir}")]
    ProjectContainsManagedDir {
        project: String,
        kind: &'static str,
        dir: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("backup worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 备份管理器
pub struct BackupManager {
    backup_dir: PathBuf,
    state_dir: Option<PathBuf>,
    store: Arc<StateStore>,
}

impl BackupManager {
    /// 备份目录不存在时自动创建
    pub fn new(backup_dir: impl AsRef<Path>, store: Arc<StateStore>) -> Result<Self, BackupError> {
        let backup_dir = backup_dir.as_ref();
        std::fs::create_dir_all(backup_dir)?;
        let backup_dir = backup_dir.canonicalize()?;
        let state_dir = store.root().and_then(|root| root.canonicalize().ok());
        Ok(Self {
            backup_dir,
            state_dir,
            store,
        })
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// 对 `project_path` 做完整快照并登记到状态存储
    pub async fn create_backup(
        &self,
        project_path: impl AsRef<Path>,
        description: &str,
    ) -> Result<BackupRecord, BackupError> {
        let project_path = project_path.as_ref();
        if !project_path.exists() {
            return Err(BackupError::PathNotFound(project_path.display().to_string()));
        }
        if !project_path.is_dir() {
            return Err(BackupError::NotADirectory(project_path.display().to_string()));
        }
        let project_path = project_path.canonicalize()?;
        self.check_managed_dirs(&project_path)?;

        let backup_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let archive_path = self.backup_dir.join(format!(
            "backup_{}_{}.zip",
            created_at.format("%Y%m%d_%H%M%S"),
            backup_id
        ));

        tracing::info!(
            backup_id = %backup_id,
            project_path = %project_path.display(),
            "Creating backup"
        );

        let files = {
            let src = project_path.clone();
            let dst = archive_path.clone();
            tokio::task::spawn_blocking(move || archive::write_archive(&src, &dst)).await??
        };

        let record = BackupRecord {
            backup_id,
            project_path,
            archive_path,
            created_at,
            description: description.to_string(),
        };
        self.store.add_backup(record.clone()).await?;

        tracing::info!(backup_id = %record.backup_id, files, "Backup created");
        Ok(record)
    }

    /// 用快照整体替换项目目录
    pub async fn rollback(&self, backup_id: &str) -> Result<BackupRecord, BackupError> {
        let record = self
            .store
            .find_backup(backup_id)
            .await
            .ok_or_else(|| BackupError::UnknownBackup(backup_id.to_string()))?;

        if !record.archive_path.exists() {
            return Err(BackupError::ArchiveMissing(
                record.archive_path.display().to_string(),
            ));
        }

        tracing::info!(
            backup_id = %backup_id,
            project_path = %record.project_path.display(),
            "Rolling back to backup"
        );

        let files = {
            let target = record.project_path.clone();
            let archive_path = record.archive_path.clone();
            let staging = staging_dir(&target, backup_id)?;
            tokio::task::spawn_blocking(move || restore_from_archive(&archive_path, &staging, &target))
                .await??
        };

        tracing::info!(backup_id = %backup_id, files, "Rollback complete");
        Ok(record)
    }

    /// 备份目录或状态目录落在项目内时，快照会把它们一起打包，回滚时又会把它们删掉
    fn check_managed_dirs(&self, project_path: &Path) -> Result<(), BackupError> {
        let managed = std::iter::once(("backup", Some(&self.backup_dir)))
            .chain(std::iter::once(("state", self.state_dir.as_ref())));
        for (kind, dir) in managed {
            if let Some(dir) = dir.filter(|dir| dir.starts_with(project_path)) {
                return Err(BackupError::ProjectContainsManagedDir {
                    project: project_path.display().to_string(),
                    kind,
                    dir: dir.display().to_string(),
                });
            }
        }
        Ok(())
    }

    pub async fn list_backups(&self) -> Vec<BackupRecord> {
        self.store.backups().await
    }

    pub async fn get_backup(&self, backup_id: &str) -> Option<BackupRecord> {
        self.store.find_backup(backup_id).await
    }
}

/// 与目标目录同级的暂存目录 `.<name>.rollback-<backup_id>`
fn staging_dir(target: &Path, backup_id: &str) -> Result<PathBuf, BackupError> {
    match (target.parent(), target.file_name()) {
        (Some(parent), Some(name)) => Ok(parent.join(format!(
            ".{}.rollback-{}",
            name.to_string_lossy(),
            backup_id
        ))),
        _ => Err(BackupError::NotADirectory(target.display().to_string())),
    }
}

/// 解压到暂存目录，成功后删除目标并把暂存目录改名过去；解压失败时目标保持不变
fn restore_from_archive(archive_path: &Path, staging: &Path, target: &Path) -> Result<usize, BackupError> {
    if staging.exists() {
        std::fs::remove_dir_all(staging)?;
    }
    std::fs::create_dir_all(staging)?;
    let files = match archive::extract_archive(archive_path, staging) {
        Ok(files) => files,
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_dir_all(staging) {
                tracing::warn!(staging = %staging.display(), error = %cleanup, "Failed to remove rollback staging directory");
            }
            return Err(e);
        }
    };

    if target.is_dir() {
        std::fs::remove_dir_all(target)?;
    } else if target.exists() {
        std::fs::remove_file(target)?;
    }
    std::fs::rename(staging, target)?;
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, BackupManager) {
        let project = tempfile::tempdir().unwrap();
        fs::write(project.path().join("file1.txt"), "content1").unwrap();
        fs::create_dir_all(project.path().join("src")).unwrap();
        fs::write(project.path().join("src/lib.rs"), "pub fn a() {}").unwrap();

        let backups = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(backups.path(), Arc::new(StateStore::in_memory())).unwrap();
        (project, backups, manager)
    }

    #[tokio::test]
    async fn test_create_backup_and_rollback() {
        let (project, _backups, manager) = setup();

        let record = manager.create_backup(project.path(), "test backup").await.unwrap();
        assert!(record.archive_path.exists());
        assert!(record.project_path.is_absolute());
        assert_eq!(manager.list_backups().await.len(), 1);

        fs::write(project.path().join("file1.txt"), "modified content").unwrap();
        fs::write(project.path().join("new.txt"), "created later").unwrap();
        fs::remove_file(project.path().join("src/lib.rs")).unwrap();

        manager.rollback(&record.backup_id).await.unwrap();

        assert_eq!(fs::read(project.path().join("file1.txt")).unwrap(), b"content1");
        assert_eq!(
            fs::read_to_string(project.path().join("src/lib.rs")).unwrap(),
            "pub fn a() {}"
        );
        // 整体替换：快照之后创建的文件被清除
        assert!(!project.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn test_backup_of_missing_path_fails() {
        let (_project, backups, manager) = setup();
        let missing = backups.path().join("does-not-exist");
        let err = manager.create_backup(&missing, "x").await.unwrap_err();
        assert!(matches!(err, BackupError::PathNotFound(_)));
        assert!(manager.list_backups().await.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_unknown_id() {
        let (_project, _backups, manager) = setup();
        let err = manager.rollback("nope").await.unwrap_err();
        assert!(matches!(err, BackupError::UnknownBackup(_)));
    }

    #[tokio::test]
    async fn test_corrupt_archive_keeps_project() {
        let (project, _backups, manager) = setup();
        let record = manager.create_backup(project.path(), "").await.unwrap();
        fs::write(&record.archive_path, b"not a zip").unwrap();
        fs::write(project.path().join("keep.txt"), "still here").unwrap();

        let err = manager.rollback(&record.backup_id).await.unwrap_err();
        assert!(matches!(err, BackupError::Archive(_)));
        assert_eq!(
            fs::read_to_string(project.path().join("keep.txt")).unwrap(),
            "still here"
        );
        assert!(project.path().join("src/lib.rs").exists());

        // 暂存目录已清理
        let parent = project.path().parent().unwrap();
        let leftovers = fs::read_dir(parent)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(&record.backup_id))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_backup_dir_inside_project_is_rejected() {
        let project = tempfile::tempdir().unwrap();
        fs::write(project.path().join("keep.txt"), "data").unwrap();
        let manager = BackupManager::new(
            project.path().join("data/backups"),
            Arc::new(StateStore::in_memory()),
        )
        .unwrap();

        let err = manager.create_backup(project.path(), "").await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::ProjectContainsManagedDir { kind: "backup", .. }
        ));
        assert!(manager.list_backups().await.is_empty());
        assert!(project.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_state_dir_inside_project_is_rejected() {
        let project = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(project.path().join("data/state")).unwrap());
        let manager = BackupManager::new(backups.path(), store).unwrap();

        let err = manager.create_backup(project.path(), "").await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::ProjectContainsManagedDir { kind: "state", .. }
        ));
    }

    #[tokio::test]
    async fn test_rollback_with_missing_archive() {
        let (project, _backups, manager) = setup();
        let record = manager.create_backup(project.path(), "").await.unwrap();
        fs::remove_file(&record.archive_path).unwrap();

        let err = manager.rollback(&record.backup_id).await.unwrap_err();
        assert!(matches!(err, BackupError::ArchiveMissing(_)));
        // 归档缺失时不能动项目目录
        assert!(project.path().join("file1.txt").exists());
    }
}
