//! 聚合持久化
//!
//! 每个聚合（tasks / agents / backups ...）单独存为一个 JSON 文件。
//! 写入走「临时文件 + rename」，只重写发生变化的那个聚合。

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard};

use super::StoreError;

/// 单个 JSON 文件句柄
#[derive(Debug)]
pub struct JsonFile<T> {
    path: PathBuf,
    _phantom: PhantomData<T>,
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            _phantom: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取文件；不存在或为空时返回 None
    pub fn load(&self) -> Result<Option<T>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let data = serde_json::from_str(&content)?;
        Ok(Some(data))
    }

    /// 原子写入：先写 `<name>.tmp` 再 rename 覆盖
    pub async fn save(&self, data: &T) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        tokio::fs::write(&tmp, &body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

/// 带独立锁的聚合；可选落盘
#[derive(Debug)]
pub struct Aggregate<T> {
    data: RwLock<T>,
    file: Option<JsonFile<T>>,
}

impl<T> Aggregate<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    /// 纯内存聚合
    pub fn in_memory() -> Self {
        Self {
            data: RwLock::new(T::default()),
            file: None,
        }
    }

    /// 从文件恢复；文件损坏时记录告警并以空聚合启动
    pub fn load(file: JsonFile<T>) -> Self {
        let data = match file.load() {
            Ok(Some(data)) => data,
            Ok(None) => T::default(),
            Err(e) => {
                tracing::warn!(
                    path = %file.path().display(),
                    error = %e,
                    "State file unreadable, starting with empty aggregate"
                );
                T::default()
            }
        };
        Self {
            data: RwLock::new(data),
            file: Some(file),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        self.data.read().await
    }

    /// 在写锁内修改并立即落盘，落盘完成后才释放锁
    ///
    /// 落盘聚合先改副本，写盘成功后才替换内存中的数据；写盘失败时内存保持原样。
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        let mut guard = self.data.write().await;
        let Some(file) = &self.file else {
            return Ok(f(&mut *guard));
        };
        let mut next = guard.clone();
        let out = f(&mut next);
        file.save(&next).await?;
        *guard = next;
        Ok(out)
    }
}
