//! 键值存储实现
//!
//! - `FileStore`：每个键一个文件，先写临时文件再 rename，保证原子替换
//! - `MemoryStore`：进程内存储，测试和一次性运行使用

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::StoreError;
use crate::services::PersistentStore;

const TMP_SUFFIX: &str = ".tmp";
/// 文件名里 ':' 的转义；合法键不含 '%'，所以还原没有歧义
const COLON_ESCAPE: &str = "%3A";

/// 文件目录存储
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// 打开（必要时创建）存储目录
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::WriteFailed {
                key: root.display().to_string(),
                source,
            })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.ends_with(TMP_SUFFIX)
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
            && !key.starts_with('.');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        // ':' 在部分文件系统上不可用
        Ok(self.root.join(key.replace(':', COLON_ESCAPE)))
    }

    fn key_for(file_name: &str) -> String {
        file_name.replace(COLON_ESCAPE, ":")
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::ReadFailed {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let tmp = path.with_file_name(format!(
            "{}{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("entry"),
            TMP_SUFFIX
        ));

        let write_err = |source| StoreError::WriteFailed {
            key: key.to_string(),
            source,
        };

        fs::write(&tmp, &value).await.map_err(write_err)?;
        if let Err(source) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(write_err(source));
        }
        debug!("写入 {} ({} 字节)", key, value.len());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::RemoveFailed {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let read_err = |source| StoreError::ReadFailed {
            key: self.root.display().to_string(),
            source,
        };

        let mut entries = fs::read_dir(&self.root).await.map_err(read_err)?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let key = Self::key_for(&name);
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 直接改写原始字节（测试损坏场景用）
    pub fn overwrite_raw(&self, key: &str, value: Vec<u8>) {
        self.lock().insert(key.to_string(), value);
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
