//! File-based storage backend.
//!
//! [`FileBackend`] keeps one file per key at `<dir>/<key>.json`. The file
//! holds the version on its first line followed by the raw value:
//!
//! ```text
//! 3
//! {"3f2a...":{"taskId":"3f2a...","docHash":"abc",...}}
//! ```
//!
//! Writes go to a sibling temporary file which is synced and then renamed
//! over the target, after which the directory itself is synced. A crash
//! leaves either the old or the new value and never a torn one. All
//! operations are serialized by an internal async mutex; the backend is
//! meant for a single host process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};

/// Upper bound on key length, keeps file names well inside platform limits.
const MAX_KEY_LENGTH: usize = 128;

/// Durable [`StorageBackend`] backed by a directory of files.
///
/// # Examples
///
/// ```no_run
/// use doc_orchestrator::store::file::FileBackend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = FileBackend::open("./data").await?;
/// assert_eq!(backend.dir(), std::path::Path::new("./data"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    io_lock: Mutex<()>,
}

impl FileBackend {
    /// Opens (creating if needed) a backend rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the directory cannot be created.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(format!("creating {}", dir.display()), e))?;
        Ok(Self {
            dir,
            io_lock: Mutex::new(()),
        })
    }

    /// The directory this backend writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(StorageError::Backend {
                message: format!("key length out of bounds: {}", key.len()),
                source: None,
            });
        }
        if !key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(StorageError::Backend {
                message: format!("unsafe key for filesystem path: {key:?}"),
                source: None,
            });
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    async fn read_current(
        &self,
        key: &str,
        path: &Path,
    ) -> Result<Option<VersionedRecord>, StorageError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(format!("reading {}", path.display()), e)),
        };
        decode(key, &raw).map(Some)
    }

    async fn write_atomic(
        &self,
        path: &Path,
        version: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StorageError::io(format!("creating {}", tmp.display()), e))?;

        let mut contents = format!("{version}\n").into_bytes();
        contents.extend_from_slice(data);
        file.write_all(&contents)
            .await
            .map_err(|e| StorageError::io(format!("writing {}", tmp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(format!("syncing {}", tmp.display()), e))?;
        drop(file);

        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            StorageError::io(
                format!("rename {} -> {}", tmp.display(), path.display()),
                e,
            )
        })?;
        self.sync_dir().await
    }

    /// Flushes the directory entry so a completed rename survives a crash.
    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<(), StorageError> {
        let dir = tokio::fs::File::open(&self.dir)
            .await
            .map_err(|e| StorageError::io(format!("opening {}", self.dir.display()), e))?;
        dir.sync_all()
            .await
            .map_err(|e| StorageError::io(format!("syncing {}", self.dir.display()), e))
    }

    // Directories cannot be opened as files here; rename durability is
    // left to the filesystem.
    #[cfg(not(unix))]
    async fn sync_dir(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

fn decode(key: &str, raw: &[u8]) -> Result<VersionedRecord, StorageError> {
    let corrupt = |what: &str| StorageError::Backend {
        message: format!("corrupt record for key {key}: {what}"),
        source: None,
    };
    let newline = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| corrupt("missing version header"))?;
    let version = std::str::from_utf8(&raw[..newline])
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| corrupt("invalid version header"))?;
    Ok(VersionedRecord {
        data: raw[newline + 1..].to_vec(),
        version,
    })
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.io_lock.lock().await;
        self.read_current(key, &path)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.io_lock.lock().await;
        let current = self
            .read_current(key, &path)
            .await?
            .map_or(0, |r| r.version);
        let new_version = current + 1;
        self.write_atomic(&path, new_version, data).await?;
        Ok(new_version)
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.io_lock.lock().await;
        let current = self
            .read_current(key, &path)
            .await?
            .map_or(0, |r| r.version);
        if current != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current,
            });
        }
        let new_version = current + 1;
        self.write_atomic(&path, new_version, data).await?;
        Ok(new_version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        let _guard = self.io_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(format!("removing {}", path.display()), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        assert_eq!(backend.put("toc_tasks", b"{}").await.unwrap(), 1);
        let record = backend.get("toc_tasks").await.unwrap();
        assert_eq!(record.data, b"{}");
        assert_eq!(record.version, 1);

        let on_disk = std::fs::read_to_string(dir.path().join("toc_tasks.json")).unwrap();
        assert_eq!(on_disk, "1\n{}");
    }

    #[tokio::test]
    async fn write_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        backend.put("toc_tasks", b"{}").await.unwrap();
        backend.put_if_version("toc_tasks", b"{\"a\":1}", 1).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["toc_tasks.json".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn directory_sync_reaches_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        let backend = FileBackend::open(&root).await.unwrap();
        assert!(backend.sync_dir().await.is_ok());

        std::fs::remove_dir(&root).unwrap();
        assert!(matches!(
            backend.sync_dir().await,
            Err(StorageError::Backend { .. })
        ));
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        assert!(matches!(
            backend.get("chunking_tasks").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cas_semantics_match_memory_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        assert_eq!(backend.put_if_version("k", b"a", 0).await.unwrap(), 1);
        assert!(matches!(
            backend.put_if_version("k", b"b", 0).await,
            Err(StorageError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            })
        ));
        assert_eq!(backend.put_if_version("k", b"b", 1).await.unwrap(), 2);
        assert_eq!(backend.get("k").await.unwrap().data, b"b");
    }

    #[tokio::test]
    async fn rejects_path_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        for key in ["../escape", "a/b", "", "with space"] {
            assert!(
                matches!(backend.put(key, b"x").await, Err(StorageError::Backend { .. })),
                "key {key:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn corrupt_header_is_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k.json"), b"not-a-version\n{}").unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        let err = backend.get("k").await.unwrap_err();
        assert!(err.to_string().contains("invalid version header"));
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).await.unwrap();
        backend.put("k", b"x").await.unwrap();
        assert!(backend.delete("k").await.unwrap());
        assert!(!dir.path().join("k.json").exists());
        assert!(!backend.delete("k").await.unwrap());
    }
}
