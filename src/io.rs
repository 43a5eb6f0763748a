use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::TryStreamExt;
use object_store::{ObjectStore, aws::AmazonS3Builder, memory::InMemory, path::Path as ObjectPath};
use polars::{
    frame::DataFrame,
    prelude::{ParquetReader, ParquetWriter, SerReader},
};
use regex::Regex;

use crate::{
    config::{GeneralConfig, StorageType},
    error::{ConfigError, LockstepResult, StorageError},
};

/// Abstracts file I/O for the artifact store and the data sources.
///
/// Paths are forward-slash separated and relative to the backend root
/// (a workspace directory, a bucket, or an in-memory namespace). Tables
/// travel as parquet, everything else as JSON. Implementations must
/// provide read-after-write consistency for the keys they write and
/// atomic replacement of existing files; concurrent writers to the same
/// key are undefined and the scheduler must not issue them.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Writes a table as parquet, replacing any existing file atomically
    /// from a reader's perspective.
    async fn save_table(&self, path: &str, table: &DataFrame) -> LockstepResult<()>;

    /// Reads a table, or `None` when the path does not exist. A present
    /// but unreadable file is a fatal [`StorageError`].
    async fn load_table(&self, path: &str) -> LockstepResult<Option<DataFrame>>;

    async fn save_json(&self, path: &str, value: &serde_json::Value) -> LockstepResult<()>;

    async fn load_json(&self, path: &str) -> LockstepResult<Option<serde_json::Value>>;

    async fn exists(&self, path: &str) -> LockstepResult<bool>;

    /// Lists files below `prefix`, optionally filtered by a glob pattern
    /// (`*`, `?`) applied to the file name. Returned paths are
    /// backend-relative and sorted.
    async fn list(&self, prefix: &str, pattern: Option<&str>) -> LockstepResult<Vec<String>>;
}

/// Per-date partition prefix: `<base>/<YYYY>/<MM>`.
pub fn partition_prefix(base: &str, target: NaiveDateTime) -> String {
    format!("{base}/{}", target.format("%Y/%m"))
}

/// Builds the backend selected by the configuration.
pub fn backend_from_config(general: &GeneralConfig) -> LockstepResult<Arc<dyn StorageBackend>> {
    match general.storage_type {
        StorageType::Local => {
            let workspace = general.workspace.as_ref().ok_or_else(|| {
                ConfigError::Invalid("local storage requires general.workspace".to_string())
            })?;
            Ok(Arc::new(LocalBackend::new(workspace)))
        }
        StorageType::S3 => {
            let bucket = general.s3_bucket.as_ref().ok_or_else(|| {
                ConfigError::Invalid("s3 storage requires general.s3_bucket".to_string())
            })?;
            let region = general.s3_region.as_ref().ok_or_else(|| {
                ConfigError::Invalid("s3 storage requires general.s3_region".to_string())
            })?;
            Ok(Arc::new(ObjectBackend::amazon_s3(bucket, region)?))
        }
        StorageType::Memory => Ok(Arc::new(ObjectBackend::in_memory())),
    }
}

fn glob_to_regex(pattern: &str) -> LockstepResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| {
        StorageError::InvalidPath {
            path: pattern.to_string(),
            message: format!("invalid glob pattern: {e}"),
        }
        .into()
    })
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// ================================================================================================
// Local Filesystem Backend
// ================================================================================================

/// Filesystem backend rooted at a workspace directory.
///
/// Writes go to a temporary sibling first and are moved into place with a
/// rename, so readers observe either the old file or the new one, never a
/// torn write.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn prepare_write(&self, path: &str) -> LockstepResult<(PathBuf, PathBuf)> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|source| io_err(path, source))?;
        }
        let tmp = target.with_file_name(format!(
            "{}.tmp-{}",
            file_name(path),
            uuid::Uuid::new_v4().simple()
        ));
        Ok((target, tmp))
    }

    fn commit_write(&self, path: &str, tmp: &Path, target: &Path) -> LockstepResult<()> {
        std::fs::rename(tmp, target).map_err(|source| io_err(path, source).into())
    }

    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::walk(&path, root, out)?;
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn save_table(&self, path: &str, table: &DataFrame) -> LockstepResult<()> {
        let (target, tmp) = self.prepare_write(path)?;
        let file = std::fs::File::create(&tmp).map_err(|source| io_err(path, source))?;
        let mut table = table.clone();
        ParquetWriter::new(file)
            .finish(&mut table)
            .map_err(|e| corrupt_err(path, e.to_string()))?;
        self.commit_write(path, &tmp, &target)
    }

    async fn load_table(&self, path: &str) -> LockstepResult<Option<DataFrame>> {
        let target = self.resolve(path);
        if !target.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(&target).map_err(|source| io_err(path, source))?;
        ParquetReader::new(file)
            .finish()
            .map(Some)
            .map_err(|e| corrupt_err(path, e.to_string()).into())
    }

    async fn save_json(&self, path: &str, value: &serde_json::Value) -> LockstepResult<()> {
        let (target, tmp) = self.prepare_write(path)?;
        let payload =
            serde_json::to_vec_pretty(value).map_err(|e| corrupt_err(path, e.to_string()))?;
        std::fs::write(&tmp, payload).map_err(|source| io_err(path, source))?;
        self.commit_write(path, &tmp, &target)
    }

    async fn load_json(&self, path: &str) -> LockstepResult<Option<serde_json::Value>> {
        let target = self.resolve(path);
        if !target.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&target).map_err(|source| io_err(path, source))?;
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| corrupt_err(path, e.to_string()).into())
    }

    async fn exists(&self, path: &str) -> LockstepResult<bool> {
        Ok(self.resolve(path).exists())
    }

    async fn list(&self, prefix: &str, pattern: Option<&str>) -> LockstepResult<Vec<String>> {
        let dir = self.resolve(prefix);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        Self::walk(&dir, &self.root, &mut files).map_err(|source| io_err(prefix, source))?;

        if let Some(pattern) = pattern {
            let matcher = glob_to_regex(pattern)?;
            files.retain(|f| matcher.is_match(file_name(f)));
        }
        files.sort();
        Ok(files)
    }
}

fn io_err(path: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_string(),
        source,
    }
}

fn corrupt_err(path: &str, message: String) -> StorageError {
    StorageError::Corrupt {
        path: path.to_string(),
        message,
    }
}

// ================================================================================================
// Object Store Backend
// ================================================================================================

/// Backend over any [`object_store::ObjectStore`]: Amazon S3 for
/// deployments, the in-memory store for tests. Object stores give atomic
/// puts, which satisfies the replace-semantics contract without a rename
/// dance.
#[derive(Clone)]
pub struct ObjectBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn amazon_s3(bucket: &str, region: &str) -> LockstepResult<Self> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region)
            .build()
            .map_err(|e| StorageError::Backend {
                path: bucket.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self::new(Arc::new(store)))
    }

    fn object_path(&self, path: &str) -> LockstepResult<ObjectPath> {
        ObjectPath::parse(path).map_err(|e| {
            StorageError::InvalidPath {
                path: path.to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    async fn put_bytes(&self, path: &str, payload: Vec<u8>) -> LockstepResult<()> {
        let object_path = self.object_path(path)?;
        self.store
            .put(&object_path, payload.into())
            .await
            .map_err(|e| backend_err(path, e))?;
        Ok(())
    }

    async fn get_bytes(&self, path: &str) -> LockstepResult<Option<Vec<u8>>> {
        let object_path = self.object_path(path)?;
        match self.store.get(&object_path).await {
            Ok(result) => {
                let bytes = result.bytes().await.map_err(|e| backend_err(path, e))?;
                Ok(Some(bytes.to_vec()))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(backend_err(path, e).into()),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectBackend {
    async fn save_table(&self, path: &str, table: &DataFrame) -> LockstepResult<()> {
        let mut buffer = Vec::new();
        let mut table = table.clone();
        ParquetWriter::new(&mut buffer)
            .finish(&mut table)
            .map_err(|e| corrupt_err(path, e.to_string()))?;
        self.put_bytes(path, buffer).await
    }

    async fn load_table(&self, path: &str) -> LockstepResult<Option<DataFrame>> {
        match self.get_bytes(path).await? {
            Some(bytes) => ParquetReader::new(Cursor::new(bytes))
                .finish()
                .map(Some)
                .map_err(|e| corrupt_err(path, e.to_string()).into()),
            None => Ok(None),
        }
    }

    async fn save_json(&self, path: &str, value: &serde_json::Value) -> LockstepResult<()> {
        let payload =
            serde_json::to_vec_pretty(value).map_err(|e| corrupt_err(path, e.to_string()))?;
        self.put_bytes(path, payload).await
    }

    async fn load_json(&self, path: &str) -> LockstepResult<Option<serde_json::Value>> {
        match self.get_bytes(path).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corrupt_err(path, e.to_string()).into()),
            None => Ok(None),
        }
    }

    async fn exists(&self, path: &str) -> LockstepResult<bool> {
        let object_path = self.object_path(path)?;
        match self.store.head(&object_path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(backend_err(path, e).into()),
        }
    }

    async fn list(&self, prefix: &str, pattern: Option<&str>) -> LockstepResult<Vec<String>> {
        let object_prefix = self.object_path(prefix)?;
        let mut stream = self.store.list(Some(&object_prefix));

        let mut files = Vec::new();
        while let Some(meta) = stream
            .try_next()
            .await
            .map_err(|e| backend_err(prefix, e))?
        {
            files.push(meta.location.to_string());
        }

        if let Some(pattern) = pattern {
            let matcher = glob_to_regex(pattern)?;
            files.retain(|f| matcher.is_match(file_name(f)));
        }
        files.sort();
        Ok(files)
    }
}

fn backend_err(path: &str, source: object_store::Error) -> StorageError {
    StorageError::Backend {
        path: path.to_string(),
        message: source.to_string(),
    }
}
