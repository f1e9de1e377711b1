//! Filesystem abstractions for testability
//!
//! Only the operations the bootstrap marker needs are abstracted.

use crate::error::BootstrapResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Abstraction for filesystem operations
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn exists(&self, path: &Path) -> BootstrapResult<bool>;

    /// Create a directory (including parents)
    async fn create_dir_all(&self, path: &Path) -> BootstrapResult<()>;

    async fn read_to_string(&self, path: &Path) -> BootstrapResult<String>;

    async fn write_string(&self, path: &Path, contents: &str) -> BootstrapResult<()>;
}

/// Production filesystem implementation
pub struct TokioFileSystem;

impl TokioFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn exists(&self, path: &Path) -> BootstrapResult<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn create_dir_all(&self, path: &Path) -> BootstrapResult<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn read_to_string(&self, path: &Path) -> BootstrapResult<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write_string(&self, path: &Path, contents: &str) -> BootstrapResult<()> {
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}

/// Mock filesystem for testing
#[derive(Clone, Default)]
pub struct MockFileSystem {
    files: Arc<RwLock<HashMap<PathBuf, String>>>,
    dirs: Arc<RwLock<Vec<PathBuf>>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files.write().insert(path.into(), contents.into());
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.files.read().get(path).cloned()
    }

    /// Directories created through `create_dir_all`
    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.dirs.read().clone()
    }
}

#[async_trait]
impl FileSystem for MockFileSystem {
    async fn exists(&self, path: &Path) -> BootstrapResult<bool> {
        Ok(self.files.read().contains_key(path) || self.dirs.read().iter().any(|d| d == path))
    }

    async fn create_dir_all(&self, path: &Path) -> BootstrapResult<()> {
        self.dirs.write().push(path.to_path_buf());
        Ok(())
    }

    async fn read_to_string(&self, path: &Path) -> BootstrapResult<String> {
        self.files.read().get(path).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )
            .into()
        })
    }

    async fn write_string(&self, path: &Path, contents: &str) -> BootstrapResult<()> {
        self.files
            .write()
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_filesystem_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let fs = TokioFileSystem::new();
        let nested = dir.path().join("a/b");
        let file = nested.join("marker");

        assert!(!fs.exists(&file).await.unwrap());
        fs.create_dir_all(&nested).await.unwrap();
        fs.write_string(&file, "master\n").await.unwrap();
        assert!(fs.exists(&file).await.unwrap());
        assert_eq!(fs.read_to_string(&file).await.unwrap(), "master\n");
    }

    #[tokio::test]
    async fn test_mock_filesystem_missing_file_is_io_error() {
        let fs = MockFileSystem::new();
        let err = fs.read_to_string(Path::new("/nope")).await.unwrap_err();
        assert!(matches!(err, crate::error::BootstrapError::Io(_)));
    }
}
