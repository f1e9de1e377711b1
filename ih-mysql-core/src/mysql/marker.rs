//! Local bootstrap marker
//!
//! The marker's presence means the node finished bootstrapping; it is
//! written only as the last step of a successful run.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::abstractions::FileSystem;
use crate::error::BootstrapResult;
use crate::types::Role;

/// What a completed bootstrap recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerRecord {
    Master,
    Replica { master_ip: Option<String> },
}

impl MarkerRecord {
    pub fn role(&self) -> Role {
        match self {
            MarkerRecord::Master => Role::Master,
            MarkerRecord::Replica { .. } => Role::Replica,
        }
    }

    /// Parse marker contents; unknown contents yield `None`
    pub fn parse(contents: &str) -> Option<Self> {
        let line = contents.lines().next().unwrap_or_default().trim();
        match line.split_once(':') {
            None if line == "master" => Some(MarkerRecord::Master),
            None if line == "replica" => Some(MarkerRecord::Replica { master_ip: None }),
            Some(("replica", ip)) if !ip.is_empty() => Some(MarkerRecord::Replica {
                master_ip: Some(ip.to_string()),
            }),
            _ => None,
        }
    }
}

/// Renders the single marker line, newline included
impl fmt::Display for MarkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerRecord::Master => writeln!(f, "master"),
            MarkerRecord::Replica { master_ip: Some(ip) } => writeln!(f, "replica:{}", ip),
            MarkerRecord::Replica { master_ip: None } => writeln!(f, "replica"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapMarker {
    path: PathBuf,
}

impl BootstrapMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self, fs: &dyn FileSystem) -> BootstrapResult<bool> {
        fs.exists(&self.path).await
    }

    /// Recorded outcome, `None` when no marker exists or it is unreadable
    pub async fn read(&self, fs: &dyn FileSystem) -> BootstrapResult<Option<MarkerRecord>> {
        if !fs.exists(&self.path).await? {
            return Ok(None);
        }
        let contents = fs.read_to_string(&self.path).await?;
        Ok(MarkerRecord::parse(&contents))
    }

    /// Write the marker, creating its parent directory if needed
    pub async fn write(&self, fs: &dyn FileSystem, record: &MarkerRecord) -> BootstrapResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !fs.exists(parent).await? {
                debug!("Creating marker directory {}", parent.display());
                fs.create_dir_all(parent).await?;
            }
        }
        fs.write_string(&self.path, &record.to_string()).await
    }
}
