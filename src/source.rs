//! Where a container comes from.

use std::io::Cursor;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek};

/// A readable, seekable byte stream.
pub trait PatchStream: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> PatchStream for T {}

/// Obtains the container stream. A failure here is terminal for the run.
#[async_trait]
pub trait PatchSource: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PatchStream>>;

    /// Human-readable origin, used in logs and progress labels.
    fn describe(&self) -> String;
}

/// A container on the local file system.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        assert!(!path.as_os_str().is_empty(), "patch path must not be empty");
        Self { path }
    }
}

#[async_trait]
impl PatchSource for FileSource {
    async fn open(&self) -> Result<Box<dyn PatchStream>> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open patch file: {}", self.path.display()))?;
        Ok(Box::new(file))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// A container already held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    bytes: Vec<u8>,
}

impl MemorySource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

#[async_trait]
impl PatchSource for MemorySource {
    async fn open(&self) -> Result<Box<dyn PatchStream>> {
        Ok(Box::new(Cursor::new(self.bytes.clone())))
    }

    fn describe(&self) -> String {
        format!("<memory, {} bytes>", self.bytes.len())
    }
}
