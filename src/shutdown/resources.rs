// External resources closed at the end of shutdown
// Anything the service holds besides workers (shared connections, pid file) exposes a single close()

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// A resource closed once, after every worker reached a terminal outcome
#[async_trait]
pub trait ExternalResource: Send + Sync {
    fn name(&self) -> &str;

    async fn close(&self) -> Result<()>;
}

/// Pid file of the running supervisor; removed on close
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        std::fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write pid file {}", path.display()))?;
        info!(path = %path.display(), "Pid file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the pid stored in a pid file
    pub fn read(path: impl AsRef<Path>) -> Result<i32> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pid file {}", path.display()))?;
        contents
            .trim()
            .parse()
            .with_context(|| format!("Pid file {} is corrupt", path.display()))
    }
}

#[async_trait]
impl ExternalResource for PidFile {
    fn name(&self) -> &str {
        "pid-file"
    }

    async fn close(&self) -> Result<()> {
        tokio::fs::remove_file(&self.path)
            .await
            .with_context(|| format!("Failed to remove pid file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pear-fleet.pid");

        let pid_file = PidFile::create(&path).unwrap();
        assert_eq!(PidFile::read(&path).unwrap(), std::process::id() as i32);

        tokio_test::assert_ok!(pid_file.close().await);
        assert!(!path.exists());

        // Closing twice reports the failure instead of hiding it
        assert!(pid_file.close().await.is_err());
    }
}
