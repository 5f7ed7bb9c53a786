//! Runtime state persistence
//!
//! The runtime directory is lost when the instance is torn down. The files
//! listed in [`SNAPSHOT_FILES`] are mirrored to a durable backup directory
//! so the next instance can start from the last working routing document
//! and selection cache, even if the subscription source is down.

use crate::common::fs::{has_min_size, write_atomic};
use crate::config::{ProxyConfig, CACHE_FILE_NAME, CONFIG_FILE_NAME};
use crate::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Files making up a snapshot
pub const SNAPSHOT_FILES: &[&str] = &[CONFIG_FILE_NAME, CACHE_FILE_NAME];

/// Smallest backup `config.yaml` considered usable
pub const MIN_SNAPSHOT_SIZE: u64 = 256;

/// Mirrors snapshot files between the runtime and backup directories
#[derive(Debug, Clone)]
pub struct StateSync {
    runtime_dir: PathBuf,
    backup_dir: Option<PathBuf>,
}

impl StateSync {
    pub fn new(config: &ProxyConfig) -> Self {
        StateSync {
            runtime_dir: config.config_dir.clone(),
            backup_dir: config.backup_dir.clone(),
        }
    }

    pub fn backup_dir(&self) -> Option<&Path> {
        self.backup_dir.as_deref()
    }

    /// Whether the backup holds a usable routing document
    pub async fn has_snapshot(&self) -> bool {
        match self.backup_dir {
            Some(ref dir) => has_min_size(&dir.join(CONFIG_FILE_NAME), MIN_SNAPSHOT_SIZE).await,
            None => false,
        }
    }

    /// Copy the snapshot into the runtime directory
    ///
    /// Returns true if at least the routing document was restored. Failures
    /// are logged; a partial restore is still better than none.
    pub async fn restore(&self) -> bool {
        let Some(ref backup_dir) = self.backup_dir else {
            return false;
        };

        if !self.has_snapshot().await {
            debug!("No usable snapshot in {}", backup_dir.display());
            return false;
        }

        let mut restored = 0usize;
        for name in SNAPSHOT_FILES {
            let src = backup_dir.join(name);
            if !src.is_file() {
                continue;
            }
            match copy_file(&src, &self.runtime_dir.join(name)).await {
                Ok(()) => restored += 1,
                Err(e) => warn!("Restore of {} failed: {}", name, e),
            }
        }

        if restored > 0 {
            info!("Restored {} file(s) from {}", restored, backup_dir.display());
        }
        self.runtime_dir.join(CONFIG_FILE_NAME).is_file()
    }

    /// Copy changed snapshot files into the backup directory
    ///
    /// Returns the number of files written; identical files are skipped.
    pub async fn backup(&self) -> Result<usize> {
        let Some(ref backup_dir) = self.backup_dir else {
            return Ok(0);
        };

        tokio::fs::create_dir_all(backup_dir).await?;

        let mut written = 0usize;
        for name in SNAPSHOT_FILES {
            let src = self.runtime_dir.join(name);
            if !src.is_file() {
                continue;
            }

            let dest = backup_dir.join(name);
            let data = tokio::fs::read(&src).await?;
            if let Ok(existing) = tokio::fs::read(&dest).await {
                if existing == data {
                    debug!("{} unchanged, skipping", name);
                    continue;
                }
            }

            write_atomic(&dest, &data).await?;
            written += 1;
        }

        if written > 0 {
            info!("Backed up {} file(s) to {}", written, backup_dir.display());
        }
        Ok(written)
    }
}

async fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    let data = tokio::fs::read(src).await?;
    write_atomic(dest, &data).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_in(root: &Path, backup: bool) -> StateSync {
        let config = ProxyConfig {
            config_dir: root.join("run"),
            backup_dir: backup.then(|| root.join("backup")),
            ..Default::default()
        };
        StateSync::new(&config)
    }

    fn routing_document() -> Vec<u8> {
        let mut doc = String::from("mixed-port: 7890\nproxies:\n");
        for i in 0..20 {
            doc.push_str(&format!("  - {{name: node-{}, type: ss, server: 10.0.0.{}}}\n", i, i));
        }
        doc.into_bytes()
    }

    #[tokio::test]
    async fn test_no_backup_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), false);

        assert!(!sync.has_snapshot().await);
        assert!(!sync.restore().await);
        assert_eq!(sync.backup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backup_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), true);
        let run = dir.path().join("run");
        std::fs::create_dir_all(&run).unwrap();
        std::fs::write(run.join(CONFIG_FILE_NAME), routing_document()).unwrap();
        std::fs::write(run.join(CACHE_FILE_NAME), b"cache").unwrap();

        assert_eq!(sync.backup().await.unwrap(), 2);
        assert!(sync.has_snapshot().await);

        std::fs::remove_dir_all(&run).unwrap();
        assert!(sync.restore().await);
        assert_eq!(std::fs::read(run.join(CONFIG_FILE_NAME)).unwrap(), routing_document());
        assert_eq!(std::fs::read(run.join(CACHE_FILE_NAME)).unwrap(), b"cache");
    }

    #[tokio::test]
    async fn test_identical_files_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), true);
        let run = dir.path().join("run");
        std::fs::create_dir_all(&run).unwrap();
        std::fs::write(run.join(CONFIG_FILE_NAME), routing_document()).unwrap();

        assert_eq!(sync.backup().await.unwrap(), 1);
        assert_eq!(sync.backup().await.unwrap(), 0);

        std::fs::write(run.join(CACHE_FILE_NAME), b"new cache").unwrap();
        assert_eq!(sync.backup().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_small_snapshot_not_restored() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path(), true);
        let backup = dir.path().join("backup");
        std::fs::create_dir_all(&backup).unwrap();
        std::fs::write(backup.join(CONFIG_FILE_NAME), b"mixed-port: 1\n").unwrap();

        assert!(!sync.has_snapshot().await);
        assert!(!sync.restore().await);
        assert!(!dir.path().join("run").join(CONFIG_FILE_NAME).exists());
    }
}
