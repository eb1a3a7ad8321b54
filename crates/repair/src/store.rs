//! Content-hash-named cache of repaired documents

use crate::{repair_bytes, RebuildReport, RepairConfig, RepairError};
use quire_watchdog::CancellationToken;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PARTIAL_SUFFIX: &str = "partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// A previous repair of the same source was found
    Reused { path: PathBuf },
    Repaired { path: PathBuf, report: RebuildReport },
}

impl RepairOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Reused { path } | Self::Repaired { path, .. } => path,
        }
    }

    pub fn was_reused(&self) -> bool {
        matches!(self, Self::Reused { .. })
    }
}

/// Removes the file on drop unless committed
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), %err, "failed to remove partial repair output");
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepairStore {
    dir: PathBuf,
}

impl RepairStore {
    /// Create the directory if needed and drop partial files left by a crash
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RepairError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == PARTIAL_SUFFIX) {
                debug!(path = %path.display(), "removing stale partial repair");
                fs::remove_file(&path)?;
            }
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Identity of a source: SHA-256 of its locator string
    pub fn key_for(locator: &str) -> String {
        hex::encode(Sha256::digest(locator.as_bytes()))
    }

    pub fn path_for(&self, locator: &str) -> PathBuf {
        self.dir.join(format!("{}.pdf", Self::key_for(locator)))
    }

    pub fn lookup(&self, locator: &str) -> Option<PathBuf> {
        let path = self.path_for(locator);
        path.is_file().then_some(path)
    }

    /// Repair `source` unless a repaired copy for `locator` already exists
    pub fn repair(
        &self,
        locator: &str,
        source: &[u8],
        config: &RepairConfig,
        token: &CancellationToken,
    ) -> Result<RepairOutcome, RepairError> {
        if let Some(path) = self.lookup(locator) {
            debug!(path = %path.display(), "reusing repaired document");
            return Ok(RepairOutcome::Reused { path });
        }

        let (bytes, report) = repair_bytes(source, config, token)?;

        let path = self.path_for(locator);
        let partial = PartialFile::new(path.with_extension(format!("pdf.{PARTIAL_SUFFIX}")));
        fs::write(&partial.path, &bytes)?;
        token.check()?;
        fs::rename(&partial.path, &path)?;
        partial.commit();

        info!(
            path = %path.display(),
            leaves = report.leaf_count,
            depth = report.depth,
            "stored repaired document"
        );
        Ok(RepairOutcome::Repaired { path, report })
    }

    pub fn remove(&self, locator: &str) -> Result<bool, RepairError> {
        match fs::remove_file(self.path_for(locator)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove every stored document; returns how many were removed
    pub fn clear(&self) -> Result<usize, RepairError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
