//! Snapshot catalog.
//!
//! A valid snapshot is a directory containing two regular files: `snapshot`
//! (device state) and `mem` (guest memory). The catalog scans once at
//! construction; reloading is the caller's concern.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::error::Result;

/// Name of the snapshot returned by [`SnapshotCatalog::default_snapshot`].
pub const DEFAULT_SNAPSHOT_NAME: &str = "base";

/// One discovered snapshot. Immutable after discovery.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub name: String,
    pub path: PathBuf,
    pub created_at: SystemTime,
    pub total_size: u64,
}

impl SnapshotInfo {
    /// Path of the device-state file.
    pub fn snapshot_file(&self) -> PathBuf {
        self.path.join("snapshot")
    }

    /// Path of the guest-memory file.
    pub fn mem_file(&self) -> PathBuf {
        self.path.join("mem")
    }
}

pub struct SnapshotCatalog {
    snapshots: HashMap<String, SnapshotInfo>,
}

impl SnapshotCatalog {
    /// Scan `base_dir` for snapshots, creating the directory if missing.
    pub async fn load(base_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(base_dir).await?;

        let mut snapshots = HashMap::new();
        let mut entries = tokio::fs::read_dir(base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            match validate(&path).await {
                Some(total_size) => {
                    debug!(name = %name, total_size, "snapshot registered");
                    snapshots.insert(
                        name.clone(),
                        SnapshotInfo {
                            name,
                            path: path.canonicalize()?,
                            created_at: SystemTime::now(),
                            total_size,
                        },
                    );
                }
                None => {
                    warn!(path = %path.display(), "skipping directory without snapshot + mem files");
                }
            }
        }

        info!(count = snapshots.len(), dir = %base_dir.display(), "snapshot catalog loaded");
        Ok(Self { snapshots })
    }

    pub fn get_snapshot(&self, name: &str) -> Option<&SnapshotInfo> {
        self.snapshots.get(name)
    }

    /// The entry named `base`, if present.
    pub fn default_snapshot(&self) -> Option<&SnapshotInfo> {
        self.snapshots.get(DEFAULT_SNAPSHOT_NAME)
    }

    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        self.snapshots.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Check that `dir` holds regular `snapshot` and `mem` files; return their
/// summed size when both are present.
async fn validate(dir: &Path) -> Option<u64> {
    let mut total = 0u64;
    for file in ["snapshot", "mem"] {
        let meta = tokio::fs::metadata(dir.join(file)).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        total += meta.len();
    }
    Some(total)
}
