//! Socket directory selection and per-VM socket paths.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use uuid::Uuid;

use crate::error::{Result, VmError};

/// Socket directory candidates, in order of preference.
const SOCKET_DIR_CANDIDATES: &[&str] = &["/run/marathon", "/var/run/marathon", "/tmp/marathon", "/tmp"];

/// Well-known path of the vsock UDS baked into the baseline snapshot.
/// Renamed to the per-instance path after a successful restore.
pub const SNAPSHOT_BASE_VSOCK: &str = "/run/marathon/snapshot-base-vsock.sock";

static SOCKET_DIR: OnceLock<Option<PathBuf>> = OnceLock::new();

/// The process-wide socket directory.
///
/// Chosen once on first use: the first candidate that can be created and in
/// which a probe file can be written and deleted. The choice is cached for
/// the process lifetime.
pub fn socket_dir() -> Result<&'static Path> {
    SOCKET_DIR
        .get_or_init(|| {
            SOCKET_DIR_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .find(|dir| probe_dir(dir))
        })
        .as_deref()
        .ok_or(VmError::NoSocketDir)
}

/// Check that `dir` is usable: creatable, and a probe file can be written
/// and removed.
fn probe_dir(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(format!(".marathon-probe-{}", std::process::id()));
    if std::fs::write(&probe, b"").is_err() {
        return false;
    }
    std::fs::remove_file(&probe).is_ok()
}

/// Per-VM socket paths, derived deterministically from the VM id.
#[derive(Debug, Clone)]
pub struct VmPaths {
    api_sock: PathBuf,
    vsock: PathBuf,
}

impl VmPaths {
    pub fn for_vm(id: Uuid) -> Result<Self> {
        let dir = socket_dir()?;
        let hex = id.simple();
        Ok(Self {
            api_sock: dir.join(format!("firecracker-{hex}.sock")),
            vsock: dir.join(format!("firecracker-{hex}-vsock.sock")),
        })
    }

    pub fn api_sock(&self) -> &Path {
        &self.api_sock
    }

    pub fn vsock(&self) -> &Path {
        &self.vsock
    }

    /// Remove stale socket files left behind by a previous process.
    pub fn remove_stale(&self) {
        let _ = std::fs::remove_file(&self.api_sock);
        let _ = std::fs::remove_file(&self.vsock);
    }
}
