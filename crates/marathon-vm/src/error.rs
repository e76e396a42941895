use std::path::PathBuf;

use crate::instance::VmState;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("firecracker binary not found: {0}")]
    FirecrackerNotFound(PathBuf),

    #[error("kernel image not found: {0}")]
    KernelNotFound(PathBuf),

    #[error("rootfs image not found: {0}")]
    RootfsNotFound(PathBuf),

    #[error("firecracker start failed: {0}")]
    FirecrackerStartFailed(String),

    #[error("firecracker api call failed: {endpoint}: {detail}")]
    ApiCallFailed { endpoint: String, detail: String },

    #[error("guest vsock socket did not appear: {0}")]
    VsockTimeout(PathBuf),

    #[error("guest vsock socket not ready after restore: {0}")]
    VsockNotReady(PathBuf),

    #[error("no writable socket directory available")]
    NoSocketDir,

    #[error("vm is {0}, expected ready")]
    NotReady(VmState),

    #[error("no vm slot available")]
    NoAvailableVm,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmError>;
