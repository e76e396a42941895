//! One Firecracker microVM: child process, API socket, guest vsock endpoint.
//!
//! An instance owns three resources — the Firecracker child, its control UDS,
//! and the guest-facing vsock UDS — plus a host TAP device. Cleanup runs on
//! every exit path: explicitly via [`VmInstance::stop`], and as a last resort
//! in `Drop`.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::ApiClient;
use crate::catalog::SnapshotInfo;
use crate::error::{Result, VmError};
use crate::network::{self, TapDevice};
use crate::paths::{SNAPSHOT_BASE_VSOCK, VmPaths};

/// Kernel command line used for cold boots.
const KERNEL_CMDLINE: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// How long to wait for the Firecracker API socket after spawn.
const API_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Vsock readiness polling: 500 ms per attempt.
const VSOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Attempts after a cold boot (15 s total; slow hosts need it).
const COLD_BOOT_VSOCK_ATTEMPTS: u32 = 30;
/// Attempts after a snapshot restore (5 s total).
const RESTORE_VSOCK_ATTEMPTS: u32 = 10;

/// Artifact paths and machine shape shared by every VM on the node.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub firecracker_bin: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Creating,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => f.write_str("creating"),
            Self::Ready => f.write_str("ready"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

pub struct VmInstance {
    id: Uuid,
    state: VmState,
    process: Option<tokio::process::Child>,
    paths: VmPaths,
    cid: u32,
    tap: Option<TapDevice>,
    task_id: Option<Uuid>,
    started_at: Option<Instant>,
}

impl VmInstance {
    /// Allocate an instance: fresh id, derived socket paths, random CID.
    /// No process is spawned until [`boot`](Self::boot) or
    /// [`restore`](Self::restore).
    pub fn new() -> Result<Self> {
        let id = Uuid::new_v4();
        let paths = VmPaths::for_vm(id)?;
        // Guest CID, uniform over [3, 2^32 - 4). 0-2 are reserved by vsock.
        let cid = rand::rng().random_range(3..u32::MAX - 3);
        Ok(Self {
            id,
            state: VmState::Creating,
            process: None,
            paths,
            cid,
            tap: None,
            task_id: None,
            started_at: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn vsock_path(&self) -> &Path {
        self.paths.vsock()
    }

    pub fn task_id(&self) -> Option<Uuid> {
        self.task_id
    }

    /// Time since the VM reached `ready`, when it has.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    // -- lifecycle --

    /// Cold-boot the VM: spawn Firecracker, configure it over the API
    /// socket, start the instance, and wait for the guest vsock endpoint.
    pub async fn boot(&mut self, config: &VmConfig) -> Result<()> {
        check_artifacts(config)?;
        self.spawn_process(config).await?;

        if let Err(e) = self.configure_and_start(config).await {
            self.fail_cleanup().await;
            self.state = VmState::Failed;
            return Err(e);
        }

        if !self.wait_for_vsock(COLD_BOOT_VSOCK_ATTEMPTS).await {
            self.fail_cleanup().await;
            self.state = VmState::Failed;
            return Err(VmError::VsockTimeout(self.paths.vsock().to_path_buf()));
        }

        self.mark_ready();
        info!(id = %self.id.simple(), cid = self.cid, "vm booted");
        Ok(())
    }

    /// Restore the VM from a snapshot, falling back to a cold boot when the
    /// snapshot vsock directory is unwritable, the load fails, or the vsock
    /// rename fails.
    pub async fn restore(&mut self, config: &VmConfig, snapshot: &SnapshotInfo) -> Result<()> {
        check_artifacts(config)?;

        let base_vsock = Path::new(SNAPSHOT_BASE_VSOCK);
        let writable = base_vsock.parent().is_some_and(dir_writable);
        if !writable {
            warn!(id = %self.id.simple(), "snapshot vsock dir not writable, falling back to cold boot");
            return self.boot(config).await;
        }

        self.spawn_process(config).await?;

        if let Err(e) = self.load_snapshot(snapshot).await {
            warn!(id = %self.id.simple(), error = %e, "snapshot load failed, falling back to cold boot");
            self.fail_cleanup().await;
            return self.boot(config).await;
        }

        // The restored guest is already listening on the snapshot-time vsock
        // path; move it to this instance's path so the runner can find it.
        if let Err(e) = tokio::fs::rename(base_vsock, self.paths.vsock()).await {
            warn!(id = %self.id.simple(), error = %e, "snapshot vsock rename failed, falling back to cold boot");
            self.fail_cleanup().await;
            return self.boot(config).await;
        }

        if !self.wait_for_vsock(RESTORE_VSOCK_ATTEMPTS).await {
            self.fail_cleanup().await;
            self.state = VmState::Failed;
            return Err(VmError::VsockNotReady(self.paths.vsock().to_path_buf()));
        }

        self.mark_ready();
        info!(id = %self.id.simple(), snapshot = %snapshot.name, "vm restored from snapshot");
        Ok(())
    }

    /// Kill the child, reap it, delete both socket files, tear down the TAP
    /// device. Idempotent.
    pub async fn stop(&mut self) {
        if self.state == VmState::Stopped {
            return;
        }
        self.state = VmState::Stopping;

        if let Some(mut child) = self.process.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.paths.remove_stale();
        if let Some(tap) = self.tap.take() {
            network::delete_tap(&tap).await;
        }

        self.task_id = None;
        self.state = VmState::Stopped;
        debug!(id = %self.id.simple(), "vm stopped");
    }

    // -- task binding --

    /// Bind a task: `ready -> running`.
    pub fn assign_task(&mut self, task_id: Uuid) -> Result<()> {
        if self.state != VmState::Ready {
            return Err(VmError::NotReady(self.state));
        }
        self.state = VmState::Running;
        self.task_id = Some(task_id);
        Ok(())
    }

    /// Unbind the task: `running -> ready`.
    pub fn release_task(&mut self) {
        self.task_id = None;
        if self.state == VmState::Running {
            self.state = VmState::Ready;
        }
    }

    // -- internals --

    async fn spawn_process(&mut self, config: &VmConfig) -> Result<()> {
        self.paths.remove_stale();
        if self.tap.is_none() {
            self.tap = Some(network::create_tap().await);
        }

        let mut child = tokio::process::Command::new(&config.firecracker_bin)
            .arg("--api-sock")
            .arg(self.paths.api_sock())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VmError::FirecrackerStartFailed(format!("spawn firecracker: {e}")))?;

        forward_process_logs(&self.id, &mut child);
        self.process = Some(child);

        let client = ApiClient::new(self.paths.api_sock());
        if let Err(e) = client.wait_for_ready(API_READY_TIMEOUT).await {
            self.fail_cleanup().await;
            self.state = VmState::Failed;
            return Err(e);
        }
        Ok(())
    }

    async fn configure_and_start(&self, config: &VmConfig) -> Result<()> {
        let client = ApiClient::new(self.paths.api_sock());

        client
            .put(
                "/boot-source",
                &serde_json::json!({
                    "kernel_image_path": config.kernel_path.display().to_string(),
                    "boot_args": KERNEL_CMDLINE,
                }),
            )
            .await?;

        client
            .put(
                "/drives/rootfs",
                &serde_json::json!({
                    "drive_id": "rootfs",
                    "path_on_host": config.rootfs_path.display().to_string(),
                    "is_root_device": true,
                    "is_read_only": false,
                }),
            )
            .await?;

        client
            .put(
                "/vsock",
                &serde_json::json!({
                    "vsock_id": "vsock0",
                    "guest_cid": self.cid,
                    "uds_path": self.paths.vsock().display().to_string(),
                }),
            )
            .await?;

        client
            .put(
                "/machine-config",
                &serde_json::json!({
                    "vcpu_count": config.vcpu_count,
                    "mem_size_mib": config.mem_size_mib,
                }),
            )
            .await?;

        client
            .put("/actions", &serde_json::json!({"action_type": "InstanceStart"}))
            .await?;

        Ok(())
    }

    async fn load_snapshot(&self, snapshot: &SnapshotInfo) -> Result<()> {
        let client = ApiClient::new(self.paths.api_sock());
        client
            .put(
                "/snapshot/load",
                &serde_json::json!({
                    "snapshot_path": snapshot.snapshot_file().display().to_string(),
                    "mem_file_path": snapshot.mem_file().display().to_string(),
                    "resume_vm": true,
                }),
            )
            .await
    }

    /// Poll for the guest vsock UDS. Returns `true` once it exists.
    async fn wait_for_vsock(&self, attempts: u32) -> bool {
        for _ in 0..attempts {
            if is_unix_socket(self.paths.vsock()) {
                return true;
            }
            tokio::time::sleep(VSOCK_POLL_INTERVAL).await;
        }
        false
    }

    pub(crate) fn mark_ready(&mut self) {
        self.state = VmState::Ready;
        self.started_at = Some(Instant::now());
    }

    /// Kill and reap the child, delete sockets, tear down the TAP device.
    /// Used on every failed start path before returning or falling back.
    async fn fail_cleanup(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.paths.remove_stale();
        if let Some(tap) = self.tap.take() {
            network::delete_tap(&tap).await;
        }
    }
}

impl Drop for VmInstance {
    fn drop(&mut self) {
        // Last-resort cleanup for panics and early returns. TAP teardown is
        // async and runs in stop(); here we reclaim the child and sockets.
        if let Some(child) = self.process.as_mut() {
            let _ = child.start_kill();
        }
        self.paths.remove_stale();
    }
}

/// Forward Firecracker stdout/stderr lines into the node log.
fn forward_process_logs(id: &Uuid, child: &mut tokio::process::Child) {
    if let Some(stdout) = child.stdout.take() {
        let id = id.simple().to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    debug!(id = %id, "{line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let id = id.simple().to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!(id = %id, "stderr: {line}");
                }
            }
        });
    }
}

fn check_artifacts(config: &VmConfig) -> Result<()> {
    if !config.firecracker_bin.is_file() {
        return Err(VmError::FirecrackerNotFound(config.firecracker_bin.clone()));
    }
    if !config.kernel_path.is_file() {
        return Err(VmError::KernelNotFound(config.kernel_path.clone()));
    }
    if !config.rootfs_path.is_file() {
        return Err(VmError::RootfsNotFound(config.rootfs_path.clone()));
    }
    Ok(())
}

fn dir_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".marathon-wprobe-{}", std::process::id()));
    if std::fs::write(&probe, b"").is_err() {
        return false;
    }
    std::fs::remove_file(&probe).is_ok()
}

fn is_unix_socket(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_socket())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_config() -> VmConfig {
        VmConfig {
            firecracker_bin: PathBuf::from("/nonexistent/firecracker"),
            kernel_path: PathBuf::from("/nonexistent/vmlinux"),
            rootfs_path: PathBuf::from("/nonexistent/rootfs.ext4"),
            vcpu_count: 2,
            mem_size_mib: 2048,
        }
    }

    #[test]
    fn new_instance_is_creating_with_unique_sockets() {
        let a = VmInstance::new().unwrap();
        let b = VmInstance::new().unwrap();
        assert_eq!(a.state(), VmState::Creating);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.vsock_path(), b.vsock_path());
        assert!(a.task_id().is_none());
        assert!(a.uptime().is_none());
    }

    #[test]
    fn cid_is_in_valid_range() {
        for _ in 0..64 {
            let vm = VmInstance::new().unwrap();
            assert!(vm.cid() >= 3);
            assert!(vm.cid() < u32::MAX - 3);
        }
    }

    #[tokio::test]
    async fn boot_fails_fast_on_missing_firecracker() {
        let mut vm = VmInstance::new().unwrap();
        let err = vm.boot(&missing_config()).await.unwrap_err();
        assert!(matches!(err, VmError::FirecrackerNotFound(_)));
        // No process was spawned, so the state never left creating.
        assert_eq!(vm.state(), VmState::Creating);
    }

    #[tokio::test]
    async fn boot_distinguishes_missing_kernel_and_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("firecracker");
        std::fs::write(&bin, b"").unwrap();

        let mut config = missing_config();
        config.firecracker_bin = bin.clone();

        let mut vm = VmInstance::new().unwrap();
        let err = vm.boot(&config).await.unwrap_err();
        assert!(matches!(err, VmError::KernelNotFound(_)));

        config.kernel_path = bin.clone();
        let mut vm = VmInstance::new().unwrap();
        let err = vm.boot(&config).await.unwrap_err();
        assert!(matches!(err, VmError::RootfsNotFound(_)));
    }

    #[tokio::test]
    async fn restore_fails_fast_on_missing_artifacts() {
        let snapshot = SnapshotInfo {
            name: "base".into(),
            path: PathBuf::from("/nonexistent/base"),
            created_at: std::time::SystemTime::now(),
            total_size: 0,
        };
        let mut vm = VmInstance::new().unwrap();
        let err = vm.restore(&missing_config(), &snapshot).await.unwrap_err();
        assert!(matches!(err, VmError::FirecrackerNotFound(_)));
    }

    #[test]
    fn assign_task_requires_ready() {
        let mut vm = VmInstance::new().unwrap();
        let err = vm.assign_task(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, VmError::NotReady(VmState::Creating)));
    }

    #[test]
    fn assign_and_release_task_flip_state() {
        let mut vm = VmInstance::new().unwrap();
        vm.mark_ready();

        let task = Uuid::new_v4();
        vm.assign_task(task).unwrap();
        assert_eq!(vm.state(), VmState::Running);
        assert_eq!(vm.task_id(), Some(task));

        // Running VMs can't take a second task.
        assert!(vm.assign_task(Uuid::new_v4()).is_err());

        vm.release_task();
        assert_eq!(vm.state(), VmState::Ready);
        assert!(vm.task_id().is_none());
        assert!(vm.uptime().is_some());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut vm = VmInstance::new().unwrap();
        vm.stop().await;
        assert_eq!(vm.state(), VmState::Stopped);
        vm.stop().await;
        assert_eq!(vm.state(), VmState::Stopped);
        assert!(vm.task_id().is_none());
    }

    #[test]
    fn dir_writable_detects_access() {
        let dir = tempfile::tempdir().unwrap();
        assert!(dir_writable(dir.path()));
        assert!(!dir_writable(Path::new("/proc")));
    }
}
