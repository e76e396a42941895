//! Node runtime configuration.
//!
//! Every option is a CLI flag with a `MARATHON_*` environment fallback, so a
//! bare `marathon-node` reads its whole configuration from the environment.

use std::path::{Path, PathBuf};

use clap::Parser;
use marathon_vm::{PoolConfig, VmConfig};

use crate::error::{NodeError, NodeResult};

/// Warm pool default when the host has KVM.
const DEFAULT_WARM_TARGET_KVM: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "marathon-node", version)]
pub struct NodeConfig {
    /// Local listen address (reserved for the node control endpoint)
    #[arg(long, env = "MARATHON_LISTEN_ADDR", default_value = "0.0.0.0")]
    pub listen_addr: String,

    /// Local listen port
    #[arg(long, env = "MARATHON_LISTEN_PORT", default_value_t = 7201)]
    pub listen_port: u16,

    /// Orchestrator host to heartbeat against
    #[arg(long, env = "MARATHON_ORCHESTRATOR_HOST", default_value = "127.0.0.1")]
    pub orchestrator_host: String,

    /// Orchestrator port
    #[arg(long, env = "MARATHON_ORCHESTRATOR_PORT", default_value_t = 7200)]
    pub orchestrator_port: u16,

    /// Hard ceiling on concurrent VMs (warm + active)
    #[arg(long, env = "MARATHON_TOTAL_VM_SLOTS", default_value_t = 10)]
    pub total_vm_slots: usize,

    /// Desired warm pool size (default: 5 with KVM present, else 0)
    #[arg(long, env = "MARATHON_WARM_POOL_TARGET")]
    pub warm_pool_target: Option<usize>,

    /// Directory of snapshot subdirectories (each with snapshot + mem)
    #[arg(long, env = "MARATHON_SNAPSHOT_DIR", default_value = "/var/lib/marathon/snapshots")]
    pub snapshot_dir: PathBuf,

    /// Guest kernel image
    #[arg(long, env = "MARATHON_KERNEL", default_value = "/var/lib/marathon/vmlinux")]
    pub kernel: PathBuf,

    /// Root filesystem image
    #[arg(long, env = "MARATHON_ROOTFS", default_value = "/var/lib/marathon/rootfs.ext4")]
    pub rootfs: PathBuf,

    /// Firecracker binary
    #[arg(long, env = "MARATHON_FIRECRACKER_BIN", default_value = "/usr/local/bin/firecracker")]
    pub firecracker: PathBuf,

    /// Guest agent vsock service port
    #[arg(long, env = "MARATHON_VSOCK_PORT", default_value_t = 9999)]
    pub vsock_port: u32,

    /// Idle heartbeat interval in milliseconds
    #[arg(long, env = "MARATHON_HEARTBEAT_INTERVAL_MS", default_value_t = 5000)]
    pub heartbeat_interval_ms: u64,

    /// Shared heartbeat auth secret, 64 hex chars (32 bytes)
    #[arg(long, env = "MARATHON_AUTH_KEY")]
    pub auth_key: Option<String>,

    /// Wrap the orchestrator connection in TLS
    #[arg(long, env = "MARATHON_TLS", default_value_t = false)]
    pub tls: bool,

    /// CA certificate (PEM) for TLS server verification
    #[arg(long, env = "MARATHON_TLS_CA")]
    pub tls_ca: Option<PathBuf>,

    /// vCPUs per VM
    #[arg(long, env = "MARATHON_VCPU", default_value_t = 2)]
    pub vcpu: u32,

    /// Memory (MiB) per VM
    #[arg(long, env = "MARATHON_MEMORY_MB", default_value_t = 2048)]
    pub memory_mb: u32,
}

impl NodeConfig {
    /// Warm target, falling back on KVM presence when unset.
    pub fn resolved_warm_target(&self) -> usize {
        self.warm_pool_target.unwrap_or_else(|| {
            if kvm_present() {
                DEFAULT_WARM_TARGET_KVM
            } else {
                0
            }
        })
    }

    /// Decode the shared auth key; `None` when unconfigured.
    pub fn auth_key_bytes(&self) -> NodeResult<Option<Vec<u8>>> {
        let Some(hex) = self.auth_key.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let bytes = decode_hex(hex)
            .ok_or_else(|| NodeError::Config("auth key must be hex".into()))?;
        if bytes.len() != 32 {
            return Err(NodeError::Config(format!(
                "auth key must be 32 bytes (64 hex chars), got {}",
                bytes.len()
            )));
        }
        Ok(Some(bytes))
    }

    pub fn orchestrator_addr(&self) -> String {
        format!("{}:{}", self.orchestrator_host, self.orchestrator_port)
    }

    pub fn vm_config(&self) -> VmConfig {
        VmConfig {
            firecracker_bin: self.firecracker.clone(),
            kernel_path: self.kernel.clone(),
            rootfs_path: self.rootfs.clone(),
            vcpu_count: self.vcpu,
            mem_size_mib: self.memory_mb,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            total_vm_slots: self.total_vm_slots,
            warm_pool_target: self.resolved_warm_target(),
        }
    }
}

pub fn kvm_present() -> bool {
    Path::new("/dev/kvm").exists()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> NodeConfig {
        let mut full = vec!["marathon-node"];
        full.extend_from_slice(args);
        NodeConfig::parse_from(full)
    }

    #[test]
    fn defaults_match_spec() {
        let config = parse(&[]);
        assert_eq!(config.total_vm_slots, 10);
        assert_eq!(config.vsock_port, 9999);
        assert_eq!(config.heartbeat_interval_ms, 5000);
        assert_eq!(config.orchestrator_port, 7200);
        assert!(!config.tls);
        assert!(config.auth_key.is_none());
        assert!(config.warm_pool_target.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--orchestrator-host",
            "orch.internal",
            "--orchestrator-port",
            "9000",
            "--total-vm-slots",
            "4",
            "--warm-pool-target",
            "2",
            "--tls",
        ]);
        assert_eq!(config.orchestrator_addr(), "orch.internal:9000");
        assert_eq!(config.total_vm_slots, 4);
        assert_eq!(config.resolved_warm_target(), 2);
        assert!(config.tls);
    }

    #[test]
    fn pool_config_uses_explicit_warm_target() {
        let config = parse(&["--warm-pool-target", "3", "--total-vm-slots", "6"]);
        let pool = config.pool_config();
        assert_eq!(pool.total_vm_slots, 6);
        assert_eq!(pool.warm_pool_target, 3);
    }

    #[test]
    fn auth_key_roundtrip() {
        let hex: String = "ab".repeat(32);
        let config = parse(&["--auth-key", &hex]);
        let key = config.auth_key_bytes().unwrap().unwrap();
        assert_eq!(key, vec![0xABu8; 32]);
    }

    #[test]
    fn auth_key_rejects_wrong_length() {
        let config = parse(&["--auth-key", "abcd"]);
        let err = config.auth_key_bytes().unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[test]
    fn auth_key_rejects_non_hex() {
        let bad: String = "zz".repeat(32);
        let config = parse(&["--auth-key", &bad]);
        assert!(config.auth_key_bytes().is_err());
    }

    #[test]
    fn missing_auth_key_is_none() {
        let config = parse(&[]);
        assert!(config.auth_key_bytes().unwrap().is_none());
    }

    #[test]
    fn decode_hex_basic() {
        assert_eq!(decode_hex("00ff10"), Some(vec![0x00, 0xFF, 0x10]));
        assert_eq!(decode_hex("abc"), None);
        assert_eq!(decode_hex("gg"), None);
        assert_eq!(decode_hex(""), Some(Vec::new()));
    }
}
