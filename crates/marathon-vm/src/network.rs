//! Host TAP device allocation for VM networking.
//!
//! Each VM gets `tap<k>` with the host side at `172.16.<k>.1/30`; the guest
//! side is `172.16.<k>.2`. Device creation and teardown shell out to `ip`;
//! non-zero exits are logged but not fatal (the device may already exist).

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::process::Command;
use tracing::{trace, warn};

/// TAP indices wrap at 256 to keep the third IPv4 octet valid.
const MAX_TAP_INDEX: u32 = 256;

static NEXT_TAP_INDEX: AtomicU32 = AtomicU32::new(0);

/// A provisioned host TAP device.
#[derive(Debug, Clone)]
pub struct TapDevice {
    pub index: u32,
    pub name: String,
    pub host_ip: String,
    pub guest_ip: String,
    pub mac: String,
}

/// Compute the deterministic device config for VM index `k`.
///
/// The MAC is `AA:FC:00:00:XX:YY` where `XXYY` is the little-endian 16-bit
/// low half of `k`.
pub fn tap_config(index: u32) -> TapDevice {
    let index = index % MAX_TAP_INDEX;
    let low = (index & 0xFFFF) as u16;
    let le = low.to_le_bytes();
    TapDevice {
        index,
        name: format!("tap{index}"),
        host_ip: format!("172.16.{index}.1"),
        guest_ip: format!("172.16.{index}.2"),
        mac: format!("AA:FC:00:00:{:02X}:{:02X}", le[0], le[1]),
    }
}

/// Allocate the next TAP index and bring the device up.
pub async fn create_tap() -> TapDevice {
    let index = NEXT_TAP_INDEX.fetch_add(1, Ordering::Relaxed) % MAX_TAP_INDEX;
    let device = tap_config(index);

    run_ip(&["tuntap", "add", &device.name, "mode", "tap"]).await;
    let host_cidr = format!("{}/30", device.host_ip);
    run_ip(&["addr", "add", &host_cidr, "dev", &device.name]).await;
    run_ip(&["link", "set", &device.name, "up"]).await;

    trace!(tap = %device.name, host_ip = %device.host_ip, mac = %device.mac, "tap device up");
    device
}

/// Remove the TAP link.
pub async fn delete_tap(device: &TapDevice) {
    run_ip(&["link", "del", &device.name]).await;
}

/// Run `sudo ip <args>`, logging failures instead of propagating them.
async fn run_ip(args: &[&str]) {
    let output = Command::new("sudo").arg("ip").args(args).output().await;
    match output {
        Ok(o) if !o.status.success() => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            warn!(command = %format!("ip {}", args.join(" ")), stderr = %stderr.trim(), "network command failed");
        }
        Err(e) => {
            warn!(command = %format!("ip {}", args.join(" ")), error = %e, "network command failed to spawn");
        }
        _ => {}
    }
}
