//! Host-side networking for restored containers.
//!
//! The freezer tool recreates the container-side veth endpoint; we only
//! have to attach the host side to the bridge and bring it up.

use anyhow::{Context, Result};
use rand::Rng;
use tokio::process::Command;
use tracing::info;

/// Generate a random locally administered unicast MAC address.
pub fn generate_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

/// Generate a host-side veth endpoint name: `veth` plus 7 random hex chars.
pub fn generate_veth_name() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..7).map(|_| HEX[rng.gen_range(0..16)] as char).collect();
    format!("veth{}", suffix)
}

/// Attach the host-side veth endpoint to a bridge.
pub async fn attach_to_bridge(ip_binary: &str, veth: &str, bridge: &str) -> Result<()> {
    info!(veth = %veth, bridge = %bridge, "attaching veth to bridge");

    let output = Command::new(ip_binary)
        .args(["link", "set", veth, "master", bridge])
        .output()
        .await
        .context("executing ip link set master")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("failed to attach {} to bridge {}: {}", veth, bridge, stderr);
    }

    Ok(())
}

/// Bring a host interface up.
pub async fn interface_up(ip_binary: &str, veth: &str) -> Result<()> {
    let output = Command::new(ip_binary)
        .args(["link", "set", veth, "up"])
        .output()
        .await
        .context("executing ip link set up")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("failed to bring up {}: {}", veth, stderr);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_mac_format() {
        let mac = generate_mac();
        assert_eq!(mac.len(), 17);
        assert!(mac.starts_with("02:"));
        assert_eq!(mac.split(':').count(), 6);
        for part in mac.split(':') {
            assert_eq!(part.len(), 2);
            assert!(u8::from_str_radix(part, 16).is_ok());
        }
    }

    #[test]
    fn test_generate_veth_name_format() {
        let name = generate_veth_name();
        assert_eq!(name.len(), 11); // "veth" + 7 chars
        assert!(name.starts_with("veth"));
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_veth_names_are_distinct() {
        let a = generate_veth_name();
        let b = generate_veth_name();
        // 16^7 names; a collision here means the generator is broken.
        assert_ne!(a, b);
    }
}
