//! Checkpoint driver: dump a running container into an image directory.

use super::{FreezerCli, SYSTEM_MOUNTS};
use crate::config::Config;
use crate::error::{IceboxError, Result};
use crate::registry::CheckpointRegistry;
use crate::storage;
use crate::types::{new_checkpoint_id, Checkpoint, ContainerDescriptor};
use anyhow::Context as _;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use tracing::info;

pub struct CheckpointDriver {
    cli: FreezerCli,
}

impl CheckpointDriver {
    pub fn new(config: &Config) -> Self {
        Self {
            cli: FreezerCli::new(config.criu_binary.clone()),
        }
    }

    /// Dump `container` and register the resulting checkpoint.
    ///
    /// Holds the container's operation lock for the whole freezer tool
    /// invocation. On failure the image directory is removed so no
    /// partial checkpoint is ever visible.
    pub async fn checkpoint(
        &self,
        registry: &CheckpointRegistry,
        container: &ContainerDescriptor,
        leave_running: bool,
    ) -> Result<Checkpoint> {
        let lock = registry.lock_for(&container.id);
        let _guard = lock.lock().await;

        let init_pid = container
            .init_pid
            .ok_or_else(|| IceboxError::NotRunning(container.id.clone()))?;

        let checkpoint = Checkpoint::new(container, new_checkpoint_id());
        prepare_image_dir(&checkpoint.image_dir)?;

        let args = build_dump_args(container, &checkpoint.image_dir, init_pid, leave_running);
        info!(
            container = %container.id,
            checkpoint = %checkpoint.id,
            pid = init_pid,
            "dumping container"
        );

        if let Err(e) = self.cli.run("dump", &args).await {
            let _ = fs::remove_dir_all(&checkpoint.image_dir);
            return Err(e);
        }

        storage::save_checkpoint(&checkpoint)?;
        registry.insert(checkpoint.clone())?;
        registry.broadcast_event(&container.id, "checkpoint");
        Ok(checkpoint)
    }
}

/// Create the image directory empty with mode 0775, clearing any
/// leftovers from a failed earlier dump.
pub(crate) fn prepare_image_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("clearing image directory {}", dir.display()))?;
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o775)
        .create(dir)
        .with_context(|| format!("creating image directory {}", dir.display()))?;
    Ok(())
}

/// Freezer tool argv for a dump; order matters to the tool.
pub fn build_dump_args(
    container: &ContainerDescriptor,
    image_dir: &Path,
    init_pid: u32,
    leave_running: bool,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "dump",
        "-v4",
        "-o",
        "/dev/stdout",
        "--manage-cgroups",
        "--evasive-devices",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if leave_running {
        args.push("--leave-running".into());
    }

    for path in SYSTEM_MOUNTS {
        args.push("--ext-mount-map".into());
        args.push(format!("{path}:{path}"));
    }
    for (host, guest) in &container.volumes {
        args.push("--ext-mount-map".into());
        args.push(format!("{host}:{guest}"));
    }

    args.push("-D".into());
    args.push(image_dir.display().to_string());
    args.push("-t".into());
    args.push(init_pid.to_string());
    args.push("--root".into());
    args.push(container.rootfs.display().to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetworkSettings;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn container_with_volumes(root: &Path) -> ContainerDescriptor {
        let mut volumes = BTreeMap::new();
        volumes.insert("/host/data".to_string(), "/data".to_string());
        ContainerDescriptor {
            id: "abcd".into(),
            rootfs: PathBuf::from("/rootfs/abcd"),
            init_pid: Some(1234),
            network: NetworkSettings {
                bridge: "docker0".into(),
                ip_address: "172.17.0.2".into(),
                ip_prefix_len: 16,
                mac_address: "02:42:ac:11:00:02".into(),
                gateway: "172.17.42.1".into(),
            },
            volumes,
            metadata_root: root.join("abcd"),
        }
    }

    #[test]
    fn test_dump_args_exact_order() {
        let tmp = TempDir::new().unwrap();
        let mut container = container_with_volumes(tmp.path());
        container.volumes.clear();
        let image_dir = PathBuf::from("/var/lib/docker/containers/abcd/checkpoints/cp1");

        let args = build_dump_args(&container, &image_dir, 1234, false);
        let expected: Vec<String> = [
            "dump",
            "-v4",
            "-o",
            "/dev/stdout",
            "--manage-cgroups",
            "--evasive-devices",
            "--ext-mount-map",
            "/etc/resolv.conf:/etc/resolv.conf",
            "--ext-mount-map",
            "/etc/hosts:/etc/hosts",
            "--ext-mount-map",
            "/etc/hostname:/etc/hostname",
            "--ext-mount-map",
            "/.dockerinit:/.dockerinit",
            "-D",
            "/var/lib/docker/containers/abcd/checkpoints/cp1",
            "-t",
            "1234",
            "--root",
            "/rootfs/abcd",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn test_dump_args_include_volume_mounts() {
        let tmp = TempDir::new().unwrap();
        let container = container_with_volumes(tmp.path());
        let args = build_dump_args(&container, Path::new("/img"), 1234, false);

        let pos = args
            .iter()
            .position(|a| a == "/host/data:/data")
            .expect("volume mount missing");
        assert_eq!(args[pos - 1], "--ext-mount-map");
        // Volumes come after the four system mounts.
        assert!(pos > args.iter().position(|a| a == "/.dockerinit:/.dockerinit").unwrap());
    }

    #[test]
    fn test_dump_args_leave_running() {
        let tmp = TempDir::new().unwrap();
        let container = container_with_volumes(tmp.path());
        let args = build_dump_args(&container, Path::new("/img"), 1234, true);
        assert!(args.contains(&"--leave-running".to_string()));
    }

    #[test]
    fn test_prepare_image_dir_clears_leftovers() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cp1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stale.img"), b"junk").unwrap();

        prepare_image_dir(&dir).unwrap();
        assert!(dir.exists());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_requires_running_container() {
        let tmp = TempDir::new().unwrap();
        let mut container = container_with_volumes(tmp.path());
        container.init_pid = None;

        let registry = CheckpointRegistry::new();
        let driver = CheckpointDriver::new(&Config::default());
        let err = driver
            .checkpoint(&registry, &container, false)
            .await
            .unwrap_err();
        assert!(matches!(err, IceboxError::NotRunning(id) if id == "abcd"));
    }

    #[tokio::test]
    async fn test_failed_dump_leaves_no_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let container = container_with_volumes(tmp.path());

        let registry = CheckpointRegistry::new();
        // "false" exits non-zero regardless of arguments.
        let driver = CheckpointDriver {
            cli: FreezerCli::new("false"),
        };
        let err = driver
            .checkpoint(&registry, &container, false)
            .await
            .unwrap_err();
        assert!(matches!(err, IceboxError::FreezerFailed { .. }));
        assert!(registry.list(&container.id).is_empty());
        // The registry invariant: no image directory without an entry.
        let leftover: Vec<_> = match std::fs::read_dir(container.checkpoints_dir()) {
            Ok(entries) => entries.collect(),
            Err(_) => Vec::new(),
        };
        assert!(leftover.is_empty());
    }
}
