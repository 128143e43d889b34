//! Restore driver: rebuild a container's process tree from a checkpoint.
//!
//! The freezer tool is invoked with detached sibling semantics, so the
//! restored init ends up as our direct child and can be waited on. The
//! tool itself exits quickly after the spawn; the restored PID is read
//! from the pidfile it leaves in the image directory.

use super::FreezerCli;
use crate::config::Config;
use crate::error::{IceboxError, Result};
use crate::net;
use crate::registry::CheckpointRegistry;
use crate::types::{Checkpoint, ContainerDescriptor, ExitStatus, InitHandle, StartCallback};
use anyhow::Context as _;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::Stdio;
use tracing::{info, warn};

/// Cgroup subsystems whose stale per-container directories are removed
/// before restore, so the freezer tool can recreate them.
const CGROUP_SUBSYSTEMS: [&str; 8] = [
    "devices",
    "memory",
    "cpu",
    "cpuset",
    "cpuacct",
    "blkio",
    "perf_event",
    "freezer",
];

const RESTORE_LOG: &str = "restore.log";

/// Caller-supplied pipes inherited by the restored init as fds 0/1/2.
#[derive(Default)]
pub struct Pipes {
    pub stdin: Option<fs::File>,
    pub stdout: Option<fs::File>,
    pub stderr: Option<fs::File>,
}

impl Pipes {
    pub fn none() -> Self {
        Self::default()
    }
}

pub struct RestoreDriver {
    config: Config,
    cli: FreezerCli,
}

impl RestoreDriver {
    pub fn new(config: Config) -> Self {
        let cli = FreezerCli::new(config.criu_binary.clone());
        Self { config, cli }
    }

    /// Restore `checkpoint_id` into `container` and wait for the
    /// restored init to exit.
    ///
    /// Holds the container's operation lock for the whole invocation.
    /// The pidfile is removed on every exit path.
    pub async fn restore(
        &self,
        registry: &CheckpointRegistry,
        container: &ContainerDescriptor,
        checkpoint_id: &str,
        pipes: Pipes,
        on_start: Option<StartCallback>,
    ) -> Result<ExitStatus> {
        let lock = registry.lock_for(&container.id);
        let _guard = lock.lock().await;

        if container.is_running() {
            return Err(IceboxError::AlreadyRunning(container.id.clone()));
        }
        let checkpoint = registry.get(&container.id, checkpoint_id).ok_or_else(|| {
            IceboxError::CheckpointNotFound {
                container: container.id.clone(),
                checkpoint: checkpoint_id.to_string(),
            }
        })?;

        let pidfile = checkpoint.pidfile();
        let result = self
            .run_restore(registry, container, &checkpoint, pipes, on_start, &pidfile)
            .await;
        let _ = fs::remove_file(&pidfile);
        result
    }

    async fn run_restore(
        &self,
        registry: &CheckpointRegistry,
        container: &ContainerDescriptor,
        checkpoint: &Checkpoint,
        mut pipes: Pipes,
        on_start: Option<StartCallback>,
        pidfile: &Path,
    ) -> Result<ExitStatus> {
        clean_stale_cgroups(&self.config.cgroup_root, &container.id)?;

        // A stale log may be a hard link shared with a clone source;
        // remove it so the tool's truncate cannot write through.
        let log_path = checkpoint.image_dir.join(RESTORE_LOG);
        let _ = fs::remove_file(&log_path);

        let veth = net::generate_veth_name();
        let inherit = inherit_fd_specs(&pipes)?;
        let args = build_restore_args(
            &self.config,
            container,
            &checkpoint.image_dir,
            &veth,
            &inherit,
        );

        info!(
            container = %container.id,
            checkpoint = %checkpoint.id,
            veth = %veth,
            "restoring container"
        );

        let mut cmd = tokio::process::Command::new(self.cli.binary());
        cmd.args(&args);
        cmd.stdin(match pipes.stdin.take() {
            Some(f) => Stdio::from(f),
            None => Stdio::null(),
        });
        cmd.stdout(match pipes.stdout.take() {
            Some(f) => Stdio::from(f),
            None => Stdio::null(),
        });
        cmd.stderr(match pipes.stderr.take() {
            Some(f) => Stdio::from(f),
            None => Stdio::null(),
        });

        let status = cmd
            .status()
            .await
            .with_context(|| format!("spawning {} restore", self.cli.binary()))?;
        if !status.success() {
            let log = fs::read_to_string(&log_path).unwrap_or_else(|_| String::new());
            return Err(IceboxError::FreezerFailed {
                operation: "restore",
                status: status.code().unwrap_or(-1),
                output: log,
            });
        }

        let pid = read_pidfile(pidfile)?;
        let handle = InitHandle { pid };

        let bridge = if container.network.bridge.is_empty() {
            &self.config.bridge
        } else {
            &container.network.bridge
        };
        if let Err(e) = self.join_bridge(bridge, &veth).await {
            kill_and_reap(handle);
            return Err(e);
        }

        if let Some(callback) = on_start {
            callback(handle);
        }
        registry.broadcast_event(&container.id, "restore");

        wait_for_exit(handle).await
    }

    async fn join_bridge(&self, bridge: &str, veth: &str) -> Result<()> {
        net::attach_to_bridge(&self.config.ip_binary, veth, bridge)
            .await
            .map_err(|e| IceboxError::HostState(format!("{e:#}")))?;
        net::interface_up(&self.config.ip_binary, veth)
            .await
            .map_err(|e| IceboxError::HostState(format!("{e:#}")))?;
        Ok(())
    }
}

/// Freezer tool argv for a restore; order matters to the tool. The four
/// system mounts are rebound to the target container's metadata root.
pub fn build_restore_args(
    config: &Config,
    container: &ContainerDescriptor,
    image_dir: &Path,
    veth: &str,
    inherit_fds: &[(u32, u64)],
) -> Vec<String> {
    let root = container.metadata_root.display();
    let mut args: Vec<String> = vec![
        "restore".into(),
        "-v4".into(),
        "-o".into(),
        image_dir.join(RESTORE_LOG).display().to_string(),
        "--restore-detached".into(),
        "--restore-sibling".into(),
        "--manage-cgroups".into(),
        "--evasive-devices".into(),
        "--ext-mount-map".into(),
        format!("/etc/resolv.conf:{root}/resolv.conf"),
        "--ext-mount-map".into(),
        format!("/etc/hosts:{root}/hosts"),
        "--ext-mount-map".into(),
        format!("/etc/hostname:{root}/hostname"),
        "--ext-mount-map".into(),
        format!("/.dockerinit:{}", config.dockerinit_path.display()),
        "--veth-pair".into(),
        format!("eth0={veth}"),
        "--pidfile".into(),
        image_dir.join("restore.pid").display().to_string(),
    ];

    for (fd, inode) in inherit_fds {
        args.push("--inherit-fd".into());
        args.push(format!("fd[{fd}]:pipe:[{inode}]"));
    }

    args.push("-D".into());
    args.push(image_dir.display().to_string());
    args.push("--root".into());
    args.push(container.rootfs.display().to_string());
    args
}

/// Map each attached pipe to `(target fd, pipe inode)`.
fn inherit_fd_specs(pipes: &Pipes) -> Result<Vec<(u32, u64)>> {
    let mut specs = Vec::new();
    for (fd, file) in [(0, &pipes.stdin), (1, &pipes.stdout), (2, &pipes.stderr)] {
        if let Some(file) = file {
            let meta = file
                .metadata()
                .with_context(|| format!("resolving inode of inherited fd {fd}"))?;
            specs.push((fd, meta.ino()));
        }
    }
    Ok(specs)
}

fn read_pidfile(path: &Path) -> Result<u32> {
    let data = fs::read_to_string(path)
        .map_err(|e| IceboxError::HostState(format!("pidfile {} unreadable: {e}", path.display())))?;
    data.trim()
        .parse::<u32>()
        .map_err(|e| IceboxError::HostState(format!("pidfile {} malformed: {e}", path.display())))
}

/// Remove stale per-subsystem cgroup directories left behind by a
/// previous run. Missing directories are fine; anything the kernel
/// refuses to remove is not.
pub(crate) fn clean_stale_cgroups(cgroup_root: &Path, container_id: &str) -> Result<()> {
    for subsys in CGROUP_SUBSYSTEMS {
        let path = cgroup_root.join(subsys).join("docker").join(container_id);
        match fs::remove_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(IceboxError::HostState(format!(
                    "removing stale cgroup {}: {e}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn kill_and_reap(handle: InitHandle) {
    let pid = Pid::from_raw(handle.pid as i32);
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        warn!(pid = handle.pid, error = %e, "failed to signal restored init");
        return;
    }
    let _ = waitpid(pid, None);
}

async fn wait_for_exit(handle: InitHandle) -> Result<ExitStatus> {
    let pid = Pid::from_raw(handle.pid as i32);
    let status = tokio::task::spawn_blocking(move || waitpid(pid, None))
        .await
        .context("joining wait task")?;
    match status {
        Ok(WaitStatus::Exited(_, code)) => Ok(ExitStatus { code }),
        Ok(WaitStatus::Signaled(_, signal, _)) => Ok(ExitStatus {
            code: 128 + signal as i32,
        }),
        Ok(other) => Err(IceboxError::HostState(format!(
            "unexpected wait status for restored init: {other:?}"
        ))),
        Err(e) => Err(IceboxError::HostState(format!(
            "waiting for restored init {}: {e}",
            handle.pid
        ))),
    }
}
