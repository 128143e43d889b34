use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

// ── Identity ───────────────────────────────────────────────────

pub type ContainerId = String;
pub type CheckpointId = String;

pub fn new_checkpoint_id() -> CheckpointId {
    format!("cp_{}", &Uuid::new_v4().to_string().replace('-', "")[..12])
}

// ── Network identity ───────────────────────────────────────────

/// Network identity of a container at a point in time.
///
/// Checkpoints carry a frozen copy of this describing the identity
/// their image set restores to, so inspection output stays correct
/// even after the owning container changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub bridge: String,
    pub ip_address: String,
    pub ip_prefix_len: u32,
    pub mac_address: String,
    pub gateway: String,
}

impl NetworkSettings {
    /// MAC with colons stripped, the form the image rewriter consumes.
    pub fn mac_hex(&self) -> String {
        self.mac_address.replace(':', "")
    }
}

// ── Container descriptor ───────────────────────────────────────

/// Static description of a container as handed to us by the runtime.
///
/// Deliberately separate from the per-invocation [`InitHandle`]: the
/// descriptor never carries process state, so it can be cloned,
/// persisted, and reused across checkpoint/restore cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub id: ContainerId,
    /// Process root handed to the freezer tool via --root.
    pub rootfs: PathBuf,
    /// PID of the container init while running, None otherwise.
    pub init_pid: Option<u32>,
    pub network: NetworkSettings,
    /// Volume mounts, host path → in-container path. Ordered so the
    /// freezer tool argv is deterministic.
    pub volumes: BTreeMap<String, String>,
    /// Per-container metadata root, e.g. /var/lib/docker/containers/<id>.
    pub metadata_root: PathBuf,
}

impl ContainerDescriptor {
    pub fn is_running(&self) -> bool {
        self.init_pid.is_some()
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.metadata_root.join("checkpoints")
    }

    pub fn checkpoint_dir(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir().join(checkpoint_id)
    }
}

// ── Init handle ────────────────────────────────────────────────

/// Handle to a restored container init, created per restore invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitHandle {
    pub pid: u32,
}

/// Exit status of a restored init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
}

/// Invoked once the restored init PID is known, before it is waited on.
pub type StartCallback = Box<dyn FnOnce(InitHandle) + Send>;

// ── Checkpoint ─────────────────────────────────────────────────

/// A persisted snapshot of a container's process state.
///
/// Immutable after creation; identity rewrites happen on a cloned
/// image directory, never on this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub container_id: ContainerId,
    pub created_at: DateTime<Utc>,
    /// The network identity this image set restores to: the owning
    /// container's settings at dump time, or the clone target's after
    /// a rewrite.
    pub network: NetworkSettings,
    pub image_dir: PathBuf,
}

impl Checkpoint {
    pub fn new(container: &ContainerDescriptor, id: CheckpointId) -> Self {
        let image_dir = container.checkpoint_dir(&id);
        Self {
            id,
            container_id: container.id.clone(),
            created_at: Utc::now(),
            network: container.network.clone(),
            image_dir,
        }
    }

    /// A copy of this checkpoint re-bound to a clone target: same id,
    /// fresh timestamp, the target's metadata root, and the target's
    /// network identity (which the image rewrite stamps into the copied
    /// records).
    pub fn rebind(&self, target: &ContainerDescriptor) -> Self {
        Self {
            id: self.id.clone(),
            container_id: target.id.clone(),
            created_at: Utc::now(),
            network: target.network.clone(),
            image_dir: target.checkpoint_dir(&self.id),
        }
    }

    pub fn pidfile(&self) -> PathBuf {
        self.image_dir.join("restore.pid")
    }
}

/// Serializable view of a checkpoint for runtime inspection output.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub id: CheckpointId,
    pub created_at: DateTime<Utc>,
    pub ip_address: String,
    pub mac_address: String,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            id: cp.id.clone(),
            created_at: cp.created_at,
            ip_address: cp.network.ip_address.clone(),
            mac_address: cp.network.mac_address.clone(),
        }
    }
}
