use crate::error::{IceboxError, Result};
use crate::storage;
use crate::types::{Checkpoint, CheckpointSummary, ContainerDescriptor, ContainerId};
use dashmap::DashMap;
use std::fs;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

/// Per-container checkpoint collection plus the operation locks that
/// serialize checkpoint/restore/clone per container.
pub struct CheckpointRegistry {
    checkpoints: DashMap<ContainerId, Vec<Checkpoint>>,
    locks: DashMap<ContainerId, Arc<Mutex<()>>>,
    event_tx: broadcast::Sender<(ContainerId, String)>,
}

impl CheckpointRegistry {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            checkpoints: DashMap::new(),
            locks: DashMap::new(),
            event_tx,
        })
    }

    /// The operation lock for a container. Held across the whole freezer
    /// tool invocation, so a stuck tool blocks further operations on
    /// that container (and only that container) until it returns.
    pub fn lock_for(&self, container_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(container_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn insert(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut entry = self
            .checkpoints
            .entry(checkpoint.container_id.clone())
            .or_default();
        if entry.iter().any(|c| c.id == checkpoint.id) {
            return Err(IceboxError::CheckpointExists {
                container: checkpoint.container_id.clone(),
                checkpoint: checkpoint.id,
            });
        }
        entry.push(checkpoint);
        Ok(())
    }

    pub fn get(&self, container_id: &str, checkpoint_id: &str) -> Option<Checkpoint> {
        self.checkpoints
            .get(container_id)?
            .iter()
            .find(|c| c.id == checkpoint_id)
            .cloned()
    }

    /// Checkpoints of a container, most recent first. Creation-time ties
    /// keep insertion order.
    pub fn list(&self, container_id: &str) -> Vec<Checkpoint> {
        let mut list = self
            .checkpoints
            .get(container_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub fn summaries(&self, container_id: &str) -> Vec<CheckpointSummary> {
        self.list(container_id)
            .iter()
            .map(CheckpointSummary::from)
            .collect()
    }

    /// Remove a checkpoint and unlink its image directory. Unlink
    /// failures are logged, not surfaced.
    pub fn remove(&self, container_id: &str, checkpoint_id: &str) -> Option<Checkpoint> {
        let checkpoint = {
            let mut entry = self.checkpoints.get_mut(container_id)?;
            let pos = entry.iter().position(|c| c.id == checkpoint_id)?;
            entry.remove(pos)
        };
        remove_image_dir(&checkpoint);
        Some(checkpoint)
    }

    /// Drop every checkpoint of a container, for container destruction.
    pub fn remove_container(&self, container_id: &str) -> usize {
        let Some((_, list)) = self.checkpoints.remove(container_id) else {
            self.locks.remove(container_id);
            return 0;
        };
        for checkpoint in &list {
            remove_image_dir(checkpoint);
        }
        self.locks.remove(container_id);
        list.len()
    }

    /// Re-populate from the metadata files under a container's
    /// checkpoints directory.
    pub fn load_from_disk(&self, container: &ContainerDescriptor) -> Result<usize> {
        let checkpoints = storage::list_checkpoints(&container.checkpoints_dir())?;
        let count = checkpoints.len();
        for checkpoint in checkpoints {
            self.insert(checkpoint)?;
        }
        Ok(count)
    }

    // ── Lifecycle events ───────────────────────────────────────

    pub fn subscribe_events(&self) -> broadcast::Receiver<(ContainerId, String)> {
        self.event_tx.subscribe()
    }

    pub fn broadcast_event(&self, container_id: &str, event: &str) {
        let _ = self
            .event_tx
            .send((container_id.to_string(), event.to_string()));
    }
}

fn remove_image_dir(checkpoint: &Checkpoint) {
    if let Err(e) = fs::remove_dir_all(&checkpoint.image_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                checkpoint = %checkpoint.id,
                path = %checkpoint.image_dir.display(),
                error = %e,
                "failed to unlink checkpoint image directory"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetworkSettings;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn test_container(root: &Path) -> ContainerDescriptor {
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
            volumes: BTreeMap::new(),
            metadata_root: root.join("abcd"),
        }
    }

    fn checkpoint_at(
        container: &ContainerDescriptor,
        id: &str,
        offset_secs: i64,
    ) -> Checkpoint {
        let mut cp = Checkpoint::new(container, id.into());
        cp.created_at = Utc::now() + Duration::seconds(offset_secs);
        cp
    }

    #[test]
    fn test_insert_and_get() {
        let tmp = TempDir::new().unwrap();
        let container = test_container(tmp.path());
        let registry = CheckpointRegistry::new();

        registry
            .insert(Checkpoint::new(&container, "cp1".into()))
            .unwrap();
        let got = registry.get("abcd", "cp1").unwrap();
        assert_eq!(got.id, "cp1");
        assert!(registry.get("abcd", "cp2").is_none());
        assert!(registry.get("ef01", "cp1").is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let tmp = TempDir::new().unwrap();
        let container = test_container(tmp.path());
        let registry = CheckpointRegistry::new();

        registry
            .insert(Checkpoint::new(&container, "cp1".into()))
            .unwrap();
        let err = registry
            .insert(Checkpoint::new(&container, "cp1".into()))
            .unwrap_err();
        assert!(matches!(err, IceboxError::CheckpointExists { .. }));
    }

    #[test]
    fn test_list_most_recent_first() {
        let tmp = TempDir::new().unwrap();
        let container = test_container(tmp.path());
        let registry = CheckpointRegistry::new();

        registry.insert(checkpoint_at(&container, "old", -100)).unwrap();
        registry.insert(checkpoint_at(&container, "new", 100)).unwrap();
        registry.insert(checkpoint_at(&container, "mid", 0)).unwrap();

        let ids: Vec<_> = registry.list("abcd").iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_list_tie_keeps_insertion_order() {
        let tmp = TempDir::new().unwrap();
        let container = test_container(tmp.path());
        let registry = CheckpointRegistry::new();

        let ts = Utc::now();
        for id in ["first", "second", "third"] {
            let mut cp = Checkpoint::new(&container, id.into());
            cp.created_at = ts;
            registry.insert(cp).unwrap();
        }
        let ids: Vec<_> = registry.list("abcd").iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_remove_unlinks_image_dir() {
        let tmp = TempDir::new().unwrap();
        let container = test_container(tmp.path());
        let registry = CheckpointRegistry::new();

        let cp = Checkpoint::new(&container, "cp1".into());
        fs::create_dir_all(&cp.image_dir).unwrap();
        fs::write(cp.image_dir.join("netdev-8.img"), b"x").unwrap();
        registry.insert(cp.clone()).unwrap();

        let removed = registry.remove("abcd", "cp1").unwrap();
        assert_eq!(removed.id, "cp1");
        assert!(!cp.image_dir.exists());
        assert!(registry.get("abcd", "cp1").is_none());
    }

    #[test]
    fn test_remove_survives_missing_image_dir() {
        let tmp = TempDir::new().unwrap();
        let container = test_container(tmp.path());
        let registry = CheckpointRegistry::new();
        registry
            .insert(Checkpoint::new(&container, "cp1".into()))
            .unwrap();
        // Image dir never created; removal still succeeds.
        assert!(registry.remove("abcd", "cp1").is_some());
    }

    #[test]
    fn test_remove_container_drops_everything() {
        let tmp = TempDir::new().unwrap();
        let container = test_container(tmp.path());
        let registry = CheckpointRegistry::new();
        for id in ["cp1", "cp2"] {
            let cp = Checkpoint::new(&container, id.into());
            fs::create_dir_all(&cp.image_dir).unwrap();
            registry.insert(cp).unwrap();
        }

        assert_eq!(registry.remove_container("abcd"), 2);
        assert!(registry.list("abcd").is_empty());
        assert!(!container.checkpoint_dir("cp1").exists());
    }

    #[test]
    fn test_load_from_disk() {
        let tmp = TempDir::new().unwrap();
        let container = test_container(tmp.path());

        let registry = CheckpointRegistry::new();
        for id in ["cp1", "cp2"] {
            let cp = Checkpoint::new(&container, id.into());
            fs::create_dir_all(&cp.image_dir).unwrap();
            storage::save_checkpoint(&cp).unwrap();
        }

        let fresh = CheckpointRegistry::new();
        let count = fresh.load_from_disk(&container).unwrap();
        assert_eq!(count, 2);
        assert!(fresh.get("abcd", "cp1").is_some());
        assert!(fresh.get("abcd", "cp2").is_some());
    }

    #[test]
    fn test_event_broadcast() {
        let registry = CheckpointRegistry::new();
        let mut rx = registry.subscribe_events();
        registry.broadcast_event("abcd", "checkpoint");
        let (id, event) = rx.try_recv().unwrap();
        assert_eq!(id, "abcd");
        assert_eq!(event, "checkpoint");
    }

    #[tokio::test]
    async fn test_lock_for_serializes_per_container() {
        let registry = CheckpointRegistry::new();
        let lock = registry.lock_for("abcd");
        let guard = lock.lock().await;

        // Same container: second acquisition must not be available.
        assert!(registry.lock_for("abcd").try_lock().is_err());
        // Different container: independent.
        assert!(registry.lock_for("ef01").try_lock().is_ok());
        drop(guard);
        assert!(registry.lock_for("abcd").try_lock().is_ok());
    }
}
