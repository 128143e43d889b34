//! Clone coordinator: bind an existing checkpoint to a freshly
//! provisioned target container.
//!
//! The target's image directory is built from hard links into the
//! source (so rewrites produce independent content and the source can
//! be removed without invalidating the clone), then rewritten for the
//! target's network identity and cgroup path. The caller hands the
//! returned checkpoint to the restore driver; the coordinator releases
//! both container locks first, keeping the (source, target) acquisition
//! order the only one in the system.

use crate::config::Config;
use crate::error::{IceboxError, Result};
use crate::net;
use crate::registry::CheckpointRegistry;
use crate::rewrite::{Directive, ImageRewriter};
use crate::storage;
use crate::types::{Checkpoint, ContainerDescriptor};
use anyhow::Context as _;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use tracing::info;

/// The freezer tool's transient pidfile, never carried into a clone.
const PIDFILE_NAME: &str = "restore.pid";

pub struct CloneCoordinator {
    config: Config,
}

impl CloneCoordinator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Clone `checkpoint_id` of `source` for `target`, allocating a MAC
    /// for the target if the runtime left it empty.
    ///
    /// On any failure the partially built target image directory is
    /// removed; the target container itself is left to the runtime's
    /// ordinary cleanup.
    pub async fn clone_checkpoint(
        &self,
        registry: &CheckpointRegistry,
        source: &ContainerDescriptor,
        checkpoint_id: &str,
        target: &mut ContainerDescriptor,
    ) -> Result<Checkpoint> {
        let source_lock = registry.lock_for(&source.id);
        let _source_guard = source_lock.lock().await;
        let target_lock = registry.lock_for(&target.id);
        let _target_guard = target_lock.lock().await;

        let checkpoint = registry.get(&source.id, checkpoint_id).ok_or_else(|| {
            IceboxError::CheckpointNotFound {
                container: source.id.clone(),
                checkpoint: checkpoint_id.to_string(),
            }
        })?;

        if target.network.mac_address.is_empty() {
            target.network.mac_address = net::generate_mac();
        }

        let rebound = checkpoint.rebind(target);
        info!(
            source = %source.id,
            target = %target.id,
            checkpoint = %rebound.id,
            mac = %target.network.mac_address,
            ip = %target.network.ip_address,
            "cloning checkpoint"
        );

        let built = self
            .build_target_image(&checkpoint, &rebound, source, target)
            .await
            .and_then(|()| {
                storage::save_checkpoint(&rebound)?;
                registry.insert(rebound.clone())
            });
        if let Err(e) = built {
            let _ = fs::remove_dir_all(&rebound.image_dir);
            return Err(e);
        }

        registry.broadcast_event(&target.id, "clone");
        Ok(rebound)
    }

    async fn build_target_image(
        &self,
        source_cp: &Checkpoint,
        target_cp: &Checkpoint,
        source: &ContainerDescriptor,
        target: &ContainerDescriptor,
    ) -> Result<()> {
        link_image_dir(&source_cp.image_dir, &target_cp.image_dir)?;

        let specs = [
            format!("mac={}", target.network.mac_hex()),
            format!("ip={}", target.network.ip_address),
            format!("cgroup=/docker/{}:/docker/{}", source.id, target.id),
        ];
        let directives = specs
            .iter()
            .map(|s| Directive::parse(s))
            .collect::<Result<Vec<_>>>()?;

        ImageRewriter::new(&target_cp.image_dir, &target_cp.image_dir)
            .with_ip_binary(&self.config.ip_binary)
            .apply_all(&directives)
            .await
    }
}

/// Hard-link every image file from `src` into a fresh `dest` (mode
/// 0775), skipping the transient pidfile. Hard links, not symlinks:
/// restore resolves paths inside the image directory itself.
pub(crate) fn link_image_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o775)
        .create(dest)
        .with_context(|| format!("creating clone image directory {}", dest.display()))?;

    for entry in
        fs::read_dir(src).with_context(|| format!("reading image directory {}", src.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy() == PIDFILE_NAME {
            continue;
        }
        fs::hard_link(entry.path(), dest.join(&name)).with_context(|| {
            format!(
                "linking {} into {}",
                entry.path().display(),
                dest.display()
            )
        })?;
    }
    Ok(())
}
