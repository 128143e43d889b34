//! Drivers for the external freezer tool (CRIU).
//!
//! Checkpoint: freeze and dump a running container's process tree into
//! its image directory (`dump.rs`).
//! Restore: rebuild the process tree from an image directory and rejoin
//! it to the host bridge (`restore.rs`).
//!
//! Requires Linux with CRIU installed and CAP_SYS_ADMIN.

pub mod dump;
pub mod restore;

pub use dump::CheckpointDriver;
pub use restore::{Pipes, RestoreDriver};

use crate::error::{IceboxError, Result};
use anyhow::Context as _;
use tracing::debug;

/// Container-managed files declared as external mounts so the freezer
/// tool does not try to dump their contents.
pub(crate) const SYSTEM_MOUNTS: [&str; 4] = [
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/hostname",
    "/.dockerinit",
];

/// Thin wrapper around the freezer tool binary.
pub struct FreezerCli {
    binary: String,
}

impl FreezerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Check whether the freezer tool is usable on this system.
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.binary)
            .arg("check")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Run the tool to completion, surfacing a non-zero exit together
    /// with its combined output.
    pub(crate) async fn run(
        &self,
        operation: &'static str,
        args: &[String],
    ) -> Result<std::process::Output> {
        debug!(binary = %self.binary, operation, ?args, "invoking freezer tool");
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawning {} {}", self.binary, operation))?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(IceboxError::FreezerFailed {
                operation,
                status: output.status.code().unwrap_or(-1),
                output: combined,
            });
        }
        Ok(output)
    }
}
