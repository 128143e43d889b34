//! Container checkpoint/restore and cloning on top of CRIU.
//!
//! The crate drives an external freezer tool to persist a running
//! container's process tree to an on-disk image directory and to
//! rebuild it later, optionally into a freshly provisioned container
//! with a new network identity. The image rewriter patches the dumped
//! records (eth0 MAC, container IPv4, cgroup paths) so a checkpoint can
//! cross container identities.

pub mod clone;
pub mod config;
pub mod error;
pub mod freezer;
pub mod net;
pub mod registry;
pub mod rewrite;
pub mod storage;
pub mod types;
