//! Checkpoint-image rewriter.
//!
//! Mutates the identity-bearing records of a dumped image directory so a
//! checkpoint taken from one container can be restored into another:
//! the eth0 MAC inside `netdev-8.img`, the IPv4 address inside
//! `ifaddr-8.img`/`route-8.img`, and the cgroup paths inside
//! `cgroup.img`. Everything else is copied through untouched.
//!
//! The IPv4 rewrite is a byte-level substitution guided by an external
//! `ip addr showdump` of the interface-address image, not a full decode
//! of those two files. That mirrors the tool's own dump format closely
//! enough in practice and keeps the rewriter independent of their
//! per-kernel record layout.

pub mod images;
pub mod proto;

use crate::error::{IceboxError, Result};
use anyhow::Context as _;
use images::{read_image, replace_file, write_image};
use prost::Message;
use proto::{CgroupDirEntry, CgroupEntry, NetDeviceEntry};
use regex::Regex;
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const NETDEV_IMG: &str = "netdev-8.img";
pub const IFADDR_IMG: &str = "ifaddr-8.img";
pub const ROUTE_IMG: &str = "route-8.img";
pub const CGROUP_IMG: &str = "cgroup.img";

/// The interface whose identity gets rewritten. Containers here have
/// exactly one.
const CONTAINER_IFACE: &str = "eth0";

// ── Directives ─────────────────────────────────────────────────

/// One `key=value` transformation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Replace the container IPv4 address in the address and route images.
    Ip(Ipv4Addr),
    /// Replace the eth0 hardware address in the network-device image.
    Mac(Vec<u8>),
    /// Substring-replace cgroup paths and directory names.
    Cgroup { old: String, new: String },
}

impl Directive {
    pub fn parse(spec: &str) -> Result<Self> {
        let (key, value) = spec
            .split_once('=')
            .ok_or_else(|| IceboxError::UnknownDirective(spec.to_string()))?;
        match key {
            "ip" => {
                let addr: Ipv4Addr = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("cannot parse {value} as an IPv4 address"))?;
                Ok(Directive::Ip(addr))
            }
            "mac" => {
                let bytes = hex::decode(value)
                    .map_err(|e| anyhow::anyhow!("cannot parse {value} as a hex MAC: {e}"))?;
                Ok(Directive::Mac(bytes))
            }
            "cgroup" => {
                let (old, new) = value
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("invalid cgroup= directive: expected OLD:NEW"))?;
                Ok(Directive::Cgroup {
                    old: old.to_string(),
                    new: new.to_string(),
                })
            }
            other => Err(IceboxError::UnknownDirective(other.to_string())),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Ip(addr) => write!(f, "ip={}", addr),
            Directive::Mac(bytes) => write!(f, "mac={}", hex::encode(bytes)),
            Directive::Cgroup { old, new } => write!(f, "cgroup={}:{}", old, new),
        }
    }
}

// ── Rewriter ───────────────────────────────────────────────────

pub struct ImageRewriter {
    src: PathBuf,
    dest: PathBuf,
    ip_binary: String,
}

impl ImageRewriter {
    /// Rewrite from `src` into `dest`. The directories may be the same,
    /// in which case each touched file is replaced in place.
    pub fn new(src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            ip_binary: "ip".into(),
        }
    }

    pub fn with_ip_binary(mut self, ip_binary: impl Into<String>) -> Self {
        self.ip_binary = ip_binary.into();
        self
    }

    /// Apply directives in order. The first failure aborts the rest and
    /// names the failing directive; earlier directives are not rolled
    /// back.
    pub async fn apply_all(&self, directives: &[Directive]) -> Result<()> {
        for directive in directives {
            debug!(directive = %directive, src = %self.src.display(), "applying rewrite");
            self.apply(directive)
                .await
                .map_err(|e| e.in_directive(directive.to_string()))?;
        }
        Ok(())
    }

    async fn apply(&self, directive: &Directive) -> Result<()> {
        match directive {
            Directive::Ip(addr) => self.rewrite_ip(*addr).await,
            Directive::Mac(bytes) => self.rewrite_mac(bytes),
            Directive::Cgroup { old, new } => self.rewrite_cgroup(old, new),
        }
    }

    // ── MAC ────────────────────────────────────────────────────

    fn rewrite_mac(&self, mac: &[u8]) -> Result<()> {
        let src = self.src.join(NETDEV_IMG);
        let mut image = read_image(&src)?;
        for record in &mut image.records {
            let mut device = NetDeviceEntry::decode(&record.body[..]).map_err(|e| {
                IceboxError::ImageFormat {
                    file: src.display().to_string(),
                    offset: record.offset,
                    reason: e.to_string(),
                }
            })?;
            if device.name == CONTAINER_IFACE {
                device.address = Some(mac.to_vec());
                record.body = device.encode_to_vec();
            }
            // Untouched records keep their original bytes.
        }
        write_image(&self.dest.join(NETDEV_IMG), &image)
    }

    // ── IPv4 ───────────────────────────────────────────────────

    async fn rewrite_ip(&self, new: Ipv4Addr) -> Result<()> {
        let ifaddr_path = self.src.join(IFADDR_IMG);
        let ifaddr = fs::read(&ifaddr_path)
            .with_context(|| format!("reading image file {}", ifaddr_path.display()))?;

        let dump = self.run_showdump(&ifaddr).await?;
        let old = parse_showdump_address(&dump)?;
        self.rewrite_ip_bytes(ifaddr, old, new)
    }

    /// Byte-level substitution of `old` with `new` across the address and
    /// route images. Both files must contain the old address at least
    /// once; on a miss neither destination file is written.
    fn rewrite_ip_bytes(&self, mut ifaddr: Vec<u8>, old: Ipv4Addr, new: Ipv4Addr) -> Result<()> {
        let from = old.octets();
        let to = new.octets();

        if substitute(&mut ifaddr, &from, &to) == 0 {
            return Err(IceboxError::RewriteMiss(format!(
                "address {} in {}",
                old, IFADDR_IMG
            )));
        }

        let route_path = self.src.join(ROUTE_IMG);
        let mut route = fs::read(&route_path)
            .with_context(|| format!("reading image file {}", route_path.display()))?;
        if substitute(&mut route, &from, &to) == 0 {
            return Err(IceboxError::RewriteMiss(format!(
                "address {} in {}",
                old, ROUTE_IMG
            )));
        }

        replace_file(&self.dest.join(IFADDR_IMG), &ifaddr)?;
        replace_file(&self.dest.join(ROUTE_IMG), &route)?;
        Ok(())
    }

    async fn run_showdump(&self, ifaddr: &[u8]) -> Result<String> {
        let mut child = Command::new(&self.ip_binary)
            .args(["addr", "showdump"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {} addr showdump", self.ip_binary))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("no stdin handle for address dump"))?;
        stdin
            .write_all(ifaddr)
            .await
            .context("feeding interface-address image to address dump")?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .context("waiting for address dump")?;
        if !output.status.success() {
            return Err(IceboxError::HostState(format!(
                "ip addr showdump failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    // ── Cgroup paths ───────────────────────────────────────────

    fn rewrite_cgroup(&self, old: &str, new: &str) -> Result<()> {
        let src = self.src.join(CGROUP_IMG);
        let mut image = read_image(&src)?;
        for record in &mut image.records {
            let entry = CgroupEntry::decode(&record.body[..]).map_err(|e| {
                IceboxError::ImageFormat {
                    file: src.display().to_string(),
                    offset: record.offset,
                    reason: e.to_string(),
                }
            })?;

            let mut updated = entry.clone();
            for set in &mut updated.sets {
                for ctl in &mut set.ctls {
                    ctl.path = ctl.path.replace(old, new);
                }
            }
            for controller in &mut updated.controllers {
                for dir in &mut controller.dirs {
                    rewrite_dir_entry(dir, old, new);
                }
            }

            if updated != entry {
                record.body = updated.encode_to_vec();
            }
        }
        write_image(&self.dest.join(CGROUP_IMG), &image)
    }
}

fn rewrite_dir_entry(dir: &mut CgroupDirEntry, old: &str, new: &str) {
    dir.dir_name = dir.dir_name.replace(old, new);
    for child in &mut dir.children {
        rewrite_dir_entry(child, old, new);
    }
}

/// Extract the current global eth0 address from an `ip addr showdump`
/// text dump.
pub fn parse_showdump_address(dump: &str) -> Result<Ipv4Addr> {
    let re = Regex::new(r"inet ((?:\d{1,3}\.){3}\d{1,3})/\d+ scope global eth0")
        .context("invalid address-dump regex")?;
    let captures = re
        .captures(dump)
        .ok_or_else(|| IceboxError::RewriteMiss("old inet address in address dump".into()))?;
    let addr = captures[1]
        .parse::<Ipv4Addr>()
        .with_context(|| format!("cannot parse {} as an IPv4 address", &captures[1]))?;
    Ok(addr)
}

/// Replace every non-overlapping occurrence of `from` with `to`,
/// returning the substitution count.
fn substitute(data: &mut [u8], from: &[u8; 4], to: &[u8; 4]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i + 4 <= data.len() {
        if &data[i..i + 4] == from {
            data[i..i + 4].copy_from_slice(to);
            count += 1;
            i += 4;
        } else {
            i += 1;
        }
    }
    count
}
