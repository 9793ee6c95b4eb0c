// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implement common definitions used throughout the app and library: the
//! typed error classes, image identity derivation, and the subprocess seam
//! every kernel-facing component runs through.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
#[cfg(test)]
use mockall::automock;
use sha2::{Digest, Sha256};
use thiserror::Error as ThisError;
use tokio::process::Command;

/// Define the namespace mixed into every image identity. Changing this value
/// changes every derived image ID, so it is fixed for the lifetime of a
/// deployment.
pub const NAMESPACE: &str = "flyio-image-manager-v1";

/// Define the largest device ID the thin-pool kernel target accepts (24 bits).
pub const MAX_DEVICE_ID: u64 = 16_777_215;

/// Define the offset added to an origin device ID to derive its snapshot ID.
const SNAPSHOT_ID_OFFSET: u64 = 1_000_000;

/// Define the secondary offset applied when the derived snapshot ID collides
/// with zero or with the origin.
const SNAPSHOT_COLLISION_OFFSET: u64 = 500_000;

/// Define where activated mapper nodes appear.
pub const DEVICE_MAPPER_DIR: &str = "/dev/mapper";

#[derive(Debug, ThisError)]
pub enum ImageError {
    /// The mapper device or pool device ID already exists.
    #[error("device already exists: {0}")]
    DeviceExists(String),
    /// The pool refused a mutation, either over the safety threshold or out
    /// of space. The message carries the remediation hint verbatim.
    #[error("{0}")]
    PoolFull(String),
    /// The named device is not known to the kernel.
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    /// The object store denied the request.
    #[error("access denied: {0}")]
    AccessDenied(String),
    /// The object exceeds the configured size limit.
    #[error("size limit exceeded: {0}")]
    SizeLimitExceeded(String),
    /// A downloaded file no longer matches its recorded digest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    /// The extracted tree is not a plausible image root.
    #[error("layout violation: {0}")]
    LayoutViolation(String),
    /// An archive entry violated the extraction hardening rules.
    #[error("archive violation: {0}")]
    ArchiveViolation(String),
    /// A mapper device exists with no owning metadata row. Never reclaimed
    /// implicitly.
    #[error("orphaned device {0}: no metadata row matches it, manual cleanup required; run 'gc --force' to reclaim it")]
    OrphanedDevice(String),
    /// The per-image lock is held by another worker.
    #[error("image lock held by {0}")]
    LockHeld(String),
    /// Another downloader holds the reservation for this object key.
    #[error("download already in progress for {0}")]
    DownloadInProgress(String),
    /// A subprocess exceeded its deadline and was killed.
    #[error("command '{0}' timed out after {1:?}")]
    CommandTimeout(String, Duration),
    /// Another manager process holds the host guard.
    #[error("manager lock held by pid {0}")]
    GuardHeld(String),
}

impl ImageError {
    /// Permanent errors poison the machine run; everything else is retried
    /// up to the transition's cap.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ImageError::PoolFull(_)
                | ImageError::AccessDenied(_)
                | ImageError::SizeLimitExceeded(_)
                | ImageError::ChecksumMismatch { .. }
                | ImageError::LayoutViolation(_)
                | ImageError::ArchiveViolation(_)
                | ImageError::OrphanedDevice(_)
                | ImageError::DownloadInProgress(_)
                | ImageError::GuardHeld(_)
        )
    }
}

/// Derive the stable image identity for an object key. Two calls with the
/// same key are byte-identical forever.
pub fn image_id_for_key(object_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(NAMESPACE.as_bytes());
    hasher.update(b":");
    hasher.update(object_key.as_bytes());
    format!("img_{}", hex::encode(hasher.finalize()))
}

/// Derive the pool device ID from an image identity. The first 64 bits of
/// the identity hash are reduced into the 24-bit space the kernel accepts.
pub fn device_id_for_image(image_id: &str) -> Result<u64> {
    let hex_part = image_id
        .strip_prefix("img_")
        .with_context(|| format!("image ID has no img_ prefix: {}", image_id))?;
    if hex_part.len() < 16 {
        bail!("image ID too short to derive a device ID: {}", image_id);
    }
    let value = u64::from_str_radix(&hex_part[..16], 16)
        .with_context(|| format!("image ID is not hex: {}", image_id))?;
    Ok(value % MAX_DEVICE_ID)
}

/// Derive the snapshot device ID for an origin. The fixed offset keeps the
/// value inside the 24-bit space; the probe loop resolves the rare wrap
/// collisions with zero or the origin itself.
pub fn snapshot_id_for_origin(origin_id: u64) -> u64 {
    let mut snap = (origin_id + SNAPSHOT_ID_OFFSET) % MAX_DEVICE_ID;
    if snap == 0 || snap == origin_id {
        snap = (snap + SNAPSHOT_COLLISION_OFFSET) % MAX_DEVICE_ID;
    }
    while snap == 0 || snap == origin_id {
        snap = (snap + 1) % MAX_DEVICE_ID;
    }
    snap
}

/// Name of the thin device backing an unpacked image.
pub fn thin_device_name(device_id: u64) -> String {
    format!("thin-{}", device_id)
}

/// Name of the activatable snapshot for an image.
pub fn snapshot_name_for_image(image_id: &str) -> String {
    format!("snap-{}", image_id)
}

/// Path of the mapper node for a device name.
pub fn mapper_path(name: &str) -> String {
    format!("{}/{}", DEVICE_MAPPER_DIR, name)
}

/// Captured result of a subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// The single seam through which every external tool is invoked. Tests
/// substitute a mock here to observe the full invocation log.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: String,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

/// Runner backed by real subprocesses. A command that overruns its deadline
/// is killed with SIGKILL and reported as a timeout.
pub struct SystemRunner {}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: String,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        debug!("Executing command: {} {}", program, args.join(" "));
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.with_context(|| format!("Failed to collect output of {}", program))?
            }
            // The timeout dropped the child, which kills it via SIGKILL.
            Err(_) => return Err(ImageError::CommandTimeout(program, timeout).into()),
        };

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Map a non-zero exit into an error carrying the tool's stderr.
pub fn ensure_success(what: &str, output: &CommandOutput) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    bail!(
        "{} failed with status {}: {}",
        what,
        output.status,
        output.stderr.trim()
    );
}

/// Log a duration with level info in the form: <action> in X.YYY seconds.
pub fn log_duration(action: &str, duration: Duration) {
    info!(
        "{} in {}.{:03} seconds",
        action,
        duration.as_secs(),
        duration.subsec_millis()
    );
}

/// Compute the SHA-256 digest of a file on disk.
pub fn file_sha256(path: &std::path::Path) -> Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let count = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }
    Ok(hex::encode(hasher.finalize()))
}
