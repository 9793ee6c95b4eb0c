// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed interface over the device-mapper control tool and loop devices.
//!
//! The thin pool is a fragile kernel resource: concurrent operations, a
//! nearly-full pool, or unmounting failed devices can leave processes in
//! D-state or panic the kernel. Everything here is therefore serialized
//! behind one mutex, preflighted against a capacity threshold, and followed
//! by a pool stabilization. Cleanup is never attempted on error paths; a
//! failed create leaves an orphan for the garbage collector.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::imageutil::{mapper_path, CommandOutput, CommandRunner, ImageError};

/// Define the known path to the dmsetup utility.
const DMSETUP_PATH: &str = "/sbin/dmsetup";
/// Define the path to the losetup utility.
const LOSETUP_PATH: &str = "/sbin/losetup";
/// Define the path to mkfs for extraction filesystems.
const MKFS_PATH: &str = "/sbin/mkfs.ext4";

/// Bytes per device sector.
pub const SECTOR_SIZE: u64 = 512;

/// Refuse pool mutations at or above this data usage. Past this point the
/// kernel's behavior degrades badly before it actually runs out of space.
pub const CAPACITY_THRESHOLD_PERCENT: f64 = 70.0;

/// Deadline for ordinary dmsetup invocations.
const DM_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for mount/unmount attempts.
const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for formatting a fresh thin device.
const MKFS_TIMEOUT: Duration = Duration::from_secs(60);

/// Pool usage parsed from the kernel's thin-pool status line.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolInfo {
    pub transaction_id: u64,
    pub used_meta_blocks: u64,
    pub total_meta_blocks: u64,
    pub used_data_blocks: u64,
    pub total_data_blocks: u64,
    pub mode: String,
}

impl PoolInfo {
    pub fn data_used_percent(&self) -> f64 {
        if self.total_data_blocks == 0 {
            return 100.0;
        }
        (self.used_data_blocks as f64 / self.total_data_blocks as f64) * 100.0
    }

    pub fn free_data_blocks(&self) -> u64 {
        self.total_data_blocks.saturating_sub(self.used_data_blocks)
    }
}

/// Parse a `dmsetup status` thin-pool line. Example:
/// `0 4194304 thin-pool 1 406/1024 1600/16384 - rw discard_passdown`.
/// See https://www.kernel.org/doc/Documentation/device-mapper/thin-provisioning.txt
pub fn parse_pool_status(line: &str) -> Result<PoolInfo> {
    if get_nth_element(line, 2)? != "thin-pool" {
        bail!("not a thin-pool status line: {}", line);
    }
    let transaction_id = get_nth_element(line, 3)?
        .parse()
        .context("Failed to parse pool transaction ID")?;
    let (used_meta_blocks, total_meta_blocks) = parse_fraction(get_nth_element(line, 4)?)?;
    let (used_data_blocks, total_data_blocks) = parse_fraction(get_nth_element(line, 5)?)?;
    let mode = get_nth_element(line, 7).unwrap_or("rw").to_string();

    Ok(PoolInfo {
        transaction_id,
        used_meta_blocks,
        total_meta_blocks,
        used_data_blocks,
        total_data_blocks,
        mode,
    })
}

fn parse_fraction(field: &str) -> Result<(u64, u64)> {
    let mut split = field.split('/');
    let used = split
        .next()
        .with_context(|| format!("Bad used/total field: {}", field))?
        .parse()
        .with_context(|| format!("Bad used count: {}", field))?;
    let total = split
        .next()
        .with_context(|| format!("Bad used/total field: {}", field))?
        .parse()
        .with_context(|| format!("Bad total count: {}", field))?;
    Ok((used, total))
}

/// Separate a string by whitespace, and return the n-th element, or an error
/// if the string doesn't contain that many elements.
fn get_nth_element(s: &str, n: usize) -> Result<&str> {
    let elements: Vec<&str> = s.split_whitespace().collect();
    if elements.len() <= n {
        bail!("Failed to get element {} in {}", n, s);
    }
    Ok(elements[n])
}

/// Map a failed dm invocation onto the recognized error classes.
fn classify_dm_failure(what: &str, output: &CommandOutput) -> anyhow::Error {
    let stderr = output.stderr.trim();
    let lower = stderr.to_lowercase();
    if lower.contains("exists") {
        return ImageError::DeviceExists(format!("{}: {}", what, stderr)).into();
    }
    if lower.contains("out of data space")
        || lower.contains("out of metadata space")
        || lower.contains("no free space")
        || lower.contains("no data space")
    {
        return ImageError::PoolFull(format!("{}: {}", what, stderr)).into();
    }
    if lower.contains("not found") || lower.contains("no such device") {
        return ImageError::DeviceNotFound(format!("{}: {}", what, stderr)).into();
    }
    anyhow::anyhow!("{} failed with status {}: {}", what, output.status, stderr)
}

/// Process-wide client for the thin pool. Constructed once and shared; the
/// internal mutex serializes every kernel interaction issued from this
/// process.
pub struct ThinPoolClient {
    pool_name: String,
    block_sectors: u64,
    runner: Arc<dyn CommandRunner>,
    ops: Mutex<()>,
}

impl ThinPoolClient {
    pub fn new(pool_name: &str, block_sectors: u64, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            pool_name: pool_name.to_string(),
            block_sectors,
            runner,
            ops: Mutex::new(()),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn block_bytes(&self) -> u64 {
        self.block_sectors * SECTOR_SIZE
    }

    fn pool_path(&self) -> String {
        mapper_path(&self.pool_name)
    }

    async fn dm(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        self.runner
            .run(
                DMSETUP_PATH.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
                timeout,
            )
            .await
    }

    async fn tool(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        self.runner
            .run(
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
                timeout,
            )
            .await
    }

    /// Read the pool's status line.
    pub async fn pool_status(&self) -> Result<PoolInfo> {
        let _guard = self.ops.lock().await;
        self.pool_status_locked().await
    }

    async fn pool_status_locked(&self) -> Result<PoolInfo> {
        let output = self.dm(&["status", &self.pool_name], DM_TIMEOUT).await?;
        if !output.success() {
            return Err(classify_dm_failure("dmsetup status", &output));
        }
        parse_pool_status(output.stdout.trim())
    }

    /// Refuse any mutation when the pool sits at or over the safety
    /// threshold, or lacks the blocks the caller is about to consume.
    pub async fn check_pool_capacity(&self, required_bytes: u64) -> Result<PoolInfo> {
        let _guard = self.ops.lock().await;
        self.check_pool_capacity_locked(required_bytes).await
    }

    async fn check_pool_capacity_locked(&self, required_bytes: u64) -> Result<PoolInfo> {
        let info = self.pool_status_locked().await?;
        let percent = info.data_used_percent();
        if percent >= CAPACITY_THRESHOLD_PERCENT {
            return Err(ImageError::PoolFull(format!(
                "pool {} is {:.1}% full (threshold {:.0}%, free {} blocks); \
                 run 'gc --force' to reclaim space",
                self.pool_name,
                percent,
                CAPACITY_THRESHOLD_PERCENT,
                info.free_data_blocks()
            ))
            .into());
        }
        let block_bytes = self.block_bytes();
        let required_blocks = (required_bytes + block_bytes - 1) / block_bytes;
        if required_blocks > info.free_data_blocks() {
            return Err(ImageError::PoolFull(format!(
                "pool {} has {} free blocks, {} required; \
                 run 'gc --force' to reclaim space",
                self.pool_name,
                info.free_data_blocks(),
                required_blocks
            ))
            .into());
        }
        Ok(info)
    }

    /// Whether a mapper node with this name is currently active.
    pub async fn device_exists(&self, name: &str) -> Result<bool> {
        let _guard = self.ops.lock().await;
        self.device_exists_locked(name).await
    }

    async fn device_exists_locked(&self, name: &str) -> Result<bool> {
        let output = self.dm(&["info", name], DM_TIMEOUT).await?;
        if output.success() {
            return Ok(true);
        }
        let lower = output.stderr.to_lowercase();
        if lower.contains("not found") || lower.contains("no such device") {
            return Ok(false);
        }
        Err(classify_dm_failure("dmsetup info", &output))
    }

    /// Whether the pool metadata contains this thin device ID. An unpacked
    /// device is normally inactive, so when no node exists the check probes
    /// by loading a thin table for the ID: the kernel refuses it when the
    /// pool has no such device. A successful probe node is removed again to
    /// restore the inactive state.
    pub async fn thin_device_in_pool(
        &self,
        device_id: u64,
        device_name: &str,
        size_bytes: u64,
    ) -> Result<bool> {
        let _guard = self.ops.lock().await;
        if self.device_exists_locked(device_name).await? {
            return Ok(true);
        }

        let sectors = size_bytes / SECTOR_SIZE;
        let table = format!("0 {} thin {} {}", sectors, self.pool_path(), device_id);
        let output = self
            .dm(&["create", device_name, "--table", &table], DM_TIMEOUT)
            .await?;
        if !output.success() {
            let err = classify_dm_failure("dmsetup create probe", &output);
            return match err.downcast_ref::<ImageError>() {
                Some(ImageError::DeviceNotFound(_)) => Ok(false),
                _ => Err(err),
            };
        }
        let output = self.dm(&["remove", device_name], DM_TIMEOUT).await?;
        if !output.success() {
            warn!(
                "Failed to deactivate probe node {}: {}",
                device_name,
                output.stderr.trim()
            );
        }
        Ok(true)
    }

    /// Create a new thin device in the pool, activate it, and put a
    /// journal-less ext4 on it. On failure nothing is rolled back.
    pub async fn create_thin_device(
        &self,
        device_id: u64,
        device_name: &str,
        size_bytes: u64,
    ) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.check_pool_capacity_locked(size_bytes).await?;

        let pool_path = self.pool_path();
        let message = format!("create_thin {}", device_id);
        let output = self
            .dm(&["message", &pool_path, "0", &message], DM_TIMEOUT)
            .await?;
        if !output.success() {
            let err = classify_dm_failure("dmsetup message create_thin", &output);
            match err.downcast_ref::<ImageError>() {
                // Device IDs are derived from the image identity, so an
                // existing ID in the pool is ours from an earlier attempt.
                Some(ImageError::DeviceExists(_)) => {
                    info!("Thin device ID {} already in pool, reusing", device_id);
                }
                _ => return Err(err),
            }
        }

        let sectors = size_bytes / SECTOR_SIZE;
        let table = format!("0 {} thin {} {}", sectors, pool_path, device_id);
        let output = self
            .dm(
                &["create", device_name, "--table", &table, "--verifyudev"],
                DM_TIMEOUT,
            )
            .await?;
        if !output.success() {
            return Err(classify_dm_failure("dmsetup create", &output));
        }

        let device_path = mapper_path(device_name);
        let output = self
            .tool(
                MKFS_PATH,
                &["-F", "-O", "^has_journal", &device_path],
                MKFS_TIMEOUT,
            )
            .await?;
        if !output.success() {
            bail!(
                "mkfs.ext4 on {} failed with status {}: {}",
                device_path,
                output.status,
                output.stderr.trim()
            );
        }
        info!(
            "Created thin device {} (ID {}, {} bytes)",
            device_name, device_id, size_bytes
        );
        Ok(())
    }

    /// Create a pool-internal snapshot of an origin device. The kernel
    /// requires the origin suspended while the snapshot message lands,
    /// otherwise in-flight writes can corrupt it; the origin is resumed on
    /// every path out.
    pub async fn create_snapshot_safe(
        &self,
        origin_device_name: &str,
        origin_id: u64,
        snap_id: u64,
    ) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.check_pool_capacity_locked(0).await?;

        let origin_active = self.device_exists_locked(origin_device_name).await?;
        if origin_active {
            let output = self
                .dm(&["suspend", origin_device_name], DM_TIMEOUT)
                .await?;
            if !output.success() {
                return Err(classify_dm_failure("dmsetup suspend", &output));
            }
        }

        let pool_path = self.pool_path();
        let message = format!("create_snap {} {}", snap_id, origin_id);
        let snap_result = self
            .dm(&["message", &pool_path, "0", &message], DM_TIMEOUT)
            .await;

        if origin_active {
            match self.dm(&["resume", origin_device_name], DM_TIMEOUT).await {
                Ok(output) if !output.success() => {
                    warn!(
                        "Failed to resume {}: {}",
                        origin_device_name,
                        output.stderr.trim()
                    );
                }
                Err(e) => warn!("Failed to resume {}: {}", origin_device_name, e),
                Ok(_) => {}
            }
        }

        let output = snap_result?;
        if !output.success() {
            let err = classify_dm_failure("dmsetup message create_snap", &output);
            match err.downcast_ref::<ImageError>() {
                // Snapshot IDs are derived too; an existing ID is a previous
                // attempt at this same snapshot.
                Some(ImageError::DeviceExists(_)) => {
                    info!("Snapshot ID {} already in pool, reusing", snap_id);
                }
                _ => return Err(err),
            }
        }
        info!("Created snapshot {} of origin {}", snap_id, origin_id);
        Ok(())
    }

    /// Activate a thin device or snapshot as a mapper node.
    pub async fn activate_device(
        &self,
        name: &str,
        device_id: u64,
        size_bytes: u64,
    ) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.check_pool_capacity_locked(0).await?;

        let sectors = size_bytes / SECTOR_SIZE;
        let table = format!("0 {} thin {} {}", sectors, self.pool_path(), device_id);
        let output = self
            .dm(&["create", name, "--table", &table, "--verifyudev"], DM_TIMEOUT)
            .await?;
        if !output.success() {
            return Err(classify_dm_failure("dmsetup create", &output));
        }
        info!("Activated device {} (ID {})", name, device_id);
        Ok(())
    }

    /// Whether something is mounted at the given path.
    pub async fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        let _guard = self.ops.lock().await;
        self.is_mounted_locked(mount_point).await
    }

    async fn is_mounted_locked(&self, mount_point: &Path) -> Result<bool> {
        let output = self.tool("mount", &[], MOUNT_TIMEOUT).await?;
        if !output.success() {
            bail!("mount listing failed: {}", output.stderr.trim());
        }
        let needle = format!(" on {} ", mount_point.display());
        Ok(output.stdout.contains(&needle))
    }

    /// Mount a device unless something is already mounted there.
    pub async fn mount_device(&self, device_path: &str, mount_point: &Path) -> Result<()> {
        let _guard = self.ops.lock().await;
        if self.is_mounted_locked(mount_point).await? {
            debug!("{} is already mounted, skipping", mount_point.display());
            return Ok(());
        }
        std::fs::create_dir_all(mount_point)
            .with_context(|| format!("Failed to create {}", mount_point.display()))?;
        let mount_str = mount_point.to_string_lossy().to_string();
        let output = self
            .tool(
                "mount",
                &["-o", "noatime,nodiratime", device_path, mount_str.as_str()],
                MOUNT_TIMEOUT,
            )
            .await?;
        if !output.success() {
            bail!(
                "mount {} on {} failed: {}",
                device_path,
                mount_point.display(),
                output.stderr.trim()
            );
        }
        info!("Mounted {} on {}", device_path, mount_point.display());
        Ok(())
    }

    /// Unmount, lazy first. A standard unmount calls into kernel sync and
    /// can block indefinitely against a stressed pool, so it is the last
    /// resort, not the first.
    pub async fn unmount_device(&self, mount_point: &Path) -> Result<()> {
        let _guard = self.ops.lock().await;
        let mount_str = mount_point.to_string_lossy().to_string();
        let mount_ref = mount_str.as_str();
        let attempts: [&[&str]; 3] = [&["-l", mount_ref], &["-f", mount_ref], &[mount_ref]];
        let mut last_err = None;
        for args in attempts {
            let output = self.tool("umount", args, MOUNT_TIMEOUT).await?;
            if output.success() {
                debug!("Unmounted {}", mount_point.display());
                return Ok(());
            }
            if output.stderr.to_lowercase().contains("not mounted") {
                return Ok(());
            }
            warn!(
                "umount {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            );
            last_err = Some(anyhow::anyhow!(
                "umount {} failed: {}",
                mount_point.display(),
                output.stderr.trim()
            ));
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("umount failed")))
    }

    /// Remove a mapper node, verifying with udev first and forcing second.
    pub async fn deactivate_device(&self, name: &str) -> Result<()> {
        let _guard = self.ops.lock().await;
        let output = self
            .dm(&["remove", "--verifyudev", name], DM_TIMEOUT)
            .await?;
        if output.success() {
            return Ok(());
        }
        let lower = output.stderr.to_lowercase();
        if lower.contains("not found") || lower.contains("no such device") {
            return Ok(());
        }
        warn!(
            "dmsetup remove --verifyudev {} failed, forcing: {}",
            name,
            output.stderr.trim()
        );
        let output = self.dm(&["remove", "--force", name], DM_TIMEOUT).await?;
        if !output.success() {
            return Err(classify_dm_failure("dmsetup remove --force", &output));
        }
        Ok(())
    }

    /// Force a pool metadata commit and let udev drain. Invoked after every
    /// mutating dm operation; this is the happens-before edge the machines
    /// rely on.
    pub async fn stabilize_pool(&self) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.stabilize_pool_locked().await
    }

    async fn stabilize_pool_locked(&self) -> Result<()> {
        let pool_path = self.pool_path();
        let reserve = self
            .dm(
                &["message", &pool_path, "0", "reserve_metadata_snap"],
                DM_TIMEOUT,
            )
            .await?;
        if !reserve.success() {
            warn!(
                "reserve_metadata_snap on {} failed: {}",
                self.pool_name,
                reserve.stderr.trim()
            );
        }
        let release = self
            .dm(
                &["message", &pool_path, "0", "release_metadata_snap"],
                DM_TIMEOUT,
            )
            .await?;
        if !release.success() && !reserve.success() {
            bail!(
                "pool {} failed to commit metadata: {}",
                self.pool_name,
                release.stderr.trim()
            );
        }
        let settle = self
            .tool("udevadm", &["settle", "--timeout=0"], DM_TIMEOUT)
            .await?;
        if !settle.success() {
            warn!("udevadm settle failed: {}", settle.stderr.trim());
        }
        Ok(())
    }

    /// Delete a thin device ID from the pool metadata. Garbage collection
    /// only; the hot path never deletes.
    pub async fn delete_thin_device(&self, device_id: u64) -> Result<()> {
        let _guard = self.ops.lock().await;
        let pool_path = self.pool_path();
        let message = format!("delete {}", device_id);
        let output = self
            .dm(&["message", &pool_path, "0", &message], DM_TIMEOUT)
            .await?;
        if !output.success() {
            return Err(classify_dm_failure("dmsetup message delete", &output));
        }
        Ok(())
    }

    /// Names of all active thin mapper nodes.
    pub async fn list_thin_devices(&self) -> Result<Vec<String>> {
        let _guard = self.ops.lock().await;
        let output = self.dm(&["ls", "--target", "thin"], DM_TIMEOUT).await?;
        if !output.success() {
            return Err(classify_dm_failure("dmsetup ls", &output));
        }
        let mut names = Vec::new();
        for line in output.stdout.lines() {
            if line.to_lowercase().contains("no devices found") {
                break;
            }
            if let Some(name) = line.split_whitespace().next() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Read the table line of a device. Used by the garbage collector to
    /// learn a node's pool device ID.
    pub async fn device_table(&self, name: &str) -> Result<String> {
        let _guard = self.ops.lock().await;
        let output = self.dm(&["table", name], DM_TIMEOUT).await?;
        if !output.success() {
            return Err(classify_dm_failure("dmsetup table", &output));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Bring the pool up at startup: backing files, loop devices, and the
    /// pool target itself. Idempotent across restarts.
    pub async fn ensure_pool(&self, config: &Config) -> Result<()> {
        let _guard = self.ops.lock().await;
        if self.device_exists_locked(&self.pool_name).await? {
            debug!("Pool {} already active", self.pool_name);
            return Ok(());
        }

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
        let meta_path = config.pool_meta_path();
        let data_path = config.pool_data_path();
        ensure_backing_file(&meta_path, config.pool_metadata_bytes)?;
        ensure_backing_file(&data_path, config.pool_data_bytes)?;

        let meta_dev = self.attach_loop_locked(&meta_path).await?;
        let data_dev = self.attach_loop_locked(&data_path).await?;

        let sectors = config.pool_data_bytes / SECTOR_SIZE;
        let table = format!(
            "0 {} thin-pool {} {} {} {}",
            sectors, meta_dev, data_dev, config.pool_block_sectors, config.pool_low_water_sectors
        );
        let output = self
            .dm(
                &["create", &self.pool_name, "--table", &table, "--verifyudev"],
                DM_TIMEOUT,
            )
            .await?;
        if !output.success() {
            return Err(classify_dm_failure("dmsetup create thin-pool", &output));
        }
        info!("Created thin pool {} ({})", self.pool_name, table);
        self.stabilize_pool_locked().await
    }

    /// Attach a backing file to a loop device, reusing an existing
    /// attachment when one is found.
    async fn attach_loop_locked(&self, backing_file: &Path) -> Result<String> {
        let file_str = backing_file.to_string_lossy().to_string();
        let output = self
            .tool(LOSETUP_PATH, &["-j", &file_str], DM_TIMEOUT)
            .await?;
        if output.success() {
            if let Some(line) = output.stdout.lines().next() {
                if let Some(device) = line.split(':').next() {
                    let device = device.trim();
                    if !device.is_empty() {
                        debug!("Reusing loop device {} for {}", device, file_str);
                        return Ok(device.to_string());
                    }
                }
            }
        }

        let output = self
            .tool(LOSETUP_PATH, &["--show", "-f", &file_str], DM_TIMEOUT)
            .await?;
        if !output.success() {
            bail!(
                "losetup for {} failed: {}",
                backing_file.display(),
                output.stderr.trim()
            );
        }
        let device = output.stdout.trim().to_string();
        if device.is_empty() {
            bail!("losetup returned no device for {}", backing_file.display());
        }
        info!("Attached {} to {}", file_str, device);
        Ok(device)
    }
}

/// Create a backing file of the given size if it does not exist. An existing
/// file is left untouched; it holds live pool state.
fn ensure_backing_file(path: &Path, size_bytes: u64) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.set_len(size_bytes)
        .with_context(|| format!("Failed to size {}", path.display()))?;
    info!("Created pool backing file {} ({} bytes)", path.display(), size_bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imageutil::MockCommandRunner;
    use std::sync::Mutex as StdMutex;

    type CallLog = Arc<StdMutex<Vec<String>>>;

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: &str) -> CommandOutput {
        CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// Build a client over a scripted runner. The handler sees
    /// "program arg1 arg2 ..." and returns the faked output; every
    /// invocation is appended to the log.
    fn scripted_client<F>(log: CallLog, handler: F) -> ThinPoolClient
    where
        F: Fn(&str) -> CommandOutput + Send + Sync + 'static,
    {
        let mut mock = MockCommandRunner::new();
        mock.expect_run().returning(move |program, args, _timeout| {
            let call = format!("{} {}", program, args.join(" "));
            log.lock().unwrap().push(call.clone());
            Ok(handler(&call))
        });
        ThinPoolClient::new("imgpool", 256, Arc::new(mock))
    }

    fn healthy_status() -> &'static str {
        "0 4194304 thin-pool 1 406/1024 10/100 - rw discard_passdown queue_if_no_space -"
    }

    #[test]
    fn test_parse_pool_status() {
        let info = parse_pool_status(healthy_status()).unwrap();
        assert_eq!(info.transaction_id, 1);
        assert_eq!(info.used_meta_blocks, 406);
        assert_eq!(info.total_meta_blocks, 1024);
        assert_eq!(info.used_data_blocks, 10);
        assert_eq!(info.total_data_blocks, 100);
        assert_eq!(info.mode, "rw");
        assert!((info.data_used_percent() - 10.0).abs() < f64::EPSILON);
        assert_eq!(info.free_data_blocks(), 90);
    }

    #[test]
    fn test_parse_pool_status_rejects_other_targets() {
        assert!(parse_pool_status("0 100 linear 8:1 0").is_err());
        assert!(parse_pool_status("0 100 thin-pool garbage").is_err());
    }

    #[tokio::test]
    async fn test_capacity_refusal_at_72_percent() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("status") {
                ok("0 4194304 thin-pool 1 406/1024 72/100 - rw")
            } else {
                ok("")
            }
        });

        let err = client
            .create_thin_device(123, "thin-123", 64 << 20)
            .await
            .unwrap_err();
        let image_err = err.downcast_ref::<ImageError>().unwrap();
        assert!(matches!(image_err, ImageError::PoolFull(_)));
        let message = err.to_string();
        assert!(message.contains("72.0% full"));
        assert!(message.contains("threshold 70%"));
        assert!(message.contains("gc --force"));

        // The refusal happens before any mutation: only the status read ran.
        let calls = log.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("status imgpool"));
    }

    #[tokio::test]
    async fn test_capacity_refusal_on_insufficient_blocks() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log, |call| {
            if call.contains("status") {
                // 50% used, but only 8 blocks (1 MiB) free.
                ok("0 4194304 thin-pool 1 406/1024 8/16 - rw")
            } else {
                ok("")
            }
        });
        let err = client
            .create_thin_device(123, "thin-123", 64 << 20)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::PoolFull(_))
        ));
    }

    #[tokio::test]
    async fn test_create_thin_device_sequence() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("status") {
                ok(healthy_status())
            } else {
                ok("")
            }
        });

        client
            .create_thin_device(123, "thin-123", 64 << 20)
            .await
            .unwrap();

        let calls = log.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        assert!(calls[0].contains("status imgpool"));
        assert_eq!(
            calls[1],
            "/sbin/dmsetup message /dev/mapper/imgpool 0 create_thin 123"
        );
        assert_eq!(
            calls[2],
            format!(
                "/sbin/dmsetup create thin-123 --table 0 {} thin /dev/mapper/imgpool 123 --verifyudev",
                (64u64 << 20) / SECTOR_SIZE
            )
        );
        assert_eq!(
            calls[3],
            "/sbin/mkfs.ext4 -F -O ^has_journal /dev/mapper/thin-123"
        );
    }

    #[tokio::test]
    async fn test_create_thin_device_reuses_existing_pool_id() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log, |call| {
            if call.contains("status") {
                ok(healthy_status())
            } else if call.contains("create_thin") {
                fail("device-mapper: message ioctl failed: File exists")
            } else {
                ok("")
            }
        });
        // A leftover pool ID from a crashed attempt is ours; creation
        // proceeds to the node and mkfs.
        client
            .create_thin_device(123, "thin-123", 64 << 20)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_cleanup_after_failed_mkfs() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("status") {
                ok(healthy_status())
            } else if call.starts_with("/sbin/mkfs.ext4") {
                fail("mkfs.ext4: Device or resource busy")
            } else {
                ok("")
            }
        });

        assert!(client
            .create_thin_device(123, "thin-123", 64 << 20)
            .await
            .is_err());

        // Fail-dumb: the orphan is left alone, no remove/delete was issued.
        let calls = log.lock().unwrap().clone();
        assert!(!calls.iter().any(|c| c.contains("remove")));
        assert!(!calls.iter().any(|c| c.contains("delete")));
    }

    #[tokio::test]
    async fn test_snapshot_suspends_active_origin() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("status") {
                ok(healthy_status())
            } else if call.contains("info thin-123") {
                ok("Name: thin-123")
            } else {
                ok("")
            }
        });

        client
            .create_snapshot_safe("thin-123", 123, 1_000_123)
            .await
            .unwrap();

        let calls = log.lock().unwrap().clone();
        let suspend = calls.iter().position(|c| c.contains("suspend thin-123"));
        let snap = calls
            .iter()
            .position(|c| c.contains("create_snap 1000123 123"));
        let resume = calls.iter().position(|c| c.contains("resume thin-123"));
        assert!(suspend.unwrap() < snap.unwrap());
        assert!(snap.unwrap() < resume.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_skips_suspend_for_inactive_origin() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("status") {
                ok(healthy_status())
            } else if call.contains("info thin-123") {
                fail("Device thin-123 not found")
            } else {
                ok("")
            }
        });

        client
            .create_snapshot_safe("thin-123", 123, 1_000_123)
            .await
            .unwrap();

        let calls = log.lock().unwrap().clone();
        assert!(!calls.iter().any(|c| c.contains("suspend")));
        assert!(!calls.iter().any(|c| c.contains("resume")));
        assert!(calls.iter().any(|c| c.contains("create_snap 1000123 123")));
    }

    #[tokio::test]
    async fn test_origin_resumed_even_when_create_snap_fails() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("status") {
                ok(healthy_status())
            } else if call.contains("info thin-123") {
                ok("Name: thin-123")
            } else if call.contains("create_snap") {
                fail("device-mapper: message ioctl failed: Invalid argument")
            } else {
                ok("")
            }
        });

        assert!(client
            .create_snapshot_safe("thin-123", 123, 1_000_123)
            .await
            .is_err());
        let calls = log.lock().unwrap().clone();
        assert!(calls.iter().any(|c| c.contains("resume thin-123")));
    }

    #[tokio::test]
    async fn test_unmount_lazy_first_then_force_then_standard() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call == "umount -l /mnt/thin-1" || call == "umount -f /mnt/thin-1" {
                fail("umount: /mnt/thin-1: target is busy")
            } else {
                ok("")
            }
        });

        client
            .unmount_device(Path::new("/mnt/thin-1"))
            .await
            .unwrap();
        let calls = log.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "umount -l /mnt/thin-1",
                "umount -f /mnt/thin-1",
                "umount /mnt/thin-1",
            ]
        );
    }

    #[tokio::test]
    async fn test_unmount_tolerates_not_mounted() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log, |_| fail("umount: /mnt/thin-1: not mounted"));
        client
            .unmount_device(Path::new("/mnt/thin-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deactivate_falls_back_to_force() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("--verifyudev") {
                fail("device-mapper: remove ioctl failed: Device or resource busy")
            } else {
                ok("")
            }
        });

        client.deactivate_device("thin-123").await.unwrap();
        let calls = log.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "/sbin/dmsetup remove --verifyudev thin-123",
                "/sbin/dmsetup remove --force thin-123",
            ]
        );
    }

    #[tokio::test]
    async fn test_stabilize_sequence() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |_| ok(""));
        client.stabilize_pool().await.unwrap();
        let calls = log.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "/sbin/dmsetup message /dev/mapper/imgpool 0 reserve_metadata_snap",
                "/sbin/dmsetup message /dev/mapper/imgpool 0 release_metadata_snap",
                "udevadm settle --timeout=0",
            ]
        );
    }

    #[tokio::test]
    async fn test_device_exists_classification() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log, |call| {
            if call.contains("info present") {
                ok("Name: present")
            } else if call.contains("info absent") {
                fail("Device absent not found")
            } else {
                ok("")
            }
        });
        assert!(client.device_exists("present").await.unwrap());
        assert!(!client.device_exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_thin_device_in_pool_probes_inactive_device() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("info thin-123") {
                fail("Device thin-123 not found")
            } else {
                ok("")
            }
        });
        assert!(client
            .thin_device_in_pool(123, "thin-123", 64 << 20)
            .await
            .unwrap());
        // The probe node is removed again so the device stays inactive.
        let calls = log.lock().unwrap().clone();
        assert!(calls.iter().any(|c| c.contains("create thin-123 --table")));
        assert_eq!(calls.last().unwrap(), "/sbin/dmsetup remove thin-123");
    }

    #[tokio::test]
    async fn test_thin_device_in_pool_detects_missing_id() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("info thin-123") {
                fail("Device thin-123 not found")
            } else if call.contains("create thin-123") {
                fail("device-mapper: reload ioctl failed: No such device or address")
            } else {
                ok("")
            }
        });
        assert!(!client
            .thin_device_in_pool(123, "thin-123", 64 << 20)
            .await
            .unwrap());
        // Nothing to restore after a failed probe.
        let calls = log.lock().unwrap().clone();
        assert!(!calls.iter().any(|c| c.starts_with("/sbin/dmsetup remove")));
    }

    #[tokio::test]
    async fn test_thin_device_in_pool_short_circuits_active_node() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("info thin-123") {
                ok("Name: thin-123")
            } else {
                ok("")
            }
        });
        assert!(client
            .thin_device_in_pool(123, "thin-123", 64 << 20)
            .await
            .unwrap());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_thin_devices() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log, |call| {
            if call.contains("ls --target thin") {
                ok("thin-123\t(253:4)\nsnap-img_ab\t(253:5)\n")
            } else {
                ok("")
            }
        });
        let names = client.list_thin_devices().await.unwrap();
        assert_eq!(names, vec!["thin-123", "snap-img_ab"]);
    }

    #[tokio::test]
    async fn test_ensure_pool_creates_files_loops_and_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.pool_metadata_bytes = 4096;
        config.pool_data_bytes = 1 << 20;

        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("info imgpool") {
                fail("Device imgpool not found")
            } else if call.contains("losetup -j") {
                ok("")
            } else if call.contains("losetup --show -f") {
                if call.contains("pool_meta") {
                    ok("/dev/loop6\n")
                } else {
                    ok("/dev/loop7\n")
                }
            } else {
                ok("")
            }
        });

        client.ensure_pool(&config).await.unwrap();

        assert_eq!(
            std::fs::metadata(config.pool_meta_path()).unwrap().len(),
            4096
        );
        assert_eq!(
            std::fs::metadata(config.pool_data_path()).unwrap().len(),
            1 << 20
        );
        let calls = log.lock().unwrap().clone();
        let create = calls
            .iter()
            .find(|c| c.contains("create imgpool"))
            .unwrap();
        assert!(create.contains(&format!(
            "--table 0 {} thin-pool /dev/loop6 /dev/loop7 256 65536",
            (1u64 << 20) / SECTOR_SIZE
        )));
        // Pool creation is a mutating dm operation: stabilization follows.
        assert!(calls.iter().any(|c| c.contains("reserve_metadata_snap")));
        assert!(calls.iter().any(|c| c.contains("udevadm settle")));
    }

    #[tokio::test]
    async fn test_ensure_pool_idempotent_when_active() {
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let client = scripted_client(log.clone(), |call| {
            if call.contains("info imgpool") {
                ok("Name: imgpool")
            } else {
                ok("")
            }
        });
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();

        client.ensure_pool(&config).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
