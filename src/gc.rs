// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Garbage collection. The hot path never cleans up after itself, so this
//! is where orphaned devices, stale locks, and half-finished downloads get
//! reclaimed. Runs only while the system is idle unless forced.

use std::collections::HashSet;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::config::Config;
use crate::guard::ProcessGuard;
use crate::imageutil::ImageError;
use crate::metadata::MetadataStore;
use crate::thinpool::ThinPoolClient;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub devices_removed: u32,
    pub pool_ids_deleted: u32,
    pub snapshots_deactivated: u32,
    pub locks_cleared: usize,
    pub reservations_expired: usize,
    pub partials_removed: u32,
}

/// Reclaim everything the fail-dumb policy left behind.
pub async fn run_gc(
    config: &Config,
    store: &MetadataStore,
    pool: &ThinPoolClient,
    force: bool,
) -> Result<GcReport> {
    if ProcessGuard::is_held(&config.manager_lock_path())? {
        if !force {
            return Err(ImageError::GuardHeld(
                "a manager is running; pass --force to collect anyway".to_string(),
            ))
            .context("Refusing to garbage collect");
        }
        warn!("Manager guard is held; forcing garbage collection");
    }

    let mut report = GcReport::default();

    // Every device name with an owning row is off-limits.
    let mut owned: HashSet<String> = HashSet::new();
    for row in store.list_unpacked()? {
        owned.insert(row.device_name);
    }
    for row in store.list_snapshots()? {
        owned.insert(row.snapshot_name);
    }

    for name in pool.list_thin_devices().await? {
        if name == pool.pool_name() || owned.contains(&name) {
            continue;
        }
        info!("Reclaiming orphaned device {}", name);

        // Learn the pool device ID from the node's table before removing it.
        let device_id = match pool.device_table(&name).await {
            Ok(table) => table
                .split_whitespace()
                .last()
                .and_then(|field| field.parse::<u64>().ok()),
            Err(e) => {
                warn!("Failed to read table of {}: {:#}", name, e);
                None
            }
        };

        // A leftover extraction mount may still pin the device.
        let mount_point = config.mount_root.join(&name);
        if let Err(e) = pool.unmount_device(&mount_point).await {
            warn!("Failed to unmount {}: {:#}", mount_point.display(), e);
        }
        pool.deactivate_device(&name)
            .await
            .with_context(|| format!("Failed to deactivate orphan {}", name))?;
        report.devices_removed += 1;

        match device_id {
            Some(device_id) => match pool.delete_thin_device(device_id).await {
                Ok(()) => report.pool_ids_deleted += 1,
                Err(e) => warn!("Failed to delete pool ID {}: {:#}", device_id, e),
            },
            None => warn!("No pool device ID found for {}, node removed only", name),
        }
        pool.stabilize_pool().await?;
    }

    // An active snapshot row whose mapper node is gone is demoted so the
    // activate machine rebuilds it on the next request.
    for snapshot in store.list_snapshots()? {
        if !snapshot.active {
            continue;
        }
        match pool.device_exists(&snapshot.snapshot_name).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "Snapshot {} has no mapper device, deactivating its row",
                    snapshot.snapshot_name
                );
                store.deactivate_snapshot(snapshot.snapshot_id)?;
                report.snapshots_deactivated += 1;
            }
            Err(e) => warn!(
                "Failed to check snapshot {}: {:#}",
                snapshot.snapshot_name, e
            ),
        }
    }

    report.locks_cleared = store.clear_all_image_locks()?;
    report.reservations_expired = store.mark_stale_reservations_failed()?;

    if let Ok(entries) = std::fs::read_dir(&config.local_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_partial = path
                .extension()
                .map_or(false, |extension| extension == "part");
            if is_partial {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        info!("Removed partial download {}", path.display());
                        report.partials_removed += 1;
                    }
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }
    }

    info!(
        "Garbage collection done: {} devices, {} pool IDs, {} snapshots, {} locks, \
         {} reservations, {} partials",
        report.devices_removed,
        report.pool_ids_deleted,
        report.snapshots_deactivated,
        report.locks_cleared,
        report.reservations_expired,
        report.partials_removed
    );
    Ok(report)
}
