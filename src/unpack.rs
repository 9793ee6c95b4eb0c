// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The unpack machine: lock, create-device, extract, verify, record.
//!
//! Two rules dominate this file. The per-image lock is released on every
//! exit path, and each release site is explicit so they can be audited. And
//! failures never clean up: a half-built device or a still-mounted
//! filesystem is left exactly where it is for the garbage collector,
//! because unmounting or removing devices on a stressed pool is how the
//! kernel ends up in D-state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::extract::{extract_archive, verify_layout, ExtractLimits, RootLayout};
use crate::imageutil::{
    device_id_for_image, log_duration, mapper_path, thin_device_name, ImageError,
};
use crate::machine::{
    abort, classify, transient, with_deadline, EventLog, MachineError, StateMachine, Step,
    Transition, TransitionCtx,
};
use crate::metadata::{LockOutcome, MetadataStore, UnpackedRow};
use crate::thinpool::ThinPoolClient;

/// Deadline for one extraction attempt.
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Deadline for the metadata write.
const DB_TIMEOUT: Duration = Duration::from_secs(15);
/// Smallest thin device we bother creating.
const MIN_DEVICE_BYTES: u64 = 64 * 1024 * 1024;
/// Virtual size headroom over the tarball size.
const DEVICE_SIZE_FACTOR: u64 = 4;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnpackRequest {
    pub image_id: String,
    pub object_key: String,
    pub local_path: String,
    pub tarball_bytes: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnpackResponse {
    pub image_id: String,
    pub device_id: u64,
    pub device_name: String,
    pub device_path: String,
    /// Virtual size of the thin device; the snapshot table is built from it.
    pub size_bytes: u64,
    pub file_count: u64,
    pub bytes_extracted: u64,
    pub mount_point: String,
    pub layout: Option<RootLayout>,
    /// Set when another holder owns the unpack and we handed off without
    /// device details.
    pub unpacked_by_peer: bool,
}

/// Tag recorded in the lock row: machine plus process.
pub fn lock_holder() -> String {
    format!("unpack:{}", std::process::id())
}

/// Virtual device size for a tarball: headroom for extraction growth,
/// rounded up to the pool block.
fn device_size_for_tarball(tarball_bytes: u64, block_bytes: u64) -> u64 {
    let wanted = (tarball_bytes * DEVICE_SIZE_FACTOR).max(MIN_DEVICE_BYTES);
    wanted.div_euclid(block_bytes) * block_bytes
        + if wanted % block_bytes == 0 { 0 } else { block_bytes }
}

/// Best-effort lock release used on the enumerated exit paths.
fn release_lock(store: &MetadataStore, image_id: &str) {
    if let Err(e) = store.release_image_lock_if_holder(image_id, &lock_holder()) {
        warn!("Failed to release image lock for {}: {:#}", image_id, e);
    }
}

fn fill_from_row(mut acc: UnpackResponse, row: &UnpackedRow) -> UnpackResponse {
    acc.device_id = row.device_id;
    acc.device_name = row.device_name.clone();
    acc.device_path = row.device_path.clone();
    acc.size_bytes = row.size_bytes;
    acc.file_count = row.file_count;
    acc
}

/// Build the unpack machine over its dependencies.
pub fn unpack_machine(
    store: Arc<MetadataStore>,
    pool: Arc<ThinPoolClient>,
    config: Arc<Config>,
    log: Arc<EventLog>,
) -> StateMachine<UnpackRequest, UnpackResponse> {
    let workers = config.unpack_workers;
    let mount_root = config.mount_root.clone();
    let check_store = store.clone();
    let check_pool = pool.clone();
    let create_store = store.clone();
    let create_pool = pool.clone();
    let extract_store = store.clone();
    let verify_store = store.clone();

    let transitions = vec![
        Transition::new(
            "check-unpacked",
            3,
            Box::new(move |ctx, req, acc| {
                let store = check_store.clone();
                let pool = check_pool.clone();
                Box::pin(async move { check_unpacked(&store, &pool, &ctx, &req, acc).await })
            }),
        ),
        Transition::new(
            "create-device",
            3,
            Box::new(move |ctx, req, acc| {
                let store = create_store.clone();
                let pool = create_pool.clone();
                let mount_root = mount_root.clone();
                Box::pin(async move {
                    create_device(&store, &pool, &mount_root, &ctx, &req, acc).await
                })
            }),
        ),
        Transition::new(
            "extract-layers",
            2,
            Box::new(move |ctx, req, acc| {
                let store = extract_store.clone();
                Box::pin(async move { extract_layers(&store, &ctx, &req, acc).await })
            }),
        ),
        Transition::new(
            "verify-layout",
            2,
            Box::new(move |ctx, req, acc| {
                let store = verify_store.clone();
                Box::pin(async move { verify_layout_step(&store, &ctx, &req, acc).await })
            }),
        ),
        Transition::new(
            "update-db",
            5,
            Box::new(move |ctx, req, acc| {
                let store = store.clone();
                let pool = pool.clone();
                Box::pin(async move { update_db(&store, &pool, &ctx, &req, acc).await })
            }),
        ),
    ];
    StateMachine::new("unpack", transitions, log, workers)
}

pub(crate) async fn check_unpacked(
    store: &MetadataStore,
    pool: &ThinPoolClient,
    _ctx: &TransitionCtx,
    req: &UnpackRequest,
    mut acc: UnpackResponse,
) -> Result<Step<UnpackResponse>, MachineError> {
    acc.image_id = req.image_id.clone();

    match store
        .acquire_image_lock(&req.image_id, &lock_holder())
        .map_err(transient)?
    {
        LockOutcome::Acquired => {}
        LockOutcome::Held(owner) => {
            info!(
                "Image {} is being unpacked by {}, handing off",
                req.image_id, owner
            );
            match store.check_image_unpacked(&req.image_id).map_err(transient)? {
                Some(row) => return Ok(Step::Handoff(fill_from_row(acc, &row))),
                None => {
                    acc.unpacked_by_peer = true;
                    return Ok(Step::Handoff(acc));
                }
            }
        }
    }

    // Lock held from here; every early return below releases it.
    let row = match store.check_image_unpacked(&req.image_id) {
        Ok(row) => row,
        Err(e) => {
            release_lock(store, &req.image_id);
            return Err(transient(e));
        }
    };
    if let Some(row) = row {
        // The device is normally inactive here, so membership in the pool
        // is what counts, not an active node.
        match pool
            .thin_device_in_pool(row.device_id, &row.device_name, row.size_bytes)
            .await
        {
            Ok(true) => {
                // Exit: already unpacked and the device is real.
                release_lock(store, &req.image_id);
                info!("{} already unpacked as {}", req.image_id, row.device_name);
                return Ok(Step::Handoff(fill_from_row(acc, &row)));
            }
            Ok(false) => {
                info!(
                    "Unpacked row for {} has no mapper device {}, purging stale row",
                    req.image_id, row.device_name
                );
                if let Err(e) = store.delete_unpacked_image(&req.image_id) {
                    release_lock(store, &req.image_id);
                    return Err(transient(e));
                }
            }
            Err(e) => {
                release_lock(store, &req.image_id);
                return Err(classify(e));
            }
        }
    }

    // Proceed to device creation, still holding the lock.
    Ok(Step::Continue(acc))
}

pub(crate) async fn create_device(
    store: &MetadataStore,
    pool: &ThinPoolClient,
    mount_root: &Path,
    _ctx: &TransitionCtx,
    req: &UnpackRequest,
    mut acc: UnpackResponse,
) -> Result<Step<UnpackResponse>, MachineError> {
    // Re-assert the lock: a resumed run enters here directly after the
    // startup sweep.
    match store
        .acquire_image_lock(&req.image_id, &lock_holder())
        .map_err(transient)?
    {
        LockOutcome::Acquired => {}
        LockOutcome::Held(owner) => return Err(abort(ImageError::LockHeld(owner))),
    }

    let device_id = match device_id_for_image(&req.image_id) {
        Ok(device_id) => device_id,
        Err(e) => {
            release_lock(store, &req.image_id);
            return Err(abort(e));
        }
    };
    let device_name = thin_device_name(device_id);
    let device_path = mapper_path(&device_name);

    let exists = match pool.device_exists(&device_name).await {
        Ok(exists) => exists,
        Err(e) => {
            release_lock(store, &req.image_id);
            return Err(classify(e));
        }
    };
    let row = match store.check_image_unpacked(&req.image_id) {
        Ok(row) => row,
        Err(e) => {
            release_lock(store, &req.image_id);
            return Err(transient(e));
        }
    };

    let size_bytes = if exists {
        match row {
            Some(row) => {
                info!("Reusing existing device {} for {}", device_name, req.image_id);
                row.size_bytes
            }
            None => {
                // Exit: a device we did not record. Never reclaim it here.
                release_lock(store, &req.image_id);
                return Err(abort(ImageError::OrphanedDevice(device_name)));
            }
        }
    } else {
        let size_bytes = device_size_for_tarball(req.tarball_bytes, pool.block_bytes());
        if let Err(e) = pool
            .create_thin_device(device_id, &device_name, size_bytes)
            .await
        {
            // Exit: creation failed; PoolFull is permanent. Whatever half
            // exists stays for gc.
            release_lock(store, &req.image_id);
            return Err(classify(e));
        }
        size_bytes
    };
    if let Err(e) = pool.stabilize_pool().await {
        release_lock(store, &req.image_id);
        return Err(transient(e));
    }

    let mount_point = mount_root.join(&device_name);
    if let Err(e) = pool.mount_device(&device_path, &mount_point).await {
        release_lock(store, &req.image_id);
        return Err(classify(e));
    }
    if let Err(e) = pool.stabilize_pool().await {
        release_lock(store, &req.image_id);
        return Err(transient(e));
    }

    acc.device_id = device_id;
    acc.device_name = device_name;
    acc.device_path = device_path;
    acc.size_bytes = size_bytes;
    acc.mount_point = mount_point.to_string_lossy().to_string();
    Ok(Step::Continue(acc))
}

pub(crate) async fn extract_layers(
    store: &MetadataStore,
    _ctx: &TransitionCtx,
    req: &UnpackRequest,
    mut acc: UnpackResponse,
) -> Result<Step<UnpackResponse>, MachineError> {
    let tar_path = PathBuf::from(&req.local_path);
    let mount_point = PathBuf::from(&acc.mount_point);
    let start = std::time::Instant::now();
    let result = with_deadline("extract-layers", EXTRACT_TIMEOUT, async {
        tokio::task::spawn_blocking(move || {
            extract_archive(&tar_path, &mount_point, &ExtractLimits::default())
        })
        .await
        .map_err(|e| transient(anyhow::anyhow!("extract task failed: {}", e)))?
        .map_err(classify)
    })
    .await;

    match result {
        Ok(summary) => {
            log_duration(
                &format!(
                    "Extracted {} files ({} bytes) for {}",
                    summary.files_extracted, summary.bytes_extracted, req.image_id
                ),
                start.elapsed(),
            );
            acc.file_count = summary.files_extracted;
            acc.bytes_extracted = summary.bytes_extracted;
            Ok(Step::Continue(acc))
        }
        Err(MachineError::Cancelled) => {
            // Exit: cancellation releases the lock and leaves the run
            // resumable.
            release_lock(store, &req.image_id);
            Err(MachineError::Cancelled)
        }
        Err(MachineError::Transient(e)) | Err(MachineError::Abort(e)) => {
            // Exit, fail-dumb: the device stays active and mounted. No
            // cleanup subprocess runs here.
            warn!(
                "Extraction for {} failed; leaving device {} mounted at {} for gc",
                req.image_id, acc.device_name, acc.mount_point
            );
            release_lock(store, &req.image_id);
            Err(MachineError::Abort(e))
        }
    }
}

pub(crate) async fn verify_layout_step(
    store: &MetadataStore,
    _ctx: &TransitionCtx,
    req: &UnpackRequest,
    mut acc: UnpackResponse,
) -> Result<Step<UnpackResponse>, MachineError> {
    let mount_point = PathBuf::from(&acc.mount_point);
    let result = tokio::task::spawn_blocking(move || verify_layout(&mount_point))
        .await
        .map_err(|e| transient(anyhow::anyhow!("verify task failed: {}", e)));

    match result {
        Ok(Ok(layout)) => {
            acc.layout = Some(layout);
            Ok(Step::Continue(acc))
        }
        Ok(Err(e)) | Err(MachineError::Transient(e)) => {
            // Exit, fail-dumb: layout violations are permanent and nothing
            // is cleaned up.
            warn!(
                "Layout verification for {} failed; leaving device {} for gc",
                req.image_id, acc.device_name
            );
            release_lock(store, &req.image_id);
            Err(abort(e))
        }
        Err(other) => {
            release_lock(store, &req.image_id);
            Err(other)
        }
    }
}

pub(crate) async fn update_db(
    store: &MetadataStore,
    pool: &ThinPoolClient,
    _ctx: &TransitionCtx,
    req: &UnpackRequest,
    acc: UnpackResponse,
) -> Result<Step<UnpackResponse>, MachineError> {
    // The row must exist before the device is deactivated, or crash
    // recovery cannot tell this device from an orphan.
    with_deadline("update-db", DB_TIMEOUT, async {
        store
            .store_unpacked_image(
                &req.image_id,
                acc.device_id,
                &acc.device_name,
                &acc.device_path,
                acc.size_bytes,
                acc.file_count,
            )
            .map_err(transient)
    })
    .await?;

    // Exit: the unpack is durably recorded.
    release_lock(store, &req.image_id);

    // Quiesce and deactivate the origin so the activate machine can
    // snapshot it safely. Lazy unmount first; sync-heavy unmounts hang on
    // stressed pools.
    pool.unmount_device(Path::new(&acc.mount_point))
        .await
        .map_err(transient)?;
    tokio::time::sleep(Duration::from_millis(1)).await;
    pool.deactivate_device(&acc.device_name)
        .await
        .map_err(transient)?;
    pool.stabilize_pool().await.map_err(transient)?;

    info!(
        "Unpacked {} onto {} ({} files, {} bytes)",
        req.image_id, acc.device_name, acc.file_count, acc.bytes_extracted
    );
    Ok(Step::Continue(acc))
}
