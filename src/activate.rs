// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The activate machine: check for an existing snapshot, create one safely
//! off the inactive origin, and register the activatable device.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::imageutil::{mapper_path, snapshot_id_for_origin, ImageError};
use crate::machine::{
    abort, classify, transient, with_deadline, EventLog, MachineError, StateMachine, Step,
    Transition, TransitionCtx,
};
use crate::metadata::MetadataStore;
use crate::thinpool::ThinPoolClient;

/// Deadline for the whole snapshot creation step.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for the registration writes.
const DB_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivateRequest {
    pub image_id: String,
    pub origin_device_id: u64,
    pub origin_device_name: String,
    pub snapshot_name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActivateResponse {
    pub image_id: String,
    pub snapshot_id: u64,
    pub snapshot_name: String,
    pub device_path: String,
    pub origin_device_id: u64,
    pub already_active: bool,
}

/// Build the activate machine over its dependencies.
pub fn activate_machine(
    store: Arc<MetadataStore>,
    pool: Arc<ThinPoolClient>,
    config: Arc<Config>,
    log: Arc<EventLog>,
) -> StateMachine<ActivateRequest, ActivateResponse> {
    let workers = config.activate_workers;
    let check_store = store.clone();
    let check_pool = pool.clone();
    let create_store = store.clone();

    let transitions = vec![
        Transition::new(
            "check-snapshot",
            3,
            Box::new(move |ctx, req, acc| {
                let store = check_store.clone();
                let pool = check_pool.clone();
                Box::pin(async move { check_snapshot(&store, &pool, &ctx, &req, acc).await })
            }),
        ),
        Transition::new(
            "create-snapshot",
            3,
            Box::new(move |ctx, req, acc| {
                let store = create_store.clone();
                let pool = pool.clone();
                Box::pin(async move { create_snapshot(&store, &pool, &ctx, &req, acc).await })
            }),
        ),
        Transition::new(
            "register",
            5,
            Box::new(move |ctx, req, acc| {
                let store = store.clone();
                Box::pin(async move { register(&store, &ctx, &req, acc).await })
            }),
        ),
    ];
    StateMachine::new("activate", transitions, log, workers)
}

pub(crate) async fn check_snapshot(
    store: &MetadataStore,
    pool: &ThinPoolClient,
    _ctx: &TransitionCtx,
    req: &ActivateRequest,
    mut acc: ActivateResponse,
) -> Result<Step<ActivateResponse>, MachineError> {
    acc.image_id = req.image_id.clone();
    acc.snapshot_name = req.snapshot_name.clone();
    acc.origin_device_id = req.origin_device_id;

    if let Some(snap) = store
        .check_snapshot_exists(&req.image_id, &req.snapshot_name)
        .map_err(transient)?
    {
        if snap.active {
            match pool.device_exists(&req.snapshot_name).await {
                Ok(true) => {
                    info!("{} already active, handing off", req.snapshot_name);
                    acc.snapshot_id = snap.snapshot_id;
                    acc.device_path = snap.device_path.clone();
                    acc.already_active = true;
                    return Ok(Step::Handoff(acc));
                }
                Ok(false) => {
                    info!(
                        "Snapshot row for {} has no mapper device, purging stale row",
                        req.snapshot_name
                    );
                    store
                        .delete_snapshot(snap.snapshot_id)
                        .map_err(transient)?;
                }
                Err(e) => return Err(classify(e)),
            }
        }
    }
    Ok(Step::Continue(acc))
}

pub(crate) async fn create_snapshot(
    store: &MetadataStore,
    pool: &ThinPoolClient,
    _ctx: &TransitionCtx,
    req: &ActivateRequest,
    mut acc: ActivateResponse,
) -> Result<Step<ActivateResponse>, MachineError> {
    with_deadline("create-snapshot", SNAPSHOT_TIMEOUT, async {
        let snap_id = snapshot_id_for_origin(req.origin_device_id);

        let origin = store
            .check_image_unpacked(&req.image_id)
            .map_err(transient)?
            .ok_or_else(|| {
                abort(ImageError::DeviceNotFound(format!(
                    "origin device for {} is not recorded; unpack it first",
                    req.image_id
                )))
            })?;

        if pool
            .device_exists(&req.snapshot_name)
            .await
            .map_err(classify)?
        {
            info!(
                "Snapshot device {} already exists, using it as-is",
                req.snapshot_name
            );
        } else {
            pool.create_snapshot_safe(&req.origin_device_name, req.origin_device_id, snap_id)
                .await
                .map_err(classify)?;
            pool.stabilize_pool().await.map_err(transient)?;
            pool.activate_device(&req.snapshot_name, snap_id, origin.size_bytes)
                .await
                .map_err(classify)?;
            pool.stabilize_pool().await.map_err(transient)?;
        }

        acc.snapshot_id = snap_id;
        acc.device_path = mapper_path(&req.snapshot_name);
        Ok(Step::Continue(acc))
    })
    .await
}

pub(crate) async fn register(
    store: &MetadataStore,
    _ctx: &TransitionCtx,
    req: &ActivateRequest,
    acc: ActivateResponse,
) -> Result<Step<ActivateResponse>, MachineError> {
    with_deadline("register", DB_TIMEOUT, async {
        store
            .store_snapshot(
                acc.snapshot_id,
                &req.image_id,
                &req.snapshot_name,
                &acc.device_path,
                req.origin_device_id,
            )
            .map_err(transient)?;
        store
            .update_image_activation_status(&req.image_id, "active")
            .map_err(transient)
    })
    .await?;
    info!(
        "Activated {} as {} (snapshot ID {})",
        req.image_id, acc.device_path, acc.snapshot_id
    );
    Ok(Step::Continue(acc))
}
