// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The download machine: reserve, fetch, validate, record. Idempotent and
//! crash-resumable; a completed image short-circuits via Handoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::extract::{scan_archive, ExtractLimits};
use crate::imageutil::{file_sha256, ImageError};
use crate::machine::{
    abort, classify, transient, with_deadline, EventLog, MachineError, StateMachine, Step,
    Transition, TransitionCtx,
};
use crate::metadata::{ImageRow, MetadataStore, ReserveOutcome};
use crate::objstore::ObjectStoreClient;

/// Deadline for one download attempt.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Deadline for the metadata write.
const DB_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub image_id: String,
    pub object_key: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub image_id: String,
    pub object_key: String,
    pub local_path: String,
    pub checksum_sha256: String,
    pub size_bytes: u64,
    pub already_downloaded: bool,
}

/// Build the download machine over its dependencies.
pub fn download_machine(
    store: Arc<MetadataStore>,
    client: Arc<ObjectStoreClient>,
    config: Arc<Config>,
    log: Arc<EventLog>,
) -> StateMachine<DownloadRequest, DownloadResponse> {
    let workers = config.download_workers;
    let check_store = store.clone();
    let validate_store = store.clone();
    let download_config = config;

    let transitions = vec![
        Transition::new(
            "check-exists",
            3,
            Box::new(move |ctx, req, acc| {
                let store = check_store.clone();
                Box::pin(async move { check_exists(&store, &ctx, &req, acc).await })
            }),
        ),
        Transition::new(
            "download",
            5,
            Box::new(move |ctx, req, acc| {
                let client = client.clone();
                let local_path = download_config.tarball_path(&req.image_id);
                Box::pin(async move { download(&client, local_path, &ctx, &req, acc).await })
            }),
        ),
        Transition::new(
            "validate",
            2,
            Box::new(move |ctx, req, acc| {
                let store = validate_store.clone();
                Box::pin(async move { validate(&store, &ctx, &req, acc).await })
            }),
        ),
        Transition::new(
            "store-metadata",
            5,
            Box::new(move |ctx, req, acc| {
                let store = store.clone();
                Box::pin(async move { store_metadata(&store, &ctx, &req, acc).await })
            }),
        ),
    ];
    StateMachine::new("download", transitions, log, workers)
}

/// Check whether the recorded file still matches its row: present, right
/// size, right digest.
async fn recorded_file_intact(row: &ImageRow) -> Result<bool, MachineError> {
    let (path, checksum, size) = match (&row.local_path, &row.checksum_sha256, row.size_bytes) {
        (Some(path), Some(checksum), Some(size)) => (path.clone(), checksum.clone(), size),
        _ => return Ok(false),
    };
    tokio::task::spawn_blocking(move || -> Result<bool> {
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(_) => return Ok(false),
        };
        if metadata.len() != size {
            return Ok(false);
        }
        Ok(file_sha256(Path::new(&path))? == checksum)
    })
    .await
    .map_err(|e| transient(anyhow::anyhow!("hash task failed: {}", e)))?
    .map_err(transient)
}

fn response_from_row(row: &ImageRow, mut acc: DownloadResponse) -> DownloadResponse {
    acc.local_path = row.local_path.clone().unwrap_or_default();
    acc.checksum_sha256 = row.checksum_sha256.clone().unwrap_or_default();
    acc.size_bytes = row.size_bytes.unwrap_or_default();
    acc.already_downloaded = true;
    acc
}

pub(crate) async fn check_exists(
    store: &MetadataStore,
    _ctx: &TransitionCtx,
    req: &DownloadRequest,
    mut acc: DownloadResponse,
) -> Result<Step<DownloadResponse>, MachineError> {
    acc.image_id = req.image_id.clone();
    acc.object_key = req.object_key.clone();

    if let Some(row) = store
        .check_image_downloaded(&req.object_key)
        .map_err(transient)?
    {
        if recorded_file_intact(&row).await? {
            info!("{} already downloaded, handing off", req.object_key);
            return Ok(Step::Handoff(response_from_row(&row, acc)));
        }
        // The row is ours; the file on disk is not what it claims to be.
        info!(
            "Recorded file for {} is missing or corrupt, re-downloading",
            req.object_key
        );
        return Ok(Step::Continue(acc));
    }

    match store
        .reserve_image_download(&req.image_id, &req.object_key)
        .map_err(transient)?
    {
        ReserveOutcome::Reserved => Ok(Step::Continue(acc)),
        ReserveOutcome::AlreadyCompleted(row) => {
            if recorded_file_intact(&row).await? {
                Ok(Step::Handoff(response_from_row(&row, acc)))
            } else {
                Ok(Step::Continue(acc))
            }
        }
        ReserveOutcome::InProgress => Err(abort(ImageError::DownloadInProgress(
            req.object_key.clone(),
        ))),
    }
}

pub(crate) async fn download(
    client: &ObjectStoreClient,
    local_path: PathBuf,
    ctx: &TransitionCtx,
    req: &DownloadRequest,
    mut acc: DownloadResponse,
) -> Result<Step<DownloadResponse>, MachineError> {
    if let Some(parent) = local_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))
            .map_err(transient)?;
    }

    let result = with_deadline("download", DOWNLOAD_TIMEOUT, async {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(MachineError::Cancelled),
            result = client.download_image(&req.object_key, &local_path) => {
                result.map_err(classify)
            }
        }
    })
    .await?;

    acc.local_path = result.local_path.to_string_lossy().to_string();
    acc.checksum_sha256 = result.checksum_sha256;
    acc.size_bytes = result.size_bytes;
    Ok(Step::Continue(acc))
}

pub(crate) async fn validate(
    store: &MetadataStore,
    _ctx: &TransitionCtx,
    req: &DownloadRequest,
    acc: DownloadResponse,
) -> Result<Step<DownloadResponse>, MachineError> {
    let path = PathBuf::from(&acc.local_path);
    let expected = acc.checksum_sha256.clone();
    let task_path = path.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<()> {
        let metadata = std::fs::metadata(&task_path)
            .with_context(|| format!("Failed to stat {}", task_path.display()))?;
        if metadata.len() == 0 {
            return Err(ImageError::ArchiveViolation(format!(
                "{} is empty",
                task_path.display()
            ))
            .into());
        }
        // Double-check: the digest computed while streaming must match what
        // is actually on disk now.
        let actual = file_sha256(&task_path)?;
        if actual != expected {
            return Err(ImageError::ChecksumMismatch {
                path: task_path.display().to_string(),
                expected,
                actual,
            }
            .into());
        }
        scan_archive(&task_path, &ExtractLimits::default())?;
        Ok(())
    })
    .await
    .map_err(|e| transient(anyhow::anyhow!("validate task failed: {}", e)))?;

    match outcome {
        Ok(()) => Ok(Step::Continue(acc)),
        Err(e) => {
            // A file that failed validation is never kept.
            if let Err(remove_err) = std::fs::remove_file(&path) {
                warn!(
                    "Failed to remove invalid download {}: {}",
                    path.display(),
                    remove_err
                );
            }
            if let Err(mark_err) = store.mark_image_failed(&req.image_id) {
                warn!("Failed to mark {} failed: {:#}", req.image_id, mark_err);
            }
            Err(abort(e.context(format!(
                "validation of {} failed",
                path.display()
            ))))
        }
    }
}

pub(crate) async fn store_metadata(
    store: &MetadataStore,
    _ctx: &TransitionCtx,
    req: &DownloadRequest,
    acc: DownloadResponse,
) -> Result<Step<DownloadResponse>, MachineError> {
    with_deadline("store-metadata", DB_TIMEOUT, async {
        store
            .store_image_metadata(
                &req.image_id,
                &req.object_key,
                &acc.local_path,
                &acc.checksum_sha256,
                acc.size_bytes,
            )
            .map_err(transient)
    })
    .await?;
    info!(
        "Recorded download of {} ({} bytes)",
        req.object_key, acc.size_bytes
    );
    Ok(Step::Continue(acc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tar::{Builder, EntryType, Header};
    use tokio_util::sync::CancellationToken;

    fn test_ctx() -> TransitionCtx {
        TransitionCtx {
            run_id: "download:test".to_string(),
            retry_count: 0,
            cancel: CancellationToken::new(),
        }
    }

    fn test_store(dir: &Path) -> MetadataStore {
        MetadataStore::open(&dir.join("images.db")).unwrap()
    }

    fn request() -> DownloadRequest {
        DownloadRequest {
            image_id: "img_test".to_string(),
            object_key: "images/test.tar".to_string(),
        }
    }

    fn write_tarball(path: &Path) {
        let mut builder = Builder::new(File::create(path).unwrap());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder
            .append_data(&mut header, "etc", std::io::empty())
            .unwrap();
        builder.finish().unwrap();
    }

    #[tokio::test]
    async fn test_check_exists_hands_off_intact_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let tar_path = dir.path().join("img_test.tar");
        write_tarball(&tar_path);
        let checksum = file_sha256(&tar_path).unwrap();
        let size = std::fs::metadata(&tar_path).unwrap().len();
        store
            .store_image_metadata(
                "img_test",
                "images/test.tar",
                &tar_path.to_string_lossy(),
                &checksum,
                size,
            )
            .unwrap();

        let step = check_exists(&store, &test_ctx(), &request(), DownloadResponse::default())
            .await
            .unwrap();
        match step {
            Step::Handoff(acc) => {
                assert!(acc.already_downloaded);
                assert_eq!(acc.checksum_sha256, checksum);
                assert_eq!(acc.size_bytes, size);
            }
            Step::Continue(_) => panic!("expected handoff"),
        }
    }

    #[tokio::test]
    async fn test_check_exists_redownloads_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let tar_path = dir.path().join("img_test.tar");
        write_tarball(&tar_path);
        store
            .store_image_metadata(
                "img_test",
                "images/test.tar",
                &tar_path.to_string_lossy(),
                "not-the-real-digest",
                std::fs::metadata(&tar_path).unwrap().len(),
            )
            .unwrap();

        let step = check_exists(&store, &test_ctx(), &request(), DownloadResponse::default())
            .await
            .unwrap();
        assert!(matches!(step, Step::Continue(_)));
    }

    #[tokio::test]
    async fn test_check_exists_reserves_fresh_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let step = check_exists(&store, &test_ctx(), &request(), DownloadResponse::default())
            .await
            .unwrap();
        assert!(matches!(step, Step::Continue(_)));
        // The reservation row exists now.
        assert!(store.get_image("img_test").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_check_exists_aborts_on_rival_downloader() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store
            .reserve_image_download("img_test", "images/test.tar")
            .unwrap();

        let err = check_exists(&store, &test_ctx(), &request(), DownloadResponse::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MachineError::Abort(_)));
        assert!(err.to_string().contains("already in progress"));
    }

    #[tokio::test]
    async fn test_validate_accepts_good_tarball() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let tar_path = dir.path().join("img_test.tar");
        write_tarball(&tar_path);

        let acc = DownloadResponse {
            image_id: "img_test".to_string(),
            object_key: "images/test.tar".to_string(),
            local_path: tar_path.to_string_lossy().to_string(),
            checksum_sha256: file_sha256(&tar_path).unwrap(),
            size_bytes: std::fs::metadata(&tar_path).unwrap().len(),
            already_downloaded: false,
        };
        let step = validate(&store, &test_ctx(), &request(), acc).await.unwrap();
        assert!(matches!(step, Step::Continue(_)));
        assert!(tar_path.exists());
    }

    #[tokio::test]
    async fn test_validate_removes_file_on_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store
            .reserve_image_download("img_test", "images/test.tar")
            .unwrap();
        let tar_path = dir.path().join("img_test.tar");
        write_tarball(&tar_path);

        let acc = DownloadResponse {
            image_id: "img_test".to_string(),
            object_key: "images/test.tar".to_string(),
            local_path: tar_path.to_string_lossy().to_string(),
            checksum_sha256: "0000".to_string(),
            size_bytes: std::fs::metadata(&tar_path).unwrap().len(),
            already_downloaded: false,
        };
        let err = validate(&store, &test_ctx(), &request(), acc)
            .await
            .unwrap_err();
        assert!(matches!(err, MachineError::Abort(_)));
        assert!(!tar_path.exists());
        // The reservation is released for the next attempt.
        let row = store.get_image("img_test").unwrap().unwrap();
        assert_eq!(row.download_status, "failed");
    }

    #[tokio::test]
    async fn test_validate_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let tar_path = dir.path().join("img_test.tar");
        std::fs::write(&tar_path, b"").unwrap();

        let acc = DownloadResponse {
            local_path: tar_path.to_string_lossy().to_string(),
            checksum_sha256: file_sha256(&tar_path).unwrap(),
            ..Default::default()
        };
        let err = validate(&store, &test_ctx(), &request(), acc)
            .await
            .unwrap_err();
        assert!(matches!(err, MachineError::Abort(_)));
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn test_store_metadata_promotes_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store
            .reserve_image_download("img_test", "images/test.tar")
            .unwrap();

        let acc = DownloadResponse {
            image_id: "img_test".to_string(),
            object_key: "images/test.tar".to_string(),
            local_path: "/tmp/img_test.tar".to_string(),
            checksum_sha256: "cafe".to_string(),
            size_bytes: 7,
            already_downloaded: false,
        };
        store_metadata(&store, &test_ctx(), &request(), acc)
            .await
            .unwrap();
        let row = store.check_image_downloaded("images/test.tar").unwrap().unwrap();
        assert_eq!(row.checksum_sha256.as_deref(), Some("cafe"));
        assert_eq!(row.size_bytes, Some(7));
    }
}
