// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The driver: takes the host guard, brings the pool up, resumes pending
//! runs, and chains Download, Unpack, and Activate for each requested
//! object key. Everything is keyed by the deterministically derived image
//! identity, so a crash mid-chain resumes the right machine on the next
//! attempt.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::activate::{activate_machine, ActivateRequest, ActivateResponse};
use crate::config::Config;
use crate::download::{download_machine, DownloadRequest, DownloadResponse};
use crate::extract::RootLayout;
use crate::guard::ProcessGuard;
use crate::imageutil::{
    image_id_for_key, snapshot_name_for_image, CommandRunner, SystemRunner,
};
use crate::machine::{transient, EventLog, MachineError, RunStatus, StateMachine};
use crate::metadata::{ImageRow, MetadataStore, SnapshotRow};
use crate::objstore::ObjectStoreClient;
use crate::thinpool::ThinPoolClient;
use crate::unpack::{lock_holder, unpack_machine, UnpackRequest, UnpackResponse};

/// What `process_image` hands back to the caller.
#[derive(Clone, Debug)]
pub struct ProcessOutcome {
    pub image_id: String,
    pub object_key: String,
    pub snapshot_name: String,
    pub device_path: String,
    pub layout: Option<RootLayout>,
}

impl std::fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageManager").finish_non_exhaustive()
    }
}

pub struct ImageManager {
    config: Arc<Config>,
    store: Arc<MetadataStore>,
    fsm: Arc<EventLog>,
    download: StateMachine<DownloadRequest, DownloadResponse>,
    unpack: StateMachine<UnpackRequest, UnpackResponse>,
    activate: StateMachine<ActivateRequest, ActivateResponse>,
    cancel: CancellationToken,
    _guard: ProcessGuard,
}

impl ImageManager {
    /// Construct the manager against the real system tools.
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_runner(config, Arc::new(SystemRunner {})).await
    }

    /// Construct with an injected command runner. Takes the host guard,
    /// sweeps stale image locks, and brings the pool up.
    pub async fn with_runner(config: Config, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let config = Arc::new(config);
        for dir in [&config.state_dir, &config.data_dir, &config.local_dir, &config.mount_root] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let guard = ProcessGuard::acquire(&config.manager_lock_path())
            .context("Another manager is active on this host")?;

        let store = Arc::new(MetadataStore::open(&config.images_db_path())?);
        // With the host guard held, any lock row is a leftover from a dead
        // process.
        let swept = store.clear_all_image_locks()?;
        if swept > 0 {
            info!("Swept {} stale image locks", swept);
        }

        let fsm = Arc::new(EventLog::open(&config.fsm_db_path())?);
        let pool = Arc::new(ThinPoolClient::new(
            &config.pool_name,
            config.pool_block_sectors,
            runner,
        ));
        pool.ensure_pool(&config).await?;

        let objstore = Arc::new(ObjectStoreClient::new(
            &config.endpoint,
            &config.bucket,
            config.max_download_bytes,
        )?);

        let download = download_machine(
            store.clone(),
            objstore,
            config.clone(),
            fsm.clone(),
        );
        let unpack = unpack_machine(store.clone(), pool.clone(), config.clone(), fsm.clone());
        let activate = activate_machine(store.clone(), pool, config.clone(), fsm.clone());

        Ok(Self {
            config,
            store,
            fsm,
            download,
            unpack,
            activate,
            cancel: CancellationToken::new(),
            _guard: guard,
        })
    }

    /// Token that aborts in-flight subprocess work; cancelled runs stay
    /// resumable.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pull, unpack, and activate one image. Idempotent: completed stages
    /// hand off from their durable records.
    pub async fn process_image(&self, object_key: &str) -> Result<ProcessOutcome, MachineError> {
        let image_id = image_id_for_key(object_key);
        info!("Processing {} as {}", object_key, image_id);

        let download = self
            .download
            .submit(
                &image_id,
                DownloadRequest {
                    image_id: image_id.clone(),
                    object_key: object_key.to_string(),
                },
                &self.cancel,
            )
            .await?;

        let unpack_request = UnpackRequest {
            image_id: image_id.clone(),
            object_key: object_key.to_string(),
            local_path: download.local_path.clone(),
            tarball_bytes: download.size_bytes,
        };
        let unpack = match self
            .unpack
            .submit(&image_id, unpack_request, &self.cancel)
            .await
        {
            Ok(unpack) => unpack,
            Err(e) => {
                // Backstop for the lock audit: no failed unpack may leave
                // its lock row behind, including runtime-level aborts.
                if let Err(release_err) = self
                    .store
                    .release_image_lock_if_holder(&image_id, &lock_holder())
                {
                    warn!(
                        "Failed to release unpack lock for {}: {:#}",
                        image_id, release_err
                    );
                }
                return Err(e);
            }
        };
        if unpack.unpacked_by_peer {
            return Err(transient(anyhow::anyhow!(
                "unpack of {} is in progress by another holder; retry later",
                image_id
            )));
        }

        let snapshot_name = snapshot_name_for_image(&image_id);
        let activate = self
            .activate
            .submit(
                &image_id,
                ActivateRequest {
                    image_id: image_id.clone(),
                    origin_device_id: unpack.device_id,
                    origin_device_name: unpack.device_name.clone(),
                    snapshot_name: snapshot_name.clone(),
                },
                &self.cancel,
            )
            .await?;

        info!(
            "Image {} active at {}",
            object_key, activate.device_path
        );
        Ok(ProcessOutcome {
            image_id,
            object_key: object_key.to_string(),
            snapshot_name,
            device_path: activate.device_path,
            layout: unpack.layout,
        })
    }

    /// Re-drive every non-terminal run found in the event log. Completed
    /// stages hand off, so this converges quickly after a crash.
    pub async fn resume_pending(&self) -> Result<usize> {
        let runs = self.fsm.pending_runs()?;
        let mut keys: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for run in runs {
            let request: serde_json::Value = match serde_json::from_str(&run.request) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Unreadable request for {}: {}", run.run_id, e);
                    continue;
                }
            };
            if let Some(key) = request.get("object_key").and_then(|v| v.as_str()) {
                if seen.insert(key.to_string()) {
                    keys.push(key.to_string());
                }
            }
        }

        let count = keys.len();
        for key in keys {
            info!("Resuming interrupted processing of {}", key);
            if let Err(e) = self.process_image(&key).await {
                warn!("Resumed processing of {} failed: {}", key, e);
            }
        }
        Ok(count)
    }

    pub fn list_images(&self) -> Result<Vec<ImageRow>> {
        self.store.list_images()
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotRow>> {
        self.store.list_snapshots()
    }

    pub fn status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        self.fsm.run_status(run_id)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imageutil::{file_sha256, CommandOutput, MockCommandRunner};
    use std::fs::File;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tar::{Builder, EntryType, Header};

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

    /// Runner that fakes the whole tool surface: devices exist once
    /// created, the pool is healthy, and loop devices attach.
    fn fake_system(log: CallLog) -> Arc<MockCommandRunner> {
        let created: Arc<StdMutex<HashSet<String>>> = Arc::new(StdMutex::new(HashSet::new()));
        let mut mock = MockCommandRunner::new();
        mock.expect_run().returning(move |program, args, _timeout| {
            let call = format!("{} {}", program, args.join(" "));
            log.lock().unwrap().push(call.clone());
            let mut created = created.lock().unwrap();
            let output = if program.ends_with("dmsetup") {
                match args[0].as_str() {
                    "info" => {
                        if created.contains(&args[1]) {
                            ok("Name: device")
                        } else {
                            fail("Device not found")
                        }
                    }
                    "status" => ok("0 4194304 thin-pool 1 406/1024 10/100 - rw"),
                    "create" => {
                        created.insert(args[1].clone());
                        ok("")
                    }
                    "remove" => {
                        if let Some(name) = args.last() {
                            created.remove(name);
                        }
                        ok("")
                    }
                    _ => ok(""),
                }
            } else if program.ends_with("losetup") {
                if args[0] == "-j" {
                    ok("")
                } else if call.contains("pool_meta") {
                    ok("/dev/loop6\n")
                } else {
                    ok("/dev/loop7\n")
                }
            } else if program == "mount" && args.is_empty() {
                ok("")
            } else {
                ok("")
            };
            Ok(output)
        });
        Arc::new(mock)
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.state_dir = dir.join("state");
        config.data_dir = dir.join("pool");
        config.local_dir = dir.join("images");
        config.mount_root = dir.join("mnt");
        config
    }

    fn write_image_tarball(path: &Path) {
        let mut builder = Builder::new(File::create(path).unwrap());
        for dir in ["etc", "usr", "var"] {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder
                .append_data(&mut header, dir, std::io::empty())
                .unwrap();
        }
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(4);
        builder
            .append_data(&mut header, "etc/hostname", &b"box\n"[..])
            .unwrap();
        builder.finish().unwrap();
    }

    /// Seed the store as if the download machine had already completed, so
    /// process_image exercises the full chain without a network.
    fn seed_download(store: &MetadataStore, config: &Config, object_key: &str) -> String {
        let image_id = image_id_for_key(object_key);
        let tar_path = config.tarball_path(&image_id);
        std::fs::create_dir_all(tar_path.parent().unwrap()).unwrap();
        write_image_tarball(&tar_path);
        store
            .store_image_metadata(
                &image_id,
                object_key,
                &tar_path.to_string_lossy(),
                &file_sha256(&tar_path).unwrap(),
                std::fs::metadata(&tar_path).unwrap().len(),
            )
            .unwrap();
        image_id
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_process_image_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let manager = ImageManager::with_runner(config, fake_system(log.clone()))
            .await
            .unwrap();

        let object_key = "images/alpine-3.18.tar";
        let image_id = seed_download(
            &MetadataStore::open(&manager.config().images_db_path()).unwrap(),
            manager.config(),
            object_key,
        );

        let outcome = manager.process_image(object_key).await.unwrap();
        assert_eq!(outcome.image_id, image_id);
        assert_eq!(outcome.snapshot_name, format!("snap-{}", image_id));
        assert_eq!(
            outcome.device_path,
            format!("/dev/mapper/snap-{}", image_id)
        );
        assert_eq!(outcome.layout, Some(RootLayout::DirectRoot));

        // Durable invariants: unpacked row with a 24-bit device ID, active
        // snapshot, active image.
        let unpacked = manager
            .store
            .check_image_unpacked(&image_id)
            .unwrap()
            .unwrap();
        assert!(unpacked.device_id < 1 << 24);
        assert_eq!(unpacked.device_name, format!("thin-{}", unpacked.device_id));
        let snapshot = manager
            .store
            .check_snapshot_exists(&image_id, &outcome.snapshot_name)
            .unwrap()
            .unwrap();
        assert!(snapshot.active);
        assert_eq!(snapshot.origin_device_id, unpacked.device_id);
        let image = manager.store.get_image(&image_id).unwrap().unwrap();
        assert_eq!(image.activation_status, "active");

        // The origin was deactivated after unpack and the lock released.
        assert!(manager.store.is_image_locked(&image_id).unwrap().is_none());
        let calls = log.lock().unwrap().clone();
        assert!(calls
            .iter()
            .any(|c| c.contains(&format!("remove --verifyudev {}", unpacked.device_name))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resubmission_hands_off_without_new_work() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let manager = ImageManager::with_runner(config, fake_system(log.clone()))
            .await
            .unwrap();

        let object_key = "images/alpine-3.18.tar";
        seed_download(
            &MetadataStore::open(&manager.config().images_db_path()).unwrap(),
            manager.config(),
            object_key,
        );

        let first = manager.process_image(object_key).await.unwrap();
        let creates_after_first = log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains("create_thin"))
            .count();

        let second = manager.process_image(object_key).await.unwrap();
        assert_eq!(first.device_path, second.device_path);

        // No second thin device was created; the chain handed off from the
        // durable records.
        let creates_after_second = log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains("create_thin"))
            .count();
        assert_eq!(creates_after_first, creates_after_second);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_manager_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let _manager = ImageManager::with_runner(config.clone(), fake_system(log.clone()))
            .await
            .unwrap();

        let err = ImageManager::with_runner(config, fake_system(log))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Another manager is active"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resume_pending_redrives_interrupted_chain() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let object_key = "images/alpine-3.18.tar";

        {
            let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
            let manager = ImageManager::with_runner(config.clone(), fake_system(log))
                .await
                .unwrap();
            seed_download(
                &MetadataStore::open(&manager.config().images_db_path()).unwrap(),
                manager.config(),
                object_key,
            );
            // Simulate an interrupted run: a pending download run in the
            // event log, never driven to completion.
            manager
                .fsm
                .load_or_create(
                    &format!("download:{}", image_id_for_key(object_key)),
                    "download",
                    &format!(r#"{{"image_id":"x","object_key":"{}"}}"#, object_key),
                )
                .unwrap();
        }

        let log: CallLog = Arc::new(StdMutex::new(Vec::new()));
        let manager = ImageManager::with_runner(config, fake_system(log))
            .await
            .unwrap();
        let resumed = manager.resume_pending().await.unwrap();
        assert_eq!(resumed, 1);

        // The chain ran to completion.
        let image_id = image_id_for_key(object_key);
        assert!(manager
            .store
            .check_snapshot_exists(&image_id, &format!("snap-{}", image_id))
            .unwrap()
            .unwrap()
            .active);
    }
}
