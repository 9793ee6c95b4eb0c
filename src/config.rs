// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Configuration for the image manager. Everything has a default; a JSON
//! file overrides individual fields.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Define the default root for all durable manager state.
const DEFAULT_STATE_DIR: &str = "/var/lib/imageman";

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory holding the databases and the manager lock file.
    pub state_dir: PathBuf,
    /// Directory holding the pool backing files.
    pub data_dir: PathBuf,
    /// Directory downloaded tarballs land in.
    pub local_dir: PathBuf,
    /// Directory extraction mount points are created under.
    pub mount_root: PathBuf,
    /// Name of the thin pool mapper device.
    pub pool_name: String,
    /// Size of the pool metadata backing file.
    pub pool_metadata_bytes: u64,
    /// Size of the pool data backing file.
    pub pool_data_bytes: u64,
    /// Pool block size in 512-byte sectors. 256 sectors = 128 KiB; larger
    /// blocks regress thin I/O badly and are unsupported.
    pub pool_block_sectors: u64,
    /// Pool low-water mark in sectors.
    pub pool_low_water_sectors: u64,
    /// Object store endpoint, e.g. "http://127.0.0.1:9000".
    pub endpoint: String,
    /// Object store bucket.
    pub bucket: String,
    /// Key prefix for listings.
    pub prefix: String,
    /// Largest object the downloader accepts.
    pub max_download_bytes: u64,
    /// Concurrent download machine runs.
    pub download_workers: usize,
    /// Concurrent unpack machine runs. The pool tolerates exactly one.
    pub unpack_workers: usize,
    /// Concurrent activate machine runs.
    pub activate_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = PathBuf::from(DEFAULT_STATE_DIR);
        Self {
            data_dir: state_dir.join("pool"),
            local_dir: state_dir.join("images"),
            mount_root: state_dir.join("mnt"),
            state_dir,
            pool_name: "imgpool".to_string(),
            pool_metadata_bytes: 4 * 1024 * 1024,
            pool_data_bytes: 2 * 1024 * 1024 * 1024,
            pool_block_sectors: 256,
            pool_low_water_sectors: 65_536,
            endpoint: "http://127.0.0.1:9000".to_string(),
            bucket: "images".to_string(),
            prefix: String::new(),
            max_download_bytes: 10 * 1024 * 1024 * 1024,
            download_workers: 5,
            unpack_workers: 1,
            activate_workers: 1,
        }
    }
}

impl Config {
    /// Load the configuration, with `path` overriding the defaults when
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn images_db_path(&self) -> PathBuf {
        self.state_dir.join("images.db")
    }

    pub fn fsm_db_path(&self) -> PathBuf {
        self.state_dir.join("fsm")
    }

    pub fn manager_lock_path(&self) -> PathBuf {
        self.state_dir.join("manager.lock")
    }

    pub fn pool_meta_path(&self) -> PathBuf {
        self.data_dir.join("pool_meta")
    }

    pub fn pool_data_path(&self) -> PathBuf {
        self.data_dir.join("pool_data")
    }

    pub fn tarball_path(&self, image_id: &str) -> PathBuf {
        self.local_dir.join(format!("{}.tar", image_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pool_block_sectors, 256);
        assert_eq!(config.pool_low_water_sectors, 65_536);
        assert_eq!(config.pool_metadata_bytes, 4 * 1024 * 1024);
        assert_eq!(config.pool_data_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.download_workers, 5);
        assert_eq!(config.unpack_workers, 1);
        assert_eq!(
            config.images_db_path(),
            PathBuf::from("/var/lib/imageman/images.db")
        );
        assert_eq!(
            config.tarball_path("img_ab"),
            PathBuf::from("/var/lib/imageman/images/img_ab.tar")
        );
    }

    #[test]
    fn test_partial_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"pool_name": "testpool", "bucket": "test-bucket"}"#,
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.pool_name, "testpool");
        assert_eq!(config.bucket, "test-bucket");
        // Untouched fields keep their defaults.
        assert_eq!(config.download_workers, 5);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"pool_nam": "typo"}"#).unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
