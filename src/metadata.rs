// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Durable metadata for images, unpacked devices, snapshots, and the
//! per-image advisory locks. All coordination state lives here; the object
//! store is only ever a content source.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// A non-completed reservation younger than this is considered owned by a
/// live downloader; older ones are reclaimed by the next reservation.
const FRESH_RESERVATION_MINUTES: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRow {
    pub image_id: String,
    pub object_key: String,
    pub local_path: Option<String>,
    pub checksum_sha256: Option<String>,
    pub size_bytes: Option<u64>,
    pub download_status: String,
    pub activation_status: String,
    pub downloaded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedRow {
    pub image_id: String,
    pub device_id: u64,
    pub device_name: String,
    pub device_path: String,
    pub size_bytes: u64,
    pub file_count: u64,
    pub unpacked_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    pub snapshot_id: u64,
    pub image_id: String,
    pub snapshot_name: String,
    pub device_path: String,
    pub origin_device_id: u64,
    pub active: bool,
    pub created_at: String,
}

/// Outcome of a download reservation attempt.
#[derive(Debug)]
pub enum ReserveOutcome {
    /// This caller won the reservation.
    Reserved,
    /// A completed row already exists; no download is needed.
    AlreadyCompleted(ImageRow),
    /// Another downloader holds a fresh reservation.
    InProgress,
}

/// Outcome of an image lock acquisition.
#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Held(String),
}

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Open (and if needed create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open metadata store {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = normal;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to configure metadata store")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS images (
                 image_id TEXT PRIMARY KEY,
                 object_key TEXT UNIQUE NOT NULL,
                 local_path TEXT,
                 checksum_sha256 TEXT,
                 size_bytes INTEGER,
                 download_status TEXT NOT NULL DEFAULT 'reserved'
                     CHECK (download_status IN ('reserved', 'completed', 'failed')),
                 activation_status TEXT NOT NULL DEFAULT 'inactive',
                 downloaded_at TEXT,
                 created_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS unpacked_images (
                 image_id TEXT PRIMARY KEY,
                 device_id INTEGER NOT NULL,
                 device_name TEXT NOT NULL,
                 device_path TEXT NOT NULL,
                 size_bytes INTEGER NOT NULL,
                 file_count INTEGER NOT NULL,
                 unpacked_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS snapshots (
                 snapshot_id INTEGER PRIMARY KEY,
                 image_id TEXT NOT NULL,
                 snapshot_name TEXT NOT NULL,
                 device_path TEXT NOT NULL,
                 origin_device_id INTEGER NOT NULL,
                 active INTEGER NOT NULL,
                 created_at TEXT NOT NULL,
                 UNIQUE (image_id, snapshot_name)
             );
             CREATE TABLE IF NOT EXISTS image_locks (
                 image_id TEXT PRIMARY KEY,
                 locked_by TEXT NOT NULL,
                 acquired_at TEXT NOT NULL
             );",
        )
        .context("Failed to create metadata schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Writers are serialized here. A poisoned lock only means a previous
    /// writer panicked mid-call; the connection itself is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Single-winner reservation for a download. At most one downloader is
    /// active for a given object key; the unique constraint is the referee.
    pub fn reserve_image_download(
        &self,
        image_id: &str,
        object_key: &str,
    ) -> Result<ReserveOutcome> {
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO images
                     (image_id, object_key, download_status, activation_status, created_at)
                 VALUES (?1, ?2, 'reserved', 'inactive', datetime('now'))",
                params![image_id, object_key],
            )
            .context("Failed to insert download reservation")?;
        if inserted == 1 {
            return Ok(ReserveOutcome::Reserved);
        }

        let row = Self::image_by_key(&conn, object_key)?
            .context("Reservation row disappeared under us")?;
        if row.download_status == "completed" {
            return Ok(ReserveOutcome::AlreadyCompleted(row));
        }

        // A failed row is immediately reclaimable; a reserved one only after
        // it has gone stale.
        if row.download_status == "reserved" {
            let fresh: bool = conn
                .query_row(
                    "SELECT (julianday('now') - julianday(created_at)) * 1440.0 < ?2
                     FROM images WHERE object_key = ?1",
                    params![object_key, FRESH_RESERVATION_MINUTES],
                    |r| r.get(0),
                )
                .context("Failed to check reservation age")?;
            if fresh {
                return Ok(ReserveOutcome::InProgress);
            }
        }

        conn.execute(
            "UPDATE images SET download_status = 'reserved', created_at = datetime('now')
             WHERE object_key = ?1 AND download_status != 'completed'",
            params![object_key],
        )
        .context("Failed to reclaim stale reservation")?;
        Ok(ReserveOutcome::Reserved)
    }

    /// Promote a reserved row to completed with the download results.
    pub fn store_image_metadata(
        &self,
        image_id: &str,
        object_key: &str,
        local_path: &str,
        checksum_sha256: &str,
        size_bytes: u64,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO images
                     (image_id, object_key, local_path, checksum_sha256, size_bytes,
                      download_status, activation_status, downloaded_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'completed', 'inactive',
                         datetime('now'), datetime('now'))
                 ON CONFLICT (image_id) DO UPDATE SET
                     object_key = excluded.object_key,
                     local_path = excluded.local_path,
                     checksum_sha256 = excluded.checksum_sha256,
                     size_bytes = excluded.size_bytes,
                     download_status = 'completed',
                     downloaded_at = datetime('now')",
                params![
                    image_id,
                    object_key,
                    local_path,
                    checksum_sha256,
                    size_bytes as i64
                ],
            )
            .context("Failed to store image metadata")?;
        Ok(())
    }

    /// Mark a download as failed so the reservation is immediately
    /// reclaimable.
    pub fn mark_image_failed(&self, image_id: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE images SET download_status = 'failed'
                 WHERE image_id = ?1 AND download_status != 'completed'",
                params![image_id],
            )
            .context("Failed to mark image failed")?;
        Ok(())
    }

    pub fn check_image_downloaded(&self, object_key: &str) -> Result<Option<ImageRow>> {
        let conn = self.conn();
        let row = Self::image_by_key(&conn, object_key)?;
        Ok(row.filter(|r| r.download_status == "completed"))
    }

    pub fn get_image(&self, image_id: &str) -> Result<Option<ImageRow>> {
        self.conn()
            .query_row(
                "SELECT image_id, object_key, local_path, checksum_sha256, size_bytes,
                        download_status, activation_status, downloaded_at
                 FROM images WHERE image_id = ?1",
                params![image_id],
                Self::map_image,
            )
            .optional()
            .context("Failed to look up image")
    }

    pub fn update_image_activation_status(&self, image_id: &str, status: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE images SET activation_status = ?2 WHERE image_id = ?1",
                params![image_id, status],
            )
            .context("Failed to update activation status")?;
        Ok(())
    }

    pub fn check_image_unpacked(&self, image_id: &str) -> Result<Option<UnpackedRow>> {
        self.conn()
            .query_row(
                "SELECT image_id, device_id, device_name, device_path, size_bytes,
                        file_count, unpacked_at
                 FROM unpacked_images WHERE image_id = ?1",
                params![image_id],
                Self::map_unpacked,
            )
            .optional()
            .context("Failed to look up unpacked image")
    }

    pub fn store_unpacked_image(
        &self,
        image_id: &str,
        device_id: u64,
        device_name: &str,
        device_path: &str,
        size_bytes: u64,
        file_count: u64,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO unpacked_images
                     (image_id, device_id, device_name, device_path, size_bytes,
                      file_count, unpacked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
                 ON CONFLICT (image_id) DO UPDATE SET
                     device_id = excluded.device_id,
                     device_name = excluded.device_name,
                     device_path = excluded.device_path,
                     size_bytes = excluded.size_bytes,
                     file_count = excluded.file_count,
                     unpacked_at = datetime('now')",
                params![
                    image_id,
                    device_id as i64,
                    device_name,
                    device_path,
                    size_bytes as i64,
                    file_count as i64
                ],
            )
            .context("Failed to store unpacked image")?;
        Ok(())
    }

    /// Purge a row whose mapper device no longer exists.
    pub fn delete_unpacked_image(&self, image_id: &str) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM unpacked_images WHERE image_id = ?1",
                params![image_id],
            )
            .context("Failed to delete unpacked image")?;
        Ok(())
    }

    pub fn check_snapshot_exists(
        &self,
        image_id: &str,
        snapshot_name: &str,
    ) -> Result<Option<SnapshotRow>> {
        self.conn()
            .query_row(
                "SELECT snapshot_id, image_id, snapshot_name, device_path,
                        origin_device_id, active, created_at
                 FROM snapshots WHERE image_id = ?1 AND snapshot_name = ?2",
                params![image_id, snapshot_name],
                Self::map_snapshot,
            )
            .optional()
            .context("Failed to look up snapshot")
    }

    pub fn store_snapshot(
        &self,
        snapshot_id: u64,
        image_id: &str,
        snapshot_name: &str,
        device_path: &str,
        origin_device_id: u64,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO snapshots
                     (snapshot_id, image_id, snapshot_name, device_path,
                      origin_device_id, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, datetime('now'))
                 ON CONFLICT (snapshot_id) DO UPDATE SET
                     image_id = excluded.image_id,
                     snapshot_name = excluded.snapshot_name,
                     device_path = excluded.device_path,
                     origin_device_id = excluded.origin_device_id,
                     active = 1,
                     created_at = datetime('now')",
                params![
                    snapshot_id as i64,
                    image_id,
                    snapshot_name,
                    device_path,
                    origin_device_id as i64
                ],
            )
            .context("Failed to store snapshot")?;
        Ok(())
    }

    pub fn deactivate_snapshot(&self, snapshot_id: u64) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE snapshots SET active = 0 WHERE snapshot_id = ?1",
                params![snapshot_id as i64],
            )
            .context("Failed to deactivate snapshot")?;
        Ok(())
    }

    /// Purge a snapshot row whose mapper device no longer exists.
    pub fn delete_snapshot(&self, snapshot_id: u64) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id as i64],
            )
            .context("Failed to delete snapshot")?;
        Ok(())
    }

    /// Take the per-image advisory lock. Re-acquisition by the same holder
    /// succeeds so crashed transitions can re-run idempotently.
    pub fn acquire_image_lock(&self, image_id: &str, holder: &str) -> Result<LockOutcome> {
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO image_locks (image_id, locked_by, acquired_at)
                 VALUES (?1, ?2, datetime('now'))",
                params![image_id, holder],
            )
            .context("Failed to insert image lock")?;
        if inserted == 1 {
            return Ok(LockOutcome::Acquired);
        }
        let current: String = conn
            .query_row(
                "SELECT locked_by FROM image_locks WHERE image_id = ?1",
                params![image_id],
                |r| r.get(0),
            )
            .context("Failed to read image lock holder")?;
        if current == holder {
            Ok(LockOutcome::Acquired)
        } else {
            Ok(LockOutcome::Held(current))
        }
    }

    pub fn release_image_lock(&self, image_id: &str) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM image_locks WHERE image_id = ?1",
                params![image_id],
            )
            .context("Failed to release image lock")?;
        Ok(())
    }

    /// Release only if we are the holder. Returns whether a row was removed.
    pub fn release_image_lock_if_holder(&self, image_id: &str, holder: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM image_locks WHERE image_id = ?1 AND locked_by = ?2",
                params![image_id, holder],
            )
            .context("Failed to release image lock")?;
        Ok(removed == 1)
    }

    pub fn is_image_locked(&self, image_id: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT locked_by FROM image_locks WHERE image_id = ?1",
                params![image_id],
                |r| r.get(0),
            )
            .optional()
            .context("Failed to check image lock")
    }

    /// Clear every lock row. Only valid while holding the host guard, when
    /// no other worker can be live.
    pub fn clear_all_image_locks(&self) -> Result<usize> {
        self.conn()
            .execute("DELETE FROM image_locks", [])
            .context("Failed to clear image locks")
    }

    /// Flip reservations older than the freshness window to failed. Used by
    /// the garbage collector.
    pub fn mark_stale_reservations_failed(&self) -> Result<usize> {
        self.conn()
            .execute(
                "UPDATE images SET download_status = 'failed'
                 WHERE download_status = 'reserved'
                   AND (julianday('now') - julianday(created_at)) * 1440.0 >= ?1",
                params![FRESH_RESERVATION_MINUTES],
            )
            .context("Failed to expire stale reservations")
    }

    pub fn list_images(&self) -> Result<Vec<ImageRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT image_id, object_key, local_path, checksum_sha256, size_bytes,
                    download_status, activation_status, downloaded_at
             FROM images ORDER BY object_key",
        )?;
        let rows = stmt
            .query_map([], Self::map_image)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list images")?;
        Ok(rows)
    }

    pub fn list_unpacked(&self) -> Result<Vec<UnpackedRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT image_id, device_id, device_name, device_path, size_bytes,
                    file_count, unpacked_at
             FROM unpacked_images ORDER BY image_id",
        )?;
        let rows = stmt
            .query_map([], Self::map_unpacked)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list unpacked images")?;
        Ok(rows)
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT snapshot_id, image_id, snapshot_name, device_path,
                    origin_device_id, active, created_at
             FROM snapshots ORDER BY image_id",
        )?;
        let rows = stmt
            .query_map([], Self::map_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list snapshots")?;
        Ok(rows)
    }

    fn image_by_key(conn: &Connection, object_key: &str) -> Result<Option<ImageRow>> {
        conn.query_row(
            "SELECT image_id, object_key, local_path, checksum_sha256, size_bytes,
                    download_status, activation_status, downloaded_at
             FROM images WHERE object_key = ?1",
            params![object_key],
            Self::map_image,
        )
        .optional()
        .context("Failed to look up image by key")
    }

    fn map_image(row: &Row) -> rusqlite::Result<ImageRow> {
        Ok(ImageRow {
            image_id: row.get(0)?,
            object_key: row.get(1)?,
            local_path: row.get(2)?,
            checksum_sha256: row.get(3)?,
            size_bytes: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
            download_status: row.get(5)?,
            activation_status: row.get(6)?,
            downloaded_at: row.get(7)?,
        })
    }

    fn map_unpacked(row: &Row) -> rusqlite::Result<UnpackedRow> {
        Ok(UnpackedRow {
            image_id: row.get(0)?,
            device_id: row.get::<_, i64>(1)? as u64,
            device_name: row.get(2)?,
            device_path: row.get(3)?,
            size_bytes: row.get::<_, i64>(4)? as u64,
            file_count: row.get::<_, i64>(5)? as u64,
            unpacked_at: row.get(6)?,
        })
    }

    fn map_snapshot(row: &Row) -> rusqlite::Result<SnapshotRow> {
        Ok(SnapshotRow {
            snapshot_id: row.get::<_, i64>(0)? as u64,
            image_id: row.get(1)?,
            snapshot_name: row.get(2)?,
            device_path: row.get(3)?,
            origin_device_id: row.get::<_, i64>(4)? as u64,
            active: row.get::<_, i64>(5)? != 0,
            created_at: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("images.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_reservation_single_winner() {
        let (_dir, store) = test_store();
        let outcome = store.reserve_image_download("img_a", "images/a.tar").unwrap();
        assert!(matches!(outcome, ReserveOutcome::Reserved));

        // A rival loses while the reservation is fresh.
        let outcome = store.reserve_image_download("img_a", "images/a.tar").unwrap();
        assert!(matches!(outcome, ReserveOutcome::InProgress));
    }

    #[test]
    fn test_reservation_completed_short_circuits() {
        let (_dir, store) = test_store();
        store.reserve_image_download("img_a", "images/a.tar").unwrap();
        store
            .store_image_metadata("img_a", "images/a.tar", "/tmp/a.tar", "deadbeef", 42)
            .unwrap();

        match store.reserve_image_download("img_a", "images/a.tar").unwrap() {
            ReserveOutcome::AlreadyCompleted(row) => {
                assert_eq!(row.local_path.as_deref(), Some("/tmp/a.tar"));
                assert_eq!(row.checksum_sha256.as_deref(), Some("deadbeef"));
                assert_eq!(row.size_bytes, Some(42));
            }
            other => panic!("expected AlreadyCompleted, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_reservation_is_reclaimable() {
        let (_dir, store) = test_store();
        store.reserve_image_download("img_a", "images/a.tar").unwrap();
        store.mark_image_failed("img_a").unwrap();
        let outcome = store.reserve_image_download("img_a", "images/a.tar").unwrap();
        assert!(matches!(outcome, ReserveOutcome::Reserved));
    }

    #[test]
    fn test_check_image_downloaded_filters_incomplete() {
        let (_dir, store) = test_store();
        store.reserve_image_download("img_a", "images/a.tar").unwrap();
        assert!(store.check_image_downloaded("images/a.tar").unwrap().is_none());

        store
            .store_image_metadata("img_a", "images/a.tar", "/tmp/a.tar", "deadbeef", 42)
            .unwrap();
        let row = store.check_image_downloaded("images/a.tar").unwrap().unwrap();
        assert_eq!(row.download_status, "completed");
        assert!(row.downloaded_at.is_some());
    }

    #[test]
    fn test_unpacked_round_trip_and_purge() {
        let (_dir, store) = test_store();
        store
            .store_unpacked_image("img_a", 123, "thin-123", "/dev/mapper/thin-123", 1 << 26, 17)
            .unwrap();
        let row = store.check_image_unpacked("img_a").unwrap().unwrap();
        assert_eq!(row.device_id, 123);
        assert_eq!(row.device_name, "thin-123");
        assert_eq!(row.size_bytes, 1 << 26);
        assert_eq!(row.file_count, 17);

        store.delete_unpacked_image("img_a").unwrap();
        assert!(store.check_image_unpacked("img_a").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let (_dir, store) = test_store();
        store
            .store_snapshot(1_000_123, "img_a", "snap-img_a", "/dev/mapper/snap-img_a", 123)
            .unwrap();
        let row = store.check_snapshot_exists("img_a", "snap-img_a").unwrap().unwrap();
        assert!(row.active);
        assert_eq!(row.origin_device_id, 123);

        store.deactivate_snapshot(1_000_123).unwrap();
        let row = store.check_snapshot_exists("img_a", "snap-img_a").unwrap().unwrap();
        assert!(!row.active);

        store.delete_snapshot(1_000_123).unwrap();
        assert!(store.check_snapshot_exists("img_a", "snap-img_a").unwrap().is_none());
    }

    #[test]
    fn test_activation_status() {
        let (_dir, store) = test_store();
        store.reserve_image_download("img_a", "images/a.tar").unwrap();
        store.update_image_activation_status("img_a", "active").unwrap();
        let row = store.get_image("img_a").unwrap().unwrap();
        assert_eq!(row.activation_status, "active");
    }

    #[test]
    fn test_image_lock_contention() {
        let (_dir, store) = test_store();
        assert_eq!(
            store.acquire_image_lock("img_a", "unpack:100").unwrap(),
            LockOutcome::Acquired
        );
        // Same holder may re-enter.
        assert_eq!(
            store.acquire_image_lock("img_a", "unpack:100").unwrap(),
            LockOutcome::Acquired
        );
        // A different holder is refused and told who owns it.
        assert_eq!(
            store.acquire_image_lock("img_a", "unpack:200").unwrap(),
            LockOutcome::Held("unpack:100".to_string())
        );

        assert!(!store.release_image_lock_if_holder("img_a", "unpack:200").unwrap());
        assert!(store.release_image_lock_if_holder("img_a", "unpack:100").unwrap());
        assert!(store.is_image_locked("img_a").unwrap().is_none());
    }

    #[test]
    fn test_lock_sweep() {
        let (_dir, store) = test_store();
        store.acquire_image_lock("img_a", "unpack:100").unwrap();
        store.acquire_image_lock("img_b", "unpack:100").unwrap();
        assert_eq!(store.clear_all_image_locks().unwrap(), 2);
        assert!(store.is_image_locked("img_a").unwrap().is_none());
    }

    #[test]
    fn test_listings() {
        let (_dir, store) = test_store();
        store.reserve_image_download("img_b", "images/b.tar").unwrap();
        store
            .store_image_metadata("img_a", "images/a.tar", "/tmp/a.tar", "cafe", 1)
            .unwrap();
        let images = store.list_images().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].object_key, "images/a.tar");

        store
            .store_snapshot(5, "img_a", "snap-img_a", "/dev/mapper/snap-img_a", 1)
            .unwrap();
        assert_eq!(store.list_snapshots().unwrap().len(), 1);
        assert!(store.list_unpacked().unwrap().is_empty());
    }
}
