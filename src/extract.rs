// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardened tar extraction onto a mounted device, plus the scan-only pass
//! the downloader uses to validate an archive before accepting it.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use serde::{Deserialize, Serialize};
use tar::{Archive, Entry, EntryType};

use crate::imageutil::ImageError;

/// Buffer size for file writes. Large buffered writes cut the metadata churn
/// against the pool's 128 KiB block size.
const WRITE_BUFFER_BYTES: usize = 1024 * 1024;

/// Directories that mark a plausible image root.
const ROOT_MARKERS: [&str; 6] = ["etc", "usr", "var", "bin", "lib", "home"];

/// Directories that must never be world-writable.
const PROTECTED_DIRS: [&str; 3] = ["etc", "usr", "bin"];

/// Hard caps applied to every archive.
#[derive(Clone, Debug)]
pub struct ExtractLimits {
    pub per_entry_bytes: u64,
    pub total_bytes: u64,
    pub max_entries: u64,
    pub wall_clock: Duration,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            per_entry_bytes: 1 << 30,
            total_bytes: 10 * (1 << 30),
            max_entries: 100_000,
            wall_clock: Duration::from_secs(30 * 60),
        }
    }
}

/// What the extractor produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files_extracted: u64,
    pub bytes_extracted: u64,
}

/// Which shape the image root takes on the extracted filesystem.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum RootLayout {
    RootfsSubdir,
    DirectRoot,
}

fn violation(msg: String) -> anyhow::Error {
    ImageError::ArchiveViolation(msg).into()
}

/// Normalize an entry path, rejecting anything that could land outside the
/// destination: absolute paths, `..` components, empty results are all
/// refused before a single byte is written.
fn checked_entry_path(raw: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(violation(format!(
                    "entry path contains '..': {}",
                    raw.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(violation(format!(
                    "entry path is absolute: {}",
                    raw.display()
                )));
            }
        }
    }
    Ok(normalized)
}

/// Validate a symlink target. Absolute targets are allowed (they are common
/// in images and resolve inside the eventual container root); relative
/// targets must stay inside the destination after normalization against the
/// link's directory.
fn check_symlink_target(entry_path: &Path, target: &Path) -> Result<()> {
    if target.is_absolute() {
        return Ok(());
    }
    // Depth of the directory the link lives in.
    let mut depth = entry_path.components().count() as i64 - 1;
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(violation(format!(
                        "symlink {} escapes the destination: {}",
                        entry_path.display(),
                        target.display()
                    )));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(())
}

/// Shared per-entry rules for both the scan and the extraction pass.
/// Returns the normalized relative path.
fn check_entry<R: io::Read>(entry: &Entry<'_, R>) -> Result<PathBuf> {
    let raw = entry
        .path()
        .context("Failed to read entry path")?
        .into_owned();
    let rel = checked_entry_path(&raw)?;
    let header = entry.header();
    let entry_type = header.entry_type();

    let mode = header.mode().context("Failed to read entry mode")?;
    if entry_type.is_file() && mode & 0o6000 != 0 {
        return Err(violation(format!(
            "entry {} carries setuid/setgid bits (mode {:o})",
            rel.display(),
            mode
        )));
    }

    if matches!(
        entry_type,
        EntryType::Char | EntryType::Block
    ) {
        let first = rel.components().next();
        let in_dev = matches!(first, Some(Component::Normal(part)) if part == "dev");
        if !in_dev {
            return Err(violation(format!(
                "device entry outside dev/: {}",
                rel.display()
            )));
        }
    }

    if entry_type.is_symlink() {
        let target = entry
            .link_name()
            .context("Failed to read symlink target")?
            .with_context(|| format!("symlink {} has no target", rel.display()))?;
        check_symlink_target(&rel, &target)?;
    }

    if entry_type.is_hard_link() {
        let target = entry
            .link_name()
            .context("Failed to read hard link target")?
            .with_context(|| format!("hard link {} has no target", rel.display()))?;
        // A hard link target is a path inside the archive, same rules apply.
        checked_entry_path(&target)?;
    }

    Ok(rel)
}

/// Validation pass over an archive on disk: confirms the headers parse and
/// that every entry obeys the hardening rules, without writing anything.
pub fn scan_archive(tar_path: &Path, limits: &ExtractLimits) -> Result<ExtractSummary> {
    let file = File::open(tar_path)
        .with_context(|| format!("Failed to open archive {}", tar_path.display()))?;
    let mut archive = Archive::new(file);
    let mut summary = ExtractSummary::default();
    let mut entries = 0u64;
    let mut total = 0u64;

    for entry in archive
        .entries()
        .context("Failed to read archive entries")?
    {
        let entry = entry.context("Failed to parse archive entry")?;
        entries += 1;
        if entries > limits.max_entries {
            return Err(violation(format!(
                "archive exceeds {} entries",
                limits.max_entries
            )));
        }

        let size = entry.header().size().context("Failed to read entry size")?;
        if size > limits.per_entry_bytes {
            return Err(violation(format!(
                "entry exceeds per-entry limit: {} bytes",
                size
            )));
        }
        total += size;
        if total > limits.total_bytes {
            return Err(violation(format!(
                "archive exceeds total limit: {} bytes",
                total
            )));
        }

        let _rel = check_entry(&entry)?;
        if !entry.header().entry_type().is_dir() {
            summary.files_extracted += 1;
        }
        summary.bytes_extracted += size;
    }

    if entries == 0 {
        return Err(violation("archive contains no entries".to_string()));
    }
    Ok(summary)
}

/// Extract an archive onto an already-mounted destination, applying every
/// hardening rule per entry. Produces the file and byte counts or a
/// permanent error; partially written trees are left for the caller's
/// failure policy.
pub fn extract_archive(
    tar_path: &Path,
    dest: &Path,
    limits: &ExtractLimits,
) -> Result<ExtractSummary> {
    let start = Instant::now();
    let dest_canon = dest
        .canonicalize()
        .with_context(|| format!("Failed to resolve destination {}", dest.display()))?;
    let file = File::open(tar_path)
        .with_context(|| format!("Failed to open archive {}", tar_path.display()))?;
    let mut archive = Archive::new(file);
    let mut summary = ExtractSummary::default();
    let mut entries = 0u64;

    for entry in archive
        .entries()
        .context("Failed to read archive entries")?
    {
        if start.elapsed() > limits.wall_clock {
            return Err(violation(format!(
                "extraction exceeded {} seconds",
                limits.wall_clock.as_secs()
            )));
        }

        let mut entry = entry.context("Failed to parse archive entry")?;
        entries += 1;
        if entries > limits.max_entries {
            return Err(violation(format!(
                "archive exceeds {} entries",
                limits.max_entries
            )));
        }

        let size = entry.header().size().context("Failed to read entry size")?;
        if size > limits.per_entry_bytes {
            return Err(violation(format!(
                "entry exceeds per-entry limit: {} bytes",
                size
            )));
        }
        if summary.bytes_extracted + size > limits.total_bytes {
            return Err(violation(format!(
                "archive exceeds total limit of {} bytes",
                limits.total_bytes
            )));
        }

        let rel = check_entry(&entry)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest_canon.join(&rel);
        ensure_resolves_inside(&dest_canon, &target)?;

        let header = entry.header();
        let mode = header.mode().context("Failed to read entry mode")?;
        match header.entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)
                    .with_context(|| format!("Failed to create {}", target.display()))?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))
                    .with_context(|| format!("Failed to chmod {}", target.display()))?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                let out = File::create(&target)
                    .with_context(|| format!("Failed to create {}", target.display()))?;
                let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, out);
                let copied = io::copy(&mut entry, &mut writer)
                    .with_context(|| format!("Failed to write {}", target.display()))?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))
                    .with_context(|| format!("Failed to chmod {}", target.display()))?;
                summary.files_extracted += 1;
                summary.bytes_extracted += copied;
            }
            EntryType::Symlink => {
                let link_target = entry
                    .link_name()
                    .context("Failed to read symlink target")?
                    .with_context(|| format!("symlink {} has no target", rel.display()))?
                    .into_owned();
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                let _ = fs::remove_file(&target);
                std::os::unix::fs::symlink(&link_target, &target)
                    .with_context(|| format!("Failed to link {}", target.display()))?;
                summary.files_extracted += 1;
            }
            EntryType::Link => {
                let link_target = entry
                    .link_name()
                    .context("Failed to read hard link target")?
                    .with_context(|| format!("hard link {} has no target", rel.display()))?;
                let source = dest_canon.join(checked_entry_path(&link_target)?);
                let _ = fs::remove_file(&target);
                fs::hard_link(&source, &target).with_context(|| {
                    format!(
                        "Failed to hard link {} -> {}",
                        target.display(),
                        source.display()
                    )
                })?;
                summary.files_extracted += 1;
            }
            EntryType::Char | EntryType::Block => {
                let kind = if header.entry_type() == EntryType::Char {
                    SFlag::S_IFCHR
                } else {
                    SFlag::S_IFBLK
                };
                let major = header
                    .device_major()
                    .context("Failed to read device major")?
                    .unwrap_or(0);
                let minor = header
                    .device_minor()
                    .context("Failed to read device minor")?
                    .unwrap_or(0);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                mknod(
                    &target,
                    kind,
                    Mode::from_bits_truncate(mode & 0o777),
                    makedev(major as u64, minor as u64),
                )
                .with_context(|| format!("Failed to mknod {}", target.display()))?;
                summary.files_extracted += 1;
            }
            EntryType::Fifo => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                nix::unistd::mkfifo(&target, Mode::from_bits_truncate(mode & 0o777))
                    .with_context(|| format!("Failed to mkfifo {}", target.display()))?;
                summary.files_extracted += 1;
            }
            other => {
                debug!("Skipping entry {} of type {:?}", rel.display(), other);
            }
        }
    }

    if entries == 0 {
        return Err(violation("archive contains no entries".to_string()));
    }
    debug!(
        "Extracted {} files, {} bytes to {}",
        summary.files_extracted,
        summary.bytes_extracted,
        dest.display()
    );
    Ok(summary)
}

/// Refuse a write whose closest existing ancestor resolves outside the
/// destination. Catches symlinks planted by earlier entries.
fn ensure_resolves_inside(dest_canon: &Path, target: &Path) -> Result<()> {
    let mut probe = match target.parent() {
        Some(parent) => parent.to_path_buf(),
        None => return Ok(()),
    };
    while !probe.exists() {
        probe = match probe.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return Ok(()),
        };
    }
    let resolved = probe
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", probe.display()))?;
    if !resolved.starts_with(dest_canon) {
        return Err(violation(format!(
            "entry resolves outside the destination: {}",
            target.display()
        )));
    }
    Ok(())
}

/// Check that an extracted tree is a plausible image root. Accepts either a
/// `rootfs/` subdirectory or a direct root layout; all failures here are
/// permanent.
pub fn verify_layout(mount_point: &Path) -> Result<RootLayout> {
    let rootfs = mount_point.join("rootfs");
    let (layout, logical_root) = if rootfs.is_dir() {
        (RootLayout::RootfsSubdir, rootfs)
    } else {
        (RootLayout::DirectRoot, mount_point.to_path_buf())
    };

    let found = ROOT_MARKERS
        .iter()
        .filter(|marker| logical_root.join(marker).exists())
        .count();
    if found == 0 {
        return Err(ImageError::LayoutViolation(format!(
            "no recognizable root directories under {} (expected one of {})",
            logical_root.display(),
            ROOT_MARKERS.join(", ")
        ))
        .into());
    }

    for dir in PROTECTED_DIRS {
        let path = logical_root.join(dir);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        if metadata.permissions().mode() & 0o002 != 0 {
            return Err(ImageError::LayoutViolation(format!(
                "{} is world-writable",
                path.display()
            ))
            .into());
        }
    }

    if found < PROTECTED_DIRS.len() {
        warn!(
            "Image root {} only has {} of the usual directories",
            logical_root.display(),
            found
        );
    }
    Ok(layout)
}
