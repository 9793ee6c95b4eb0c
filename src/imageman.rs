// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Listing for the image manager library components.
//!
//! The core is a three-stage durable pipeline: Download pulls a container
//! image tarball from the object store, Unpack materializes it onto a thin
//! device, and Activate exposes a copy-on-write snapshot ready to mount.
//! Each stage is a persistent state machine whose transitions are
//! idempotent and crash-resumable, serialized against the thin pool.

pub mod activate;
pub mod config;
pub mod download;
pub mod extract;
pub mod gc;
pub mod guard;
pub mod imageutil;
pub mod machine;
pub mod manager;
pub mod metadata;
pub mod objstore;
pub mod thinpool;
pub mod unpack;

pub use config::Config;
pub use imageutil::{image_id_for_key, snapshot_name_for_image, ImageError, SystemRunner};
pub use machine::MachineError;
pub use manager::{ImageManager, ProcessOutcome};
