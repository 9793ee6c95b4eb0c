// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Streaming client for the S3-compatible object store the image tarballs
//! come from. Downloads stream to a temporary file, hash while streaming,
//! and atomically rename into place.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::imageutil::ImageError;

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub local_path: PathBuf,
    pub checksum_sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size_bytes: u64,
}

pub struct ObjectStoreClient {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    max_bytes: u64,
}

impl ObjectStoreClient {
    pub fn new(endpoint: &str, bucket: &str, max_bytes: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            max_bytes,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn bucket_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.bucket)
    }

    /// Pull an object to `local_path`. The transfer streams into a `.part`
    /// file next to the destination; a pre-existing partial transfer is
    /// resumed with a range request when the server cooperates. Only a
    /// fully verified stream is renamed into place.
    pub async fn download_image(&self, key: &str, local_path: &Path) -> Result<DownloadResult> {
        let part_path = PathBuf::from(format!("{}.part", local_path.display()));
        let mut hasher = Sha256::new();
        let mut written = hash_existing_part(&part_path, &mut hasher).await?;

        let mut request = self.http.get(self.object_url(key));
        if written > 0 {
            debug!("Resuming {} from offset {}", key, written);
            request = request.header("Range", format!("bytes={}-", written));
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to request object {}", key))?;

        match response.status() {
            StatusCode::OK => {
                // Full body; any previous partial content is void.
                if written > 0 {
                    hasher = Sha256::new();
                    written = 0;
                }
            }
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::FORBIDDEN => {
                return Err(ImageError::AccessDenied(key.to_string()).into());
            }
            status => bail!("object store returned {} for {}", status, key),
        }

        if let Some(total) = response.content_length() {
            if written + total > self.max_bytes {
                return Err(ImageError::SizeLimitExceeded(format!(
                    "{} is {} bytes, limit {}",
                    key,
                    written + total,
                    self.max_bytes
                ))
                .into());
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(written == 0)
            .append(written > 0)
            .open(&part_path)
            .await
            .with_context(|| format!("Failed to open {}", part_path.display()))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Failed to stream {}", key))?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(ImageError::SizeLimitExceeded(format!(
                    "{} exceeded {} bytes mid-stream",
                    key, self.max_bytes
                ))
                .into());
            }
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", part_path.display()))?;
        }
        file.flush()
            .await
            .with_context(|| format!("Failed to flush {}", part_path.display()))?;
        drop(file);

        tokio::fs::rename(&part_path, local_path)
            .await
            .with_context(|| format!("Failed to move download into {}", local_path.display()))?;

        let checksum = hex::encode(hasher.finalize());
        info!("Downloaded {} ({} bytes, sha256 {})", key, written, checksum);
        Ok(DownloadResult {
            local_path: local_path.to_path_buf(),
            checksum_sha256: checksum,
            size_bytes: written,
        })
    }

    pub async fn head_object(&self, key: &str) -> Result<RemoteObject> {
        let response = self
            .http
            .head(self.object_url(key))
            .send()
            .await
            .with_context(|| format!("Failed to head object {}", key))?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::FORBIDDEN => {
                return Err(ImageError::AccessDenied(key.to_string()).into());
            }
            status => bail!("object store returned {} for {}", status, key),
        }
        let size_bytes = response
            .content_length()
            .with_context(|| format!("No content length for {}", key))?;
        Ok(RemoteObject {
            key: key.to_string(),
            size_bytes,
        })
    }

    /// List objects under a prefix, following continuation tokens.
    pub async fn list_images(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(token) = &token {
                query.push(("continuation-token".to_string(), token.clone()));
            }
            let response = self
                .http
                .get(self.bucket_url())
                .query(&query)
                .send()
                .await
                .context("Failed to list objects")?;
            match response.status() {
                StatusCode::OK => {}
                StatusCode::FORBIDDEN => {
                    return Err(ImageError::AccessDenied(self.bucket.clone()).into());
                }
                status => bail!("object store returned {} for listing", status),
            }
            let body = response.text().await.context("Failed to read listing")?;
            let page = parse_listing(&body)?;
            objects.extend(page.objects);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }
}

pub(crate) struct ListingPage {
    pub objects: Vec<RemoteObject>,
    pub next_token: Option<String>,
}

/// Parse the fields we need out of a ListObjectsV2 response.
pub(crate) fn parse_listing(body: &str) -> Result<ListingPage> {
    lazy_static! {
        static ref RE_CONTENTS: Regex = Regex::new(r"(?s)<Contents>(.*?)</Contents>").unwrap();
        static ref RE_KEY: Regex = Regex::new(r"<Key>([^<]+)</Key>").unwrap();
        static ref RE_SIZE: Regex = Regex::new(r"<Size>(\d+)</Size>").unwrap();
        static ref RE_TOKEN: Regex =
            Regex::new(r"<NextContinuationToken>([^<]+)</NextContinuationToken>").unwrap();
        static ref RE_TRUNCATED: Regex =
            Regex::new(r"<IsTruncated>\s*true\s*</IsTruncated>").unwrap();
    }

    let mut objects = Vec::new();
    for block in RE_CONTENTS.captures_iter(body) {
        let block = &block[1];
        let key = match RE_KEY.captures(block) {
            Some(capture) => capture[1].to_string(),
            None => {
                warn!("Listing entry without a key, skipping");
                continue;
            }
        };
        let size_bytes = match RE_SIZE.captures(block) {
            Some(capture) => capture[1]
                .parse()
                .with_context(|| format!("Bad size for key {}", key))?,
            None => 0,
        };
        objects.push(RemoteObject { key, size_bytes });
    }

    let next_token = if RE_TRUNCATED.is_match(body) {
        Some(
            RE_TOKEN
                .captures(body)
                .context("Truncated listing without a continuation token")?[1]
                .to_string(),
        )
    } else {
        None
    };

    Ok(ListingPage {
        objects,
        next_token,
    })
}

/// Feed an existing partial download into the hasher so a resumed transfer
/// produces the digest of the whole object. Returns the byte count already
/// on disk.
async fn hash_existing_part(part_path: &Path, hasher: &mut Sha256) -> Result<u64> {
    let mut file = match tokio::fs::File::open(part_path).await {
        Ok(file) => file,
        Err(_) => return Ok(0),
    };
    let mut total = 0u64;
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let count = file
            .read(&mut buf)
            .await
            .with_context(|| format!("Failed to read {}", part_path.display()))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
        total += count as u64;
    }
    Ok(total)
}
