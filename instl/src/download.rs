// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Fetches a [`sync::DownloadOp`] list over HTTP, verifying the checksum of
//! each file once it lands on disk.

use fs_err::tokio::{self as fs, File};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::sync::DownloadOp;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid source URL for {0}")]
    Url(String),
    #[error("request {0}")]
    Request(#[from] reqwest::Error),
    #[error("write {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum { path: String, expected: String, actual: String },
}

/// Download every op in `ops` from `base_url`, writing each to its `dest`
/// path and verifying its checksum (when present) once the write completes.
pub async fn fetch_all(base_url: &Url, ops: &[DownloadOp]) -> Result<(), Error> {
    for op in ops {
        fetch_one(base_url, op).await?;
    }
    Ok(())
}

async fn fetch_one(base_url: &Url, op: &DownloadOp) -> Result<(), Error> {
    let url = base_url.join(op.path.trim_start_matches('/')).map_err(|_| Error::Url(op.path.clone()))?;
    let mut stream = crate::request::get(url).await?;

    if let Some(parent) = std::path::Path::new(&op.dest).parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = File::create(&op.dest).await?;
    let mut hasher = Sha256::new();
    while let Some(chunk) = stream.next().await {
        let mut chunk = chunk?;
        hasher.update(&chunk);
        file.write_all_buf(&mut chunk).await?;
    }
    file.flush().await?;

    if let Some(expected) = &op.checksum {
        let actual = hex::encode(hasher.finalize());
        if &actual != expected {
            return Err(Error::Checksum {
                path: op.path.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    log::info!("fetched {} -> {}", op.path, op.dest);
    Ok(())
}
