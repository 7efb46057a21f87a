//! Files under the model directory: checkpoint payloads, the checkpoint
//! index and run summaries.
//!
//! Writes go to a uniquely named sibling first and are renamed into place,
//! so an interrupted save leaves the previous file intact. Every write
//! reports the SHA-256 of the bytes on disk; [`read_verified`] refuses a
//! payload whose digest no longer matches.

use crate::error::FitError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;

/// What landed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Written {
    pub sha256: String,
    pub size_bytes: u64,
}

/// How a JSON file is laid out. Payloads are compact, files people read are
/// indented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Compact,
    Pretty,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Serialize `value` and move it into place at `path`, creating parent
/// directories.
pub fn write_json<T: Serialize>(path: &Path, value: &T, layout: Layout) -> Result<Written, FitError> {
    let bytes = match layout {
        Layout::Compact => serde_json::to_vec(value)?,
        Layout::Pretty => serde_json::to_vec_pretty(value)?,
    };
    replace_file(path, &bytes)?;
    Ok(Written {
        sha256: sha256_hex(&bytes),
        size_bytes: bytes.len() as u64,
    })
}

fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), FitError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .ok_or_else(|| FitError::checkpoint(format!("{} is not a file path", path.display())))?;
    let staging = path.with_file_name(format!(
        ".{}.{}.tmp",
        name.to_string_lossy(),
        Uuid::new_v4().simple()
    ));
    if let Err(e) = std::fs::write(&staging, bytes).and_then(|()| std::fs::rename(&staging, path)) {
        let _ = std::fs::remove_file(&staging);
        return Err(e.into());
    }
    Ok(())
}

/// Read a JSON file written by an earlier run. A missing file is `Ok(None)`;
/// a file that does not parse is a checkpoint error naming the path.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, FitError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| FitError::checkpoint(format!("{} is unreadable: {e}", path.display())))
}

/// Read a payload and check it against the digest recorded when it was
/// written.
pub fn read_verified<T: DeserializeOwned>(path: &Path, sha256: &str) -> Result<T, FitError> {
    let bytes = std::fs::read(path)?;
    let actual = sha256_hex(&bytes);
    if actual != sha256 {
        return Err(FitError::checkpoint(format!(
            "{} is corrupt: hash {actual} != {sha256}",
            path.display()
        )));
    }
    Ok(serde_json::from_slice(&bytes)?)
}
