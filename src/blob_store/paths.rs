//! Where each blob lives on disk.

use std::path::{Path, PathBuf};

use crate::types::crypto_primitives::blake2b256;

/// Path of `name`'s blob relative to the blob root: the 64 hex characters of BLAKE2b-256(name) cut
/// into sixteen 4-character segments, fifteen directories and one file suffixed with `_blob`.
///
/// ```text
/// ab12/cd34/.../ef56_blob
/// ```
pub fn blob_relative_path(name: &str) -> PathBuf {
    let hex = hex::encode(blake2b256(name.as_bytes()).bytes());
    let segments: Vec<&str> = (0..16).map(|i| &hex[i * 4..(i + 1) * 4]).collect();
    let mut path = PathBuf::new();
    for segment in &segments[..15] {
        path.push(segment);
    }
    path.push(format!("{}_blob", segments[15]));
    path
}

pub fn blob_path(root: &Path, name: &str) -> PathBuf {
    root.join(blob_relative_path(name))
}
