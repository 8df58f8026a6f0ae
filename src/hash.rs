//! Short content digests.
//!
//! Layer archives and ISO images are named by these digests, so the same bytes
//! always have to produce the same eight hex characters. The digest is SHA-256
//! cut down to [`SHORT_HASH_LEN`] characters; it keeps filenames scannable and
//! is not a security boundary.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Number of hex characters kept from the full digest.
pub const SHORT_HASH_LEN: usize = 8;

/// Hash a byte slice.
pub fn short_hash(bytes: &[u8]) -> String {
    truncate(Sha256::digest(bytes))
}

/// Hash the contents of a file without loading it into memory.
pub fn hash_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(truncate(hasher.finalize()))
}

/// Hash `input` as a file when it names one, otherwise as literal text.
pub fn hash_file_or_string(input: &str) -> Result<String> {
    let path = Path::new(input);
    if path.is_file() {
        hash_file(path)
    } else {
        Ok(short_hash(input.as_bytes()))
    }
}

/// List `"{digest}  {relative_path}"` for every regular file under `root`.
///
/// `exclude` holds paths relative to `root`; only those exact files are
/// skipped. Lines are ordered by relative path so the listing only changes
/// when content or names change.
pub fn hash_file_set(root: &Path, exclude: &[&str]) -> Result<String> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if exclude.iter().any(|skip| rel == Path::new(skip)) {
            continue;
        }
        let rel = rel.to_string_lossy().into_owned();
        files.push((rel, entry.into_path()));
    }
    files.sort();

    let mut listing = String::new();
    for (rel, path) in &files {
        let digest = hash_file(path)?;
        listing.push_str(&format!("{digest}  {rel}\n"));
    }
    Ok(listing)
}

/// Reduce the file listing of `root` to a single digest.
pub fn hash_tree(root: &Path, exclude: &[&str]) -> Result<String> {
    let listing = hash_file_set(root, exclude)?;
    hash_file_or_string(&listing)
}

fn truncate(digest: impl std::fmt::LowerHex) -> String {
    let mut hex = format!("{:x}", digest);
    hex.truncate(SHORT_HASH_LEN);
    hex
}
