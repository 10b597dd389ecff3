//! Persisted set of content hashes the user chose to always allow.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tether_core::write_text_atomic;

pub const TRUST_STORE_FILE_NAME: &str = "trusted-native.json";
const SHA256_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 of the exact code bytes.
pub fn content_hash(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

pub fn is_valid_content_hash(hash: &str) -> bool {
    hash.len() == SHA256_HEX_LEN && hash.bytes().all(|byte| byte.is_ascii_hexdigit())
}

/// Parses the on-disk JSON array of hashes. Entries that are not sha256 hex
/// digests are skipped with a warning so the valid ones survive the next write.
pub fn parse_trust_store(raw: &str) -> Result<BTreeSet<String>> {
    let entries: Vec<Value> =
        serde_json::from_str(raw).context("trust store must be a JSON array")?;
    let mut hashes = BTreeSet::new();
    for entry in entries {
        let Some(normalized) = entry
            .as_str()
            .map(|text| text.trim().to_ascii_lowercase())
            .filter(|text| is_valid_content_hash(text))
        else {
            tracing::warn!(entry = %entry, "skipping trust store entry that is not a sha256 hex digest");
            continue;
        };
        hashes.insert(normalized);
    }
    Ok(hashes)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustStore {
    path: Option<PathBuf>,
    hashes: BTreeSet<String>,
}

impl TrustStore {
    /// Store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads `path`. A missing or unreadable file yields an empty store bound
    /// to the same path, so the first "always allow" recreates it.
    pub fn load(path: &Path) -> Self {
        let hashes = match std::fs::read_to_string(path) {
            Ok(raw) => match parse_trust_store(&raw) {
                Ok(hashes) => hashes,
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %format!("{error:#}"),
                        "ignoring corrupt trust store"
                    );
                    BTreeSet::new()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to read trust store");
                BTreeSet::new()
            }
        };
        tracing::debug!(path = %path.display(), trusted = hashes.len(), "loaded trust store");
        Self {
            path: Some(path.to_path_buf()),
            hashes,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.hashes.iter().map(String::as_str)
    }

    /// Adds `hash` and rewrites the file. The hash stays trusted in memory
    /// even when the write fails.
    pub fn insert(&mut self, hash: &str) -> Result<bool> {
        let normalized = hash.to_ascii_lowercase();
        if !is_valid_content_hash(&normalized) {
            bail!("'{hash}' is not a sha256 hex digest");
        }
        if !self.hashes.insert(normalized) {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn remove(&mut self, hash: &str) -> Result<bool> {
        if !self.hashes.remove(&hash.to_ascii_lowercase()) {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn to_json(&self) -> Result<String> {
        let entries: Vec<&str> = self.hashes().collect();
        serde_json::to_string_pretty(&entries).context("failed to serialize trust store")
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        write_text_atomic(path, &self.to_json()?)
            .with_context(|| format!("failed to persist trust store {}", path.display()))
    }
}
