//! Compiled program cache.
//!
//! Entries are keyed by template identity and a fingerprint of the source
//! that produced them, so an edited template simply misses. Each entry also
//! records the fingerprint of every template the compilation read; the
//! engine treats the entry as stale when any of them changed.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use trellis_runtime::RUNTIME_VERSION;

use crate::error::CacheError;

const ENTRY_SUFFIX: &str = ".trellis.json";

fn modified(path: &Path) -> io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

fn io_error(path: &Path, source: io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Hex SHA-256 of a template source.
pub fn fingerprint(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: String,
    pub fingerprint: String,
    pub runtime_version: u32,
    /// Identity to fingerprint of every template the compilation read.
    pub dependencies: BTreeMap<String, String>,
    /// Parameters, for entries holding a single fragment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
    pub code: String,
}

impl CacheEntry {
    pub fn new(identity: &str, fingerprint: &str, dependencies: BTreeMap<String, String>, code: String) -> Self {
        Self {
            identity: identity.to_string(),
            fingerprint: fingerprint.to_string(),
            runtime_version: RUNTIME_VERSION,
            dependencies,
            params: Vec::new(),
            code,
        }
    }

    fn matches(&self, identity: &str, fingerprint: &str) -> bool {
        self.identity == identity && self.fingerprint == fingerprint && self.runtime_version == RUNTIME_VERSION
    }
}

pub trait CacheStore: Send + Sync {
    /// The entry for `identity` compiled from a source with `fingerprint`.
    fn get(&self, identity: &str, fingerprint: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store `entry`, dropping any entry for the same identity.
    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;

    /// Drop the entry for `identity` and, for a template, the entries of
    /// its fragments (`<identity>::<fragment>`).
    fn remove(&self, identity: &str) -> Result<(), CacheError>;

    fn clear(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, identity: &str, fingerprint: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(identity)
            .filter(|e| e.matches(identity, fingerprint))
            .cloned())
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry.identity.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), CacheError> {
        let fragments = format!("{identity}::");
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|key, _| key != identity && !key.starts_with(&fragments));
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        Ok(())
    }
}

/// One JSON file per entry in a directory, named
/// `<template hash>-<identity hash>-<key hash>.trellis.json`, where the
/// template is the identity up to any `::fragment` suffix and the key adds
/// the fingerprint and runtime version. Writes go through a temporary file
/// renamed into place, so readers never see a partial entry.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    dir: PathBuf,
}

impl FsCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn digest(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    // shared by a template and its fragment entries
    fn template_prefix(identity: &str) -> String {
        let template = identity.split("::").next().unwrap_or(identity);
        format!("{}-", &Self::digest(template)[..16])
    }

    fn identity_prefix(identity: &str) -> String {
        format!("{}{}-", Self::template_prefix(identity), &Self::digest(identity)[..8])
    }

    pub fn entry_path(&self, identity: &str, fingerprint: &str) -> PathBuf {
        let digest = Self::digest(&format!("{identity}\0{fingerprint}\0{RUNTIME_VERSION}"));
        self.dir.join(format!(
            "{}{}{ENTRY_SUFFIX}",
            Self::identity_prefix(identity),
            &digest[..32]
        ))
    }

    /// Entry files in the cache directory whose names start with `prefix`.
    fn entries(&self, prefix: &str) -> Result<Vec<PathBuf>, CacheError> {
        let listing = match fs::read_dir(&self.dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir, e)),
        };
        let mut paths = Vec::new();
        for entry in listing {
            let path = entry.map_err(|e| io_error(&self.dir, e))?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix) && n.ends_with(ENTRY_SUFFIX));
            if matches {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn remove_file(&self, path: &Path) -> Result<(), CacheError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, e)),
        }
    }
}

impl CacheStore for FsCacheStore {
    fn get(&self, identity: &str, fingerprint: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(identity, fingerprint);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        let entry: CacheEntry =
            serde_json::from_slice(&bytes).map_err(|source| CacheError::Corrupt { path, source })?;
        Ok(entry.matches(identity, fingerprint).then_some(entry))
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let path = self.entry_path(&entry.identity, &entry.fingerprint);
        let json = serde_json::to_vec_pretty(entry).map_err(CacheError::Encode)?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        tmp.write_all(&json).map_err(|e| io_error(&path, e))?;
        tmp.as_file().sync_all().map_err(|e| io_error(&path, e))?;
        tmp.persist(&path).map_err(|e| io_error(&path, e.error))?;

        // a sibling written after ours comes from a newer source; leave it
        let written = modified(&path).map_err(|e| io_error(&path, e))?;
        for stale in self.entries(&Self::identity_prefix(&entry.identity))? {
            if stale != path && modified(&stale).is_ok_and(|t| t <= written) {
                self.remove_file(&stale)?;
            }
        }
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), CacheError> {
        let prefix = if identity.contains("::") {
            Self::identity_prefix(identity)
        } else {
            Self::template_prefix(identity)
        };
        for path in self.entries(&prefix)? {
            self.remove_file(&path)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        for path in self.entries("")? {
            self.remove_file(&path)?;
        }
        Ok(())
    }
}
