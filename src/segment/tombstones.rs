// Deleted keys of a segment live next to its automaton file, msgpack-encoded
// as an array of strings. `<segment>.dk` holds the settled set and
// `<segment>.dkm` the keys deleted while the segment is being merged. A
// missing file reads as an empty set.

use std::{
    collections::{BTreeSet, HashSet},
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use parking_lot::Mutex;

pub use crate::traversal::zip::Tombstones;

pub const DELETED_KEYS_SUFFIX: &str = ".dk";
pub const DELETED_KEYS_DURING_MERGE_SUFFIX: &str = ".dkm";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut p = OsString::from(path.as_os_str());
    p.push(suffix);
    PathBuf::from(p)
}

pub fn deleted_keys_path(segment: &Path) -> PathBuf {
    with_suffix(segment, DELETED_KEYS_SUFFIX)
}

pub fn deleted_keys_during_merge_path(segment: &Path) -> PathBuf {
    with_suffix(segment, DELETED_KEYS_DURING_MERGE_SUFFIX)
}

pub fn load(path: &Path) -> anyhow::Result<HashSet<String>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
    };
    rmp_serde::from_slice(&bytes).with_context(|| format!("decoding deleted keys in {:?}", path))
}

pub fn write(path: &Path, keys: &HashSet<String>) -> anyhow::Result<()> {
    // Sorted, so the same set always produces the same file.
    let sorted: BTreeSet<&String> = keys.iter().collect();
    let encoded = rmp_serde::to_vec(&sorted)?;
    crate::fs::write_atomic(path, &encoded).with_context(|| format!("writing {:?}", path))
}

/// A set of deleted keys that readers can take cheap snapshots of.
///
/// The set behind the handle is never modified. Writers build a new set and
/// swap it in, so the lock is only held long enough to clone or replace an
/// `Arc`.
#[derive(Debug, Default)]
pub struct SharedTombstones {
    current: Mutex<Tombstones>,
}

impl SharedTombstones {
    pub fn new(keys: HashSet<String>) -> Self {
        SharedTombstones {
            current: Mutex::new(Arc::new(keys)),
        }
    }

    pub fn snapshot(&self) -> Tombstones {
        self.current.lock().clone()
    }

    pub fn replace(&self, keys: Tombstones) {
        *self.current.lock() = keys;
    }

    // Callers must serialize updates among themselves; a concurrent update
    // between the snapshot and the swap would be lost.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut HashSet<String>) -> bool,
    {
        let mut keys = (*self.snapshot()).clone();
        let changed = f(&mut keys);
        if changed {
            self.replace(Arc::new(keys));
        }
        changed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.snapshot().contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
