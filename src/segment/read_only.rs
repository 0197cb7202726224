use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::SystemTime,
};

use anyhow::Context;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::tombstones::{
    self, deleted_keys_during_merge_path, deleted_keys_path, SharedTombstones, Tombstones,
};
use crate::fsa::{Automaton, Fsa, LoadOptions};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Mtimes {
    deleted_keys: Option<SystemTime>,
    deleted_keys_during_merge: Option<SystemTime>,
}

/// A segment as seen by a reader in another process (or thread) than the
/// one deleting from it.
///
/// Deletes arrive through the tombstone files only. `reload_deleted_keys`
/// rereads them when their modification times change; readers keep using
/// whichever snapshot they already hold.
#[derive(Debug)]
pub struct ReadOnlySegment {
    path: PathBuf,
    deleted_keys_path: PathBuf,
    deleted_keys_during_merge_path: PathBuf,
    filename: String,
    options: LoadOptions,
    fsa: OnceCell<Fsa>,
    has_deleted_keys: AtomicBool,
    deleted_keys: SharedTombstones,
    // Also serializes reloads.
    mtimes: Mutex<Mtimes>,
}

impl ReadOnlySegment {
    pub fn open_lazy<P: Into<PathBuf>>(path: P, options: LoadOptions) -> Self {
        let path = path.into();
        ReadOnlySegment {
            deleted_keys_path: deleted_keys_path(&path),
            deleted_keys_during_merge_path: deleted_keys_during_merge_path(&path),
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path,
            options,
            fsa: OnceCell::new(),
            has_deleted_keys: AtomicBool::new(false),
            deleted_keys: SharedTombstones::default(),
            mtimes: Mutex::new(Mtimes::default()),
        }
    }

    pub fn open<P: Into<PathBuf>>(path: P, options: LoadOptions) -> anyhow::Result<Self> {
        let segment = Self::open_lazy(path, options);
        segment.fsa()?;
        segment.reload_deleted_keys()?;
        Ok(segment)
    }

    pub fn fsa(&self) -> anyhow::Result<&Fsa> {
        self.fsa.get_or_try_init(|| {
            let fsa = Automaton::open(&self.path, self.options)
                .with_context(|| format!("loading segment {}", self.filename))?;
            Ok(Arc::new(fsa))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn deleted_keys_path(&self) -> &Path {
        &self.deleted_keys_path
    }

    pub fn deleted_keys_during_merge_path(&self) -> &Path {
        &self.deleted_keys_during_merge_path
    }

    /// Rereads both tombstone files if either changed since the last load.
    /// Returns whether a new set was published.
    pub fn reload_deleted_keys(&self) -> anyhow::Result<bool> {
        let mut mtimes = self.mtimes.lock();
        let current = Mtimes {
            deleted_keys: crate::fs::modified_time(&self.deleted_keys_path)?,
            deleted_keys_during_merge: crate::fs::modified_time(
                &self.deleted_keys_during_merge_path,
            )?,
        };
        if current == *mtimes {
            return Ok(false);
        }

        let mut keys: HashSet<String> = tombstones::load(&self.deleted_keys_path)?;
        keys.extend(tombstones::load(&self.deleted_keys_during_merge_path)?);
        let has_deleted_keys = !keys.is_empty();
        tracing::debug!(segment = %self.filename, deleted = keys.len(), "reloaded deleted keys");

        self.deleted_keys.replace(Arc::new(keys));
        self.has_deleted_keys
            .store(has_deleted_keys, Ordering::Release);
        *mtimes = current;
        Ok(true)
    }

    pub fn has_deleted_keys(&self) -> bool {
        self.has_deleted_keys.load(Ordering::Acquire)
    }

    pub fn deleted_keys(&self) -> Tombstones {
        self.deleted_keys.snapshot()
    }

    pub fn is_deleted(&self, key: &str) -> bool {
        // Deletes are rare, so most lookups never touch the lock.
        self.has_deleted_keys() && self.deleted_keys.contains(key)
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::HashSet,
        fs::File,
        time::{Duration, SystemTime},
    };

    use super::ReadOnlySegment;
    use crate::{
        fsa::LoadOptions,
        segment::{
            test::write_segment,
            tombstones::{self, deleted_keys_during_merge_path, deleted_keys_path},
            Segment,
        },
    };

    // Coarse filesystem timestamps could hide a rewrite within the same tick.
    fn bump_mtime(path: &std::path::Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        write_segment(&path, &["a", "b", "c"]);

        let reader = ReadOnlySegment::open(&path, LoadOptions::default()).unwrap();
        assert!(!reader.has_deleted_keys());
        assert!(!reader.is_deleted("a"));
        assert!(!reader.reload_deleted_keys().unwrap());

        let writer = Segment::open(&path, LoadOptions::default()).unwrap();
        writer.delete_key("a").unwrap();
        writer.delete_key("c").unwrap();
        writer.persist().unwrap();
        bump_mtime(&deleted_keys_path(&path), 10);

        let before = reader.deleted_keys();
        assert!(reader.reload_deleted_keys().unwrap());
        assert!(before.is_empty());
        assert!(reader.has_deleted_keys());
        let expected: HashSet<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(*reader.deleted_keys(), expected);
        assert!(reader.is_deleted("c"));
        assert!(!reader.is_deleted("b"));

        // Nothing changed on disk.
        assert!(!reader.reload_deleted_keys().unwrap());
    }

    #[test]
    fn test_reload_includes_during_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        write_segment(&path, &["a", "b"]);
        let reader = ReadOnlySegment::open(&path, LoadOptions::default()).unwrap();

        let keys: HashSet<String> = ["b".to_owned()].into_iter().collect();
        tombstones::write(&deleted_keys_during_merge_path(&path), &keys).unwrap();
        bump_mtime(&deleted_keys_during_merge_path(&path), 10);
        assert!(reader.reload_deleted_keys().unwrap());
        assert!(reader.is_deleted("b"));

        // The merge gave up and folded its deletes into the settled file.
        tombstones::write(&deleted_keys_path(&path), &keys).unwrap();
        std::fs::remove_file(deleted_keys_during_merge_path(&path)).unwrap();
        assert!(reader.reload_deleted_keys().unwrap());
        assert!(reader.is_deleted("b"));
        assert_eq!(reader.deleted_keys().len(), 1);
    }

    #[test]
    fn test_missing_automaton() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ReadOnlySegment::open(dir.path().join("nope"), LoadOptions::default()).is_err());
        let lazy = ReadOnlySegment::open_lazy(dir.path().join("nope"), LoadOptions::default());
        assert_eq!(lazy.filename(), "nope");
        assert!(lazy.fsa().is_err());
    }
}
