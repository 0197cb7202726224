pub mod read_only;
pub mod tombstones;

// A segment is one automaton file plus the keys deleted from it since it was
// written. Automaton files are immutable, so a delete only records the key in
// a tombstone set that readers consult; the key physically disappears when
// the segment is merged into a new one.
//
// While a segment is an input to a merge, its settled tombstones are frozen
// (the merge is reading them) and new deletes go to a separate during-merge
// set instead. When the merge succeeds, the child segment inherits the
// during-merge sets of all its parents. When it fails, each parent folds its
// during-merge set back into its settled set.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use self::tombstones::{
    deleted_keys_during_merge_path, deleted_keys_path, SharedTombstones, Tombstones,
};
use crate::fsa::{Automaton, Fsa, LoadOptions};

#[derive(Debug, Default)]
struct WriteState {
    in_merge: bool,
    // Deletes since the last persist.
    dirty: bool,
}

#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    filename: String,
    options: LoadOptions,
    fsa: OnceCell<Fsa>,
    deleted_keys: SharedTombstones,
    deleted_keys_during_merge: SharedTombstones,
    // Held for the whole of every state change, which serializes writers.
    state: Mutex<WriteState>,
}

impl Segment {
    fn new(path: PathBuf, options: LoadOptions, deleted_keys: HashSet<String>) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Segment {
            path,
            filename,
            options,
            fsa: OnceCell::new(),
            deleted_keys: SharedTombstones::new(deleted_keys),
            deleted_keys_during_merge: SharedTombstones::default(),
            state: Mutex::new(WriteState::default()),
        }
    }

    /// Opens a segment without touching its automaton, which is mapped on
    /// first use.
    ///
    /// Tombstones left behind by an earlier process are picked up. A leftover
    /// during-merge file means that merge never finished, so its keys are
    /// folded into the settled set.
    pub fn open_lazy<P: Into<PathBuf>>(path: P, options: LoadOptions) -> anyhow::Result<Self> {
        let path = path.into();
        let mut deleted = tombstones::load(&deleted_keys_path(&path))?;
        let dkm_path = deleted_keys_during_merge_path(&path);
        let interrupted = tombstones::load(&dkm_path)?;
        let recovered = !interrupted.is_empty();
        deleted.extend(interrupted);

        let segment = Segment::new(path, options, deleted);
        if recovered {
            tracing::debug!(segment = %segment.filename, "recovering deletes from interrupted merge");
            segment.state.lock().dirty = true;
            segment.persist()?;
        }
        crate::fs::remove_if_exists(&dkm_path)?;
        Ok(segment)
    }

    /// Opens a segment and loads its automaton, failing if the file is
    /// missing or corrupt.
    pub fn open<P: Into<PathBuf>>(path: P, options: LoadOptions) -> anyhow::Result<Self> {
        let segment = Self::open_lazy(path, options)?;
        segment.fsa()?;
        Ok(segment)
    }

    /// The segment produced by merging `parents`. Keys deleted from any parent
    /// while the merge ran start out deleted here.
    pub fn from_parents<P: Into<PathBuf>>(
        path: P,
        parents: &[Arc<Segment>],
        options: LoadOptions,
    ) -> anyhow::Result<Self> {
        let mut deleted = HashSet::new();
        for parent in parents {
            deleted.extend(parent.deleted_keys_during_merge.snapshot().iter().cloned());
        }
        let dirty = !deleted.is_empty();
        let segment = Segment::new(path.into(), options, deleted);
        segment.fsa()?;
        if dirty {
            segment.state.lock().dirty = true;
            segment.persist()?;
        }
        tracing::debug!(
            segment = %segment.filename,
            parents = parents.len(),
            deleted = segment.deleted_keys.snapshot().len(),
            "created segment from merge"
        );
        Ok(segment)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn fsa(&self) -> anyhow::Result<&Fsa> {
        self.fsa.get_or_try_init(|| {
            let fsa = Automaton::open(&self.path, self.options)
                .with_context(|| format!("loading segment {}", self.filename))?;
            Ok(Arc::new(fsa))
        })
    }

    /// Records `key` as deleted. Keys the automaton doesn't hold, or that are
    /// already deleted, are ignored. Returns whether anything changed.
    pub fn delete_key(&self, key: &str) -> anyhow::Result<bool> {
        if !self.fsa()?.contains(key.as_bytes()) {
            return Ok(false);
        }
        let mut state = self.state.lock();
        let target = if state.in_merge {
            &self.deleted_keys_during_merge
        } else {
            &self.deleted_keys
        };
        let changed = target.update(|keys| keys.insert(key.to_owned()));
        if changed {
            tracing::trace!(segment = %self.filename, key, in_merge = state.in_merge, "deleted key");
            state.dirty = true;
        }
        Ok(changed)
    }

    /// Writes pending deletes to disk. Only the set currently taking deletes
    /// can have changed since the last persist, so only that one is written.
    pub fn persist(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        self.persist_locked(&mut state)
    }

    fn persist_locked(&self, state: &mut WriteState) -> anyhow::Result<()> {
        if !state.dirty {
            return Ok(());
        }
        if state.in_merge {
            tombstones::write(
                &deleted_keys_during_merge_path(&self.path),
                &self.deleted_keys_during_merge.snapshot(),
            )?;
        } else {
            tombstones::write(&deleted_keys_path(&self.path), &self.deleted_keys.snapshot())?;
        }
        tracing::debug!(segment = %self.filename, in_merge = state.in_merge, "persisted deleted keys");
        state.dirty = false;
        Ok(())
    }

    /// Freezes the settled tombstones for use as merge input.
    pub fn elected_for_merge(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        debug_assert!(!state.in_merge, "segment {} is already in a merge", self.filename);
        self.persist_locked(&mut state)?;
        state.in_merge = true;
        tracing::debug!(segment = %self.filename, "elected for merge");
        Ok(())
    }

    /// Undoes `elected_for_merge` after the merge was abandoned.
    ///
    /// The folded set is written before anything changes in memory; if that
    /// write fails, the segment is still marked for merge and the call can be
    /// retried.
    pub fn merge_failed(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let during_merge = self.deleted_keys_during_merge.snapshot();
        if !during_merge.is_empty() {
            let mut settled = (*self.deleted_keys.snapshot()).clone();
            settled.extend(during_merge.iter().cloned());
            tombstones::write(&deleted_keys_path(&self.path), &settled)?;
            self.deleted_keys.replace(Arc::new(settled));
            self.deleted_keys_during_merge.replace(Arc::default());
            state.dirty = false;
        }
        state.in_merge = false;
        // A leftover file holds a subset of the settled set, which reopening
        // folds in again.
        crate::fs::remove_if_exists(&deleted_keys_during_merge_path(&self.path))?;
        tracing::debug!(segment = %self.filename, folded = during_merge.len(), "merge failed");
        Ok(())
    }

    pub fn marked_for_merge(&self) -> bool {
        self.state.lock().in_merge
    }

    /// Deletes the automaton and both tombstone files. Missing files are fine;
    /// anything else is logged and skipped.
    pub fn remove_files(&self) {
        for path in [
            self.path.clone(),
            deleted_keys_during_merge_path(&self.path),
            deleted_keys_path(&self.path),
        ] {
            if let Err(e) = crate::fs::remove_if_exists(&path) {
                tracing::warn!(path = ?path, error = %e, "failed to remove segment file");
            }
        }
        tracing::debug!(segment = %self.filename, "removed segment files");
    }

    /// The settled tombstones.
    pub fn deleted_keys(&self) -> Tombstones {
        self.deleted_keys.snapshot()
    }

    pub fn deleted_keys_during_merge(&self) -> Tombstones {
        self.deleted_keys_during_merge.snapshot()
    }

    pub fn has_deleted_keys(&self) -> bool {
        !self.deleted_keys.is_empty() || !self.deleted_keys_during_merge.is_empty()
    }

    /// Whether readers should treat `key` as gone, whichever set holds it.
    pub fn is_deleted(&self, key: &str) -> bool {
        self.deleted_keys.contains(key) || self.deleted_keys_during_merge.contains(key)
    }
}
