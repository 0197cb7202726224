// Compaction: folds several segments into one new segment.
//
// The parents are zipped together in the order given, so with the default
// `LastWins` precedence a later parent's value for a key replaces an earlier
// one's. Keys in a parent's settled tombstones are dropped. Keys deleted
// while the merge runs land in the parents' during-merge sets and are carried
// over to the child.
//
// A failed merge leaves no trace: every parent is restored with
// `merge_failed` and the partial output is removed.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

pub use crate::traversal::zip::Precedence;
use crate::{
    fsa::{builder::AutomatonBuilder, LoadOptions},
    segment::Segment,
    traversal::zip::{ZipInput, ZipTraverser},
};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    pub precedence: Precedence,
    // Used to open the merged segment.
    pub load: LoadOptions,
}

/// Receives the merged key stream, in key order.
pub trait AutomatonSink {
    fn insert(&mut self, key: &[u8], value: &[u8], weight: u32) -> anyhow::Result<()>;

    /// Publishes the output at its final path.
    fn finish(&mut self) -> anyhow::Result<()>;

    /// Removes whatever has been written so far. Must be safe to call after
    /// a failed `finish`.
    fn discard(&mut self);
}

/// Builds the merged automaton in memory and writes it on `finish`.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    builder: Option<AutomatonBuilder>,
}

impl FileSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileSink {
            path: path.into(),
            builder: Some(AutomatonBuilder::new()),
        }
    }
}

impl AutomatonSink for FileSink {
    fn insert(&mut self, key: &[u8], value: &[u8], weight: u32) -> anyhow::Result<()> {
        match self.builder.as_mut() {
            Some(b) => b.insert(key, value, weight),
            None => anyhow::bail!("insert into finished sink for {:?}", self.path),
        }
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        match self.builder.take() {
            Some(b) => b.write_to_file(&self.path),
            None => anyhow::bail!("sink for {:?} finished twice", self.path),
        }
    }

    fn discard(&mut self) {
        self.builder = None;
        if let Err(e) = crate::fs::remove_if_exists(&self.path) {
            tracing::warn!(path = ?self.path, error = %e, "failed to remove partial merge output");
        }
    }
}

#[derive(Debug)]
pub enum MergeOutcome {
    Merged(Segment),
    Failed(anyhow::Error),
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged(_))
    }
}

/// Merges `parents` into a new segment at `output`.
pub fn merge_segments(
    parents: &[Arc<Segment>],
    output: &Path,
    options: &MergeOptions,
) -> MergeOutcome {
    let mut sink = FileSink::new(output);
    merge_segments_into(parents, &mut sink, output, options)
}

/// Like `merge_segments`, with the caller supplying where the merged keys
/// go. `output` is where the sink publishes the automaton.
pub fn merge_segments_into<S: AutomatonSink>(
    parents: &[Arc<Segment>],
    sink: &mut S,
    output: &Path,
    options: &MergeOptions,
) -> MergeOutcome {
    let mut elected = Vec::with_capacity(parents.len());
    let result = run(parents, &mut elected, sink, output, options);
    match result {
        Ok(child) => {
            tracing::debug!(
                output = ?output,
                parents = parents.len(),
                keys = child.fsa().map(|f| f.number_of_keys()).unwrap_or_default(),
                "merge finished"
            );
            MergeOutcome::Merged(child)
        }
        Err(e) => {
            tracing::warn!(output = ?output, error = %e, "merge failed, restoring parents");
            sink.discard();
            for parent in elected {
                if let Err(e) = parent.merge_failed() {
                    tracing::warn!(segment = parent.filename(), error = %e, "failed to restore segment after merge");
                }
            }
            MergeOutcome::Failed(e)
        }
    }
}

fn run<'a, S: AutomatonSink>(
    parents: &'a [Arc<Segment>],
    elected: &mut Vec<&'a Arc<Segment>>,
    sink: &mut S,
    output: &Path,
    options: &MergeOptions,
) -> anyhow::Result<Segment> {
    let mut inputs = Vec::with_capacity(parents.len());
    for parent in parents {
        let fsa = parent.fsa()?.clone();
        parent.elected_for_merge()?;
        elected.push(parent);
        inputs.push(ZipInput::new(fsa).with_tombstones(parent.deleted_keys()));
    }

    let mut zip = ZipTraverser::new(inputs, options.precedence);
    let mut keys = 0_u64;
    while zip.has_more() {
        if let Some(value) = zip.value_bytes() {
            // The builder derives inner weights from these, so deleted keys
            // leave no weight behind.
            sink.insert(zip.key(), value, zip.key_weight().unwrap_or(0))?;
            keys += 1;
        }
        zip.advance();
    }
    tracing::trace!(keys, "merged key stream");

    sink.finish()?;
    Segment::from_parents(output, parents, options.load)
}
