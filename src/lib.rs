// fsadb: a read-optimized key-value index stored as byte-labeled finite-state
// automata. Each segment is one immutable automaton file plus a set of
// deleted keys; segments are merged in the background into larger ones.

pub mod fs;
pub mod fsa;
pub mod matching;
pub mod merge;
pub mod segment;
pub mod traversal;

pub use fsa::{Automaton, Fsa, FormatError, LoadOptions};
pub use matching::{fuzzy::FuzzyMatcher, prefix::PrefixMatcher, ExpressionMatcher, Match};
pub use merge::{merge_segments, MergeOptions, MergeOutcome, Precedence};
pub use segment::{read_only::ReadOnlySegment, Segment};
pub use traversal::{zip::ZipTraverser, StateTraverser, Unweighted, Weighted};
