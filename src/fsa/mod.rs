pub mod builder;
pub mod scanner;
pub mod value_store;

// This package reads finite-state automata (FSAs) from disk.
//
// An automaton maps byte-string keys to values. Keys are paths through a graph
// of states; each state has up to 256 labeled outgoing transitions, an
// optional final marker (with a reference into the value store) and an inner
// weight, which is the highest weight of any key at or below that state. The
// weight of a key itself is kept with its value. Transitions never form a
// cycle.
//
// Physically, an automaton file is:
// * an 8-byte magic,
// * a u32 length followed by a JSON properties record (see `Properties`),
// * the body: five parallel arrays of `sparse_array_size` slots, followed by
//   the value store.
//
// The arrays are `labels` (u8), `targets` (u64), `flags` (u8), `values` (u64)
// and `weights` (u32), all little-endian. A state is identified by its base
// offset `s`. Its transition on label `c` lives in slot `s + c`, and exists
// iff `labels[s + c] == c` and `targets[s + c] != 0`. Because a slot's owner
// is always `slot - labels[slot]`, states can be interleaved in the array
// without ambiguity. The per-state arrays (`flags`, `values`, `weights`) are
// indexed by the base offset directly.
//
// Automata are immutable once loaded and are shared between readers through
// an `Arc`.

use std::{fs::File, path::Path, sync::Arc};

use anyhow::Context;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::scanner::ScannerKind;
use self::{
    scanner::{LabelSet, BLOCK_SIZE},
    value_store::ValueStore,
};

pub const MAGIC: &[u8; 8] = b"FSADB\x00\x00\x01";
pub const FORMAT_VERSION: u32 = 1;

pub const FLAG_STATE: u8 = 0x01;
pub const FLAG_FINAL: u8 = 0x02;

// Bytes per slot across the five arrays.
pub const SLOT_WIDTH: usize = 1 + 8 + 1 + 8 + 4;

pub type Fsa = Arc<Automaton>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("not an automaton file")]
    BadMagic,
    #[error("unsupported automaton version {0}")]
    UnsupportedVersion(u32),
    #[error("automaton file is truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: u64, found: u64 },
    #[error("invalid properties header: {0}")]
    InvalidHeader(String),
    #[error("checksum mismatch: header says {expected:#010x}, body hashes to {found:#010x}")]
    ChecksumMismatch { expected: u32, found: u32 },
    #[error("invalid state {0}")]
    InvalidState(u64),
    #[error("invalid transition in slot {slot} to {target}")]
    InvalidTransition { slot: u64, target: u64 },
    #[error("state {state} points outside the value store ({value_ref})")]
    InvalidValue { state: u64, value_ref: u64 },
    #[error("transition from {state} to {target} closes a cycle")]
    Cycle { state: u64, target: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Properties {
    pub version: u32,
    pub start_state: u64,
    pub number_of_keys: u64,
    pub sparse_array_size: u64,
    pub value_store_size: u64,
    pub checksum: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    pub verify_checksum: bool,
    pub scanner: ScannerKind,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            verify_checksum: true,
            scanner: ScannerKind::Auto,
        }
    }
}

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(m) => m.as_ref(),
            Backing::Owned(v) => v.as_slice(),
        }
    }
}

pub struct Automaton {
    backing: Backing,
    properties: Properties,
    scanner: ScannerKind,
    // Absolute offsets of each array within `backing`.
    labels: usize,
    targets: usize,
    flags: usize,
    values: usize,
    weights: usize,
    value_store: usize,
}

impl std::fmt::Debug for Automaton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automaton")
            .field("properties", &self.properties)
            .field("scanner", &self.scanner)
            .finish()
    }
}

impl Automaton {
    pub fn open<P: AsRef<Path>>(path: P, options: LoadOptions) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening automaton {:?}", path))?;
        // SAFETY: automaton files are written once (via rename) and never
        // modified in place afterwards.
        let mmap = unsafe { Mmap::map(&file)? };
        let fsa = Self::load(Backing::Mapped(mmap), options)
            .with_context(|| format!("loading automaton {:?}", path))?;
        tracing::debug!(
            path = ?path,
            keys = fsa.properties.number_of_keys,
            slots = fsa.properties.sparse_array_size,
            "loaded automaton"
        );
        Ok(fsa)
    }

    pub fn from_bytes(bytes: Vec<u8>, options: LoadOptions) -> anyhow::Result<Self> {
        Self::load(Backing::Owned(bytes), options)
    }

    fn load(backing: Backing, options: LoadOptions) -> anyhow::Result<Self> {
        let bytes = backing.bytes();
        let found = bytes.len() as u64;
        if bytes.len() < MAGIC.len() + 4 {
            if !bytes.starts_with(&MAGIC[..bytes.len().min(MAGIC.len())]) {
                return Err(FormatError::BadMagic.into());
            }
            return Err(FormatError::Truncated {
                expected: (MAGIC.len() + 4) as u64,
                found,
            }
            .into());
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(FormatError::BadMagic.into());
        }
        let props_len =
            u32::from_le_bytes(bytes[MAGIC.len()..MAGIC.len() + 4].try_into()?) as usize;
        let props_start = MAGIC.len() + 4;
        let props_end = props_start
            .checked_add(props_len)
            .ok_or_else(|| FormatError::InvalidHeader("length overflow".into()))?;
        if bytes.len() < props_end {
            return Err(FormatError::Truncated {
                expected: props_end as u64,
                found,
            }
            .into());
        }
        let properties: Properties = serde_json::from_slice(&bytes[props_start..props_end])
            .map_err(|e| FormatError::InvalidHeader(e.to_string()))?;
        if properties.version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(properties.version).into());
        }

        let slots = usize::try_from(properties.sparse_array_size)
            .map_err(|_| FormatError::InvalidHeader("sparse array too large".into()))?;
        let value_store_size = usize::try_from(properties.value_store_size)
            .map_err(|_| FormatError::InvalidHeader("value store too large".into()))?;
        let expected = slots
            .checked_mul(SLOT_WIDTH)
            .and_then(|n| n.checked_add(value_store_size))
            .and_then(|n| n.checked_add(props_end))
            .ok_or_else(|| FormatError::InvalidHeader("size overflow".into()))?;
        if bytes.len() < expected {
            return Err(FormatError::Truncated {
                expected: expected as u64,
                found,
            }
            .into());
        }
        if bytes.len() > expected {
            return Err(FormatError::InvalidHeader(format!(
                "{} trailing bytes",
                bytes.len() - expected
            ))
            .into());
        }

        if options.verify_checksum {
            let computed = crc32fast::hash(&bytes[props_end..]);
            if computed != properties.checksum {
                return Err(FormatError::ChecksumMismatch {
                    expected: properties.checksum,
                    found: computed,
                }
                .into());
            }
        }

        let labels = props_end;
        let targets = labels + slots;
        let flags = targets + slots * 8;
        let values = flags + slots;
        let weights = values + slots * 8;
        let value_store = weights + slots * 4;

        let fsa = Automaton {
            backing,
            properties,
            scanner: options.scanner,
            labels,
            targets,
            flags,
            values,
            weights,
            value_store,
        };
        fsa.validate()?;
        Ok(fsa)
    }

    // Structural checks, so that traversal can index without bounds worries.
    fn validate(&self) -> Result<(), FormatError> {
        let slots = self.properties.sparse_array_size;
        let start = self.properties.start_state;
        if !self.is_state(start) {
            return Err(FormatError::InvalidState(start));
        }
        let values = self.value_store();
        for slot in 0..slots {
            let flags = self.flags_at(slot);
            if flags & FLAG_STATE != 0 {
                if slot == 0 || slot + BLOCK_SIZE as u64 > slots {
                    return Err(FormatError::InvalidState(slot));
                }
                if flags & FLAG_FINAL != 0 {
                    let value_ref = self.u64_at(self.values, slot);
                    if values.get(value_ref).is_none() {
                        return Err(FormatError::InvalidValue {
                            state: slot,
                            value_ref,
                        });
                    }
                }
            }

            let target = self.target_at(slot);
            let label = self.label_at(slot) as u64;
            if target != 0 {
                let owner_ok = slot >= label && self.is_state(slot - label);
                if !owner_ok || !self.is_state(target) {
                    return Err(FormatError::InvalidTransition { slot, target });
                }
            } else if label != 0 {
                // Unused slots carry label 0; anything else would scan as a
                // transition to nowhere.
                return Err(FormatError::InvalidTransition { slot, target });
            }
        }
        self.check_acyclic()
    }

    // Depth-first over the states reachable from the start, failing on the
    // first edge back into the current path.
    fn check_acyclic(&self) -> Result<(), FormatError> {
        const ON_PATH: u8 = 1;
        const DONE: u8 = 2;

        let mut marks = vec![0_u8; self.properties.sparse_array_size as usize];
        let start = self.start_state();
        marks[start as usize] = ON_PATH;
        let mut stack = vec![(start, self.targets_of(start))];
        while let Some((state, targets)) = stack.last_mut() {
            let state = *state;
            match targets.next() {
                Some(target) => match marks[target as usize] {
                    ON_PATH => return Err(FormatError::Cycle { state, target }),
                    DONE => {}
                    _ => {
                        marks[target as usize] = ON_PATH;
                        stack.push((target, self.targets_of(target)));
                    }
                },
                None => {
                    marks[state as usize] = DONE;
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    fn targets_of(&self, state: u64) -> std::vec::IntoIter<u64> {
        self.outgoing_transitions(state)
            .map(|(_, target)| target)
            .collect::<Vec<_>>()
            .into_iter()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn start_state(&self) -> u64 {
        self.properties.start_state
    }

    pub fn number_of_keys(&self) -> u64 {
        self.properties.number_of_keys
    }

    pub fn is_empty(&self) -> bool {
        self.properties.number_of_keys == 0
    }

    pub fn scanner(&self) -> ScannerKind {
        self.scanner
    }

    fn bytes(&self) -> &[u8] {
        self.backing.bytes()
    }

    fn u64_at(&self, array: usize, slot: u64) -> u64 {
        let at = array + slot as usize * 8;
        u64::from_le_bytes(self.bytes()[at..at + 8].try_into().unwrap())
    }

    fn label_at(&self, slot: u64) -> u8 {
        self.bytes()[self.labels + slot as usize]
    }

    fn target_at(&self, slot: u64) -> u64 {
        self.u64_at(self.targets, slot)
    }

    fn flags_at(&self, slot: u64) -> u8 {
        self.bytes()[self.flags + slot as usize]
    }

    pub fn is_state(&self, state: u64) -> bool {
        state != 0 && state < self.properties.sparse_array_size && self.flags_at(state) & FLAG_STATE != 0
    }

    pub fn is_final(&self, state: u64) -> bool {
        self.flags_at(state) & FLAG_FINAL != 0
    }

    // The value reference of a final state.
    pub fn state_value(&self, state: u64) -> Option<u64> {
        if self.is_final(state) {
            Some(self.u64_at(self.values, state))
        } else {
            None
        }
    }

    pub fn inner_weight(&self, state: u64) -> u32 {
        let at = self.weights + state as usize * 4;
        u32::from_le_bytes(self.bytes()[at..at + 4].try_into().unwrap())
    }

    /// The weight the key ending in `state` was inserted with.
    pub fn key_weight(&self, state: u64) -> Option<u32> {
        self.state_value(state)
            .and_then(|value_ref| self.value_store().weight(value_ref))
    }

    pub fn value_store(&self) -> ValueStore<'_> {
        ValueStore::new(&self.bytes()[self.value_store..])
    }

    pub fn value_bytes(&self, state: u64) -> Option<&[u8]> {
        self.state_value(state)
            .and_then(|value_ref| self.value_store().get(value_ref))
    }

    // The 256 label bytes owned by `state`.
    pub fn block(&self, state: u64) -> &[u8; BLOCK_SIZE] {
        debug_assert!(self.is_state(state), "{} is not a state", state);
        let at = self.labels + state as usize;
        self.bytes()[at..at + BLOCK_SIZE].try_into().unwrap()
    }

    pub fn try_walk_transition(&self, state: u64, label: u8) -> Option<u64> {
        let slot = state + label as u64;
        if self.label_at(slot) != label {
            return None;
        }
        match self.target_at(slot) {
            0 => None,
            target => Some(target),
        }
    }

    pub fn outgoing_labels(&self, state: u64) -> LabelSet {
        let mut labels = scanner::scan(self.scanner, self.block(state));
        // A zero byte in an unused slot looks like a label-0 transition.
        if labels.contains(0) && self.target_at(state) == 0 {
            let mut filtered = LabelSet::new();
            for l in labels.iter().filter(|l| *l != 0) {
                filtered.insert(l);
            }
            labels = filtered;
        }
        labels
    }

    // (label, target) pairs in ascending label order.
    pub fn outgoing_transitions(&self, state: u64) -> impl Iterator<Item = (u8, u64)> + '_ {
        self.outgoing_labels(state)
            .iter()
            .map(move |label| (label, self.target_at(state + label as u64)))
            .collect::<Vec<_>>()
            .into_iter()
    }

    // The state reached by `key`, final or not.
    pub fn walk(&self, key: &[u8]) -> Option<u64> {
        let mut state = self.start_state();
        for b in key {
            state = self.try_walk_transition(state, *b)?;
        }
        Some(state)
    }

    // The final state for `key`.
    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        self.walk(key).filter(|s| self.is_final(*s))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.lookup(key).is_some()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.lookup(key).and_then(|s| self.value_bytes(s))
    }
}
