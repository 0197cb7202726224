use std::cmp::Ordering;

use super::{StateTraverser, TransitionKind, Unweighted};
use crate::fsa::Fsa;

/// A traverser ordered by the bytes it has matched so far.
///
/// Two traversers over different automata are equal when they sit on the
/// same key. `order` records which input a traverser came from; it plays no
/// part in comparisons, callers use it to break ties between equal ones.
#[derive(Debug)]
pub struct ComparableTraverser<T: TransitionKind = Unweighted> {
    inner: StateTraverser<T>,
    order: usize,
}

impl<T: TransitionKind> ComparableTraverser<T> {
    pub fn new(fsa: Fsa, start: Option<u64>, order: usize) -> Self {
        let start = start.unwrap_or_else(|| fsa.start_state());
        ComparableTraverser {
            inner: StateTraverser::from_state(fsa, start),
            order,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn traverser(&self) -> &StateTraverser<T> {
        &self.inner
    }

    pub fn advance(&mut self) {
        self.inner.advance();
    }

    pub fn prune(&mut self) {
        self.inner.prune();
    }

    pub fn has_more(&self) -> bool {
        self.inner.has_more()
    }

    pub fn key(&self) -> &[u8] {
        self.inner.key()
    }
}

impl<T: TransitionKind> PartialEq for ComparableTraverser<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T: TransitionKind> Eq for ComparableTraverser<T> {}

impl<T: TransitionKind> PartialOrd for ComparableTraverser<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TransitionKind> Ord for ComparableTraverser<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(other.key())
    }
}
