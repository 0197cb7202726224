pub mod comparable;
pub mod zip;

use std::marker::PhantomData;

use crate::fsa::Fsa;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub label: u8,
    pub target: u64,
    // Inner weight of the target; zero for unweighted traversal.
    pub weight: u32,
}

/// How a state's outgoing transitions are enumerated, and in what order they
/// are visited.
pub trait TransitionKind {
    fn expand(fsa: &Fsa, state: u64) -> Vec<Transition>;
}

/// Ascending label order, so final states come out in key order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unweighted;

impl TransitionKind for Unweighted {
    fn expand(fsa: &Fsa, state: u64) -> Vec<Transition> {
        fsa.outgoing_transitions(state)
            .map(|(label, target)| Transition {
                label,
                target,
                weight: 0,
            })
            .collect()
    }
}

/// Heaviest subtree first; ties go to the smaller label.
#[derive(Debug, Clone, Copy, Default)]
pub struct Weighted;

impl TransitionKind for Weighted {
    fn expand(fsa: &Fsa, state: u64) -> Vec<Transition> {
        let mut transitions: Vec<_> = fsa
            .outgoing_transitions(state)
            .map(|(label, target)| Transition {
                label,
                target,
                weight: fsa.inner_weight(target),
            })
            .collect();
        transitions.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.label.cmp(&b.label)));
        transitions
    }
}

#[derive(Debug)]
struct Frame {
    transitions: Vec<Transition>,
    next: usize,
}

impl Frame {
    fn new<T: TransitionKind>(fsa: &Fsa, state: u64) -> Self {
        Frame {
            transitions: T::expand(fsa, state),
            next: 0,
        }
    }
}

/// A depth-first cursor over one automaton.
///
/// The cursor stops on every state below the starting state (the starting
/// state itself is never visited), whether or not it is final. A state's
/// transitions are only expanded when the cursor descends into it, so
/// `prune` skips a subtree without ever looking at it.
///
/// Invariant: while positioned, `path.len() == stack.len()`, and the last
/// frame holds the transition that led to the current state.
#[derive(Debug)]
pub struct StateTraverser<T: TransitionKind = Unweighted> {
    fsa: Fsa,
    stack: Vec<Frame>,
    path: Vec<u8>,
    current: Option<Transition>,
    _kind: PhantomData<T>,
}

impl<T: TransitionKind> StateTraverser<T> {
    pub fn new(fsa: Fsa) -> Self {
        let start = fsa.start_state();
        Self::from_state(fsa, start)
    }

    pub fn from_state(fsa: Fsa, start: u64) -> Self {
        let root = Frame::new::<T>(&fsa, start);
        let mut t = StateTraverser {
            fsa,
            stack: vec![root],
            path: Vec::new(),
            current: None,
            _kind: PhantomData,
        };
        t.forward();
        t
    }

    // Moves to the next unvisited transition of the deepest frame, popping
    // exhausted frames on the way.
    fn forward(&mut self) {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.current = None;
                return;
            };
            if let Some(t) = frame.transitions.get(frame.next).copied() {
                frame.next += 1;
                self.path.push(t.label);
                self.current = Some(t);
                return;
            }
            self.stack.pop();
            self.path.pop();
        }
    }

    /// Moves to the next state in depth-first order, descending into the
    /// current state first.
    pub fn advance(&mut self) {
        debug_assert!(self.has_more(), "advance on an exhausted traverser");
        let Some(current) = self.current else {
            return;
        };
        self.stack.push(Frame::new::<T>(&self.fsa, current.target));
        self.forward();
    }

    /// Moves past the current state's subtree.
    pub fn prune(&mut self) {
        debug_assert!(self.has_more(), "prune on an exhausted traverser");
        if self.current.is_none() {
            return;
        }
        self.path.pop();
        self.forward();
    }

    pub fn has_more(&self) -> bool {
        self.current.is_some()
    }

    pub fn fsa(&self) -> &Fsa {
        &self.fsa
    }

    /// The bytes consumed from the starting state to here.
    pub fn key(&self) -> &[u8] {
        &self.path
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn state(&self) -> Option<u64> {
        self.current.map(|t| t.target)
    }

    pub fn label(&self) -> Option<u8> {
        self.current.map(|t| t.label)
    }

    pub fn is_final(&self) -> bool {
        self.state().map_or(false, |s| self.fsa.is_final(s))
    }

    pub fn state_value(&self) -> Option<u64> {
        self.state().and_then(|s| self.fsa.state_value(s))
    }

    pub fn value_bytes(&self) -> Option<&[u8]> {
        self.state().and_then(|s| self.fsa.value_bytes(s))
    }

    pub fn inner_weight(&self) -> u32 {
        self.state().map_or(0, |s| self.fsa.inner_weight(s))
    }

    /// The weight of the key ending here, if the current state is final.
    pub fn key_weight(&self) -> Option<u32> {
        self.state().and_then(|s| self.fsa.key_weight(s))
    }
}
