use super::Match;
use crate::{
    fsa::Fsa,
    traversal::{StateTraverser, TransitionKind, Unweighted},
};

/// All keys within a Levenshtein distance of a query.
///
/// The first `minimum_exact_prefix` bytes of the query must match exactly;
/// the rest is compared against everything below that prefix, one
/// edit-distance row per depth. A subtree is skipped as soon as no cell of
/// its row is within the bound, since rows never get cheaper further down.
/// Each match carries its distance as its score.
pub struct FuzzyMatcher<T: TransitionKind = Unweighted> {
    query: Vec<u8>,
    exact_prefix: usize,
    max_distance: u32,
    // rows[d] is the row for the key bytes at depth d below the prefix.
    rows: Vec<Vec<u32>>,
    exact: Option<Match>,
    traverser: Option<StateTraverser<T>>,
}

fn next_row(prev: &[u32], query: &[u8], label: u8) -> Vec<u32> {
    let mut row = Vec::with_capacity(prev.len());
    row.push(prev[0] + 1);
    for j in 1..prev.len() {
        let substitute = prev[j - 1] + u32::from(query[j - 1] != label);
        row.push(substitute.min(prev[j] + 1).min(row[j - 1] + 1));
    }
    row
}

impl<T: TransitionKind> FuzzyMatcher<T> {
    pub fn new<Q: Into<Vec<u8>>>(
        fsa: Fsa,
        query: Q,
        max_distance: u32,
        minimum_exact_prefix: usize,
    ) -> Self {
        let query = query.into();
        let exact_prefix = minimum_exact_prefix.min(query.len());
        let first_row: Vec<u32> = (0..=(query.len() - exact_prefix) as u32).collect();
        let mut m = FuzzyMatcher {
            query,
            exact_prefix,
            max_distance,
            rows: Vec::new(),
            exact: None,
            traverser: None,
        };
        let Some(state) = fsa.walk(&m.query[..exact_prefix]) else {
            return m;
        };

        // The prefix itself, with the rest of the query deleted.
        let distance = first_row[first_row.len() - 1];
        if fsa.is_final(state) && distance <= max_distance {
            m.exact = Some(
                Match::new(m.query[..exact_prefix].to_vec(), fsa.clone(), state)
                    .with_score(distance),
            );
        }
        m.rows.push(first_row);
        m.traverser = Some(StateTraverser::from_state(fsa, state));
        m
    }
}

impl<T: TransitionKind> Iterator for FuzzyMatcher<T> {
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        if let Some(m) = self.exact.take() {
            return Some(m);
        }
        let t = self.traverser.as_mut()?;
        let suffix = &self.query[self.exact_prefix..];
        while t.has_more() {
            let (Some(label), Some(state)) = (t.label(), t.state()) else {
                break;
            };
            let depth = t.depth();
            self.rows.truncate(depth);
            let row = next_row(&self.rows[depth - 1], suffix, label);
            let distance = row[row.len() - 1];
            let reachable = row.iter().any(|d| *d <= self.max_distance);
            self.rows.push(row);

            if !reachable {
                t.prune();
                continue;
            }
            let found = if t.is_final() && distance <= self.max_distance {
                let mut matched = self.query[..self.exact_prefix].to_vec();
                matched.extend_from_slice(t.key());
                Some(Match::new(matched, t.fsa().clone(), state).with_score(distance))
            } else {
                None
            };
            t.advance();
            if found.is_some() {
                return found;
            }
        }
        None
    }
}
