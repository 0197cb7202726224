pub mod fuzzy;
pub mod prefix;

use std::{borrow::Cow, collections::HashSet};

use crate::fsa::Fsa;

/// Byte that stands for "any run of bytes" inside a stored key.
pub const WILDCARD: u8 = 0x1b;

/// A key found by one of the matchers.
#[derive(Clone)]
pub struct Match {
    matched: Vec<u8>,
    fsa: Fsa,
    state: u64,
    // Edit distance for fuzzy matches, zero otherwise.
    score: u32,
}

impl Match {
    pub fn new(matched: Vec<u8>, fsa: Fsa, state: u64) -> Self {
        debug_assert!(fsa.is_final(state));
        Match {
            matched,
            fsa,
            state,
            score: 0,
        }
    }

    pub fn with_score(mut self, score: u32) -> Self {
        self.score = score;
        self
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn matched(&self) -> &[u8] {
        &self.matched
    }

    pub fn matched_string(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.matched)
    }

    pub fn fsa(&self) -> &Fsa {
        &self.fsa
    }

    pub fn state(&self) -> u64 {
        self.state
    }

    pub fn value_bytes(&self) -> Option<&[u8]> {
        self.fsa.value_bytes(self.state)
    }

    pub fn value_as_string(&self) -> Option<Cow<'_, str>> {
        self.value_bytes().map(String::from_utf8_lossy)
    }

    pub fn weight(&self) -> u32 {
        self.fsa.inner_weight(self.state)
    }
}

impl std::fmt::Debug for Match {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Match")
            .field("matched", &self.matched_string())
            .field("value", &self.value_as_string())
            .field("weight", &self.weight())
            .field("score", &self.score)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Exact,
    FollowWildcard,
    Wildcard,
    Exhausted,
}

#[derive(Debug)]
struct Frame {
    mode: Mode,
    state: u64,
    offset: usize,
    // Nonzero while inside a wildcard gap.
    wildcard_depth: usize,
}

impl Frame {
    fn new(state: u64, offset: usize, wildcard_depth: usize) -> Self {
        Frame {
            mode: Mode::Exact,
            state,
            offset,
            wildcard_depth,
        }
    }
}

/// Matches a literal query against stored keys that may contain `WILDCARD`.
///
/// A wildcard in a stored key swallows zero or more query bytes. The search
/// is a depth-first backtrack over an explicit stack of frames; each frame
/// tries, in turn, to consume the next query byte literally, to widen the
/// gap it sits in by one byte, and to enter a wildcard transition. The first
/// match is computed on construction, later ones on demand.
///
/// Gaps of different widths can lead to the same final state, so states
/// already reported are remembered and each stored key matches once.
pub struct ExpressionMatcher {
    fsa: Fsa,
    query: Vec<u8>,
    stack: Vec<Frame>,
    reported: HashSet<u64>,
    first_match: Option<Match>,
}

impl ExpressionMatcher {
    pub fn new<Q: Into<Vec<u8>>>(fsa: Fsa, query: Q) -> Self {
        let start = fsa.start_state();
        let mut m = ExpressionMatcher {
            fsa,
            query: query.into(),
            stack: vec![Frame::new(start, 0, 0)],
            reported: HashSet::new(),
            first_match: None,
        };
        m.first_match = m.next_match();
        m
    }

    pub fn first_match(&self) -> Option<&Match> {
        self.first_match.as_ref()
    }

    /// Continues the search after the last match. Returns None once the
    /// search space is used up, and keeps returning None after that.
    pub fn next_match(&mut self) -> Option<Match> {
        let state = self.next_final_state()?;
        Some(Match::new(self.query.clone(), self.fsa.clone(), state))
    }

    fn next_final_state(&mut self) -> Option<u64> {
        let query_len = self.query.len();
        loop {
            let frame = self.stack.last_mut()?;

            if frame.offset == query_len {
                let state = frame.state;
                self.stack.pop();
                // Gaps may also be empty at the end of the query.
                if let Some(next) = self.fsa.try_walk_transition(state, WILDCARD) {
                    self.stack.push(Frame::new(next, query_len, 1));
                }
                if self.fsa.is_final(state) && self.reported.insert(state) {
                    return Some(state);
                }
                continue;
            }

            if frame.mode == Mode::Exact {
                frame.mode = if frame.wildcard_depth > 0 {
                    Mode::FollowWildcard
                } else {
                    Mode::Wildcard
                };
                let byte = self.query[frame.offset];
                if let Some(next) = self.fsa.try_walk_transition(frame.state, byte) {
                    let offset = frame.offset + 1;
                    self.stack.push(Frame::new(next, offset, 0));
                    continue;
                }
            }

            if frame.mode == Mode::FollowWildcard {
                frame.mode = Mode::Wildcard;
                let next = Frame::new(frame.state, frame.offset + 1, frame.wildcard_depth + 1);
                self.stack.push(next);
                continue;
            }

            if frame.mode == Mode::Wildcard {
                frame.mode = Mode::Exhausted;
                if let Some(next) = self.fsa.try_walk_transition(frame.state, WILDCARD) {
                    let offset = frame.offset;
                    self.stack.push(Frame::new(next, offset, 1));
                    continue;
                }
            }

            tracing::trace!(state = frame.state, offset = frame.offset, "dead end");
            self.stack.pop();
        }
    }
}

#[cfg(test)]
mod test {
    use super::{ExpressionMatcher, WILDCARD};
    use crate::fsa::builder::test_fsa;

    fn wildcard(parts: &[&str]) -> String {
        parts.join(&char::from(WILDCARD).to_string())
    }

    fn matched(fsa: &crate::fsa::Fsa, query: &str) -> Option<String> {
        let m = ExpressionMatcher::new(fsa.clone(), query);
        m.first_match().map(|m| m.value_as_string().unwrap().into_owned())
    }

    #[test]
    fn test_exact() {
        let fsa = test_fsa(&[("abbc", "{b:2}", 0), ("abbcd", "{c:3}", 0), ("abc", "{a:1}", 0)]);

        let mut m = ExpressionMatcher::new(fsa.clone(), "abc");
        let first = m.first_match().unwrap();
        assert_eq!(first.matched_string(), "abc");
        assert_eq!(first.value_as_string().unwrap(), "{a:1}");
        assert!(m.next_match().is_none());

        assert_eq!(matched(&fsa, "abbc").as_deref(), Some("{b:2}"));
        assert_eq!(matched(&fsa, "ab"), None);
        assert_eq!(matched(&fsa, "abcd"), None);
        assert_eq!(matched(&fsa, ""), None);
    }

    #[test]
    fn test_wildcard() {
        let key = wildcard(&["a", "c"]);
        let fsa = test_fsa(&[(key.as_str(), "{a:1}", 0)]);

        for query in ["abc", "axyzc", "abbc", "agegeiec"] {
            let mut m = ExpressionMatcher::new(fsa.clone(), query);
            let first = m.first_match().unwrap();
            assert_eq!(first.matched_string(), query);
            assert_eq!(first.value_as_string().unwrap(), "{a:1}");
            assert!(m.next_match().is_none(), "{}", query);
            assert!(m.next_match().is_none(), "{}", query);
        }
        // The gap can be empty.
        assert!(matched(&fsa, "ac").is_some());

        assert_eq!(matched(&fsa, "ab"), None);
        assert_eq!(matched(&fsa, "abb"), None);
        assert_eq!(matched(&fsa, "abbcaa"), None);
        assert_eq!(matched(&fsa, "bc"), None);
    }

    #[test]
    fn test_multiple_wildcards() {
        let key1 = wildcard(&["a", "c", "e"]);
        let key2 = wildcard(&["a", "xyz", "vw"]);
        let mut keys = vec![(key1.as_str(), "{a:1}", 0_u32), (key2.as_str(), "{a:2}", 0)];
        keys.sort();
        let fsa = test_fsa(&keys);

        assert_eq!(matched(&fsa, "abcde").as_deref(), Some("{a:1}"));
        assert_eq!(matched(&fsa, "abbcddddeee").as_deref(), Some("{a:1}"));
        assert_eq!(matched(&fsa, "abcxyzcdevw").as_deref(), Some("{a:2}"));
        assert_eq!(matched(&fsa, "abcxyzcdev"), None);

        let mut m = ExpressionMatcher::new(fsa, "abcxyzcdevw");
        assert!(m.first_match().is_some());
        assert!(m.next_match().is_none());
    }

    #[test]
    fn test_trailing_wildcard() {
        let key = format!("ab{}", char::from(WILDCARD));
        let fsa = test_fsa(&[(key.as_str(), "x", 0)]);
        assert!(matched(&fsa, "ab").is_some());
        assert!(matched(&fsa, "abzzz").is_some());
        assert!(matched(&fsa, "a").is_none());

        // Both the literal key and its open-ended sibling match.
        let keys = vec![("ab", "exact", 0_u32), (key.as_str(), "open", 0)];
        let mut m = ExpressionMatcher::new(test_fsa(&keys), "ab");
        assert_eq!(m.first_match().unwrap().value_as_string().unwrap(), "exact");
        assert_eq!(m.next_match().unwrap().value_as_string().unwrap(), "open");
        assert!(m.next_match().is_none());
    }

    #[test]
    fn test_key_matched_once() {
        let w = char::from(WILDCARD);
        let key = format!("a{}b{}", w, w);
        let fsa = test_fsa(&[(key.as_str(), "x", 0)]);

        for query in ["abb", "ab", "abbb", "axbyb"] {
            let mut m = ExpressionMatcher::new(fsa.clone(), query);
            assert!(m.first_match().is_some(), "{}", query);
            assert!(m.next_match().is_none(), "{}", query);
        }
    }

    #[test]
    fn test_several_keys_match() {
        let key = wildcard(&["a", "c"]);
        let mut keys = vec![("abc", "literal", 0_u32), (key.as_str(), "pattern", 0)];
        keys.sort();
        let fsa = test_fsa(&keys);

        let mut m = ExpressionMatcher::new(fsa, "abc");
        let mut values = vec![m.first_match().unwrap().value_as_string().unwrap().into_owned()];
        while let Some(next) = m.next_match() {
            values.push(next.value_as_string().unwrap().into_owned());
        }
        assert_eq!(values, vec!["literal", "pattern"]);
    }
}
