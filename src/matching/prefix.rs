use super::Match;
use crate::{
    fsa::Fsa,
    traversal::{StateTraverser, TransitionKind, Unweighted},
};

/// All keys that start with a given prefix, the prefix itself included.
///
/// With `Unweighted` the completions come out in key order; with `Weighted`
/// the heaviest subtrees are visited first.
pub struct PrefixMatcher<T: TransitionKind = Unweighted> {
    prefix: Vec<u8>,
    exact: Option<Match>,
    traverser: Option<StateTraverser<T>>,
}

impl<T: TransitionKind> PrefixMatcher<T> {
    pub fn new<P: Into<Vec<u8>>>(fsa: Fsa, prefix: P) -> Self {
        let prefix = prefix.into();
        let Some(state) = fsa.walk(&prefix) else {
            return PrefixMatcher {
                prefix,
                exact: None,
                traverser: None,
            };
        };
        let exact = if fsa.is_final(state) {
            Some(Match::new(prefix.clone(), fsa.clone(), state))
        } else {
            None
        };
        PrefixMatcher {
            prefix,
            exact,
            traverser: Some(StateTraverser::from_state(fsa, state)),
        }
    }
}

impl<T: TransitionKind> Iterator for PrefixMatcher<T> {
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        if let Some(m) = self.exact.take() {
            return Some(m);
        }
        let t = self.traverser.as_mut()?;
        while t.has_more() {
            let found = match t.state() {
                Some(state) if t.is_final() => {
                    let mut matched = self.prefix.clone();
                    matched.extend_from_slice(t.key());
                    Some(Match::new(matched, t.fsa().clone(), state))
                }
                _ => None,
            };
            t.advance();
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::PrefixMatcher;
    use crate::{
        fsa::builder::test_fsa,
        traversal::{Unweighted, Weighted},
    };

    #[test]
    fn test_prefix() {
        let fsa = test_fsa(&[
            ("app", "1", 1),
            ("apple", "2", 2),
            ("apply", "3", 9),
            ("banana", "4", 0),
        ]);

        let keys: Vec<String> = PrefixMatcher::<Unweighted>::new(fsa.clone(), "app")
            .map(|m| m.matched_string().into_owned())
            .collect();
        assert_eq!(keys, vec!["app", "apple", "apply"]);

        let keys: Vec<String> = PrefixMatcher::<Weighted>::new(fsa.clone(), "app")
            .map(|m| m.matched_string().into_owned())
            .collect();
        assert_eq!(keys, vec!["app", "apply", "apple"]);

        let values: Vec<String> = PrefixMatcher::<Unweighted>::new(fsa.clone(), "")
            .map(|m| m.value_as_string().unwrap().into_owned())
            .collect();
        assert_eq!(values, vec!["1", "2", "3", "4"]);

        assert_eq!(PrefixMatcher::<Unweighted>::new(fsa.clone(), "c").count(), 0);
        assert_eq!(PrefixMatcher::<Unweighted>::new(fsa, "applex").count(), 0);
    }
}
