// ZipTraverser walks several automata in lockstep, as if they were one.
//
// Each input gets its own traverser. The traversers sit in an ordered set
// keyed by (matched bytes, input order), so the first entry is always the
// smallest key and all inputs positioned on that same key follow it
// contiguously. That contiguous group is the current position; advancing or
// pruning the zip moves exactly the members of the group and re-files them.

use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use super::comparable::ComparableTraverser;
use crate::fsa::Fsa;

/// Which input's value survives when several inputs hold the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    /// The last input (in construction order) holding the key wins. Inputs
    /// listed oldest first therefore let newer values override older ones.
    #[default]
    LastWins,
    FirstWins,
}

pub type Tombstones = Arc<HashSet<String>>;

#[derive(Debug, Clone)]
pub struct ZipInput {
    pub fsa: Fsa,
    pub start: Option<u64>,
    // The bytes leading to `start`, needed to spell out full keys for
    // tombstone lookups.
    pub prefix: Vec<u8>,
    pub tombstones: Option<Tombstones>,
}

impl ZipInput {
    pub fn new(fsa: Fsa) -> Self {
        ZipInput {
            fsa,
            start: None,
            prefix: Vec::new(),
            tombstones: None,
        }
    }

    // Restricts the input to keys starting with `prefix`, if there are any.
    pub fn with_prefix(mut self, prefix: &[u8]) -> Option<Self> {
        self.start = Some(self.fsa.walk(prefix)?);
        self.prefix = prefix.to_vec();
        Some(self)
    }

    pub fn with_tombstones(mut self, tombstones: Tombstones) -> Self {
        self.tombstones = Some(tombstones);
        self
    }
}

impl From<Fsa> for ZipInput {
    fn from(fsa: Fsa) -> Self {
        ZipInput::new(fsa)
    }
}

#[derive(Debug)]
struct Member {
    traverser: ComparableTraverser,
    prefix: Vec<u8>,
    tombstones: Option<Tombstones>,
}

impl Member {
    // Final and not deleted in its own segment.
    fn is_live_final(&self) -> bool {
        let t = self.traverser.traverser();
        if !t.is_final() {
            return false;
        }
        let Some(tombstones) = &self.tombstones else {
            return true;
        };
        if tombstones.is_empty() {
            return true;
        }
        let mut key = self.prefix.clone();
        key.extend_from_slice(t.key());
        match std::str::from_utf8(&key) {
            Ok(k) => !tombstones.contains(k),
            // Tombstones are strings, so no tombstone can name this key.
            Err(_) => {
                tracing::trace!(
                    key = ?String::from_utf8_lossy(&key),
                    "key is not UTF-8, tombstones can't apply"
                );
                true
            }
        }
    }
}

#[derive(Debug, Default)]
struct Position {
    // Indexes into `members` of the dedup run, in input order.
    run: Vec<usize>,
    winner: Option<usize>,
    weight: u32,
    // Highest own weight among the live final members.
    key_weight: Option<u32>,
}

#[derive(Debug)]
pub struct ZipTraverser {
    members: Vec<Member>,
    queue: BTreeSet<(Vec<u8>, usize)>,
    precedence: Precedence,
    current: Position,
}

impl ZipTraverser {
    pub fn new<I>(inputs: I, precedence: Precedence) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ZipInput>,
    {
        let members: Vec<_> = inputs
            .into_iter()
            .map(Into::<ZipInput>::into)
            .enumerate()
            .map(|(order, input)| Member {
                traverser: ComparableTraverser::new(input.fsa, input.start, order),
                prefix: input.prefix,
                tombstones: input.tombstones,
            })
            .collect();
        let queue = members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.traverser.has_more())
            .map(|(idx, m)| (m.traverser.key().to_vec(), idx))
            .collect();
        let mut zip = ZipTraverser {
            members,
            queue,
            precedence,
            current: Position::default(),
        };
        zip.settle();
        zip
    }

    // Recomputes the dedup run at the front of the queue.
    fn settle(&mut self) {
        let mut pos = Position::default();
        let mut entries = self.queue.iter();
        if let Some((top_key, top)) = entries.next() {
            pos.run.push(*top);
            for (key, idx) in entries {
                if key != top_key {
                    break;
                }
                pos.run.push(*idx);
            }
        }
        for idx in &pos.run {
            let member = &self.members[*idx];
            pos.weight = pos.weight.max(member.traverser.traverser().inner_weight());
            if member.is_live_final() {
                let key_weight = member.traverser.traverser().key_weight().unwrap_or(0);
                pos.key_weight = Some(pos.key_weight.map_or(key_weight, |w| w.max(key_weight)));
                pos.winner = match (self.precedence, pos.winner) {
                    (Precedence::FirstWins, Some(w)) => Some(w),
                    _ => Some(*idx),
                };
            }
        }
        self.current = pos;
        tracing::trace!(
            key = ?String::from_utf8_lossy(self.key()),
            equal_states = self.current.run.len(),
            "zip position"
        );
    }

    fn step(&mut self, prune: bool) {
        debug_assert!(self.has_more(), "step on an exhausted zip traverser");
        let run = std::mem::take(&mut self.current.run);
        for idx in run {
            let member = &mut self.members[idx];
            let key = member.traverser.key().to_vec();
            self.queue.remove(&(key, idx));
            if prune {
                member.traverser.prune();
            } else {
                member.traverser.advance();
            }
            if member.traverser.has_more() {
                self.queue.insert((member.traverser.key().to_vec(), idx));
            }
        }
        self.settle();
    }

    pub fn advance(&mut self) {
        self.step(false);
    }

    /// Skips everything below the current key in every input sitting on it.
    pub fn prune(&mut self) {
        self.step(true);
    }

    pub fn has_more(&self) -> bool {
        !self.current.run.is_empty()
    }

    // The member whose state is reported: the winner if the key is final
    // anywhere, otherwise the first member of the run.
    fn representative(&self) -> Option<&Member> {
        self.current
            .winner
            .or_else(|| self.current.run.first().copied())
            .map(|idx| &self.members[idx])
    }

    pub fn key(&self) -> &[u8] {
        self.representative()
            .map_or(&[][..], |m| m.traverser.key())
    }

    pub fn depth(&self) -> usize {
        self.key().len()
    }

    pub fn label(&self) -> Option<u8> {
        self.representative()
            .and_then(|m| m.traverser.traverser().label())
    }

    /// How many inputs are positioned on the current key.
    pub fn equal_states(&self) -> usize {
        self.current.run.len()
    }

    pub fn is_final(&self) -> bool {
        self.current.winner.is_some()
    }

    /// The input whose value is reported for the current key.
    pub fn order(&self) -> Option<usize> {
        self.representative().map(|m| m.traverser.order())
    }

    pub fn fsa(&self) -> Option<&Fsa> {
        self.representative().map(|m| m.traverser.traverser().fsa())
    }

    pub fn state(&self) -> Option<u64> {
        self.representative()
            .and_then(|m| m.traverser.traverser().state())
    }

    pub fn state_value(&self) -> Option<u64> {
        let winner = self.current.winner?;
        self.members[winner].traverser.traverser().state_value()
    }

    pub fn value_bytes(&self) -> Option<&[u8]> {
        let winner = self.current.winner?;
        self.members[winner].traverser.traverser().value_bytes()
    }

    /// The highest inner weight among the inputs on the current key. This
    /// bounds every key below, including keys deleted in their own input.
    pub fn inner_weight(&self) -> u32 {
        self.current.weight
    }

    /// The highest weight the current key was inserted with, counting only
    /// inputs where it is final and not deleted.
    pub fn key_weight(&self) -> Option<u32> {
        self.current.key_weight
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::{BTreeMap, HashMap, HashSet},
        fmt::Write,
        sync::Arc,
    };

    use rand::{Rng, SeedableRng};

    use super::{Precedence, ZipInput, ZipTraverser};
    use crate::fsa::{builder::test_fsa, Fsa};

    fn describe(zip: &ZipTraverser) -> String {
        if !zip.has_more() {
            return "eof\n".into();
        }
        let mut out = format!(
            "{} eq={} w={}",
            String::from_utf8_lossy(zip.key()),
            zip.equal_states(),
            zip.inner_weight()
        );
        if zip.is_final() {
            write!(
                out,
                " final={} from={}",
                String::from_utf8_lossy(zip.value_bytes().unwrap()),
                zip.order().unwrap()
            )
            .unwrap();
        }
        out.push('\n');
        out
    }

    #[test]
    fn test_zip() {
        datadriven::walk("src/traversal/testdata/", |f| {
            let mut automata: HashMap<String, Fsa> = HashMap::new();
            let mut deleted: HashMap<String, HashSet<String>> = HashMap::new();
            let mut zip = None;
            f.run(|test_case| match test_case.directive.as_str() {
                "build" => {
                    let name = test_case.args.get("name").unwrap()[0].clone();
                    let mut keys: Vec<(&str, &str, u32)> = Vec::new();
                    for line in test_case.input.lines() {
                        let (key, rest) = line.split_once('=').unwrap();
                        let (value, weight) = match rest.split_once(':') {
                            Some((v, w)) => (v, w.parse().unwrap()),
                            None => (rest, 0),
                        };
                        keys.push((key, value, weight));
                    }
                    automata.insert(name, test_fsa(&keys));
                    "ok\n".into()
                }
                "delete" => {
                    let name = test_case.args.get("name").unwrap()[0].clone();
                    let set = deleted.entry(name).or_default();
                    for line in test_case.input.lines() {
                        set.insert(line.to_owned());
                    }
                    "ok\n".into()
                }
                "zip" => {
                    let names = test_case.args.get("inputs").unwrap()[0].clone();
                    let precedence = match test_case.args.get("precedence") {
                        Some(p) if p[0] == "first" => Precedence::FirstWins,
                        _ => Precedence::LastWins,
                    };
                    let prefix = test_case
                        .args
                        .get("prefix")
                        .map(|p| p[0].clone())
                        .unwrap_or_default();
                    let inputs = names.chars().filter_map(|c| {
                        let name = c.to_string();
                        let mut input = ZipInput::new(automata[&name].clone());
                        if let Some(set) = deleted.get(&name) {
                            input = input.with_tombstones(Arc::new(set.clone()));
                        }
                        if prefix.is_empty() {
                            Some(input)
                        } else {
                            input.with_prefix(prefix.as_bytes())
                        }
                    });
                    let z = ZipTraverser::new(inputs.collect::<Vec<_>>(), precedence);
                    let out = describe(&z);
                    zip = Some(z);
                    out
                }
                "scan" => {
                    let z = zip.as_mut().unwrap();
                    let mut out = String::new();
                    for command in test_case.input.trim().chars() {
                        match command {
                            '>' => z.advance(),
                            '!' => z.prune(),
                            _ => panic!("unknown command {:?}", command),
                        }
                        out.push_str(&describe(z));
                    }
                    out
                }
                "walk" => {
                    let z = zip.as_mut().unwrap();
                    let mut out = String::new();
                    while z.has_more() {
                        z.advance();
                        out.push_str(&describe(z));
                    }
                    out
                }
                _ => panic!("unhandled"),
            })
        })
    }

    fn final_keys(mut zip: ZipTraverser) -> Vec<(String, String)> {
        let mut out = Vec::new();
        while zip.has_more() {
            if zip.is_final() {
                out.push((
                    String::from_utf8_lossy(zip.key()).into_owned(),
                    String::from_utf8_lossy(zip.value_bytes().unwrap()).into_owned(),
                ));
            }
            zip.advance();
        }
        out
    }

    // Zipping random overlapping inputs matches a map where later inputs
    // overwrite earlier ones.
    #[test]
    fn test_random_zip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1234);
        for _ in 0..30 {
            let n = rng.gen_range(1..5);
            let mut model = BTreeMap::new();
            let mut inputs = Vec::new();
            for i in 0..n {
                let mut keys = BTreeMap::new();
                for _ in 0..rng.gen_range(0..40) {
                    let len = rng.gen_range(1..5);
                    let key: String = (0..len).map(|_| rng.gen_range(b'a'..=b'd') as char).collect();
                    keys.insert(key, format!("{}", i));
                }
                for (k, v) in &keys {
                    model.insert(k.clone(), v.clone());
                }
                let triples: Vec<_> = keys.iter().map(|(k, v)| (k.as_str(), v.as_str(), 0_u32)).collect();
                inputs.push(test_fsa(&triples));
            }
            let zip = ZipTraverser::new(inputs, Precedence::LastWins);
            assert_eq!(final_keys(zip), model.into_iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_key_weight_skips_deleted() {
        let a = test_fsa(&[("a", "1", 1), ("ab", "2", 9)]);
        let b = test_fsa(&[("a", "3", 4)]);
        let deleted: HashSet<String> = ["ab".to_owned()].into_iter().collect();
        let inputs = vec![
            ZipInput::new(a).with_tombstones(Arc::new(deleted)),
            ZipInput::new(b),
        ];
        let mut zip = ZipTraverser::new(inputs, Precedence::LastWins);

        assert_eq!(zip.key(), b"a");
        assert_eq!(zip.inner_weight(), 9);
        assert_eq!(zip.key_weight(), Some(4));
        zip.advance();
        assert_eq!(zip.key(), b"ab");
        assert!(!zip.is_final());
        assert_eq!(zip.key_weight(), None);
        zip.advance();
        assert!(!zip.has_more());
    }

    #[test]
    fn test_empty_inputs() {
        let zip = ZipTraverser::new(Vec::<Fsa>::new(), Precedence::LastWins);
        assert!(!zip.has_more());
        assert_eq!(zip.equal_states(), 0);
        assert_eq!(zip.key(), b"");

        let zip = ZipTraverser::new(vec![test_fsa(&[]), test_fsa(&[])], Precedence::LastWins);
        assert!(!zip.has_more());
    }
}
