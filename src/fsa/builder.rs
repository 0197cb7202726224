// Packs a sorted key list into the sparse-array layout described in the
// parent module. Keys become a plain trie (no suffix sharing), so the output
// is larger than a minimized automaton would be, but it reads identically.

use std::path::Path;

use anyhow::bail;

use super::{
    scanner::BLOCK_SIZE, value_store::ValueStoreWriter, Automaton, LoadOptions, Properties,
    FLAG_FINAL, FLAG_STATE, FORMAT_VERSION, MAGIC,
};

#[derive(Debug, Default)]
struct Node {
    // Sorted by label, since keys arrive sorted.
    children: Vec<(u8, usize)>,
    value: Option<u64>,
    inner_weight: u32,
}

#[derive(Debug)]
pub struct AutomatonBuilder {
    nodes: Vec<Node>,
    values: ValueStoreWriter,
    last_key: Option<Vec<u8>>,
    number_of_keys: u64,
}

impl Default for AutomatonBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AutomatonBuilder {
    pub fn new() -> Self {
        AutomatonBuilder {
            nodes: vec![Node::default()],
            values: ValueStoreWriter::new(),
            last_key: None,
            number_of_keys: 0,
        }
    }

    pub fn number_of_keys(&self) -> u64 {
        self.number_of_keys
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8], weight: u32) -> anyhow::Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                bail!(
                    "keys must be inserted in strictly increasing order: {:?} after {:?}",
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(last),
                );
            }
        }

        let mut node = 0;
        self.nodes[node].inner_weight = self.nodes[node].inner_weight.max(weight);
        for b in key {
            // Only the most recently added child can be shared with this key.
            let next = match self.nodes[node].children.last() {
                Some((label, child)) if label == b => *child,
                _ => {
                    let child = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[node].children.push((*b, child));
                    child
                }
            };
            node = next;
            self.nodes[node].inner_weight = self.nodes[node].inner_weight.max(weight);
        }
        self.nodes[node].value = Some(self.values.push(value, weight));

        self.last_key = Some(key.to_vec());
        self.number_of_keys += 1;
        Ok(())
    }

    // Assigns every node a unique base such that all of its transition slots
    // are free. Returns the bases and the array size.
    // TODO: keep a free list of slots instead of probing upwards from
    // `first_free` for every node; this is quadratic for large merges.
    fn pack(&self) -> (Vec<u64>, usize) {
        let mut bases = vec![0_u64; self.nodes.len()];
        let mut slot_used: Vec<bool> = Vec::new();
        let mut base_used: Vec<bool> = Vec::new();
        // Everything below this is occupied, for both slots and bases.
        let mut first_free = 1;

        fn grow(v: &mut Vec<bool>, len: usize) {
            if v.len() < len {
                v.resize(len, false);
            }
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            let mut base = first_free;
            loop {
                grow(&mut base_used, base + 1);
                grow(&mut slot_used, base + BLOCK_SIZE);
                let fits = !base_used[base]
                    && node
                        .children
                        .iter()
                        .all(|(label, _)| !slot_used[base + *label as usize]);
                if fits {
                    break;
                }
                base += 1;
            }
            base_used[base] = true;
            for (label, _) in &node.children {
                slot_used[base + *label as usize] = true;
            }
            while first_free < base_used.len() && base_used[first_free] && slot_used[first_free] {
                first_free += 1;
            }
            bases[idx] = base as u64;
        }

        let max_base = bases.iter().copied().max().unwrap_or(1) as usize;
        (bases, max_base + BLOCK_SIZE)
    }

    pub fn to_bytes(self) -> Vec<u8> {
        let (bases, slots) = self.pack();

        let mut labels = vec![0_u8; slots];
        let mut targets = vec![0_u64; slots];
        let mut flags = vec![0_u8; slots];
        let mut values = vec![0_u64; slots];
        let mut weights = vec![0_u32; slots];

        for (node, base) in self.nodes.iter().zip(bases.iter()) {
            let s = *base as usize;
            flags[s] |= FLAG_STATE;
            weights[s] = node.inner_weight;
            if let Some(value_ref) = node.value {
                flags[s] |= FLAG_FINAL;
                values[s] = value_ref;
            }
            for (label, child) in &node.children {
                labels[s + *label as usize] = *label;
                targets[s + *label as usize] = bases[*child];
            }
        }

        let value_store = self.values.into_bytes();
        let mut body = Vec::with_capacity(slots * super::SLOT_WIDTH + value_store.len());
        body.extend_from_slice(&labels);
        for t in &targets {
            body.extend_from_slice(&t.to_le_bytes());
        }
        body.extend_from_slice(&flags);
        for v in &values {
            body.extend_from_slice(&v.to_le_bytes());
        }
        for w in &weights {
            body.extend_from_slice(&w.to_le_bytes());
        }
        body.extend_from_slice(&value_store);

        let properties = Properties {
            version: FORMAT_VERSION,
            start_state: bases[0],
            number_of_keys: self.number_of_keys,
            sparse_array_size: slots as u64,
            value_store_size: value_store.len() as u64,
            checksum: crc32fast::hash(&body),
        };
        // Serializing a struct of integers can't fail.
        let header = serde_json::to_vec(&properties).unwrap_or_default();

        let mut out = Vec::with_capacity(MAGIC.len() + 4 + header.len() + body.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        out
    }

    pub fn build(self, options: LoadOptions) -> anyhow::Result<Automaton> {
        Automaton::from_bytes(self.to_bytes(), options)
    }

    pub fn write_to_file(self, path: &Path) -> anyhow::Result<()> {
        let keys = self.number_of_keys;
        crate::fs::write_atomic(path, &self.to_bytes())?;
        tracing::debug!(path = ?path, keys, "wrote automaton");
        Ok(())
    }
}

// Builds an in-memory automaton from (key, value, weight) triples in key order.
#[cfg(test)]
pub(crate) fn test_fsa(keys: &[(&str, &str, u32)]) -> super::Fsa {
    let mut b = AutomatonBuilder::new();
    for (k, v, w) in keys {
        b.insert(k.as_bytes(), v.as_bytes(), *w).unwrap();
    }
    std::sync::Arc::new(b.build(LoadOptions::default()).unwrap())
}

#[cfg(test)]
mod test {
    use rand::{Rng, SeedableRng};

    use super::AutomatonBuilder;
    use crate::fsa::LoadOptions;

    #[test]
    fn test_rejects_unsorted() {
        let mut b = AutomatonBuilder::new();
        b.insert(b"b", b"", 0).unwrap();
        assert!(b.insert(b"a", b"", 0).is_err());
        assert!(b.insert(b"b", b"", 0).is_err());
        b.insert(b"ba", b"", 0).unwrap();
        assert_eq!(b.number_of_keys(), 2);
    }

    #[test]
    fn test_empty_key() {
        let mut b = AutomatonBuilder::new();
        b.insert(b"", b"root", 4).unwrap();
        b.insert(b"x", b"x", 1).unwrap();
        let fsa = b.build(LoadOptions::default()).unwrap();
        assert_eq!(fsa.get(b""), Some(&b"root"[..]));
        assert_eq!(fsa.get(b"x"), Some(&b"x"[..]));
        assert_eq!(fsa.inner_weight(fsa.start_state()), 4);
    }

    #[test]
    fn test_random_keys() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut keys = std::collections::BTreeMap::new();
        for _ in 0..300 {
            let len = rng.gen_range(0..8);
            let key: Vec<u8> = (0..len).map(|_| rng.gen_range(0..=255)).collect();
            let value = format!("{}", rng.gen_range(0..1000));
            keys.insert(key, value);
        }

        let mut b = AutomatonBuilder::new();
        for (k, v) in &keys {
            b.insert(k, v.as_bytes(), 0).unwrap();
        }
        let fsa = b.build(LoadOptions::default()).unwrap();
        assert_eq!(fsa.number_of_keys(), keys.len() as u64);
        for (k, v) in &keys {
            assert_eq!(fsa.get(k), Some(v.as_bytes()));
        }
        for _ in 0..300 {
            let len = rng.gen_range(0..8);
            let key: Vec<u8> = (0..len).map(|_| rng.gen_range(0..=255)).collect();
            assert_eq!(fsa.get(&key), keys.get(&key).map(|v| v.as_bytes()));
        }
    }
}
