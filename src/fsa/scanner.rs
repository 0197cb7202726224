// Finds the outgoing transitions of a state.
//
// A state at offset `s` owns the 256-byte window `labels[s..s + 256]`. It has
// a transition on label `c` exactly when `labels[s + c] == c`, so comparing
// the window against the identity mask [0, 1, .., 255] yields the candidate
// labels in one pass. Candidates still need a non-zero target to be real
// transitions; that check lives with the automaton, not here.
//
// There are three interchangeable implementations. They must agree bit for
// bit, and in debug builds `scan` checks the fast path against the scalar one.

use serde::{Deserialize, Serialize};

pub const BLOCK_SIZE: usize = 256;

pub const OUTGOING_TRANSITIONS_MASK: [u8; BLOCK_SIZE] = {
    let mut mask = [0_u8; BLOCK_SIZE];
    let mut i = 0;
    while i < BLOCK_SIZE {
        mask[i] = i as u8;
        i += 1;
    }
    mask
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerKind {
    #[default]
    Auto,
    Scalar,
    Swar,
    Simd,
}

/// A set of byte labels, one bit per label.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct LabelSet([u64; 4]);

impl LabelSet {
    pub fn new() -> Self {
        LabelSet([0; 4])
    }

    pub fn insert(&mut self, label: u8) {
        self.0[(label >> 6) as usize] |= 1 << (label & 63);
    }

    pub fn contains(&self, label: u8) -> bool {
        self.0[(label >> 6) as usize] & (1 << (label & 63)) != 0
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    // Labels in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().enumerate().flat_map(|(word_idx, word)| {
            let mut w = *word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros();
                w &= w - 1;
                Some((word_idx as u32 * 64 + bit) as u8)
            })
        })
    }
}

impl std::fmt::Debug for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

pub fn scan_scalar(block: &[u8; BLOCK_SIZE]) -> LabelSet {
    let mut out = LabelSet::new();
    for (label, b) in block.iter().enumerate() {
        if *b == label as u8 {
            out.insert(label as u8);
        }
    }
    out
}

const LOW_SEVEN: u64 = 0x7f7f_7f7f_7f7f_7f7f;

// Sets the high bit of every byte of `x` that is zero, and nothing else. The
// usual `(x - 0x01..) & !x & 0x80..` trick can report false positives above a
// zero byte, which we can't afford here.
fn zero_bytes(x: u64) -> u64 {
    let y = (x & LOW_SEVEN).wrapping_add(LOW_SEVEN);
    !(y | x | LOW_SEVEN)
}

// Compares eight labels at a time.
pub fn scan_swar(block: &[u8; BLOCK_SIZE]) -> LabelSet {
    let mut out = LabelSet::new();
    for (chunk_idx, (labels, mask)) in block
        .chunks_exact(8)
        .zip(OUTGOING_TRANSITIONS_MASK.chunks_exact(8))
        .enumerate()
    {
        let labels = u64::from_le_bytes(labels.try_into().unwrap());
        let mask = u64::from_le_bytes(mask.try_into().unwrap());
        let mut hits = zero_bytes(labels ^ mask);
        while hits != 0 {
            let byte = hits.trailing_zeros() / 8;
            out.insert((chunk_idx as u32 * 8 + byte) as u8);
            hits &= hits - 1;
        }
    }
    out
}

// Compares sixteen labels at a time. SSE2 is part of the x86_64 baseline, so
// there is no runtime feature detection.
#[cfg(target_arch = "x86_64")]
pub fn scan_simd(block: &[u8; BLOCK_SIZE]) -> LabelSet {
    use std::arch::x86_64::{__m128i, _mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8};

    let mut out = LabelSet::new();
    for offset in (0..BLOCK_SIZE).step_by(16) {
        // SAFETY: both arrays are BLOCK_SIZE long and `offset + 16 <=
        // BLOCK_SIZE`; the loads are unaligned.
        let mut hits = unsafe {
            let labels = _mm_loadu_si128(block.as_ptr().add(offset) as *const __m128i);
            let mask =
                _mm_loadu_si128(OUTGOING_TRANSITIONS_MASK.as_ptr().add(offset) as *const __m128i);
            _mm_movemask_epi8(_mm_cmpeq_epi8(labels, mask)) as u32
        };
        while hits != 0 {
            let bit = hits.trailing_zeros();
            out.insert((offset as u32 + bit) as u8);
            hits &= hits - 1;
        }
    }
    out
}

#[cfg(not(target_arch = "x86_64"))]
pub fn scan_simd(block: &[u8; BLOCK_SIZE]) -> LabelSet {
    scan_swar(block)
}

pub fn scan(kind: ScannerKind, block: &[u8; BLOCK_SIZE]) -> LabelSet {
    let result = match kind {
        ScannerKind::Scalar => return scan_scalar(block),
        ScannerKind::Swar => scan_swar(block),
        ScannerKind::Simd | ScannerKind::Auto => scan_simd(block),
    };
    debug_assert_eq!(
        result,
        scan_scalar(block),
        "vectorized transition scan disagrees with scalar scan"
    );
    result
}
