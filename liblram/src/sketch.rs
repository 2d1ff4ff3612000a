//! (w,k)-minimizer sketching.
//!
//! For every length-`w` window of consecutive k-mers the sketcher emits
//! the minimum-hash k-mer, deduplicated against the previous emission.
//! Each emission is a packed word `(hash:56 | strand:1 | window_idx:7)`;
//! absolute positions are reconstructed by [`WordDecoder`] from the
//! within-window indices, so the emission stream stays 8 bytes per
//! minimizer.
//!
//! The window state can be carried across calls: [`Sketcher::sketch`]
//! returns a [`SketchCap`] and [`Sketcher::resume`] continues the stream
//! as if the two chunks had been one sequence. The index builder uses
//! this to run a reference's head past its tail when the reference is
//! circular.

use crate::error::LramError;

/// Strand bit inside the low byte of an emitted word.
pub const WORD_STRAND: u64 = 0x80;

/// Mix the canonical/non-canonical k-mer pair into a hash of at most
/// `2k` bits. Splitmix-style finalizer; collisions among the at most
/// `4^k` inputs are close to uniform.
#[inline]
pub fn hash64(km: u64, kx: u64, mask: u64) -> u64 {
    let h = kx.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    ((h ^ (h >> 31)) ^ km) & mask
}

/// Hash of one k-mer (given as base codes) after canonicalization.
///
/// This is the value the index is keyed by; the k-mer and its reverse
/// complement hash identically.
pub fn kmer_hash(kmer: &[u8], k: u32) -> u64 {
    debug_assert_eq!(kmer.len(), k as usize);
    let mask = (1u64 << (2 * k)) - 1;
    let shift1 = 2 * (k as u64 - 1);
    let mut k0 = 0u64;
    let mut k1 = 0u64;
    for &c in kmer {
        let c = (c & 3) as u64;
        k0 = (k0 << 2 | c) & mask;
        k1 = (k1 >> 2) | ((3 ^ c) << shift1);
    }
    let (km, kx) = if k0 <= k1 { (k0, k1) } else { (k1, k0) };
    hash64(km, kx, mask)
}

/// Resumable sketch state between two chunks of one sequence.
///
/// Only meaningful together with the [`Sketcher`] that produced it; the
/// window ring stays inside the sketcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct SketchCap {
    /// Position within the current window block.
    wpos: u32,
    /// Last emitted word, for deduplication.
    last_min: u64,
    /// Forward k-mer register.
    fw: u64,
    /// Reverse-complement k-mer register.
    rv: u64,
}

/// Minimizer sketcher for a fixed `(w, k)`.
pub struct Sketcher {
    w: u32,
    k: u32,
    mask: u64,
    shift1: u64,
    /// Raw words of the current block, by block index.
    cur: [u64; 32],
    /// Suffix minima of the previous block (`fold[i] = min(prev[i..w])`).
    fold: [u64; 33],
    /// Running forward minimum within the current block.
    fmin: u64,
}

impl Sketcher {
    /// Fails with `InvalidParam` unless `1 <= w <= 31` and `1 <= k <= 31`.
    pub fn new(w: u32, k: u32) -> crate::Result<Self> {
        if w == 0 || k == 0 || w > 31 || k > 31 {
            return Err(LramError::InvalidParam(format!(
                "window/k-mer size must be in 1..=31, got w={w}, k={k}"
            )));
        }
        Ok(Self {
            w,
            k,
            mask: (1u64 << (2 * k)) - 1,
            shift1: 2 * (k as u64 - 1),
            cur: [u64::MAX; 32],
            fold: [u64::MAX; 33],
            fmin: u64::MAX,
        })
    }

    pub fn w(&self) -> u32 {
        self.w
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    /// Sketch `seq` (base codes) from scratch, appending emitted words to `out`.
    pub fn sketch(&mut self, seq: &[u8], out: &mut Vec<u64>) -> SketchCap {
        self.cur = [u64::MAX; 32];
        self.fold = [u64::MAX; 33];
        self.fmin = u64::MAX;
        out.reserve(4 * seq.len() / self.w as usize + 16);

        let mut cap = SketchCap::default();
        // prime the k-mer registers with the first k-1 bases
        let prime = (self.k as usize - 1).min(seq.len());
        for &c in &seq[..prime] {
            push_kmer(&mut cap.fw, &mut cap.rv, c, self.mask, self.shift1);
        }
        self.run(cap, &seq[prime..], out)
    }

    /// Continue a sketch across a chunk boundary.
    ///
    /// `sketch(a ++ b)` and `sketch(a)` followed by `resume(cap_a, b)`
    /// emit the same word stream for any split at or past the first
    /// whole k-mer.
    pub fn resume(&mut self, cap: &SketchCap, seq: &[u8], out: &mut Vec<u64>) -> SketchCap {
        out.reserve(4 * seq.len() / self.w as usize + 16);
        self.run(*cap, seq, out)
    }

    fn run(&mut self, mut cap: SketchCap, seq: &[u8], out: &mut Vec<u64>) -> SketchCap {
        let w = self.w as usize;
        for &c in seq {
            push_kmer(&mut cap.fw, &mut cap.rv, c, self.mask, self.shift1);

            // canonicalize; ties go to the forward strand
            let (km, kx, m) = if cap.fw <= cap.rv {
                (cap.fw, cap.rv, 0)
            } else {
                (cap.rv, cap.fw, WORD_STRAND)
            };
            let i = cap.wpos as usize;
            let h = hash64(km, kx, self.mask) << 8 | m | i as u64;

            self.fmin = self.fmin.min(h);
            let v = self.fmin.min(self.fold[i + 1]);
            if v == h || v != cap.last_min {
                out.push(v);
            }
            cap.last_min = v;
            self.cur[i] = h;

            cap.wpos += 1;
            if cap.wpos as usize == w {
                // close the block: fold suffix minima for the next one
                let mut r = u64::MAX;
                for j in (0..w).rev() {
                    r = r.min(self.cur[j]);
                    self.fold[j] = r;
                }
                self.fold[w] = u64::MAX;
                cap.wpos = 0;
                self.fmin = u64::MAX;
            }
        }
        cap
    }
}

#[inline]
fn push_kmer(fw: &mut u64, rv: &mut u64, c: u8, mask: u64, shift1: u64) {
    let c = (c & 3) as u64;
    *fw = (*fw << 2 | c) & mask;
    *rv = (*rv >> 2) | ((3 ^ c) << shift1);
}

/// One decoded minimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Minimizer {
    /// The 2k-bit hash; this is the index key.
    pub hash: u64,
    /// Forward-strand start of the k-mer.
    pub pos: u32,
    /// True if the canonical orientation was the reverse complement.
    pub rev: bool,
}

/// Reconstructs absolute positions from a stream of emitted words.
///
/// Consecutive emissions are at most one window block apart, so a
/// non-increasing within-window index means the stream crossed into the
/// next block.
pub struct WordDecoder {
    w: i64,
    base: i64,
    prev_idx: u64,
}

impl WordDecoder {
    pub fn new(w: u32) -> Self {
        Self {
            w: w as i64,
            base: -(w as i64),
            prev_idx: w as u64,
        }
    }

    #[inline]
    pub fn step(&mut self, word: u64) -> Minimizer {
        let idx = word & 0x7f;
        if idx <= self.prev_idx {
            self.base += self.w;
        }
        self.prev_idx = idx;
        Minimizer {
            hash: word >> 8,
            pos: (self.base + idx as i64) as u32,
            rev: word & WORD_STRAND != 0,
        }
    }
}

/// Decode a whole word stream.
pub fn decode_words(words: &[u64], w: u32) -> Vec<Minimizer> {
    let mut dec = WordDecoder::new(w);
    words.iter().map(|&word| dec.step(word)).collect()
}
