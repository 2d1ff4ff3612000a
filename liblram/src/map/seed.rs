//! Seed collection: sketch the query, look every minimizer up in the
//! index, and expand postings into chain-space anchors.
//!
//! Postings more frequent than the current occurrence tier go to the
//! rescue list and are expanded when a later pass asks for them.

use crate::index::posting;
use crate::map::{uval, vval, Mapper, Rescue, Seed, UNCHAINED};
use crate::sketch::WordDecoder;

/// Tail sentinel: sorts after every real seed and fails every window
/// test, so forward scans need no bounds checks.
const SENTINEL: Seed = Seed {
    u: 0x8000_0000,
    rid: 0x7fff_ffff,
    v: 0x8000_0000,
    lid: UNCHAINED,
};

impl<'i> Mapper<'i> {
    /// Expand a posting list at query position `qs` (already
    /// strand-twisted) into seeds.
    fn expand(seeds: &mut Vec<Seed>, k: u32, postings: &[u64], qs: u32) {
        seeds.reserve(postings.len());
        for &p in postings {
            let rid_s = posting::rid_strand(p);
            let rs = posting::pos(p);
            // reference-side strand twist: shift by k and negate the
            // query position when the posting is reverse-canonical
            let rmask = (rid_s & 1).wrapping_neg();
            let r = rs.wrapping_add(k & rmask) as i32 as i64;
            let q = (qs ^ rmask) as i32 as i64;
            seeds.push(Seed {
                u: uval(r, q),
                v: vval(r, q),
                rid: rid_s >> 1,
                lid: UNCHAINED,
            });
        }
    }

    /// Sketch the query and split postings into immediate seeds and the
    /// rescue list.
    fn collect_seed(&mut self, qseq: &[u8]) {
        let idx = self.idx;
        let mut words = std::mem::take(&mut self.words);
        words.clear();
        self.sketcher.sketch(qseq, &mut words);

        let k = idx.k();
        let max_occ = idx.max_occ();
        let resc_occ = idx.occ(0);
        let mut dec = WordDecoder::new(idx.w());
        for &word in &words {
            let m = dec.step(word);
            let postings = idx.get(m.hash);
            let n = postings.len() as u32;
            if n == 0 || n > max_occ {
                continue;
            }
            // query-side strand twist mirrors the reference-side one
            let fmask = (m.rev as u32).wrapping_neg();
            let qs = m.pos.wrapping_add(k & fmask) ^ fmask;
            if n > resc_occ {
                self.resc.push(Rescue {
                    qs,
                    n,
                    p: postings,
                });
                continue;
            }
            Self::expand(&mut self.seeds, k, postings, qs);
        }
        self.words = words;
        self.presc = 0;
    }

    /// Build (or extend) the seed array for occurrence tier `tier`.
    /// Returns the number of live seeds, zero when the pass added none.
    pub(crate) fn seed(&mut self, tier: usize, qseq: &[u8]) -> usize {
        let before;
        if tier == 0 {
            self.seeds.clear();
            self.n_seed = 0;
            before = 0;
            self.collect_seed(qseq);
        } else {
            if tier == 1 {
                // expanded in ascending-count order
                self.resc.sort_unstable_by_key(|r| (r.n, r.qs));
            }
            // drop the sentinel, forget previous chains
            self.seeds.truncate(self.n_seed);
            for s in &mut self.seeds {
                s.lid = UNCHAINED;
            }
            before = self.seeds.len();

            let occ = self.idx.occ(tier);
            while self.presc < self.resc.len() && self.resc[self.presc].n <= occ {
                let r = self.resc[self.presc];
                Self::expand(&mut self.seeds, self.idx.k(), r.p, r.qs);
                self.presc += 1;
            }
        }

        self.n_seed = self.seeds.len();
        if self.seeds.is_empty() || (tier > 0 && self.seeds.len() == before) {
            return 0;
        }

        self.seeds.push(SENTINEL);
        self.seeds
            .sort_unstable_by_key(|s| ((s.rid as u64) << 32 | s.u as u64, s.v));
        self.n_seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::tests::{test_index, test_params};
    use crate::map::{apos_of, bpos_of};
    use crate::seq::encode_seq;

    #[test]
    fn test_seed_positions_land_on_query_anchors() {
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACC";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();

        let q = encode_seq(&reference[5..35]);
        let n = mapper.seed(0, &q);
        assert!(n > 0);

        // every forward-strand seed must satisfy r - q = 5 (the offset
        // the query was cut at)
        let mut checked = 0;
        for s in &mapper.seeds[..mapper.n_seed] {
            let (a, b) = (apos_of(s), bpos_of(s));
            if b >= 0 {
                assert_eq!(a - b, 5, "seed at a={a}, b={b}");
                checked += 1;
            }
        }
        assert!(checked > 0);
    }

    #[test]
    fn test_seed_array_is_sorted_with_sentinel() {
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACC";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        let q = encode_seq(&reference[..40]);
        let n = mapper.seed(0, &q);
        assert!(n > 0);

        let keys: Vec<u64> = mapper
            .seeds
            .iter()
            .map(|s| (s.rid as u64) << 32 | s.u as u64)
            .collect();
        assert!(keys.windows(2).all(|p| p[0] <= p[1]));
        // the sentinel is last and unmistakable
        assert_eq!(mapper.seeds.last().unwrap().rid, 0x7fff_ffff);
        assert_eq!(mapper.seeds.len(), mapper.n_seed + 1);
    }

    #[test]
    fn test_later_tier_without_new_seeds_reports_zero() {
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACC";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        let q = encode_seq(&reference[..40]);
        assert!(mapper.seed(0, &q) > 0);
        // nothing was rescued in this tiny example, so tier 1 adds nothing
        assert_eq!(mapper.seed(1, &q), 0);
    }
}
