//! Greedy windowed chaining over the sorted seed array.
//!
//! Each branch (leaf) starts from the first unchained seed and walks
//! forward, absorbing every seed inside a diagonal window that tightens
//! as it translates along the chain. A walk that runs into an
//! already-chained seed merges into that chain. After chaining, tails of
//! chains on circular references are fused to heads of chains that
//! restart at the origin.

use crate::map::{apos_of, ps, Leaf, Mapper, Root, Seed, MERGED, OFS, UNCHAINED};

/// Chainability window in `(u, v)` space, anchored on one seed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Win {
    pub uub: i32,
    pub rid: u32,
    pub vub: i32,
    pub vlb: i32,
}

impl Win {
    pub fn around(s: &Seed, t: i32) -> Self {
        Self {
            uub: s.u as i32 + t,
            rid: s.rid,
            vub: s.v as i32 + t,
            vlb: s.v as i32,
        }
    }

    /// Strict window test: same reference, `u` within reach, `v` past
    /// the anchor but within reach.
    #[inline]
    pub fn contains(&self, f: &Seed) -> bool {
        (f.v as i32) > self.vlb
            && (f.v as i32) <= self.vub
            && f.rid <= self.rid
            && (f.u as i32) <= self.uub
    }

    /// Loose test bounding the forward scan: once `u` or `rid` escapes,
    /// nothing later can link.
    #[inline]
    pub fn scan_bounded(&self, f: &Seed) -> bool {
        f.rid <= self.rid && (f.u as i32) <= self.uub
    }

    /// Translate the window onto a just-linked seed, trading `u` slack
    /// for `v` slack so the chain cannot drift off its diagonal.
    #[inline]
    pub fn update(&mut self, f: &Seed) {
        let du = self.uub - f.u as i32;
        let dv = self.vub - f.v as i32;
        self.uub -= dv;
        self.vub -= du;
    }

    /// Remaining reach from `f` to the window's far corner.
    #[inline]
    pub fn pdiff(&self, f: &Seed) -> i32 {
        (self.uub - f.u as i32) + (self.vub - f.v as i32)
    }
}

impl<'i> Mapper<'i> {
    fn chain_seeds(&mut self) -> usize {
        let seeds = &mut self.seeds;
        let leaves = &mut self.leaves;
        let roots = &mut self.roots;
        leaves.clear();
        roots.clear();

        let tsid = self.n_seed;
        let tw = self.twlen;
        let mut nlsid: usize = 0;
        while nlsid < tsid {
            let lid = leaves.len() as u32;
            leaves.push(Leaf {
                rsid: nlsid as u32,
                lsid: nlsid as u32,
                rid: seeds[nlsid].rid,
                cid: u32::MAX,
            });
            let plen0 = ps(&seeds[nlsid]);
            let mut scnt: u32 = 1;

            let mut front: usize = nlsid;
            nlsid = usize::MAX;
            loop {
                let mut wv = Win::around(&seeds[front], tw);
                let mut next: usize = usize::MAX;
                let mut sid = front + 1;
                loop {
                    let f = seeds[sid];
                    if !wv.contains(&f) {
                        nlsid = nlsid.min(sid);
                        if wv.scan_bounded(&f) {
                            sid += 1;
                            continue;
                        }
                        break;
                    }
                    // absorbing a seed translates the window onto it;
                    // the farthest absorbed seed becomes the next front
                    wv.update(&f);
                    next = sid;
                    sid += 1;
                }

                if next == usize::MAX {
                    break; // dead end: `front` stays the chain tail
                }
                if seeds[next].lid != UNCHAINED {
                    front = next; // ran into an existing chain
                    break;
                }
                seeds[next].lid = lid;
                scnt += 1;
                front = next;
                if nlsid <= next {
                    nlsid = usize::MAX;
                }
            }

            if front == leaves[lid as usize].lsid as usize {
                continue; // single-seed branch, no chain
            }

            // resolve the chain id, following a merge to its owner
            let mut cid = u32::MAX;
            if seeds[front].lid < lid {
                let dst = seeds[front].lid as usize;
                front = leaves[dst].rsid as usize;
                let owner = seeds[front].lid;
                if owner != UNCHAINED {
                    cid = leaves[owner as usize].cid;
                }
            }
            if cid == u32::MAX {
                cid = roots.len() as u32;
                roots.push(Root { plen: OFS, lid });
            }

            leaves[lid as usize].cid = cid;
            leaves[lid as usize].rsid = front as u32;

            // inverted-offset reach, discounted for sparse chains
            let reach = ps(&seeds[front]).wrapping_sub(plen0);
            let discounted = ((1.0 - 1.0 / scnt as f64) * reach as f64) as u32;
            let plen = OFS.wrapping_sub(discounted);
            if plen < roots[cid as usize].plen {
                roots[cid as usize] = Root { plen, lid };
            }
        }
        roots.len()
    }

    /// Fuse chain tails near the end of a circular reference to chain
    /// heads near its origin.
    fn circularize(&mut self) {
        let tw = self.twlen;
        let tlid = self.leaves.len();
        let mut blid = 0usize;

        for rcid in 0..self.roots.len() {
            let rlid = self.roots[rcid].lid as usize;
            let rsid = self.leaves[rlid].rsid as usize;
            let rid = self.leaves[rlid].rid;
            let rseq = self.idx.seq(rid);
            let rlen = rseq.len() as i32;
            if !rseq.circular || rlen - apos_of(&self.seeds[rsid]) > tw {
                continue;
            }

            // the tail window, translated one reference length forward
            let uofs = 2 * rlen;
            let vofs = -rlen;
            let tail = &self.seeds[rsid];
            let rv = Win {
                uub: tail.u as i32 + tw - uofs,
                rid,
                vub: tail.v as i32 + tw - vofs,
                vlb: tail.v as i32 - vofs,
            };

            // forward the leaf cursor to this reference
            while blid < tlid
                && self.seeds[self.leaves[blid].lsid as usize].rid < rid
            {
                blid += 1;
            }
            let vskip = tail.v as i32 - vofs + tw;
            while blid < tlid
                && self.seeds[self.leaves[blid].lsid as usize].v as i32 > vskip
            {
                blid += 1;
            }

            // best (longest) linkable head chain
            let mut best: Option<(u64, usize)> = None;
            for lid in blid..tlid {
                let head = self.seeds[self.leaves[lid].lsid as usize];
                if !rv.contains(&head) {
                    continue;
                }
                let cid = self.leaves[lid].cid;
                if cid == u32::MAX || self.roots[cid as usize].plen & MERGED != 0 {
                    continue;
                }
                let key = (self.roots[cid as usize].plen as u64) << 32 | lid as u64;
                if best.map_or(true, |(k, _)| key < k) {
                    best = Some((key, lid));
                }
            }
            let Some((key, llid)) = best else { continue };
            let lcid = self.leaves[llid].cid as usize;

            // the head-side chain is absorbed; the tail-side chain now
            // reaches through the origin
            self.roots[lcid].lid = rlid as u32;
            self.roots[lcid].plen |= MERGED;
            let lreach = OFS.wrapping_sub((key >> 32) as u32);
            let fused = self.roots[rcid].plen.wrapping_sub(lreach);
            self.roots[rcid].plen = fused;
            let head_front = self.leaves[llid].rsid;
            self.leaves[rlid].rsid = head_front;
        }
    }

    /// Chain the sorted seed array, returning the number of chains.
    pub(crate) fn chain(&mut self) -> usize {
        if self.chain_seeds() == 0 {
            return 0;
        }
        self.circularize();
        self.roots.sort_unstable_by_key(|r| (r.plen, r.lid));
        self.roots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::tests::{test_index, test_params};
    use crate::map::Mapper;
    use crate::seq::encode_seq;

    fn chained(mapper: &mut Mapper, q: &[u8]) -> usize {
        assert!(mapper.seed(0, q) > 0);
        mapper.chain()
    }

    #[test]
    fn test_collinear_seeds_chain_together() {
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACCGTTAGCAATG";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        let n = chained(&mut mapper, &encode_seq(&reference[8..52]));
        assert!(n >= 1);

        // the best chain's reach must cover most of the query span
        let best = mapper.roots[0];
        let reach = OFS.wrapping_sub(best.plen);
        assert!(reach > 0, "best chain has positive reach");
    }

    #[test]
    fn test_chain_ps_is_monotone() {
        // inside a single chain, u+v never decreases root -> tail
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACCGTTAGCAATG";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        chained(&mut mapper, &encode_seq(&reference[..56]));

        for root in &mapper.roots {
            if root.plen & MERGED != 0 {
                continue;
            }
            let leaf = mapper.leaves[root.lid as usize];
            // walk every seed claimed by this leaf in sorted order
            let members: Vec<u32> = mapper
                .seeds
                .iter()
                .enumerate()
                .filter(|(i, s)| {
                    s.lid == root.lid || *i == leaf.lsid as usize
                })
                .map(|(_, s)| ps(s))
                .collect();
            assert!(
                members.windows(2).all(|p| p[0] <= p[1]),
                "ps must be non-decreasing along the chain"
            );
        }
    }

    #[test]
    fn test_diagonal_jump_splits_chains() {
        // a query stitched from two distant reference windows shifts the
        // diagonal by more than the window; the blocks cannot chain
        let reference =
            b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACCGTTAGCAATGGCATTGCCAT";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut params = test_params();
        params.wlen = 4;
        params.glen = 4;
        let mut mapper = Mapper::new(&idx, &params).unwrap();
        let mut q = encode_seq(&reference[..28]);
        q.extend(encode_seq(&reference[40..68]));
        let n = chained(&mut mapper, &q);
        assert!(n > 1, "the diagonal jump must split the chain, got {n}");
    }

    #[test]
    fn test_circular_fusion_marks_absorbed_chain() {
        // a query spanning the wrap of a circular reference produces a
        // tail chain and a head chain that must fuse
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACC";
        let idx = test_index(vec![("r0", reference, true)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        // wraps: last 20 bases, an inserted spacer, then the first 20.
        // The spacer pushes the head chain far enough along the query
        // that it cannot ride the re-emitted wrap postings.
        let mut q = encode_seq(&reference[30..]);
        q.extend(encode_seq(b"TTTTTTTTTT"));
        q.extend(encode_seq(&reference[..20]));

        assert!(mapper.seed(0, &q) > 0);
        let n = mapper.chain();
        assert!(n >= 1);
        let merged = mapper.roots.iter().any(|r| r.plen & MERGED != 0);
        assert!(merged, "one chain should be fused through the origin");
        // the surviving fused chain sorts first
        assert_eq!(mapper.roots[0].plen & MERGED, 0);
    }
}
