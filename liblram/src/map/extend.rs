//! Chain extension: gap-affine DP from each chain's anchors, duplicate
//! suppression through the position hash, and score bookkeeping.
//!
//! Each chain gets a result bin. Extension runs downward from an anchor
//! to find the alignment end, then upward from that end with traceback.
//! Head and tail positions are keyed into the per-query hash so a chain
//! whose extension lands on an already-evaluated position is subsumed or
//! retried with a narrower band.

use crate::dp::{Alignment, DpAligner, Fill, MaxPos, SecView, STAT_TERM, STAT_UPDATE_A, STAT_UPDATE_B};
use crate::map::{
    apos_of, bpos_of, pos_key, uval, vval, Bin, Mapper, Res, Search, Seed, Win, MERGED, OFS,
    SEED_TRIALS, TRIAL_BUDGET,
};

/// Section id of the sentinel N tail.
const TAIL_ID: u32 = 0xffff_fffe;

/// Hash value marking a position as evaluated with no surviving
/// alignment: the recording chain in the low half, no alignment above.
#[inline]
fn mark_evaluated(eid: u32) -> u64 {
    (u32::MAX as u64) << 32 | eid as u64
}

enum RootLoad {
    Ready,
    Skip,
    Stop,
}

/// Run one extension stage to termination, swapping in tail sections as
/// either side runs out. Each side is swapped at most once.
fn extend_core(
    dp: &mut DpAligner,
    a: &SecView,
    at: &SecView,
    b: &SecView,
    bt: &SecView,
    apos: u32,
    bpos: u32,
    narrow: u32,
) -> Fill {
    let mut f = dp.fill_root(a, apos, b, bpos, narrow);
    let mut flag = STAT_TERM;
    let (mut ca, mut cb) = (a, b);
    while flag & f.status == 0 {
        if f.status & STAT_UPDATE_A != 0 {
            ca = at;
        }
        if f.status & STAT_UPDATE_B != 0 {
            cb = bt;
        }
        flag |= f.status & (STAT_UPDATE_A | STAT_UPDATE_B);
        f = dp.fill(ca, cb);
    }
    f
}

impl<'i> Mapper<'i> {
    /// Decode a seed back to sequence positions; reverse-strand seeds
    /// carry a negative query coordinate that folds back by the query
    /// length.
    fn load_pos(&self, s: &Seed) -> ((i32, i32), bool) {
        let a = apos_of(s);
        let b = bpos_of(s);
        let rev = b < 0;
        let mut apos = a;
        let mut bpos = b + if rev { self.qlen as i32 } else { 0 };
        if apos as u32 >= self.rlen || bpos as u32 >= self.qlen {
            let k = self.idx.k() as i32;
            apos -= apos.min(k);
            bpos -= bpos.min(k);
        }
        ((apos, bpos), rev)
    }

    fn load_root(&mut self, st: &mut Search, cid: usize) -> RootLoad {
        let root = self.roots[cid];
        if root.plen & MERGED != 0 {
            return RootLoad::Skip; // fused into another chain
        }
        let plen = OFS.wrapping_sub(root.plen);
        if (plen as f64) * self.mcoef < 2.0 * self.min_score as f64 {
            return RootLoad::Stop; // chains only get shorter from here
        }

        self.nexts.clear();
        let iid = self.bins.len() as u32;
        self.bins.push(Bin::new());
        let eid = self.res.len() as u32;
        self.res.push(Res { score: 0, iid });

        let rsid = self.leaves[root.lid as usize].rsid as usize;
        let seed = self.seeds[rsid];
        st.aid = seed.rid;
        st.bid = 0;
        self.rlen = self.idx.seq(seed.rid).len();
        let (cp, rev) = self.load_pos(&seed);
        st.cp = cp;
        st.tp = cp;
        st.rev = rev;
        st.iid = iid;
        st.eid = eid;
        st.sid = rsid;
        st.prem = plen as i64;
        st.pacc = 0;
        st.srem = SEED_TRIALS;
        st.narrow = 0;
        RootLoad::Ready
    }

    /// Pick the next anchor in the chain's unwalked region, preferring
    /// seeds outside a 128-base exclusion zone around the last
    /// extension.
    fn load_next(&mut self, st: &mut Search) -> bool {
        if st.srem == 0 {
            return false;
        }
        st.srem -= 1;

        let reach = 2 * self.tglen as u32;
        let bq = (st.cp.1 - if st.rev { self.qlen as i32 } else { 0 }) as i64;
        let head = Seed {
            u: uval(st.cp.0 as i64, bq),
            rid: st.aid,
            v: vval(st.cp.0 as i64, bq),
            lid: 0,
        };

        // age out stale candidates from the previous search
        if st.pacc > reach {
            self.nexts.clear();
        } else {
            let plim = reach - st.pacc;
            let mut keep = self.nexts.len();
            for (i, n) in self.nexts.iter_mut().enumerate() {
                if n.0 >= plim {
                    keep = i;
                    break;
                }
                n.0 += st.pacc;
            }
            self.nexts.truncate(keep);
        }

        // collect fresh candidates walking back from the old anchor
        let mut sid = st.sid;
        let mut rcnt = 2 * st.srem;
        while sid > 0 && rcnt > 0 {
            let cand = &self.seeds[sid - 1];
            let wv = Win::around(cand, self.tglen);
            if !wv.scan_bounded(&head) {
                break;
            }
            let zv = Win::around(cand, 128);
            if wv.contains(&head) && !zv.contains(&head) {
                self.nexts.push((wv.pdiff(&head) as u32, (sid - 1) as u32));
                rcnt -= 1;
            }
            sid -= 1;
        }
        st.sid = sid;

        if self.nexts.is_empty() {
            st.pacc = 0;
            st.srem = 0;
            return false;
        }
        self.nexts.sort_unstable_by_key(|&(pd, s)| (pd, s));
        let (pd, nsid) = self.nexts.pop().expect("nonempty");
        st.pacc = reach - pd;
        let (cp, rev) = self.load_pos(&self.seeds[nsid as usize]);
        st.cp = cp;
        st.rev = rev;
        true
    }

    /// Test whether an extension max lands on an already-evaluated
    /// position. Marks the position either way and clips it into `tp`
    /// for the upward stage.
    fn test_dup(&mut self, st: &mut Search, mp: MaxPos) -> bool {
        let key = pos_key(mp.apos, mp.bpos, st.aid, st.bid);
        st.tp = (
            (mp.apos as i32).clamp(1, self.rlen as i32),
            (mp.bpos as i32).clamp(1, self.qlen as i32),
        );

        let eid = st.eid;
        let slot = self.pos.entry_val(key);
        let prev = *slot;
        *slot = mark_evaluated(eid);
        if prev == u64::MAX {
            return false;
        }

        let prev_eid = prev as u32 as usize;
        if prev_eid != st.eid as usize
            && prev_eid < self.res.len()
            && mp.plen < self.bins[self.res[prev_eid].iid as usize].plen
        {
            st.srem = 0; // subsumed by a longer alignment
        } else {
            st.narrow = (st.narrow + 1).min(2);
        }
        true
    }

    /// Record a traced alignment into the chain's bin, deduplicating by
    /// head position. Returns true when the chain is covered.
    fn record(&mut self, st: &mut Search, aln: Alignment) -> bool {
        let (score, plen, identity) = (aln.score, aln.plen, aln.identity);
        let first = aln.segs[0];
        let last = *aln.segs.last().expect("traced alignments have segments");

        // convert from the upward (reversed) frame to forward coordinates
        let hp = (
            self.rlen as i32 - (last.apos + last.alen) as i32,
            self.qlen as i32 - (last.bpos + last.blen) as i32,
        );
        let tp = (
            self.rlen as i32 - first.apos as i32,
            self.qlen as i32 - first.bpos as i32,
        );
        st.cp = hp;
        st.prem -= plen as i64;
        st.pacc = plen;

        let hk = pos_key(hp.0 as u32, hp.1 as u32, st.aid, st.bid);
        let tk = pos_key(tp.0 as u32, tp.1 as u32, st.aid, st.bid);
        let prev_h = *self.pos.entry_val(hk);
        let fresh = (prev_h >> 32) as u32 == u32::MAX;

        // coverage-weighted score: overlap with what the bin already
        // spans earns nothing
        let bin = &mut self.bins[st.iid as usize];
        let span = (tp.1 - hp.1).max(0) as i64;
        let covered = (bin.ub.min(tp.1 as u32) as i64 - bin.lb.max(hp.1 as u32) as i64).max(0);
        self.res[st.eid as usize].score +=
            score + (2.0 * (span - covered) as f64 * identity as f64) as i64;

        bin.plen += plen;
        bin.lb = bin.lb.min(hp.1 as u32);
        bin.ub = bin.ub.max(tp.1 as u32);

        let nid;
        let stored;
        if fresh {
            nid = self.alns.len() as u32;
            self.alns.push(Some(aln));
            bin.aln_ids.push(nid);
            stored = true;
        } else {
            nid = (prev_h >> 32) as u32;
            let better = self.alns[nid as usize]
                .as_ref()
                .map_or(true, |old| old.score <= score);
            if better {
                self.alns[nid as usize] = Some(aln);
            }
            stored = better;
        }
        if stored {
            let val = (nid as u64) << 32 | st.eid as u64;
            *self.pos.entry_val(hk) = val;
            *self.pos.entry_val(tk) = val;
        } else {
            *self.pos.entry_val(tk) = mark_evaluated(st.eid);
        }

        st.srem = SEED_TRIALS;
        st.narrow = 0;
        st.min_score = st.min_score.max((score as f32 * self.min_ratio) as u32);

        !(fresh && st.prem > 0)
    }

    /// Close out a chain: drop its bin when nothing met the configured
    /// minimum, charging the global trial budget. Returns true when the
    /// budget is spent.
    fn finish_root(&mut self, st: &mut Search) -> bool {
        let n_aln = self.bins[st.iid as usize].aln_ids.len();
        if n_aln == 0 || self.res[st.eid as usize].score < self.min_score as i64 {
            self.bins.truncate(st.iid as usize);
            self.res.truncate(st.eid as usize);
            st.crem = st.crem.saturating_sub(1);
        } else {
            st.crem = if st.crem != 0 { TRIAL_BUDGET } else { 0 };
        }
        st.crem == 0
    }

    /// Extend every chain in order; returns the number of surviving
    /// result bins.
    pub(crate) fn extend(&mut self, qseq: &[u8]) -> usize {
        let mut st = Search {
            crem: TRIAL_BUDGET,
            min_score: self.min_score,
            ..Default::default()
        };

        for cid in 0..self.roots.len() {
            match self.load_root(&mut st, cid) {
                RootLoad::Stop => break,
                RootLoad::Skip => continue,
                RootLoad::Ready => {}
            }

            let idx = self.idx;
            let rseq: &[u8] = &idx.seq(st.aid).seq;
            let circular = idx.seq(st.aid).circular;

            while st.srem > 0 && st.prem > 0 {
                self.dp.flush();
                // downward: from the anchor toward the sequence ends
                let f = {
                    let r_fw = SecView::fwd(st.aid << 1, rseq);
                    let q_fw = SecView::fwd(0, qseq);
                    let q_rv = SecView::rev(1, qseq);
                    let tail = SecView::fwd(TAIL_ID, &self.tail);
                    let b_dn = if st.rev { q_rv } else { q_fw };
                    extend_core(
                        &mut self.dp,
                        &r_fw,
                        if circular { &r_fw } else { &tail },
                        &b_dn,
                        &tail,
                        st.cp.0 as u32,
                        st.cp.1 as u32,
                        st.narrow,
                    )
                };
                let mp = self.dp.search_max();
                if f.max != 0 && !self.test_dup(&mut st, mp) {
                    // upward: reversed frame, from the max back past the
                    // anchor, with traceback
                    let f = {
                        let r_rv = SecView::rev(st.aid << 1 | 1, rseq);
                        let q_fw = SecView::fwd(0, qseq);
                        let q_rv = SecView::rev(1, qseq);
                        let tail = SecView::fwd(TAIL_ID, &self.tail);
                        let b_up = if st.rev { q_fw } else { q_rv };
                        extend_core(
                            &mut self.dp,
                            &r_rv,
                            if circular { &r_rv } else { &tail },
                            &b_up,
                            &tail,
                            (self.rlen as i32 - st.tp.0) as u32,
                            (self.qlen as i32 - st.tp.1) as u32,
                            0,
                        )
                    };
                    if f.max >= st.min_score as i64 {
                        if let Some(aln) = self.dp.trace() {
                            if self.record(&mut st, aln) {
                                break;
                            }
                        }
                    }
                }
                self.load_next(&mut st);
            }

            if self.finish_root(&mut st) {
                break;
            }
        }
        self.res.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::tests::{test_index, test_params};
    use crate::map::Mapper;
    use crate::seq::encode_seq;
    use std::collections::HashSet;

    #[test]
    fn test_extension_covers_chain() {
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACCGTTAGCAATG";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        let q = encode_seq(&reference[12..52]);
        mapper.qlen = q.len() as u32;
        assert!(mapper.seed(0, &q) > 0);
        assert!(mapper.chain() > 0);
        let n = mapper.extend(&q);
        assert!(n >= 1);
        assert!(!mapper.bins[mapper.res[0].iid as usize].aln_ids.is_empty());
    }

    #[test]
    fn test_no_duplicate_heads_recorded() {
        // a repetitive reference produces several chains that extend to
        // the same endpoints; recorded head positions must be unique
        let reference = b"ACGGTCAGTTACGGATCCGTACGGTCAGTTACGGATCCGTACGGTCAGTTACGGATCCGT";
        let idx = test_index(vec![("r0", reference, false)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        let q = encode_seq(&reference[..40]);
        mapper.qlen = q.len() as u32;

        for tier in 0..idx.n_occ() {
            if mapper.seed(tier, &q) == 0 {
                continue;
            }
            if mapper.chain() == 0 {
                continue;
            }
            if mapper.extend(&q) > 0 {
                break;
            }
        }

        let mut heads = HashSet::new();
        for bin in &mapper.bins {
            for &aid in &bin.aln_ids {
                if let Some(aln) = &mapper.alns[aid as usize] {
                    let last = aln.segs.last().unwrap();
                    let head = (
                        last.a_id,
                        last.apos + last.alen,
                        last.bpos + last.blen,
                    );
                    assert!(heads.insert(head), "duplicate head {head:?}");
                }
            }
        }
    }

    #[test]
    fn test_circular_query_wraps_reference() {
        // query spans the wrap point of a circular reference; a single
        // alignment must chain through the end of the sequence
        let reference = b"GATTACAGGTTCAACGTTGCATCAGTACGGATCCAGTTGCACTACGTACC";
        let idx = test_index(vec![("r0", reference, true)], 2, 8);
        let mut mapper = Mapper::new(&idx, &test_params()).unwrap();
        let mut q = encode_seq(&reference[30..]);
        q.extend(encode_seq(&reference[..20]));

        let reg = mapper.map(&q).expect("wrapped query must map");
        let top = &reg.aln[0];
        // the alignment crosses the origin: more than one segment on
        // the same reference id
        assert!(top.aln.slen() >= 2, "expected a wrapped alignment");
        assert_eq!(top.aln.segs[0].a_id >> 1, 0);
        assert_eq!(top.aln.score, 40);
    }
}
