//! Post-processing of extension results: pruning, splitting the bin
//! list into primary/supplementary versus secondary, and mapping
//! quality estimation.

use crate::map::{Bin, Mapper, Res, MAPQ_COEF};

const MAPQ_MAX: f64 = (60 * MAPQ_COEF) as f64;

#[inline]
fn clip_mapq(x: f64) -> u32 {
    // NaN falls through the saturating cast to 0
    x.clamp(0.0, MAPQ_MAX) as u32
}

/// Walk bins in score order, keeping each as primary/supplementary while
/// it still covers enough uncovered query span, demoting it to secondary
/// otherwise. Returns the number of primary + supplementary bins, which
/// end up at the head of `res`.
fn collect_supp(res: &mut [Res], bins: &[Bin]) -> usize {
    let n = res.len();
    let mut p = 1;
    let mut q = n;
    while p < q {
        let mut best: u64 = 0;
        let mut i = p;
        while i < q {
            let s = &bins[res[i].iid as usize];
            let (mut lb, mut ub) = (s.lb as i64, s.ub as i64);
            let span = ub - lb;

            let mut demoted = false;
            for j in 0..p {
                let t = &bins[res[j].iid as usize];
                // shrink to the part not covered by the selected bin
                if (t.ub as i64) < ub {
                    lb = lb.max(t.ub as i64);
                } else {
                    ub = ub.min(t.lb as i64);
                }
                if 1.2 * ((ub - lb) as f64) < span as f64 {
                    demoted = true;
                    break;
                }
            }
            if demoted {
                // mostly covered already: secondary, move to tail and
                // re-examine whatever swapped into `i`
                q -= 1;
                res.swap(i, q);
                continue;
            }
            best = best.max(((2 * (ub - lb) - span) as u64) << 32 | i as u64);
            i += 1;
        }
        if best & 0xffff_ffff != 0 {
            // promote the bin that extends coverage the most
            res.swap(p, (best & 0xffff_ffff) as usize);
        }
        p += 1;
    }
    p.min(q)
}

impl<'i> Mapper<'i> {
    /// Drop trailing bins scoring below `min_ratio` of the best.
    /// `res` must already be sorted score-descending.
    pub(crate) fn prune(&mut self) -> usize {
        let min = (self.res[0].score as f32 * self.min_ratio) as i64;
        let mut q = self.res.len();
        while q > 1 && self.res[q - 1].score < min {
            q -= 1;
        }
        self.res.truncate(q);
        q
    }

    /// Classify bins and assign mapping qualities; returns the number of
    /// primary + supplementary bins.
    pub(crate) fn post_map(&mut self) -> usize {
        let res = &mut self.res;
        let bins = &mut self.bins;
        let alns = &self.alns;
        let p = collect_supp(res, bins);

        // score statistics over the secondaries
        let mut usc: i64 = 0;
        let mut lsc: i64 = i64::MAX;
        let mut tsc: i64 = 0;
        for r in &res[p..] {
            usc = usc.max(r.score);
            lsc = lsc.min(r.score);
            tsc += r.score;
        }
        if lsc == i64::MAX {
            lsc = 0;
        }

        let x = self.xcoef;
        let mx = self.mcoef + self.xcoef;
        let mut tpc = 1.0f64;
        for r in &res[..p] {
            let bin = &mut bins[r.iid as usize];

            // path-length-weighted identity over the bin's alignments
            let mut pid = 0.0f64;
            let mut len = 0u64;
            for &aid in &bin.aln_ids {
                if let Some(a) = &alns[aid as usize] {
                    len += a.plen as u64;
                    pid += a.plen as f64 * a.identity as f64;
                }
            }
            if len > 0 {
                pid /= len as f64;
            }

            // expected score per unique base, from the scoring scheme
            let ec = 2.0 / (pid * mx - x);
            let ulen = ec * (r.score - usc).max(0) as f64;
            let pe = 1.0 / (ulen * ulen + 1.0);
            bin.mapq = clip_mapq(-10.0 * MAPQ_COEF as f64 * pe.log10());
            tpc *= 1.0 - pe;
        }

        let tpe = (1.0 - tpc).min(1.0);
        for r in &res[p..] {
            let bin = &mut bins[r.iid as usize];
            let frac = tpe * (r.score - lsc + 1) as f64 / tsc as f64;
            bin.mapq = if frac >= 1.0 {
                0
            } else {
                clip_mapq(-10.0 * MAPQ_COEF as f64 * (1.0 - frac).log10())
            };
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(lb: u32, ub: u32) -> Bin {
        Bin {
            lb,
            ub,
            plen: ub - lb,
            mapq: 0,
            aln_ids: Vec::new(),
        }
    }

    fn res(scores: &[i64]) -> Vec<Res> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &score)| Res {
                score,
                iid: i as u32,
            })
            .collect()
    }

    #[test]
    fn test_disjoint_bins_are_all_unique() {
        // two alignments covering different halves of the query: both
        // stay primary/supplementary
        let bins = vec![bin(0, 500), bin(500, 1000)];
        let mut r = res(&[400, 300]);
        assert_eq!(collect_supp(&mut r, &bins), 2);
    }

    #[test]
    fn test_covered_bin_is_secondary() {
        // the second bin sits fully inside the first one's span
        let bins = vec![bin(0, 1000), bin(200, 800)];
        let mut r = res(&[900, 500]);
        assert_eq!(collect_supp(&mut r, &bins), 1);
        // the demoted bin moved to the tail
        assert_eq!(r[1].iid, 1);
    }

    #[test]
    fn test_partial_overlap_keeps_extender() {
        // the second bin overlaps but extends coverage well past the
        // first: kept as supplementary
        let bins = vec![bin(0, 600), bin(500, 1500)];
        let mut r = res(&[700, 600]);
        assert_eq!(collect_supp(&mut r, &bins), 2);
    }

    #[test]
    fn test_promotion_picks_best_extender() {
        // among two candidates, the one adding more uncovered span is
        // promoted first
        let bins = vec![bin(0, 500), bin(480, 700), bin(490, 1500)];
        let mut r = res(&[900, 800, 750]);
        let p = collect_supp(&mut r, &bins);
        assert!(p >= 2);
        assert_eq!(r[1].iid, 2, "the wide extender is promoted");
    }

    #[test]
    fn test_clip_mapq_bounds() {
        assert_eq!(clip_mapq(-5.0), 0);
        assert_eq!(clip_mapq(1e9), 60 * MAPQ_COEF);
        assert_eq!(clip_mapq(f64::NAN), 0);
        assert_eq!(clip_mapq(f64::INFINITY), 60 * MAPQ_COEF);
        assert!(clip_mapq(123.4) <= 60 * MAPQ_COEF);
    }
}
